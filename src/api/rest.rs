// =============================================================================
// REST API Endpoints — Axum
// =============================================================================
//
// The ingress webhook lives at `/webhook/in` (optionally guarded by the
// shared inbound token). Admin endpoints live under `/api/v1/` and require a
// valid Bearer token checked via the `AuthBearer` extractor; every admin
// mutation is written to the audit trail.
//
// CORS is configured permissively for development; tighten `allowed_origins`
// in production.
// =============================================================================

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Json, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info, warn};

use crate::api::auth::{AuthBearer, InboundAuth};
use crate::app_state::{AppState, OrderStatusPayload, PositionsPayload, SubmitError, WsEvent};
use crate::ledger::CloseOutcome;
use crate::metrics::MetricsRegistry;
use crate::store::{SignalFilter, Store, StoreError, StrategySpec};
use crate::types::{ApprovedSignal, Signal, SignalStatus, SignalType};

/// Budget for admin-synthesized exits to reach the forwarding queue.
const ADMIN_ENQUEUE_TIMEOUT: Duration = Duration::from_secs(5);

// =============================================================================
// Router construction
// =============================================================================

/// Build the full HTTP router with CORS middleware and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // ── Ingress ─────────────────────────────────────────────────
        .route("/webhook/in", post(ingress))
        // ── Public ──────────────────────────────────────────────────
        .route("/api/v1/health", get(health))
        // ── Authenticated ───────────────────────────────────────────
        .route("/api/v1/system", get(system_info))
        .route("/api/v1/metrics", get(get_metrics))
        .route("/api/v1/metrics/reset", post(reset_metrics))
        .route("/api/v1/signals", get(list_signals))
        .route("/api/v1/positions", get(list_positions))
        .route("/api/v1/positions/sell-all", post(sell_all))
        .route("/api/v1/positions/{ticker}/close", post(close_position))
        .route("/api/v1/strategies", get(list_strategies).post(create_strategy))
        .route(
            "/api/v1/strategies/{id}",
            put(update_strategy).delete(delete_strategy),
        )
        .route("/api/v1/strategies/{id}/activate", post(activate_strategy))
        .route("/api/v1/refresher/pause", post(pause_refresher))
        .route("/api/v1/refresher/resume", post(resume_refresher))
        .route("/api/v1/refresher/refresh", post(force_refresh))
        .route("/api/v1/ratelimiter/pause", post(pause_rate_limiter))
        .route("/api/v1/ratelimiter/resume", post(resume_rate_limiter))
        .route("/api/v1/admin/clear", post(clear_all))
        .route("/api/v1/admin/actions", get(list_admin_actions))
        // ── WebSocket ───────────────────────────────────────────────
        .route("/api/v1/ws", get(crate::api::ws::ws_handler))
        // ── Middleware & State ──────────────────────────────────────
        .layer(cors)
        .with_state(state)
}

/// Map a store failure onto an HTTP response.
fn store_error_response(e: StoreError) -> Response {
    let (status, message) = match &e {
        StoreError::Conflict(msg) => (StatusCode::CONFLICT, msg.clone()),
        StoreError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
        StoreError::Transient(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg.clone()),
        StoreError::Fatal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
    };
    (status, Json(json!({ "error": message }))).into_response()
}

fn bad_request(message: &str) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": message }))).into_response()
}

// =============================================================================
// Ingress
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
struct InboundSignal {
    ticker: String,
    #[serde(default)]
    side: Option<String>,
    #[serde(default)]
    action: Option<String>,
    #[serde(default)]
    price: Option<f64>,
    #[serde(default)]
    time: Option<String>,
}

/// Uppercase and validate a raw ticker symbol.
fn normalize_ticker(raw: &str) -> Option<String> {
    let ticker = raw.trim().to_uppercase();
    let valid = !ticker.is_empty()
        && ticker.len() <= 10
        && ticker
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-');
    valid.then_some(ticker)
}

/// Use the payload's `time` when it parses as RFC 3339, otherwise "now".
fn parse_received_at(time: Option<&str>) -> DateTime<Utc> {
    time.and_then(|t| DateTime::parse_from_rfc3339(t).ok())
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(Utc::now)
}

async fn ingress(
    _auth: InboundAuth,
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Response {
    // Parse by hand so every malformed body is a clean 400 (never persisted).
    let raw: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(_) => {
            MetricsRegistry::incr(&state.metrics.validation_rejections);
            return bad_request("malformed JSON body");
        }
    };
    let parsed: InboundSignal = match serde_json::from_value(raw.clone()) {
        Ok(p) => p,
        Err(e) => {
            MetricsRegistry::incr(&state.metrics.validation_rejections);
            return bad_request(&format!("invalid signal payload: {e}"));
        }
    };
    let Some(ticker) = normalize_ticker(&parsed.ticker) else {
        MetricsRegistry::incr(&state.metrics.validation_rejections);
        return bad_request("invalid ticker symbol");
    };

    let signal = Signal::new(
        ticker,
        parsed.side,
        parsed.action,
        parsed.price,
        parse_received_at(parsed.time.as_deref()),
        raw,
    );

    match state.submit(signal).await {
        Ok((signal_id, signal_type)) => (
            StatusCode::ACCEPTED,
            Json(json!({ "signal_id": signal_id, "signal_type": signal_type })),
        )
            .into_response(),
        Err(SubmitError::Backpressure) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": "signal queue is full — retry later" })),
        )
            .into_response(),
        Err(SubmitError::Store(e)) => store_error_response(e),
    }
}

// =============================================================================
// Health (public)
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    state_version: u64,
    server_time: i64,
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        state_version: state.current_state_version(),
        server_time: Utc::now().timestamp_millis(),
    })
}

// =============================================================================
// System & metrics (authenticated)
// =============================================================================

async fn system_info(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.system_info().await)
}

async fn get_metrics(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.metrics.snapshot())
}

async fn reset_metrics(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.metrics.reset();
    let _ = state.store.record_admin_action("reset_metrics", None).await;
    state.increment_version();
    info!("metrics reset via API");
    Json(json!({ "message": "metrics reset" }))
}

// =============================================================================
// Signals (authenticated)
// =============================================================================

#[derive(Deserialize)]
struct SignalsQuery {
    ticker: Option<String>,
    status: Option<String>,
    signal_type: Option<String>,
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
    #[serde(default)]
    limit: usize,
    #[serde(default)]
    offset: usize,
}

async fn list_signals(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Query(query): Query<SignalsQuery>,
) -> Response {
    let status = match query.status.as_deref().map(str::parse::<SignalStatus>).transpose() {
        Ok(status) => status,
        Err(e) => return bad_request(&e),
    };
    let signal_type = match query
        .signal_type
        .as_deref()
        .map(str::parse::<SignalType>)
        .transpose()
    {
        Ok(signal_type) => signal_type,
        Err(e) => return bad_request(&e),
    };

    let filter = SignalFilter {
        ticker: query.ticker.map(|t| t.to_uppercase()),
        status,
        signal_type,
        from: query.from,
        to: query.to,
        limit: query.limit,
        offset: query.offset,
    };

    match state.store.list_signals(&filter).await {
        Ok(rows) => Json(rows).into_response(),
        Err(e) => store_error_response(e),
    }
}

// =============================================================================
// Positions (authenticated)
// =============================================================================

async fn list_positions(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> Response {
    match state.store.list_open_positions().await {
        Ok(rows) => Json(rows).into_response(),
        Err(e) => store_error_response(e),
    }
}

/// Hand an admin-synthesized exit to the forwarding queue.
async fn enqueue_admin_exit(state: &Arc<AppState>, signal: Signal, signal_type: SignalType) {
    let signal_id = signal.signal_id;
    let ticker = signal.ticker.clone();

    state.publish(WsEvent::OrderStatusChange(OrderStatusPayload {
        signal_id,
        ticker: ticker.clone(),
        status: SignalStatus::Approved,
        detail: None,
    }));
    state.publish(WsEvent::PositionsUpdate(PositionsPayload {
        ticker: ticker.clone(),
        status: "CLOSING".to_string(),
    }));

    let approved = ApprovedSignal {
        signal,
        signal_type,
    };
    if state
        .approved_queue
        .push_timeout(approved, ADMIN_ENQUEUE_TIMEOUT)
        .await
        .is_err()
    {
        error!(
            signal_id = %signal_id,
            ticker = %ticker,
            "CRITICAL: position marked closing but forwarding enqueue failed — manual reconciliation required"
        );
        MetricsRegistry::incr(&state.metrics.critical_incidents);
    }
}

async fn close_position(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Path(ticker): Path<String>,
) -> Response {
    let Some(ticker) = normalize_ticker(&ticker) else {
        return bad_request("invalid ticker symbol");
    };

    let signal = Signal::new(
        ticker.clone(),
        None,
        Some("exit".to_string()),
        None,
        Utc::now(),
        json!({ "ticker": ticker, "action": "exit", "origin": "manual_close" }),
    );
    if let Err(e) = state
        .store
        .insert_signal(&signal, SignalStatus::Approved, SignalType::PositionClose)
        .await
    {
        return store_error_response(e);
    }

    match state.ledger.try_begin_close(&ticker, signal.signal_id).await {
        Ok(CloseOutcome::Closing(position_id)) => {
            let _ = state
                .store
                .record_admin_action(
                    "close_position",
                    Some(format!("{ticker} via signal {}", signal.signal_id)),
                )
                .await;
            info!(ticker = %ticker, position_id, "manual position close requested");
            let signal_id = signal.signal_id;
            enqueue_admin_exit(&state, signal, SignalType::PositionClose).await;
            (
                StatusCode::ACCEPTED,
                Json(json!({ "signal_id": signal_id, "position_id": position_id })),
            )
                .into_response()
        }
        Ok(CloseOutcome::NotFound) => {
            let _ = state
                .store
                .set_signal_status(
                    signal.signal_id,
                    SignalStatus::Rejected,
                    "admin",
                    Some("no_open_position".to_string()),
                )
                .await;
            (
                StatusCode::NOT_FOUND,
                Json(json!({ "error": format!("no open position for {ticker}") })),
            )
                .into_response()
        }
        Err(e) => store_error_response(e),
    }
}

async fn sell_all(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> Response {
    let tickers = match state.store.open_position_tickers().await {
        Ok(tickers) => tickers,
        Err(e) => return store_error_response(e),
    };
    let mut tickers: Vec<String> = tickers.into_iter().collect();
    tickers.sort();

    let mut submitted = Vec::new();
    let mut skipped = Vec::new();

    for ticker in tickers {
        let signal = Signal::new(
            ticker.clone(),
            Some("sell".to_string()),
            Some("exit".to_string()),
            None,
            Utc::now(),
            json!({ "ticker": ticker, "side": "sell", "action": "exit", "origin": "sell_all" }),
        );
        if let Err(e) = state
            .store
            .insert_signal(&signal, SignalStatus::Approved, SignalType::SellAll)
            .await
        {
            warn!(ticker = %ticker, error = %e, "sell-all signal insert failed");
            skipped.push(ticker);
            continue;
        }

        match state.ledger.try_begin_close(&ticker, signal.signal_id).await {
            Ok(CloseOutcome::Closing(_)) => {
                enqueue_admin_exit(&state, signal, SignalType::SellAll).await;
                submitted.push(ticker);
            }
            Ok(CloseOutcome::NotFound) => {
                // Position already CLOSING: skip, don't enqueue a duplicate
                // exit, and leave an audited trace.
                let _ = state
                    .store
                    .set_signal_status(
                        signal.signal_id,
                        SignalStatus::Rejected,
                        "admin",
                        Some("already_closing".to_string()),
                    )
                    .await;
                let _ = state
                    .store
                    .record_admin_action(
                        "sell_all_skip",
                        Some(format!("{ticker} SKIPPED_ALREADY_CLOSING")),
                    )
                    .await;
                skipped.push(ticker);
            }
            Err(e) => {
                warn!(ticker = %ticker, error = %e, "sell-all close failed");
                skipped.push(ticker);
            }
        }
    }

    let _ = state
        .store
        .record_admin_action(
            "sell_all",
            Some(format!(
                "submitted={} skipped={}",
                submitted.len(),
                skipped.len()
            )),
        )
        .await;
    info!(
        submitted = submitted.len(),
        skipped = skipped.len(),
        "bulk sell-all executed"
    );
    Json(json!({ "submitted": submitted, "skipped": skipped })).into_response()
}

// =============================================================================
// Strategies (authenticated)
// =============================================================================

async fn list_strategies(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> Response {
    match state.store.list_strategies().await {
        Ok(strategies) => Json(strategies).into_response(),
        Err(e) => store_error_response(e),
    }
}

async fn create_strategy(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Json(spec): Json<StrategySpec>,
) -> Response {
    if let Err(e) = spec.validate() {
        return bad_request(&e);
    }
    match state.store.create_strategy(&spec).await {
        Ok(strategy) => {
            let _ = state
                .store
                .record_admin_action("create_strategy", Some(strategy.name.clone()))
                .await;
            state.increment_version();
            (StatusCode::CREATED, Json(strategy)).into_response()
        }
        Err(e) => store_error_response(e),
    }
}

async fn update_strategy(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(spec): Json<StrategySpec>,
) -> Response {
    if let Err(e) = spec.validate() {
        return bad_request(&e);
    }
    match state.store.update_strategy(id, &spec).await {
        Ok(strategy) => {
            let _ = state
                .store
                .record_admin_action("update_strategy", Some(strategy.name.clone()))
                .await;
            if strategy.is_active {
                state.publish(WsEvent::FinvizStrategyChanged(strategy.clone()));
            } else {
                state.increment_version();
            }
            Json(strategy).into_response()
        }
        Err(e) => store_error_response(e),
    }
}

async fn activate_strategy(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Response {
    match state.store.switch_active_strategy(id).await {
        Ok(strategy) => {
            let _ = state
                .store
                .record_admin_action("activate_strategy", Some(strategy.name.clone()))
                .await;
            info!(id, name = %strategy.name, "strategy activated via API");
            state.publish(WsEvent::FinvizStrategyChanged(strategy.clone()));
            Json(strategy).into_response()
        }
        Err(e) => store_error_response(e),
    }
}

async fn delete_strategy(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Response {
    match state.store.delete_strategy(id).await {
        Ok(()) => {
            let _ = state
                .store
                .record_admin_action("delete_strategy", Some(format!("id={id}")))
                .await;
            state.increment_version();
            StatusCode::NO_CONTENT.into_response()
        }
        Err(e) => store_error_response(e),
    }
}

// =============================================================================
// Control endpoints (authenticated)
// =============================================================================

#[derive(Serialize)]
struct ControlResponse {
    state: String,
    message: String,
}

async fn pause_refresher(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.refresher.pause();
    let _ = state.store.record_admin_action("pause_refresher", None).await;
    state.increment_version();
    info!("ranking refresher PAUSED via API");
    Json(ControlResponse {
        state: "paused".to_string(),
        message: "ranking refresher paused — last snapshot stays authoritative".to_string(),
    })
}

async fn resume_refresher(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    state.refresher.resume();
    let _ = state.store.record_admin_action("resume_refresher", None).await;
    state.increment_version();
    info!("ranking refresher RESUMED via API");
    Json(ControlResponse {
        state: "running".to_string(),
        message: "ranking refresher resumed".to_string(),
    })
}

async fn force_refresh(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.refresher.force.notify_one();
    let _ = state.store.record_admin_action("force_refresh", None).await;
    info!("manual ranking refresh requested via API");
    Json(ControlResponse {
        state: "requested".to_string(),
        message: "ranking refresh scheduled".to_string(),
    })
}

async fn pause_rate_limiter(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    state.rate_limiter.pause();
    let _ = state
        .store
        .record_admin_action("pause_rate_limiter", None)
        .await;
    state.increment_version();
    Json(ControlResponse {
        state: "paused".to_string(),
        message: "outbound pacing disabled — permits are immediate".to_string(),
    })
}

async fn resume_rate_limiter(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    state.rate_limiter.resume();
    let _ = state
        .store
        .record_admin_action("resume_rate_limiter", None)
        .await;
    state.increment_version();
    Json(ControlResponse {
        state: "running".to_string(),
        message: "outbound pacing enabled".to_string(),
    })
}

// =============================================================================
// Maintenance (authenticated)
// =============================================================================

async fn clear_all(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> Response {
    match state.store.clear_all().await {
        Ok(()) => {
            let _ = state.store.record_admin_action("clear_all", None).await;
            state.increment_version();
            warn!("store cleared via API");
            Json(json!({ "message": "events, positions, and signals cleared" })).into_response()
        }
        Err(e) => store_error_response(e),
    }
}

#[derive(Deserialize)]
struct AdminActionsQuery {
    #[serde(default)]
    limit: usize,
}

async fn list_admin_actions(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Query(query): Query<AdminActionsQuery>,
) -> Response {
    let limit = if query.limit == 0 { 100 } else { query.limit };
    match state.store.list_admin_actions(limit).await {
        Ok(actions) => Json(actions).into_response(),
        Err(e) => store_error_response(e),
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ticker_normalization_uppercases_and_validates() {
        assert_eq!(normalize_ticker(" aapl "), Some("AAPL".to_string()));
        assert_eq!(normalize_ticker("brk-b"), Some("BRK-B".to_string()));
        assert_eq!(normalize_ticker("BF.B"), Some("BF.B".to_string()));
        assert_eq!(normalize_ticker(""), None);
        assert_eq!(normalize_ticker("   "), None);
        assert_eq!(normalize_ticker("BAD TICKER"), None);
        assert_eq!(normalize_ticker("WAYTOOLONGSYM"), None);
    }

    #[test]
    fn received_at_prefers_valid_rfc3339() {
        let parsed = parse_received_at(Some("2026-03-01T12:30:00Z"));
        assert_eq!(parsed.to_rfc3339(), "2026-03-01T12:30:00+00:00");

        let now = Utc::now();
        let fallback = parse_received_at(Some("yesterday-ish"));
        assert!((fallback - now).num_seconds().abs() < 5);
        let missing = parse_received_at(None);
        assert!((missing - now).num_seconds().abs() < 5);
    }
}
