// =============================================================================
// Forwarding Workers — rate-limited delivery to the destination webhook
// =============================================================================
//
// Each worker drains the ApprovedQueue: acquire a rate-limiter permit, POST
// the signal's payload with a hard timeout, record the outcome. Non-2xx,
// timeout, and network errors are terminal for the signal (FORWARDED_ERR, no
// retry). A successfully forwarded SELL-family signal finalizes its ticker's
// CLOSING position.
// =============================================================================

use std::sync::Arc;

use tokio::time::Duration;
use tracing::{info, warn};

use crate::app_state::{AppState, OrderStatusPayload, PositionsPayload, WsEvent};
use crate::metrics::MetricsRegistry;
use crate::store::Store;
use crate::types::{ApprovedSignal, Intent, Signal, SignalStatus};

/// Build the shared outbound HTTP client. The per-request timeout comes from
/// config at send time; this is a floor against pathological connects.
pub fn build_client() -> reqwest::Client {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .build()
        .expect("failed to build reqwest client")
}

/// Run one forwarding worker until the ApprovedQueue closes.
pub async fn run_forwarding_worker(
    state: Arc<AppState>,
    client: reqwest::Client,
    worker_idx: usize,
) {
    let worker_id = format!("forward-{worker_idx}");
    info!(worker_id = %worker_id, "forwarding worker started");

    while let Some(item) = state.approved_queue.pop().await {
        let permit = state.rate_limiter.acquire().await;
        let status = deliver(&state, &client, &worker_id, &item).await;
        state.rate_limiter.on_response(permit, status);
    }

    info!(worker_id = %worker_id, "forwarding worker stopped (queue closed)");
}

/// POST one approved signal. Returns the HTTP status code when a response
/// was received at all.
pub(crate) async fn deliver(
    state: &Arc<AppState>,
    client: &reqwest::Client,
    worker_id: &str,
    item: &ApprovedSignal,
) -> Option<u16> {
    let (url, timeout, rewrite) = {
        let config = state.config.read();
        (
            config.dest_webhook_url.clone(),
            Duration::from_secs(config.dest_webhook_timeout_secs),
            config.forward_rewrite_side_to_action,
        )
    };

    let payload = outbound_payload(&item.signal, rewrite);
    let result = client
        .post(&url)
        .timeout(timeout)
        .json(&payload)
        .send()
        .await;

    match result {
        Ok(resp) => {
            let code = resp.status().as_u16();
            if resp.status().is_success() {
                mark_forwarded_ok(state, worker_id, item).await;
            } else {
                mark_forwarded_err(state, worker_id, item, format!("http_{code}")).await;
            }
            Some(code)
        }
        Err(e) => {
            let detail = if e.is_timeout() {
                "timeout".to_string()
            } else {
                format!("network_error: {e}")
            };
            mark_forwarded_err(state, worker_id, item, detail).await;
            None
        }
    }
}

async fn mark_forwarded_ok(state: &Arc<AppState>, worker_id: &str, item: &ApprovedSignal) {
    let signal_id = item.signal.signal_id;
    let ticker = item.signal.ticker.clone();

    if let Err(e) = state
        .store
        .set_signal_status(signal_id, SignalStatus::ForwardedOk, worker_id, None)
        .await
    {
        warn!(signal_id = %signal_id, error = %e, "forwarded-ok status write failed");
    }
    MetricsRegistry::incr(&state.metrics.forwarded_ok);
    info!(signal_id = %signal_id, ticker = %ticker, "signal forwarded");

    state.publish(WsEvent::OrderStatusChange(OrderStatusPayload {
        signal_id,
        ticker: ticker.clone(),
        status: SignalStatus::ForwardedOk,
        detail: None,
    }));

    // A delivered exit finalizes the CLOSING position. Classification looks
    // at both wire fields, with exit-like actions winning over `side`.
    if item.signal.intent() == Intent::SellFamily || item.signal_type.is_sell_family() {
        if let Err(e) = state.ledger.finalize_close(&ticker).await {
            warn!(ticker = %ticker, error = %e, "finalize_close failed after forward");
        } else {
            state.publish(WsEvent::PositionsUpdate(PositionsPayload {
                ticker,
                status: "CLOSED".to_string(),
            }));
        }
    }
}

async fn mark_forwarded_err(
    state: &Arc<AppState>,
    worker_id: &str,
    item: &ApprovedSignal,
    detail: String,
) {
    let signal_id = item.signal.signal_id;

    warn!(signal_id = %signal_id, ticker = %item.signal.ticker, detail = %detail, "forwarding failed");
    if let Err(e) = state
        .store
        .set_signal_status(
            signal_id,
            SignalStatus::ForwardedErr,
            worker_id,
            Some(detail.clone()),
        )
        .await
    {
        warn!(signal_id = %signal_id, error = %e, "forwarded-err status write failed");
    }
    MetricsRegistry::incr(&state.metrics.forwarded_err);

    state.publish(WsEvent::OrderStatusChange(OrderStatusPayload {
        signal_id,
        ticker: item.signal.ticker.clone(),
        status: SignalStatus::ForwardedErr,
        detail: Some(detail),
    }));
}

/// The JSON body sent downstream: the original payload untouched, unless the
/// rewrite flag asks for an `action` field derived from `side`.
fn outbound_payload(signal: &Signal, rewrite_side_to_action: bool) -> serde_json::Value {
    let mut payload = if signal.original_payload.is_object() {
        signal.original_payload.clone()
    } else {
        serde_json::json!({
            "ticker": signal.ticker,
            "side": signal.side,
            "action": signal.action,
            "price": signal.price,
            "time": signal.received_at.to_rfc3339(),
        })
    };

    if rewrite_side_to_action {
        if let Some(obj) = payload.as_object_mut() {
            if !obj.contains_key("action") {
                if let Some(side) = obj.get("side").cloned() {
                    obj.insert("action".to_string(), side);
                }
            }
        }
    }
    payload
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RelayConfig;
    use crate::ledger::{CloseOutcome, OpenOutcome};
    use crate::store::memory::MemoryStore;
    use crate::store::PositionStatus;
    use crate::types::SignalType;
    use chrono::Utc;
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// Minimal HTTP responder: answers every connection with `status_line`
    /// after reading the full request head and body.
    async fn spawn_http_server(status_line: &'static str) -> std::net::SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut sock, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = Vec::new();
                    let mut chunk = [0u8; 4096];
                    loop {
                        match sock.read(&mut chunk).await {
                            Ok(0) => break,
                            Ok(n) => {
                                buf.extend_from_slice(&chunk[..n]);
                                if request_complete(&buf) {
                                    break;
                                }
                            }
                            Err(_) => break,
                        }
                    }
                    let resp = format!(
                        "HTTP/1.1 {status_line}\r\ncontent-length: 0\r\nconnection: close\r\n\r\n"
                    );
                    let _ = sock.write_all(resp.as_bytes()).await;
                    let _ = sock.shutdown().await;
                });
            }
        });
        addr
    }

    fn request_complete(buf: &[u8]) -> bool {
        let Some(head_end) = buf.windows(4).position(|w| w == b"\r\n\r\n") else {
            return false;
        };
        let head = String::from_utf8_lossy(&buf[..head_end]);
        let content_length = head
            .lines()
            .find_map(|line| {
                let (name, value) = line.split_once(':')?;
                name.trim()
                    .eq_ignore_ascii_case("content-length")
                    .then(|| value.trim().parse::<usize>().ok())?
            })
            .unwrap_or(0);
        buf.len() >= head_end + 4 + content_length
    }

    fn state_with_dest(url: String) -> Arc<AppState> {
        let config = RelayConfig {
            dest_webhook_url: url,
            dest_webhook_timeout_secs: 2,
            ..RelayConfig::default()
        };
        Arc::new(AppState::new(config, Arc::new(MemoryStore::new())))
    }

    fn approved(ticker: &str, side: Option<&str>, action: Option<&str>) -> ApprovedSignal {
        let signal = Signal::new(
            ticker.to_string(),
            side.map(str::to_string),
            action.map(str::to_string),
            Some(10.0),
            Utc::now(),
            json!({"ticker": ticker, "side": side, "action": action}),
        );
        let signal_type = signal.ingress_signal_type();
        ApprovedSignal {
            signal,
            signal_type,
        }
    }

    async fn persist_approved(state: &AppState, item: &ApprovedSignal) {
        state
            .store
            .insert_signal(&item.signal, SignalStatus::Received, item.signal_type)
            .await
            .unwrap();
        state
            .store
            .set_signal_status(item.signal.signal_id, SignalStatus::Approved, "decision-0", None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn successful_forward_marks_forwarded_ok() {
        let addr = spawn_http_server("200 OK").await;
        let state = state_with_dest(format!("http://{addr}/hook"));
        let item = approved("AAPL", Some("buy"), None);
        persist_approved(&state, &item).await;

        let status = deliver(&state, &build_client(), "forward-0", &item).await;
        assert_eq!(status, Some(200));
        assert_eq!(
            state.store.get_signal(item.signal.signal_id).await.unwrap().status,
            SignalStatus::ForwardedOk
        );
        assert_eq!(state.metrics.snapshot().forwarded_ok, 1);
    }

    #[tokio::test]
    async fn forwarded_exit_finalizes_the_position() {
        let addr = spawn_http_server("200 OK").await;
        let state = state_with_dest(format!("http://{addr}/hook"));

        // Entry forwarded earlier; now forward the exit.
        let entry = approved("AAPL", Some("buy"), None);
        persist_approved(&state, &entry).await;
        let opened = state
            .ledger
            .try_open("AAPL", entry.signal.signal_id)
            .await
            .unwrap();
        assert!(matches!(opened, OpenOutcome::Opened(_)));

        let exit = approved("AAPL", None, Some("exit"));
        persist_approved(&state, &exit).await;
        let closing = state
            .ledger
            .try_begin_close("AAPL", exit.signal.signal_id)
            .await
            .unwrap();
        assert!(matches!(closing, CloseOutcome::Closing(_)));

        let status = deliver(&state, &build_client(), "forward-0", &exit).await;
        assert_eq!(status, Some(200));

        // Round trip: one CLOSED position with matching entry/exit ids.
        assert!(state.store.list_open_positions().await.unwrap().is_empty());
        let mut txn_check = state.store.list_signals(&Default::default()).await.unwrap();
        txn_check.retain(|r| r.status == SignalStatus::ForwardedOk);
        assert_eq!(txn_check.len(), 1);
        assert!(!state.store.is_position_open_or_closing("AAPL").await.unwrap());
    }

    #[tokio::test]
    async fn non_2xx_is_terminal_and_keeps_the_position_closing() {
        let addr = spawn_http_server("500 Internal Server Error").await;
        let state = state_with_dest(format!("http://{addr}/hook"));

        let entry = approved("AAPL", Some("buy"), None);
        persist_approved(&state, &entry).await;
        state
            .ledger
            .try_open("AAPL", entry.signal.signal_id)
            .await
            .unwrap();

        let exit = approved("AAPL", Some("sell"), None);
        persist_approved(&state, &exit).await;
        state
            .ledger
            .try_begin_close("AAPL", exit.signal.signal_id)
            .await
            .unwrap();

        let status = deliver(&state, &build_client(), "forward-0", &exit).await;
        assert_eq!(status, Some(500));

        let row = state.store.get_signal(exit.signal.signal_id).await.unwrap();
        assert_eq!(row.status, SignalStatus::ForwardedErr);
        assert_eq!(row.last_detail.as_deref(), Some("http_500"));

        // The exit never landed: the position must stay CLOSING, not CLOSED.
        let positions = state.store.list_open_positions().await.unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].status, PositionStatus::Closing);
        assert_eq!(state.metrics.snapshot().forwarded_err, 1);
    }

    #[tokio::test]
    async fn network_error_is_terminal() {
        // Bind to grab a free port, then drop the listener.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let state = state_with_dest(format!("http://{addr}/hook"));
        let item = approved("AAPL", Some("buy"), None);
        persist_approved(&state, &item).await;

        let status = deliver(&state, &build_client(), "forward-0", &item).await;
        assert_eq!(status, None);
        let row = state.store.get_signal(item.signal.signal_id).await.unwrap();
        assert_eq!(row.status, SignalStatus::ForwardedErr);
    }

    #[test]
    fn rewrite_flag_copies_side_into_missing_action() {
        let signal = Signal::new(
            "AAPL".into(),
            Some("sell".into()),
            None,
            None,
            Utc::now(),
            json!({"ticker": "AAPL", "side": "sell"}),
        );
        let plain = outbound_payload(&signal, false);
        assert!(plain.get("action").is_none());

        let rewritten = outbound_payload(&signal, true);
        assert_eq!(rewritten.get("action").and_then(|v| v.as_str()), Some("sell"));
        // The stored signal itself is untouched.
        assert!(signal.original_payload.get("action").is_none());
    }

    #[test]
    fn non_object_payload_falls_back_to_stored_fields() {
        let signal = Signal::new(
            "AAPL".into(),
            Some("buy".into()),
            None,
            Some(12.0),
            Utc::now(),
            serde_json::Value::Null,
        );
        let payload = outbound_payload(&signal, false);
        assert_eq!(payload.get("ticker").and_then(|v| v.as_str()), Some("AAPL"));
        assert_eq!(payload.get("price").and_then(|v| v.as_f64()), Some(12.0));
    }
}
