// =============================================================================
// Central Application State — signal-relay
// =============================================================================
//
// The single hub tying the subsystems together. All async tasks hold an
// `Arc<AppState>`; each subsystem manages its own interior mutability.
//
// Thread safety:
//   - Atomic counters for lock-free version tracking.
//   - parking_lot::RwLock for the mutable config (never held across await).
//   - Arc wrappers for engines that manage their own synchronization.
//
// The state-version counter is incremented on every meaningful mutation; the
// WebSocket broadcast task uses it to decide when to push fresh
// metrics/status frames.
// =============================================================================

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::{broadcast, Notify};
use uuid::Uuid;

use crate::config::RelayConfig;
use crate::ledger::PositionLedger;
use crate::metrics::{MetricsRegistry, MetricsSnapshot};
use crate::queue::BoundedQueue;
use crate::ranking::RankingHandle;
use crate::ratelimit::{OutboundRateLimiter, RateLimiterSnapshot};
use crate::reprocess::{ReprocessHealth, ReprocessingEngine};
use crate::store::{Store, StoreError, Strategy};
use crate::types::{ApprovedSignal, QueuedSignal, Signal, SignalStatus, SignalType};

/// Capacity of the WebSocket event fan-out channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

// =============================================================================
// WebSocket events
// =============================================================================

/// Typed events published to WebSocket clients.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum WsEvent {
    MetricsUpdate(MetricsSnapshot),
    StatusUpdate(StatusPayload),
    PositionsUpdate(PositionsPayload),
    FinvizStrategyChanged(Strategy),
    OrderStatusChange(OrderStatusPayload),
}

/// Compact operational status frame.
#[derive(Debug, Clone, Serialize)]
pub struct StatusPayload {
    pub state_version: u64,
    pub ranking_generation: u64,
    pub ranking_size: usize,
    pub in_queue_depth: usize,
    pub approved_queue_depth: usize,
    pub refresher_paused: bool,
    pub rate_limiter_enabled: bool,
    pub shutting_down: bool,
    pub server_time: i64,
}

/// A position changed state for `ticker`.
#[derive(Debug, Clone, Serialize)]
pub struct PositionsPayload {
    pub ticker: String,
    pub status: String,
}

/// A signal moved through its lifecycle.
#[derive(Debug, Clone, Serialize)]
pub struct OrderStatusPayload {
    pub signal_id: Uuid,
    pub ticker: String,
    pub status: SignalStatus,
    pub detail: Option<String>,
}

// =============================================================================
// Refresher control
// =============================================================================

/// Pause flag + forced-refresh doorbell for the ranking refresher.
#[derive(Debug, Default)]
pub struct RefresherControl {
    paused: AtomicBool,
    pub force: Notify,
}

impl RefresherControl {
    pub fn pause(&self) {
        self.paused.store(true, Ordering::Relaxed);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::Relaxed);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Relaxed)
    }
}

// =============================================================================
// Submission
// =============================================================================

/// Failure of an ingress submission.
#[derive(Debug)]
pub enum SubmitError {
    /// The InQueue is at capacity (or the relay is shutting down); nothing
    /// was persisted.
    Backpressure,
    Store(StoreError),
}

// =============================================================================
// AppState
// =============================================================================

/// Central application state shared across all async tasks via
/// `Arc<AppState>`.
pub struct AppState {
    // ── Version tracking ────────────────────────────────────────────────
    pub state_version: AtomicU64,

    // ── Configuration ───────────────────────────────────────────────────
    pub config: RwLock<RelayConfig>,

    // ── Durable state ───────────────────────────────────────────────────
    pub store: Arc<dyn Store>,
    pub ledger: PositionLedger,

    // ── Pipeline ────────────────────────────────────────────────────────
    pub in_queue: BoundedQueue<QueuedSignal>,
    pub approved_queue: BoundedQueue<ApprovedSignal>,
    pub rate_limiter: Arc<OutboundRateLimiter>,

    // ── Ranking & reprocessing ──────────────────────────────────────────
    pub ranking: RankingHandle,
    pub reprocessor: Arc<ReprocessingEngine>,
    pub refresher: RefresherControl,

    // ── Observability ───────────────────────────────────────────────────
    pub metrics: Arc<MetricsRegistry>,
    pub events: broadcast::Sender<WsEvent>,

    // ── Lifecycle ───────────────────────────────────────────────────────
    pub shutting_down: AtomicBool,
    pub start_time: std::time::Instant,
}

impl AppState {
    /// Construct the full state graph from the given configuration and
    /// store. The returned value is typically wrapped in `Arc` immediately.
    pub fn new(config: RelayConfig, store: Arc<dyn Store>) -> Self {
        let in_queue = BoundedQueue::new(config.in_queue_capacity);
        let approved_queue = BoundedQueue::new(config.approved_queue_capacity);
        let metrics = Arc::new(MetricsRegistry::new());
        let rate_limiter = Arc::new(OutboundRateLimiter::new(config.max_req_per_min));
        let reprocessor = Arc::new(ReprocessingEngine::new(
            store.clone(),
            approved_queue.clone(),
            metrics.clone(),
            Duration::from_secs(config.reprocess_deadline_secs),
            config.max_signals_per_ticker,
        ));
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Self {
            state_version: AtomicU64::new(1),
            config: RwLock::new(config),
            ledger: PositionLedger::new(store.clone()),
            store,
            in_queue,
            approved_queue,
            rate_limiter,
            ranking: RankingHandle::new(),
            reprocessor,
            refresher: RefresherControl::default(),
            metrics,
            events,
            shutting_down: AtomicBool::new(false),
            start_time: std::time::Instant::now(),
        }
    }

    // ── Version management ──────────────────────────────────────────────

    pub fn increment_version(&self) -> u64 {
        self.state_version.fetch_add(1, Ordering::SeqCst)
    }

    pub fn current_state_version(&self) -> u64 {
        self.state_version.load(Ordering::SeqCst)
    }

    // ── Event fan-out ───────────────────────────────────────────────────

    /// Publish a typed event to WebSocket subscribers and bump the version.
    /// A send error only means no subscriber is connected.
    pub fn publish(&self, event: WsEvent) {
        let _ = self.events.send(event);
        self.increment_version();
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WsEvent> {
        self.events.subscribe()
    }

    // ── Ingress ─────────────────────────────────────────────────────────

    /// Accept a normalized signal into the pipeline.
    ///
    /// The InQueue slot is reserved BEFORE the signal is persisted: a full
    /// queue fails with `Backpressure` and leaves no trace in the store.
    pub async fn submit(&self, signal: Signal) -> Result<(Uuid, SignalType), SubmitError> {
        if self.shutting_down.load(Ordering::Relaxed) {
            MetricsRegistry::incr(&self.metrics.backpressure_rejections);
            return Err(SubmitError::Backpressure);
        }

        let slot = match self.in_queue.try_reserve() {
            Ok(slot) => slot,
            Err(_) => {
                MetricsRegistry::incr(&self.metrics.backpressure_rejections);
                return Err(SubmitError::Backpressure);
            }
        };

        let signal_type = signal.ingress_signal_type();
        self.store
            .insert_signal(&signal, SignalStatus::Received, signal_type)
            .await
            .map_err(SubmitError::Store)?;
        MetricsRegistry::incr(&self.metrics.signals_received);

        let signal_id = signal.signal_id;
        let ticker = signal.ticker.clone();
        slot.send(QueuedSignal {
            signal,
            signal_type,
            retry_count: 0,
        });

        self.publish(WsEvent::OrderStatusChange(OrderStatusPayload {
            signal_id,
            ticker,
            status: SignalStatus::Received,
            detail: None,
        }));
        Ok((signal_id, signal_type))
    }

    // ── Snapshots for the admin surface ─────────────────────────────────

    pub fn status_payload(&self) -> StatusPayload {
        let snapshot = self.ranking.load();
        StatusPayload {
            state_version: self.current_state_version(),
            ranking_generation: snapshot.generation,
            ranking_size: snapshot.tickers.len(),
            in_queue_depth: self.in_queue.depth(),
            approved_queue_depth: self.approved_queue.depth(),
            refresher_paused: self.refresher.is_paused(),
            rate_limiter_enabled: self.rate_limiter.is_enabled(),
            shutting_down: self.shutting_down.load(Ordering::Relaxed),
            server_time: Utc::now().timestamp_millis(),
        }
    }

    /// Full system payload: store truth for positions and the active
    /// strategy, in-memory truth for queues, workers, and pacing.
    pub async fn system_info(&self) -> SystemInfo {
        let ranking = self.ranking.load();
        let (decision_workers, forwarding_workers) = {
            let config = self.config.read();
            (config.decision_workers, config.forwarding_workers)
        };

        let active_strategy = self.store.active_strategy().await.ok();
        let open_positions = self
            .store
            .list_open_positions()
            .await
            .map(|rows| rows.len())
            .unwrap_or(0);

        SystemInfo {
            uptime_secs: self.start_time.elapsed().as_secs(),
            state_version: self.current_state_version(),
            ranking: RankingInfo {
                generation: ranking.generation,
                size: ranking.tickers.len(),
                fetched_at: ranking.fetched_at,
            },
            queues: QueueInfo {
                in_depth: self.in_queue.depth(),
                in_capacity: self.in_queue.capacity(),
                approved_depth: self.approved_queue.depth(),
                approved_capacity: self.approved_queue.capacity(),
            },
            workers: WorkerInfo {
                decision: decision_workers,
                forwarding: forwarding_workers,
            },
            active_strategy,
            reprocess_health: self.reprocessor.health(),
            rate_limiter: self.rate_limiter.snapshot().await,
            refresher_paused: self.refresher.is_paused(),
            open_positions,
        }
    }
}

// =============================================================================
// Serialisable system payloads
// =============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct SystemInfo {
    pub uptime_secs: u64,
    pub state_version: u64,
    pub ranking: RankingInfo,
    pub queues: QueueInfo,
    pub workers: WorkerInfo,
    pub active_strategy: Option<Strategy>,
    pub reprocess_health: ReprocessHealth,
    pub rate_limiter: RateLimiterSnapshot,
    pub refresher_paused: bool,
    pub open_positions: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RankingInfo {
    pub generation: u64,
    pub size: usize,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueInfo {
    pub in_depth: usize,
    pub in_capacity: usize,
    pub approved_depth: usize,
    pub approved_capacity: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerInfo {
    pub decision: usize,
    pub forwarding: usize,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use serde_json::json;

    fn state_with_queue_capacity(capacity: usize) -> Arc<AppState> {
        let config = RelayConfig {
            in_queue_capacity: capacity,
            ..RelayConfig::default()
        };
        Arc::new(AppState::new(config, Arc::new(MemoryStore::new())))
    }

    fn buy(ticker: &str) -> Signal {
        Signal::new(
            ticker.to_string(),
            Some("buy".into()),
            None,
            None,
            Utc::now(),
            json!({"ticker": ticker, "side": "buy"}),
        )
    }

    #[tokio::test]
    async fn submit_persists_and_enqueues() {
        let state = state_with_queue_capacity(8);
        let (signal_id, signal_type) = state.submit(buy("AAPL")).await.unwrap();
        assert_eq!(signal_type, SignalType::Buy);
        assert_eq!(state.in_queue.depth(), 1);

        let row = state.store.get_signal(signal_id).await.unwrap();
        assert_eq!(row.status, SignalStatus::Received);
        assert_eq!(state.metrics.snapshot().signals_received, 1);
    }

    #[tokio::test]
    async fn full_queue_is_backpressure_with_nothing_persisted() {
        let state = state_with_queue_capacity(1);
        state.submit(buy("AAPL")).await.unwrap();

        let err = state.submit(buy("MSFT")).await.unwrap_err();
        assert!(matches!(err, SubmitError::Backpressure));

        // Only the first signal exists in the store.
        let all = state
            .store
            .list_signals(&crate::store::SignalFilter::default())
            .await
            .unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].ticker, "AAPL");
        assert_eq!(state.metrics.snapshot().backpressure_rejections, 1);
    }

    #[tokio::test]
    async fn shutdown_stops_accepting_submissions() {
        let state = state_with_queue_capacity(8);
        state.shutting_down.store(true, Ordering::Relaxed);
        let err = state.submit(buy("AAPL")).await.unwrap_err();
        assert!(matches!(err, SubmitError::Backpressure));
    }

    #[tokio::test]
    async fn publish_increments_version_and_reaches_subscribers() {
        let state = state_with_queue_capacity(8);
        let mut rx = state.subscribe();
        let before = state.current_state_version();

        state.publish(WsEvent::StatusUpdate(state.status_payload()));
        assert!(state.current_state_version() > before);

        let event = rx.recv().await.unwrap();
        assert!(matches!(event, WsEvent::StatusUpdate(_)));
    }
}
