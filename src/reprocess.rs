// =============================================================================
// Reprocessing Engine — revives rejected BUYs when their ticker enters the
// ranking
// =============================================================================
//
// For every ticker that newly entered the ranking, rejected BUY signals are
// re-examined oldest-admissible-first. Admission is a single store
// transaction: optimistic re-approval (the signal must still be REJECTED),
// a position re-check, and the position open — then, strictly after commit,
// the reconstructed signal is enqueued for forwarding. An enqueue failure
// after commit is a critical inconsistency (position without a queued
// forward) that is surfaced, never compensated.
//
// Per ticker, iteration stops at the first success: one open position is the
// most a ticker can have.
// =============================================================================

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::metrics::MetricsRegistry;
use crate::queue::BoundedQueue;
use crate::store::{SignalRow, Store, StoreError, Strategy};
use crate::types::{classify_intent, ApprovedSignal, Intent, Signal, SignalStatus, SignalType};

/// Worker id stamped on events written by this engine.
pub const WORKER_ID: &str = "reprocessor";

/// Budget for the post-commit enqueue before it counts as failed.
const ENQUEUE_TIMEOUT: Duration = Duration::from_secs(5);

/// Rolling window for health aggregation; also the staleness threshold.
const HEALTH_WINDOW_SECS: i64 = 3600;

// =============================================================================
// Outcomes & health
// =============================================================================

/// Per-candidate outcome of a reprocessing attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReprocessOutcome {
    Success,
    FailedValidation,
    FailedReconstruction,
    FailedDatabase,
    FailedQueue,
    SkippedNonBuy,
    SkippedPositionExists,
    SkippedSellChronology,
    SkippedStatusChanged,
}

impl std::fmt::Display for ReprocessOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Success => "SUCCESS",
            Self::FailedValidation => "FAILED_VALIDATION",
            Self::FailedReconstruction => "FAILED_RECONSTRUCTION",
            Self::FailedDatabase => "FAILED_DATABASE",
            Self::FailedQueue => "FAILED_QUEUE",
            Self::SkippedNonBuy => "SKIPPED_NON_BUY",
            Self::SkippedPositionExists => "SKIPPED_POSITION_EXISTS",
            Self::SkippedSellChronology => "SKIPPED_SELL_CHRONOLOGY",
            Self::SkippedStatusChanged => "SKIPPED_STATUS_CHANGED",
        };
        write!(f, "{name}")
    }
}

/// Aggregate health over the rolling window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Critical,
    Stale,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReprocessHealth {
    pub status: HealthStatus,
    pub success_rate: Option<f64>,
    pub processed: u64,
    pub successful: u64,
    pub last_cycle_at: Option<DateTime<Utc>>,
    pub last_cycle_duration_ms: Option<u64>,
}

/// Result of one full cycle over an `entered` set.
#[derive(Debug, Clone)]
pub struct CycleSummary {
    pub processed: u64,
    pub successful: u64,
    pub timed_out: bool,
    pub duration_ms: u64,
}

#[derive(Debug, Clone)]
struct CycleRecord {
    at: DateTime<Utc>,
    duration_ms: u64,
    processed: u64,
    successful: u64,
}

// =============================================================================
// Engine
// =============================================================================

pub struct ReprocessingEngine {
    store: Arc<dyn Store>,
    approved_queue: BoundedQueue<ApprovedSignal>,
    metrics: Arc<MetricsRegistry>,
    deadline: Duration,
    max_signals_per_ticker: usize,
    history: Mutex<Vec<CycleRecord>>,
}

impl ReprocessingEngine {
    pub fn new(
        store: Arc<dyn Store>,
        approved_queue: BoundedQueue<ApprovedSignal>,
        metrics: Arc<MetricsRegistry>,
        deadline: Duration,
        max_signals_per_ticker: usize,
    ) -> Self {
        Self {
            store,
            approved_queue,
            metrics,
            deadline,
            max_signals_per_ticker,
            history: Mutex::new(Vec::new()),
        }
    }

    /// Run one reprocessing cycle over the tickers that entered the ranking.
    ///
    /// Soft deadline: once exceeded, no new per-ticker work starts; whatever
    /// is in flight finishes (or rolls back) on its own.
    pub async fn run_cycle(&self, entered: &HashSet<String>, strategy: &Strategy) -> CycleSummary {
        let started = Instant::now();
        let started_at = Utc::now();
        let mut processed = 0u64;
        let mut successful = 0u64;
        let mut timed_out = false;

        let mut tickers: Vec<&String> = entered.iter().collect();
        tickers.sort();

        for ticker in tickers {
            if started.elapsed() >= self.deadline {
                timed_out = true;
                MetricsRegistry::incr(&self.metrics.reprocess_timeouts);
                warn!(
                    deadline_secs = self.deadline.as_secs(),
                    "reprocessing cycle hit its deadline — remaining tickers deferred"
                );
                break;
            }
            let (p, s) = self.reprocess_ticker(ticker, strategy).await;
            processed += p;
            successful += s;
        }

        MetricsRegistry::incr(&self.metrics.reprocess_cycles);
        let duration_ms = started.elapsed().as_millis() as u64;
        {
            let mut history = self.history.lock();
            history.push(CycleRecord {
                at: started_at,
                duration_ms,
                processed,
                successful,
            });
            let cutoff = Utc::now() - chrono::Duration::seconds(HEALTH_WINDOW_SECS);
            history.retain(|r| r.at >= cutoff);
        }

        info!(
            tickers = entered.len(),
            processed, successful, timed_out, duration_ms, "reprocessing cycle finished"
        );
        CycleSummary {
            processed,
            successful,
            timed_out,
            duration_ms,
        }
    }

    /// Examine one ticker's rejected-BUY candidates. Returns
    /// `(processed, successful)`; stops at the first success.
    async fn reprocess_ticker(&self, ticker: &str, strategy: &Strategy) -> (u64, u64) {
        let candidates = match self
            .store
            .get_rejected_buy_candidates(
                ticker,
                strategy.reprocess_window_seconds,
                self.max_signals_per_ticker,
            )
            .await
        {
            Ok(rows) => rows,
            Err(e) => {
                warn!(ticker, error = %e, "candidate query failed");
                self.metrics
                    .record_reprocess_outcome(ReprocessOutcome::FailedDatabase);
                return (1, 0);
            }
        };

        if candidates.is_empty() {
            debug!(ticker, "no rejected BUY candidates");
            return (0, 0);
        }

        let mut processed = 0u64;
        let mut successful = 0u64;

        // The store returns newest first; admit the oldest admissible first.
        for row in candidates.iter().rev() {
            processed += 1;
            let outcome = self.admit_candidate(ticker, row, strategy).await;
            self.metrics.record_reprocess_outcome(outcome);

            match outcome {
                ReprocessOutcome::Success => {
                    info!(ticker, signal_id = %row.signal_id, "rejected BUY revived and enqueued");
                    successful += 1;
                    break;
                }
                ReprocessOutcome::SkippedNonBuy
                | ReprocessOutcome::SkippedPositionExists
                | ReprocessOutcome::SkippedSellChronology
                | ReprocessOutcome::SkippedStatusChanged => {
                    debug!(ticker, signal_id = %row.signal_id, outcome = %outcome, "candidate skipped");
                }
                _ => {
                    warn!(ticker, signal_id = %row.signal_id, outcome = %outcome, "candidate failed");
                }
            }
        }

        (processed, successful)
    }

    /// Run the guard chain and the atomic admission for one candidate.
    async fn admit_candidate(
        &self,
        ticker: &str,
        row: &SignalRow,
        strategy: &Strategy,
    ) -> ReprocessOutcome {
        // a. Classification guard — re-derive intent from the original
        //    payload, falling back to the stored columns.
        let payload_side = row
            .original_payload
            .get("side")
            .and_then(|v| v.as_str())
            .or(row.side.as_deref());
        let payload_action = row
            .original_payload
            .get("action")
            .and_then(|v| v.as_str())
            .or(row.action.as_deref());
        if classify_intent(payload_side, payload_action) != Intent::Buy {
            return ReprocessOutcome::SkippedNonBuy;
        }

        // b. Position-existence guard.
        match self.store.is_position_open_or_closing(ticker).await {
            Ok(true) => return ReprocessOutcome::SkippedPositionExists,
            Ok(false) => {}
            Err(_) => return ReprocessOutcome::FailedDatabase,
        }

        // c. Chronology guard — a later SELL means the source already
        //    expressed exit intent; don't revive the buy.
        if strategy.respect_sell_chronology_enabled {
            match self
                .store
                .has_subsequent_sell(
                    ticker,
                    row.created_at,
                    strategy.sell_chronology_window_seconds,
                )
                .await
            {
                Ok(true) => return ReprocessOutcome::SkippedSellChronology,
                Ok(false) => {}
                Err(_) => return ReprocessOutcome::FailedDatabase,
            }
        }

        // d. Reconstruction.
        let signal = match reconstruct_signal(row) {
            Some(signal) => signal,
            None => return ReprocessOutcome::FailedReconstruction,
        };

        // e. Atomic admission: re-approve + re-check + open, one transaction.
        let mut txn = match self.store.begin().await {
            Ok(txn) => txn,
            Err(_) => return ReprocessOutcome::FailedDatabase,
        };

        if let Err(e) = txn
            .reapprove_signal_with_validation(row.signal_id, SignalStatus::Rejected, WORKER_ID)
            .await
        {
            let outcome = match e {
                StoreError::Conflict(_) => ReprocessOutcome::SkippedStatusChanged,
                StoreError::NotFound(_) => ReprocessOutcome::FailedValidation,
                _ => ReprocessOutcome::FailedDatabase,
            };
            let _ = txn.rollback().await;
            return outcome;
        }

        match txn.is_position_open_or_closing(ticker).await {
            Ok(false) => {}
            Ok(true) => {
                let _ = txn.rollback().await;
                return ReprocessOutcome::SkippedPositionExists;
            }
            Err(_) => {
                let _ = txn.rollback().await;
                return ReprocessOutcome::FailedDatabase;
            }
        }

        match txn.open_position(ticker, row.signal_id).await {
            Ok(_) => {}
            Err(StoreError::Conflict(_)) => {
                let _ = txn.rollback().await;
                return ReprocessOutcome::SkippedPositionExists;
            }
            Err(_) => {
                let _ = txn.rollback().await;
                return ReprocessOutcome::FailedDatabase;
            }
        }

        if txn.commit().await.is_err() {
            return ReprocessOutcome::FailedDatabase;
        }

        // f. Post-commit enqueue. A failure here leaves a durable position
        //    with no queued forward: surface it, do not roll the position
        //    back.
        let approved = ApprovedSignal {
            signal,
            signal_type: SignalType::Buy,
        };
        match self.approved_queue.push_timeout(approved, ENQUEUE_TIMEOUT).await {
            Ok(()) => ReprocessOutcome::Success,
            Err(_) => {
                error!(
                    signal_id = %row.signal_id,
                    ticker,
                    "CRITICAL: position opened but forwarding enqueue failed — manual reconciliation required"
                );
                MetricsRegistry::incr(&self.metrics.critical_incidents);
                ReprocessOutcome::FailedQueue
            }
        }
    }

    /// Aggregate health over the rolling window.
    pub fn health(&self) -> ReprocessHealth {
        let cutoff = Utc::now() - chrono::Duration::seconds(HEALTH_WINDOW_SECS);
        let mut history = self.history.lock();
        history.retain(|r| r.at >= cutoff);

        let Some(last) = history.last().cloned() else {
            return ReprocessHealth {
                status: HealthStatus::Stale,
                success_rate: None,
                processed: 0,
                successful: 0,
                last_cycle_at: None,
                last_cycle_duration_ms: None,
            };
        };

        let processed: u64 = history.iter().map(|r| r.processed).sum();
        let successful: u64 = history.iter().map(|r| r.successful).sum();
        let success_rate = if processed == 0 {
            1.0
        } else {
            successful as f64 / processed as f64
        };

        let status = if success_rate >= 0.95 && last.duration_ms < 10_000 {
            HealthStatus::Healthy
        } else if success_rate >= 0.85 && last.duration_ms < 30_000 {
            HealthStatus::Warning
        } else {
            HealthStatus::Critical
        };

        ReprocessHealth {
            status,
            success_rate: Some(success_rate),
            processed,
            successful,
            last_cycle_at: Some(last.at),
            last_cycle_duration_ms: Some(last.duration_ms),
        }
    }
}

impl std::fmt::Debug for ReprocessingEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReprocessingEngine")
            .field("deadline", &self.deadline)
            .field("max_signals_per_ticker", &self.max_signals_per_ticker)
            .finish_non_exhaustive()
    }
}

/// Rebuild a forwardable signal from a stored candidate, preferring the
/// original payload, then the stored columns, then a minimal synthetic BUY.
/// The signal id is always preserved.
fn reconstruct_signal(row: &SignalRow) -> Option<Signal> {
    if row.ticker.trim().is_empty() {
        return None;
    }

    let (side, action, price, received_at) = if row.original_payload.is_object() {
        (
            row.original_payload
                .get("side")
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .or_else(|| row.side.clone()),
            row.original_payload
                .get("action")
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .or_else(|| row.action.clone()),
            row.original_payload
                .get("price")
                .and_then(|v| v.as_f64())
                .or(row.price),
            row.received_at,
        )
    } else if row.side.is_some() || row.price.is_some() {
        (row.side.clone(), row.action.clone(), row.price, row.received_at)
    } else {
        (Some("buy".to_string()), None, None, Utc::now())
    };

    Some(Signal {
        signal_id: row.signal_id,
        ticker: row.ticker.clone(),
        side: side.or_else(|| Some("buy".to_string())),
        action,
        price,
        received_at,
        original_payload: row.original_payload.clone(),
    })
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use serde_json::json;

    fn strategy(chronology: bool) -> Strategy {
        Strategy {
            id: 1,
            name: "test".into(),
            url: "https://example.com".into(),
            top_n: 20,
            refresh_interval_secs: 60,
            reprocess_enabled: true,
            reprocess_window_seconds: 0,
            respect_sell_chronology_enabled: chronology,
            sell_chronology_window_seconds: 300,
            is_active: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn engine(store: Arc<MemoryStore>) -> (ReprocessingEngine, BoundedQueue<ApprovedSignal>) {
        let queue: BoundedQueue<ApprovedSignal> = BoundedQueue::new(16);
        let engine = ReprocessingEngine::new(
            store,
            queue.clone(),
            Arc::new(MetricsRegistry::new()),
            Duration::from_secs(30),
            10,
        );
        (engine, queue)
    }

    async fn rejected_buy(store: &MemoryStore, ticker: &str) -> Signal {
        let signal = Signal::new(
            ticker.to_string(),
            Some("buy".into()),
            None,
            Some(50.0),
            Utc::now(),
            json!({"ticker": ticker, "side": "buy", "price": 50.0}),
        );
        store
            .insert_signal(&signal, SignalStatus::Received, SignalType::Buy)
            .await
            .unwrap();
        store
            .set_signal_status(
                signal.signal_id,
                SignalStatus::Rejected,
                "decision-0",
                Some("not_in_ranking".into()),
            )
            .await
            .unwrap();
        signal
    }

    fn entered(ticker: &str) -> HashSet<String> {
        std::iter::once(ticker.to_string()).collect()
    }

    #[tokio::test]
    async fn revives_a_rejected_buy_and_enqueues_it() {
        let store = Arc::new(MemoryStore::new());
        let signal = rejected_buy(&store, "AAPL").await;
        let (engine, queue) = engine(store.clone());

        let summary = engine.run_cycle(&entered("AAPL"), &strategy(false)).await;
        assert_eq!(summary.successful, 1);

        let row = store.get_signal(signal.signal_id).await.unwrap();
        assert_eq!(row.status, SignalStatus::Approved);
        assert!(store.is_position_open_or_closing("AAPL").await.unwrap());

        let queued = queue.pop().await.unwrap();
        assert_eq!(queued.signal.signal_id, signal.signal_id);
        assert_eq!(queued.signal.ticker, "AAPL");
    }

    #[tokio::test]
    async fn second_run_is_idempotent() {
        let store = Arc::new(MemoryStore::new());
        rejected_buy(&store, "AAPL").await;
        let (engine, queue) = engine(store.clone());

        let first = engine.run_cycle(&entered("AAPL"), &strategy(false)).await;
        let second = engine.run_cycle(&entered("AAPL"), &strategy(false)).await;
        assert_eq!(first.successful, 1);
        assert_eq!(second.successful, 0);

        // Exactly one position, exactly one enqueued forward.
        assert_eq!(store.list_open_positions().await.unwrap().len(), 1);
        assert_eq!(queue.depth(), 1);
    }

    #[tokio::test]
    async fn subsequent_sell_blocks_revival_when_chronology_enabled() {
        let store = Arc::new(MemoryStore::new());
        let buy = rejected_buy(&store, "AAPL").await;

        // A later SELL for the same ticker, itself rejected.
        let sell = Signal::new(
            "AAPL".into(),
            Some("sell".into()),
            None,
            None,
            Utc::now(),
            json!({"ticker": "AAPL", "side": "sell"}),
        );
        store
            .insert_signal(&sell, SignalStatus::Received, SignalType::Sell)
            .await
            .unwrap();
        store
            .set_signal_status(
                sell.signal_id,
                SignalStatus::Rejected,
                "decision-0",
                Some("no_open_position".into()),
            )
            .await
            .unwrap();

        let (engine, queue) = engine(store.clone());
        let summary = engine.run_cycle(&entered("AAPL"), &strategy(true)).await;
        assert_eq!(summary.successful, 0);
        assert!(!store.is_position_open_or_closing("AAPL").await.unwrap());
        assert_eq!(
            store.get_signal(buy.signal_id).await.unwrap().status,
            SignalStatus::Rejected
        );
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn chronology_disabled_allows_revival_despite_later_sell() {
        let store = Arc::new(MemoryStore::new());
        let buy = rejected_buy(&store, "AAPL").await;
        let sell = Signal::new(
            "AAPL".into(),
            Some("sell".into()),
            None,
            None,
            Utc::now(),
            json!({"ticker": "AAPL", "side": "sell"}),
        );
        store
            .insert_signal(&sell, SignalStatus::Received, SignalType::Sell)
            .await
            .unwrap();
        store
            .set_signal_status(sell.signal_id, SignalStatus::Rejected, "decision-0", None)
            .await
            .unwrap();

        let (engine, _queue) = engine(store.clone());
        let summary = engine.run_cycle(&entered("AAPL"), &strategy(false)).await;
        assert_eq!(summary.successful, 1);
        assert_eq!(
            store.get_signal(buy.signal_id).await.unwrap().status,
            SignalStatus::Approved
        );
        assert!(store.is_position_open_or_closing("AAPL").await.unwrap());
    }

    #[tokio::test]
    async fn existing_position_blocks_revival() {
        let store = Arc::new(MemoryStore::new());
        let buy = rejected_buy(&store, "AAPL").await;
        let mut txn = store.begin().await.unwrap();
        txn.open_position("AAPL", uuid::Uuid::new_v4()).await.unwrap();
        txn.commit().await.unwrap();

        let (engine, queue) = engine(store.clone());
        let summary = engine.run_cycle(&entered("AAPL"), &strategy(false)).await;
        assert_eq!(summary.successful, 0);
        assert_eq!(
            store.get_signal(buy.signal_id).await.unwrap().status,
            SignalStatus::Rejected
        );
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn at_most_one_candidate_revived_per_ticker() {
        let store = Arc::new(MemoryStore::new());
        let older = rejected_buy(&store, "AAPL").await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        let newer = rejected_buy(&store, "AAPL").await;

        let (engine, queue) = engine(store.clone());
        let summary = engine.run_cycle(&entered("AAPL"), &strategy(false)).await;
        assert_eq!(summary.successful, 1);

        // The oldest admissible candidate wins; the newer one stays rejected.
        assert_eq!(
            store.get_signal(older.signal_id).await.unwrap().status,
            SignalStatus::Approved
        );
        assert_eq!(
            store.get_signal(newer.signal_id).await.unwrap().status,
            SignalStatus::Rejected
        );
        assert_eq!(store.list_open_positions().await.unwrap().len(), 1);
        assert_eq!(queue.depth(), 1);
    }

    #[tokio::test]
    async fn non_buy_payload_is_skipped() {
        let store = Arc::new(MemoryStore::new());
        // Persisted with BUY type but the payload says exit: the re-derived
        // classification must disqualify it.
        let signal = Signal::new(
            "AAPL".into(),
            Some("buy".into()),
            Some("exit".into()),
            None,
            Utc::now(),
            json!({"ticker": "AAPL", "side": "buy", "action": "exit"}),
        );
        store
            .insert_signal(&signal, SignalStatus::Received, SignalType::Buy)
            .await
            .unwrap();
        store
            .set_signal_status(signal.signal_id, SignalStatus::Rejected, "decision-0", None)
            .await
            .unwrap();

        let (engine, queue) = engine(store.clone());
        let summary = engine.run_cycle(&entered("AAPL"), &strategy(false)).await;
        assert_eq!(summary.successful, 0);
        assert!(queue.is_empty());
        assert!(!store.is_position_open_or_closing("AAPL").await.unwrap());
    }

    #[tokio::test]
    async fn deadline_stops_new_ticker_work() {
        let store = Arc::new(MemoryStore::new());
        rejected_buy(&store, "AAPL").await;
        let queue: BoundedQueue<ApprovedSignal> = BoundedQueue::new(16);
        let engine = ReprocessingEngine::new(
            store.clone(),
            queue.clone(),
            Arc::new(MetricsRegistry::new()),
            Duration::ZERO,
            10,
        );

        let summary = engine.run_cycle(&entered("AAPL"), &strategy(false)).await;
        assert!(summary.timed_out);
        assert_eq!(summary.processed, 0);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn full_queue_after_commit_counts_a_critical_incident() {
        let store = Arc::new(MemoryStore::new());
        let signal = rejected_buy(&store, "AAPL").await;

        let queue: BoundedQueue<ApprovedSignal> = BoundedQueue::new(1);
        queue
            .try_push(ApprovedSignal {
                signal: Signal::new(
                    "X".into(),
                    None,
                    None,
                    None,
                    Utc::now(),
                    serde_json::Value::Null,
                ),
                signal_type: SignalType::Buy,
            })
            .unwrap();

        let metrics = Arc::new(MetricsRegistry::new());
        let engine = ReprocessingEngine::new(
            store.clone(),
            queue.clone(),
            metrics.clone(),
            Duration::from_secs(30),
            10,
        );

        tokio::time::pause();
        let summary = engine.run_cycle(&entered("AAPL"), &strategy(false)).await;
        assert_eq!(summary.successful, 0);

        // The position stays committed; the inconsistency is surfaced.
        assert!(store.is_position_open_or_closing("AAPL").await.unwrap());
        assert_eq!(
            store.get_signal(signal.signal_id).await.unwrap().status,
            SignalStatus::Approved
        );
        assert_eq!(metrics.snapshot().critical_incidents, 1);
        assert_eq!(metrics.snapshot().reprocess_failed_queue, 1);
    }

    #[tokio::test]
    async fn health_is_stale_before_any_cycle_then_healthy() {
        let store = Arc::new(MemoryStore::new());
        rejected_buy(&store, "AAPL").await;
        let (engine, _queue) = engine(store.clone());

        assert_eq!(engine.health().status, HealthStatus::Stale);

        engine.run_cycle(&entered("AAPL"), &strategy(false)).await;
        let health = engine.health();
        assert_eq!(health.status, HealthStatus::Healthy);
        assert_eq!(health.successful, 1);
        assert!(health.last_cycle_at.is_some());
    }

    #[test]
    fn reconstruction_prefers_payload_then_columns() {
        let row = SignalRow {
            signal_id: uuid::Uuid::new_v4(),
            ticker: "AAPL".into(),
            side: Some("buy".into()),
            action: None,
            price: Some(10.0),
            received_at: Utc::now(),
            created_at: Utc::now(),
            original_payload: json!({"ticker": "AAPL", "side": "buy", "price": 12.5}),
            signal_type: SignalType::Buy,
            status: SignalStatus::Rejected,
            retry_count: 0,
            last_detail: None,
        };
        let signal = reconstruct_signal(&row).unwrap();
        assert_eq!(signal.signal_id, row.signal_id);
        assert_eq!(signal.price, Some(12.5));

        let bare = SignalRow {
            original_payload: serde_json::Value::Null,
            side: None,
            price: None,
            ..row.clone()
        };
        let signal = reconstruct_signal(&bare).unwrap();
        assert_eq!(signal.side.as_deref(), Some("buy"));

        let no_ticker = SignalRow {
            ticker: "".into(),
            ..row
        };
        assert!(reconstruct_signal(&no_ticker).is_none());
    }
}
