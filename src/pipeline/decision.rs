// =============================================================================
// Decision Workers — admit or reject signals from the InQueue
// =============================================================================
//
// Each worker drains the InQueue in a loop. Per signal: reread the published
// ranking snapshot, reclassify from (side, action), then either open a
// position (BUY) or begin closing one (SELL-family). Every status transition
// is written with its event atomically.
//
// Failure policy: transient store failures requeue the signal at the tail
// with a bumped retry count, up to the configured cap; a single item's
// failure never kills the worker loop.
// =============================================================================

use std::sync::Arc;

use tokio::time::Duration;
use tracing::{error, info, warn};

use crate::app_state::{AppState, OrderStatusPayload, PositionsPayload, WsEvent};
use crate::ledger::{CloseOutcome, OpenOutcome};
use crate::metrics::MetricsRegistry;
use crate::store::{Store, StoreError, StoreResult};
use crate::types::{ApprovedSignal, Intent, QueuedSignal, SignalStatus};

/// Budget for handing an approved signal to the forwarding queue.
const ENQUEUE_TIMEOUT: Duration = Duration::from_secs(5);

/// Rejection reason when a BUY's ticker is not in the current ranking.
pub const REASON_NOT_IN_RANKING: &str = "not_in_ranking";
/// Rejection reason when the ticker already has a live position.
pub const REASON_DUPLICATE_OPEN: &str = "duplicate_open";
/// Rejection reason when a SELL finds nothing to close.
pub const REASON_NO_OPEN_POSITION: &str = "no_open_position";
/// Rejection reason when transient store failures exhausted the retry cap.
pub const REASON_STORE_TRANSIENT_EXCEEDED: &str = "store_transient_exceeded";

/// Run one decision worker until the InQueue closes.
pub async fn run_decision_worker(state: Arc<AppState>, worker_idx: usize) {
    let worker_id = format!("decision-{worker_idx}");
    info!(worker_id = %worker_id, "decision worker started");

    while let Some(item) = state.in_queue.pop().await {
        let signal_id = item.signal.signal_id;
        if let Err(e) = handle_signal(&state, &worker_id, item).await {
            // Unrecoverable for this signal only: record and keep serving.
            error!(
                worker_id = %worker_id,
                signal_id = %signal_id,
                error = %e,
                "decision failed — signal dropped"
            );
        }
    }

    info!(worker_id = %worker_id, "decision worker stopped (queue closed)");
}

/// Decide one signal. Errors returned here are fatal for the signal.
pub(crate) async fn handle_signal(
    state: &Arc<AppState>,
    worker_id: &str,
    item: QueuedSignal,
) -> StoreResult<()> {
    let snapshot = state.ranking.load();

    match item.signal.intent() {
        Intent::Buy => {
            if !snapshot.contains(&item.signal.ticker) {
                return reject(state, worker_id, item, REASON_NOT_IN_RANKING).await;
            }
            let ticker = item.signal.ticker.clone();
            match state.ledger.try_open(&ticker, item.signal.signal_id).await {
                Ok(OpenOutcome::Opened(_)) => {
                    approve(state, worker_id, item, "OPEN").await;
                    Ok(())
                }
                Ok(OpenOutcome::AlreadyExists) => {
                    reject(state, worker_id, item, REASON_DUPLICATE_OPEN).await
                }
                Err(StoreError::Transient(msg)) => {
                    requeue_or_exhaust(state, worker_id, item, &msg).await
                }
                Err(e) => Err(e),
            }
        }
        Intent::SellFamily => {
            let ticker = item.signal.ticker.clone();
            match state
                .ledger
                .try_begin_close(&ticker, item.signal.signal_id)
                .await
            {
                Ok(CloseOutcome::Closing(_)) => {
                    approve(state, worker_id, item, "CLOSING").await;
                    Ok(())
                }
                Ok(CloseOutcome::NotFound) => {
                    reject(state, worker_id, item, REASON_NO_OPEN_POSITION).await
                }
                Err(StoreError::Transient(msg)) => {
                    requeue_or_exhaust(state, worker_id, item, &msg).await
                }
                Err(e) => Err(e),
            }
        }
    }
}

/// Mark the signal APPROVED and hand it to the forwarding queue.
async fn approve(state: &Arc<AppState>, worker_id: &str, item: QueuedSignal, position_state: &str) {
    let signal_id = item.signal.signal_id;
    let ticker = item.signal.ticker.clone();

    // The position mutation is already durable; a failed status write must
    // not keep the signal from being forwarded.
    if let Err(e) = state
        .store
        .set_signal_status(signal_id, SignalStatus::Approved, worker_id, None)
        .await
    {
        warn!(signal_id = %signal_id, error = %e, "approved-status write failed");
    }
    MetricsRegistry::incr(&state.metrics.signals_approved);

    state.publish(WsEvent::OrderStatusChange(OrderStatusPayload {
        signal_id,
        ticker: ticker.clone(),
        status: SignalStatus::Approved,
        detail: None,
    }));
    state.publish(WsEvent::PositionsUpdate(PositionsPayload {
        ticker: ticker.clone(),
        status: position_state.to_string(),
    }));

    let approved = ApprovedSignal {
        signal: item.signal,
        signal_type: item.signal_type,
    };
    if state
        .approved_queue
        .push_timeout(approved, ENQUEUE_TIMEOUT)
        .await
        .is_err()
    {
        error!(
            signal_id = %signal_id,
            ticker = %ticker,
            "CRITICAL: position mutated but forwarding enqueue failed — manual reconciliation required"
        );
        MetricsRegistry::incr(&state.metrics.critical_incidents);
    }
}

/// Persist a rejection with its reason.
async fn reject(
    state: &Arc<AppState>,
    worker_id: &str,
    item: QueuedSignal,
    reason: &str,
) -> StoreResult<()> {
    match state
        .store
        .set_signal_status(
            item.signal.signal_id,
            SignalStatus::Rejected,
            worker_id,
            Some(reason.to_string()),
        )
        .await
    {
        Ok(()) => {}
        Err(StoreError::Transient(msg)) => {
            return requeue_or_exhaust(state, worker_id, item, &msg).await;
        }
        Err(e) => return Err(e),
    }

    MetricsRegistry::incr(&state.metrics.signals_rejected);
    state.publish(WsEvent::OrderStatusChange(OrderStatusPayload {
        signal_id: item.signal.signal_id,
        ticker: item.signal.ticker.clone(),
        status: SignalStatus::Rejected,
        detail: Some(reason.to_string()),
    }));
    Ok(())
}

/// Requeue the signal at the tail, or reject it once the cap is exhausted.
async fn requeue_or_exhaust(
    state: &Arc<AppState>,
    worker_id: &str,
    mut item: QueuedSignal,
    cause: &str,
) -> StoreResult<()> {
    let cap = state.config.read().store_retry_cap;

    if item.retry_count < cap {
        item.retry_count += 1;
        MetricsRegistry::incr(&state.metrics.transient_retries);
        warn!(
            signal_id = %item.signal.signal_id,
            retry_count = item.retry_count,
            cause,
            "transient store failure — requeueing signal"
        );
        match state.in_queue.try_reserve() {
            Ok(slot) => {
                slot.send(item);
                return Ok(());
            }
            Err(_) => {
                warn!("InQueue full while requeueing — treating retries as exhausted");
            }
        }
    }

    warn!(
        signal_id = %item.signal.signal_id,
        retries = item.retry_count,
        cause,
        "transient store failures exhausted — rejecting signal"
    );
    if let Err(e) = state
        .store
        .set_signal_status(
            item.signal.signal_id,
            SignalStatus::Rejected,
            worker_id,
            Some(REASON_STORE_TRANSIENT_EXCEEDED.to_string()),
        )
        .await
    {
        warn!(signal_id = %item.signal.signal_id, error = %e, "exhaustion-status write failed");
    }
    MetricsRegistry::incr(&state.metrics.signals_rejected);
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
