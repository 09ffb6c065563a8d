// =============================================================================
// Pipeline Metrics — lock-free counters for the admin surface
// =============================================================================
//
// All counters are atomics so the hot path never takes a lock. Store-derived
// truths (positions, signal histories) are NOT duplicated here; these count
// process-local events only.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::reprocess::ReprocessOutcome;

#[derive(Debug, Default)]
pub struct MetricsRegistry {
    // --- Ingress / decision --------------------------------------------------
    pub signals_received: AtomicU64,
    pub signals_approved: AtomicU64,
    pub signals_rejected: AtomicU64,
    pub backpressure_rejections: AtomicU64,
    pub validation_rejections: AtomicU64,
    pub transient_retries: AtomicU64,

    // --- Forwarding ----------------------------------------------------------
    pub forwarded_ok: AtomicU64,
    pub forwarded_err: AtomicU64,

    // --- Reprocessing --------------------------------------------------------
    pub reprocess_cycles: AtomicU64,
    pub reprocess_timeouts: AtomicU64,
    pub reprocess_success: AtomicU64,
    pub reprocess_failed_validation: AtomicU64,
    pub reprocess_failed_reconstruction: AtomicU64,
    pub reprocess_failed_database: AtomicU64,
    pub reprocess_failed_queue: AtomicU64,
    pub reprocess_skipped_non_buy: AtomicU64,
    pub reprocess_skipped_position_exists: AtomicU64,
    pub reprocess_skipped_sell_chronology: AtomicU64,
    pub reprocess_skipped_status_changed: AtomicU64,

    // --- Incidents -----------------------------------------------------------
    /// Position committed but the forwarding enqueue failed; requires manual
    /// reconciliation.
    pub critical_incidents: AtomicU64,
}

/// Serialisable snapshot of every counter.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub signals_received: u64,
    pub signals_approved: u64,
    pub signals_rejected: u64,
    pub backpressure_rejections: u64,
    pub validation_rejections: u64,
    pub transient_retries: u64,
    pub forwarded_ok: u64,
    pub forwarded_err: u64,
    pub reprocess_cycles: u64,
    pub reprocess_timeouts: u64,
    pub reprocess_success: u64,
    pub reprocess_failed_validation: u64,
    pub reprocess_failed_reconstruction: u64,
    pub reprocess_failed_database: u64,
    pub reprocess_failed_queue: u64,
    pub reprocess_skipped_non_buy: u64,
    pub reprocess_skipped_position_exists: u64,
    pub reprocess_skipped_sell_chronology: u64,
    pub reprocess_skipped_status_changed: u64,
    pub critical_incidents: u64,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Bump the counter matching a reprocessing outcome.
    pub fn record_reprocess_outcome(&self, outcome: ReprocessOutcome) {
        let counter = match outcome {
            ReprocessOutcome::Success => &self.reprocess_success,
            ReprocessOutcome::FailedValidation => &self.reprocess_failed_validation,
            ReprocessOutcome::FailedReconstruction => &self.reprocess_failed_reconstruction,
            ReprocessOutcome::FailedDatabase => &self.reprocess_failed_database,
            ReprocessOutcome::FailedQueue => &self.reprocess_failed_queue,
            ReprocessOutcome::SkippedNonBuy => &self.reprocess_skipped_non_buy,
            ReprocessOutcome::SkippedPositionExists => &self.reprocess_skipped_position_exists,
            ReprocessOutcome::SkippedSellChronology => &self.reprocess_skipped_sell_chronology,
            ReprocessOutcome::SkippedStatusChanged => &self.reprocess_skipped_status_changed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            signals_received: load(&self.signals_received),
            signals_approved: load(&self.signals_approved),
            signals_rejected: load(&self.signals_rejected),
            backpressure_rejections: load(&self.backpressure_rejections),
            validation_rejections: load(&self.validation_rejections),
            transient_retries: load(&self.transient_retries),
            forwarded_ok: load(&self.forwarded_ok),
            forwarded_err: load(&self.forwarded_err),
            reprocess_cycles: load(&self.reprocess_cycles),
            reprocess_timeouts: load(&self.reprocess_timeouts),
            reprocess_success: load(&self.reprocess_success),
            reprocess_failed_validation: load(&self.reprocess_failed_validation),
            reprocess_failed_reconstruction: load(&self.reprocess_failed_reconstruction),
            reprocess_failed_database: load(&self.reprocess_failed_database),
            reprocess_failed_queue: load(&self.reprocess_failed_queue),
            reprocess_skipped_non_buy: load(&self.reprocess_skipped_non_buy),
            reprocess_skipped_position_exists: load(&self.reprocess_skipped_position_exists),
            reprocess_skipped_sell_chronology: load(&self.reprocess_skipped_sell_chronology),
            reprocess_skipped_status_changed: load(&self.reprocess_skipped_status_changed),
            critical_incidents: load(&self.critical_incidents),
        }
    }

    /// Reset every counter to zero (admin endpoint).
    pub fn reset(&self) {
        let zero = |c: &AtomicU64| c.store(0, Ordering::Relaxed);
        zero(&self.signals_received);
        zero(&self.signals_approved);
        zero(&self.signals_rejected);
        zero(&self.backpressure_rejections);
        zero(&self.validation_rejections);
        zero(&self.transient_retries);
        zero(&self.forwarded_ok);
        zero(&self.forwarded_err);
        zero(&self.reprocess_cycles);
        zero(&self.reprocess_timeouts);
        zero(&self.reprocess_success);
        zero(&self.reprocess_failed_validation);
        zero(&self.reprocess_failed_reconstruction);
        zero(&self.reprocess_failed_database);
        zero(&self.reprocess_failed_queue);
        zero(&self.reprocess_skipped_non_buy);
        zero(&self.reprocess_skipped_position_exists);
        zero(&self.reprocess_skipped_sell_chronology);
        zero(&self.reprocess_skipped_status_changed);
        zero(&self.critical_incidents);
    }
}

// =============================================================================
// Tests
// =============================================================================
