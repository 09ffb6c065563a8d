// =============================================================================
// Store — durable-state seam for signals, events, positions, and strategies
// =============================================================================
//
// The pipeline never touches persistence directly; everything goes through
// `Store` (and `StoreTxn` for multi-step mutations). Every signal status
// change emits a SignalEvent in the same operation, so the event log is a
// complete account of the lifecycle.
//
// Failure taxonomy: Conflict (optimistic-lock / uniqueness), NotFound,
// Transient (retry allowed), Fatal (log and surface). Callers branch on the
// variant, never on message text.
// =============================================================================

pub mod memory;

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::types::{Signal, SignalStatus, SignalType};

// =============================================================================
// Errors
// =============================================================================

/// Typed failure returned by every store operation.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Optimistic-lock or uniqueness violation.
    #[error("store conflict: {0}")]
    Conflict(String),

    /// The referenced row does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Infrastructure hiccup; the caller may retry.
    #[error("transient store failure: {0}")]
    Transient(String),

    /// Unrecoverable failure; log and surface.
    #[error("fatal store failure: {0}")]
    Fatal(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

// =============================================================================
// Rows
// =============================================================================

/// A persisted signal.
#[derive(Debug, Clone, Serialize)]
pub struct SignalRow {
    pub signal_id: Uuid,
    pub ticker: String,
    pub side: Option<String>,
    pub action: Option<String>,
    pub price: Option<f64>,
    pub received_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub original_payload: serde_json::Value,
    pub signal_type: SignalType,
    pub status: SignalStatus,
    pub retry_count: u32,
    /// Most recent transition detail (rejection reason, HTTP status, ...).
    pub last_detail: Option<String>,
}

/// Append-only record of one signal status transition.
#[derive(Debug, Clone, Serialize)]
pub struct SignalEvent {
    pub event_id: u64,
    pub signal_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub status: SignalStatus,
    pub worker_id: String,
    pub details: Option<String>,
}

/// Position lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PositionStatus {
    Open,
    Closing,
    Closed,
}

impl std::fmt::Display for PositionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open => write!(f, "OPEN"),
            Self::Closing => write!(f, "CLOSING"),
            Self::Closed => write!(f, "CLOSED"),
        }
    }
}

/// A ledger position row.
#[derive(Debug, Clone, Serialize)]
pub struct PositionRow {
    pub position_id: i64,
    pub ticker: String,
    pub status: PositionStatus,
    pub entry_signal_id: Uuid,
    pub exit_signal_id: Option<Uuid>,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

/// A ranking strategy. Exactly one is active at all times.
#[derive(Debug, Clone, Serialize)]
pub struct Strategy {
    pub id: i64,
    pub name: String,
    pub url: String,
    pub top_n: usize,
    pub refresh_interval_secs: u64,
    pub reprocess_enabled: bool,
    /// Lookback for rejected-BUY candidates; 0 = unbounded.
    pub reprocess_window_seconds: u64,
    pub respect_sell_chronology_enabled: bool,
    /// Window after a BUY within which a later SELL disqualifies it;
    /// 0 = no upper bound.
    pub sell_chronology_window_seconds: u64,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Client-supplied strategy fields for create/update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategySpec {
    pub name: String,
    pub url: String,
    pub top_n: usize,
    pub refresh_interval_secs: u64,
    #[serde(default)]
    pub reprocess_enabled: bool,
    #[serde(default)]
    pub reprocess_window_seconds: u64,
    #[serde(default)]
    pub respect_sell_chronology_enabled: bool,
    #[serde(default)]
    pub sell_chronology_window_seconds: u64,
}

impl StrategySpec {
    /// Field-level sanity checks shared by create and update.
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("strategy name must not be empty".into());
        }
        if self.url.trim().is_empty() {
            return Err("strategy url must not be empty".into());
        }
        if self.top_n == 0 {
            return Err("top_n must be >= 1".into());
        }
        if self.refresh_interval_secs == 0 {
            return Err("refresh_interval_secs must be >= 1".into());
        }
        Ok(())
    }
}

/// One audited admin mutation.
#[derive(Debug, Clone, Serialize)]
pub struct AdminAction {
    pub id: u64,
    pub at: DateTime<Utc>,
    pub action: String,
    pub details: Option<String>,
}

/// Filters for the admin signal listing.
#[derive(Debug, Clone, Default)]
pub struct SignalFilter {
    pub ticker: Option<String>,
    pub status: Option<SignalStatus>,
    pub signal_type: Option<SignalType>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub limit: usize,
    pub offset: usize,
}

// =============================================================================
// Traits
// =============================================================================

/// Durable-state operations consumed by the pipeline. Object-safe; held as
/// `Arc<dyn Store>`.
#[async_trait]
pub trait Store: Send + Sync {
    // --- Signals -------------------------------------------------------------

    /// Persist a new signal and emit its INITIAL event.
    async fn insert_signal(
        &self,
        signal: &Signal,
        initial_status: SignalStatus,
        signal_type: SignalType,
    ) -> StoreResult<Uuid>;

    /// Append a lifecycle event without changing the signal's status.
    async fn append_event(
        &self,
        signal_id: Uuid,
        status: SignalStatus,
        worker_id: &str,
        details: Option<String>,
    ) -> StoreResult<()>;

    /// Update a signal's status; the matching event is written atomically.
    async fn set_signal_status(
        &self,
        signal_id: Uuid,
        new_status: SignalStatus,
        worker_id: &str,
        details: Option<String>,
    ) -> StoreResult<()>;

    async fn get_signal(&self, signal_id: Uuid) -> StoreResult<SignalRow>;

    async fn list_signals(&self, filter: &SignalFilter) -> StoreResult<Vec<SignalRow>>;

    // --- Positions -----------------------------------------------------------

    /// Select the newest OPEN position for `ticker` and mark it CLOSING.
    /// Returns the position id, or `None` if no OPEN position exists.
    async fn mark_position_closing(
        &self,
        ticker: &str,
        exit_signal_id: Uuid,
    ) -> StoreResult<Option<i64>>;

    /// Transition the ticker's CLOSING position to CLOSED.
    async fn close_position(&self, ticker: &str) -> StoreResult<()>;

    async fn is_position_open_or_closing(&self, ticker: &str) -> StoreResult<bool>;

    /// Tickers with a position in {OPEN, CLOSING}.
    async fn open_position_tickers(&self) -> StoreResult<HashSet<String>>;

    /// All positions in {OPEN, CLOSING}, newest first.
    async fn list_open_positions(&self) -> StoreResult<Vec<PositionRow>>;

    // --- Reprocessing queries ------------------------------------------------

    /// REJECTED BUY signals for `ticker`, newest first, at most `limit`.
    /// `window_seconds = 0` disables the time filter.
    async fn get_rejected_buy_candidates(
        &self,
        ticker: &str,
        window_seconds: u64,
        limit: usize,
    ) -> StoreResult<Vec<SignalRow>>;

    /// Whether a SELL-family signal for `ticker` exists strictly after
    /// `buy_created_at` (and within `window_seconds` of it, unless 0).
    async fn has_subsequent_sell(
        &self,
        ticker: &str,
        buy_created_at: DateTime<Utc>,
        window_seconds: u64,
    ) -> StoreResult<bool>;

    // --- Transactions --------------------------------------------------------

    /// Open a scoped transaction. Dropping it uncommitted rolls back.
    async fn begin(&self) -> StoreResult<Box<dyn StoreTxn>>;

    // --- Strategies ----------------------------------------------------------

    async fn list_strategies(&self) -> StoreResult<Vec<Strategy>>;

    async fn create_strategy(&self, spec: &StrategySpec) -> StoreResult<Strategy>;

    async fn update_strategy(&self, id: i64, spec: &StrategySpec) -> StoreResult<Strategy>;

    /// Delete an inactive strategy; deleting the active one is a Conflict.
    async fn delete_strategy(&self, id: i64) -> StoreResult<()>;

    async fn active_strategy(&self) -> StoreResult<Strategy>;

    /// Atomically make `id` the single active strategy.
    async fn switch_active_strategy(&self, id: i64) -> StoreResult<Strategy>;

    /// Seed a default active strategy when none exist yet.
    async fn ensure_default_strategy(&self) -> StoreResult<Strategy>;

    // --- Audit & maintenance -------------------------------------------------

    async fn record_admin_action(&self, action: &str, details: Option<String>) -> StoreResult<()>;

    async fn list_admin_actions(&self, limit: usize) -> StoreResult<Vec<AdminAction>>;

    /// Full wipe: events, then positions, then signals (FK order), as one
    /// transaction. Strategies and the audit trail survive.
    async fn clear_all(&self) -> StoreResult<()>;
}

/// A scoped transactional session. All mutations are invisible to other
/// callers until `commit`; `rollback` (or drop) discards them.
#[async_trait]
pub trait StoreTxn: Send {
    /// Optimistic re-approval: fails with `Conflict` unless the signal's
    /// current status equals `expected`. On success the signal is APPROVED
    /// and the matching event is staged.
    async fn reapprove_signal_with_validation(
        &mut self,
        signal_id: Uuid,
        expected: SignalStatus,
        worker_id: &str,
    ) -> StoreResult<()>;

    async fn is_position_open_or_closing(&mut self, ticker: &str) -> StoreResult<bool>;

    /// Open a position; `Conflict` when any OPEN/CLOSING position exists.
    async fn open_position(&mut self, ticker: &str, entry_signal_id: Uuid) -> StoreResult<i64>;

    async fn set_signal_status(
        &mut self,
        signal_id: Uuid,
        new_status: SignalStatus,
        worker_id: &str,
        details: Option<String>,
    ) -> StoreResult<()>;

    async fn commit(self: Box<Self>) -> StoreResult<()>;

    async fn rollback(self: Box<Self>) -> StoreResult<()>;
}
