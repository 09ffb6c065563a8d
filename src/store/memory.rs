// =============================================================================
// MemoryStore — reference Store implementation backed by in-process tables
// =============================================================================
//
// One `tokio::sync::Mutex` guards all tables, so every operation is
// serializable; a transaction holds the owned guard for its whole scope and
// keeps a snapshot of the tables taken at `begin`, which rollback (or drop
// without commit) restores. That makes the multi-step reprocessing admission
// genuinely atomic with respect to every other store caller.
//
// A SQL-backed implementation lives behind the same trait; `schema.sql`
// documents the relational shape it must provide.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info};
use uuid::Uuid;

use crate::store::{
    AdminAction, PositionRow, PositionStatus, SignalEvent, SignalFilter, SignalRow, Store,
    StoreError, StoreResult, StoreTxn, Strategy, StrategySpec,
};
use crate::types::{Signal, SignalStatus, SignalType};

/// Default page size when a listing filter does not specify a limit.
const DEFAULT_LIST_LIMIT: usize = 100;

/// Seeded when the store holds no strategies at all.
const DEFAULT_STRATEGY_NAME: &str = "default";
const DEFAULT_STRATEGY_URL: &str =
    "https://finviz.com/screener.ashx?v=111&f=cap_largeover&o=-marketcap";

// =============================================================================
// Tables
// =============================================================================

#[derive(Debug, Clone, Default)]
struct MemoryInner {
    signals: HashMap<Uuid, SignalRow>,
    events: Vec<SignalEvent>,
    next_event_id: u64,
    positions: Vec<PositionRow>,
    next_position_id: i64,
    strategies: Vec<Strategy>,
    next_strategy_id: i64,
    admin_actions: Vec<AdminAction>,
    next_admin_action_id: u64,
}

impl MemoryInner {
    fn push_event(
        &mut self,
        signal_id: Uuid,
        status: SignalStatus,
        worker_id: &str,
        details: Option<String>,
    ) {
        self.next_event_id += 1;
        self.events.push(SignalEvent {
            event_id: self.next_event_id,
            signal_id,
            timestamp: Utc::now(),
            status,
            worker_id: worker_id.to_string(),
            details,
        });
    }

    fn set_status(
        &mut self,
        signal_id: Uuid,
        new_status: SignalStatus,
        worker_id: &str,
        details: Option<String>,
    ) -> StoreResult<()> {
        let row = self
            .signals
            .get_mut(&signal_id)
            .ok_or_else(|| StoreError::NotFound(format!("signal {signal_id}")))?;
        row.status = new_status;
        row.last_detail = details.clone();
        self.push_event(signal_id, new_status, worker_id, details);
        Ok(())
    }

    fn position_open_or_closing(&self, ticker: &str) -> bool {
        self.positions.iter().any(|p| {
            p.ticker == ticker && matches!(p.status, PositionStatus::Open | PositionStatus::Closing)
        })
    }

    fn open_position(&mut self, ticker: &str, entry_signal_id: Uuid) -> StoreResult<i64> {
        if self.position_open_or_closing(ticker) {
            return Err(StoreError::Conflict(format!(
                "position already open or closing for {ticker}"
            )));
        }
        self.next_position_id += 1;
        let id = self.next_position_id;
        self.positions.push(PositionRow {
            position_id: id,
            ticker: ticker.to_string(),
            status: PositionStatus::Open,
            entry_signal_id,
            exit_signal_id: None,
            opened_at: Utc::now(),
            closed_at: None,
        });
        Ok(id)
    }

    fn insert_strategy(&mut self, spec: &StrategySpec, is_active: bool) -> Strategy {
        self.next_strategy_id += 1;
        let now = Utc::now();
        let strategy = Strategy {
            id: self.next_strategy_id,
            name: spec.name.clone(),
            url: spec.url.clone(),
            top_n: spec.top_n,
            refresh_interval_secs: spec.refresh_interval_secs,
            reprocess_enabled: spec.reprocess_enabled,
            reprocess_window_seconds: spec.reprocess_window_seconds,
            respect_sell_chronology_enabled: spec.respect_sell_chronology_enabled,
            sell_chronology_window_seconds: spec.sell_chronology_window_seconds,
            is_active,
            created_at: now,
            updated_at: now,
        };
        self.strategies.push(strategy.clone());
        strategy
    }
}

// =============================================================================
// MemoryStore
// =============================================================================

/// In-process `Store` implementation. Cheap to clone; all clones share state.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore").finish_non_exhaustive()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_signal(
        &self,
        signal: &Signal,
        initial_status: SignalStatus,
        signal_type: SignalType,
    ) -> StoreResult<Uuid> {
        let mut inner = self.inner.lock().await;
        if inner.signals.contains_key(&signal.signal_id) {
            return Err(StoreError::Conflict(format!(
                "signal {} already exists",
                signal.signal_id
            )));
        }
        inner.signals.insert(
            signal.signal_id,
            SignalRow {
                signal_id: signal.signal_id,
                ticker: signal.ticker.clone(),
                side: signal.side.clone(),
                action: signal.action.clone(),
                price: signal.price,
                received_at: signal.received_at,
                created_at: Utc::now(),
                original_payload: signal.original_payload.clone(),
                signal_type,
                status: initial_status,
                retry_count: 0,
                last_detail: None,
            },
        );
        inner.push_event(signal.signal_id, initial_status, "ingress", Some("INITIAL".into()));
        debug!(signal_id = %signal.signal_id, ticker = %signal.ticker, signal_type = %signal_type, "signal inserted");
        Ok(signal.signal_id)
    }

    async fn append_event(
        &self,
        signal_id: Uuid,
        status: SignalStatus,
        worker_id: &str,
        details: Option<String>,
    ) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        if !inner.signals.contains_key(&signal_id) {
            return Err(StoreError::NotFound(format!("signal {signal_id}")));
        }
        inner.push_event(signal_id, status, worker_id, details);
        Ok(())
    }

    async fn set_signal_status(
        &self,
        signal_id: Uuid,
        new_status: SignalStatus,
        worker_id: &str,
        details: Option<String>,
    ) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        inner.set_status(signal_id, new_status, worker_id, details)
    }

    async fn get_signal(&self, signal_id: Uuid) -> StoreResult<SignalRow> {
        let inner = self.inner.lock().await;
        inner
            .signals
            .get(&signal_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("signal {signal_id}")))
    }

    async fn list_signals(&self, filter: &SignalFilter) -> StoreResult<Vec<SignalRow>> {
        let inner = self.inner.lock().await;
        let mut rows: Vec<SignalRow> = inner
            .signals
            .values()
            .filter(|row| {
                filter.ticker.as_deref().map_or(true, |t| row.ticker == t)
                    && filter.status.map_or(true, |s| row.status == s)
                    && filter.signal_type.map_or(true, |t| row.signal_type == t)
                    && filter.from.map_or(true, |f| row.created_at >= f)
                    && filter.to.map_or(true, |t| row.created_at <= t)
            })
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let limit = if filter.limit == 0 { DEFAULT_LIST_LIMIT } else { filter.limit };
        Ok(rows.into_iter().skip(filter.offset).take(limit).collect())
    }

    async fn mark_position_closing(
        &self,
        ticker: &str,
        exit_signal_id: Uuid,
    ) -> StoreResult<Option<i64>> {
        let mut inner = self.inner.lock().await;
        let newest_open = inner
            .positions
            .iter_mut()
            .filter(|p| p.ticker == ticker && p.status == PositionStatus::Open)
            .max_by_key(|p| p.position_id);
        match newest_open {
            Some(pos) => {
                pos.status = PositionStatus::Closing;
                pos.exit_signal_id = Some(exit_signal_id);
                Ok(Some(pos.position_id))
            }
            None => Ok(None),
        }
    }

    async fn close_position(&self, ticker: &str) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        let closing = inner
            .positions
            .iter_mut()
            .filter(|p| p.ticker == ticker && p.status == PositionStatus::Closing)
            .max_by_key(|p| p.position_id);
        match closing {
            Some(pos) => {
                pos.status = PositionStatus::Closed;
                pos.closed_at = Some(Utc::now());
                info!(ticker, position_id = pos.position_id, "position closed");
                Ok(())
            }
            None => Err(StoreError::NotFound(format!(
                "no closing position for {ticker}"
            ))),
        }
    }

    async fn is_position_open_or_closing(&self, ticker: &str) -> StoreResult<bool> {
        let inner = self.inner.lock().await;
        Ok(inner.position_open_or_closing(ticker))
    }

    async fn open_position_tickers(&self) -> StoreResult<HashSet<String>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .positions
            .iter()
            .filter(|p| matches!(p.status, PositionStatus::Open | PositionStatus::Closing))
            .map(|p| p.ticker.clone())
            .collect())
    }

    async fn list_open_positions(&self) -> StoreResult<Vec<PositionRow>> {
        let inner = self.inner.lock().await;
        let mut rows: Vec<PositionRow> = inner
            .positions
            .iter()
            .filter(|p| matches!(p.status, PositionStatus::Open | PositionStatus::Closing))
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.position_id.cmp(&a.position_id));
        Ok(rows)
    }

    async fn get_rejected_buy_candidates(
        &self,
        ticker: &str,
        window_seconds: u64,
        limit: usize,
    ) -> StoreResult<Vec<SignalRow>> {
        let inner = self.inner.lock().await;
        let cutoff = if window_seconds == 0 {
            None
        } else {
            Some(Utc::now() - Duration::seconds(window_seconds as i64))
        };
        let mut rows: Vec<SignalRow> = inner
            .signals
            .values()
            .filter(|row| {
                row.ticker == ticker
                    && row.status == SignalStatus::Rejected
                    && row.signal_type == SignalType::Buy
                    && cutoff.map_or(true, |c| row.created_at >= c)
            })
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        rows.truncate(limit);
        Ok(rows)
    }

    async fn has_subsequent_sell(
        &self,
        ticker: &str,
        buy_created_at: chrono::DateTime<Utc>,
        window_seconds: u64,
    ) -> StoreResult<bool> {
        let inner = self.inner.lock().await;
        let upper = if window_seconds == 0 {
            None
        } else {
            Some(buy_created_at + Duration::seconds(window_seconds as i64))
        };
        Ok(inner.signals.values().any(|row| {
            row.ticker == ticker
                && row.signal_type.is_sell_family()
                && row.created_at > buy_created_at
                && upper.map_or(true, |u| row.created_at <= u)
        }))
    }

    async fn begin(&self) -> StoreResult<Box<dyn StoreTxn>> {
        let guard = self.inner.clone().lock_owned().await;
        let snapshot = guard.clone();
        Ok(Box::new(MemoryTxn {
            guard,
            snapshot: Some(snapshot),
            done: false,
        }))
    }

    async fn list_strategies(&self) -> StoreResult<Vec<Strategy>> {
        let inner = self.inner.lock().await;
        Ok(inner.strategies.clone())
    }

    async fn create_strategy(&self, spec: &StrategySpec) -> StoreResult<Strategy> {
        let mut inner = self.inner.lock().await;
        if inner.strategies.iter().any(|s| s.name == spec.name) {
            return Err(StoreError::Conflict(format!(
                "strategy '{}' already exists",
                spec.name
            )));
        }
        // The first strategy ever created becomes active automatically.
        let make_active = inner.strategies.is_empty();
        let strategy = inner.insert_strategy(spec, make_active);
        info!(id = strategy.id, name = %strategy.name, active = strategy.is_active, "strategy created");
        Ok(strategy)
    }

    async fn update_strategy(&self, id: i64, spec: &StrategySpec) -> StoreResult<Strategy> {
        let mut inner = self.inner.lock().await;
        if inner
            .strategies
            .iter()
            .any(|s| s.id != id && s.name == spec.name)
        {
            return Err(StoreError::Conflict(format!(
                "strategy '{}' already exists",
                spec.name
            )));
        }
        let strategy = inner
            .strategies
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| StoreError::NotFound(format!("strategy {id}")))?;
        strategy.name = spec.name.clone();
        strategy.url = spec.url.clone();
        strategy.top_n = spec.top_n;
        strategy.refresh_interval_secs = spec.refresh_interval_secs;
        strategy.reprocess_enabled = spec.reprocess_enabled;
        strategy.reprocess_window_seconds = spec.reprocess_window_seconds;
        strategy.respect_sell_chronology_enabled = spec.respect_sell_chronology_enabled;
        strategy.sell_chronology_window_seconds = spec.sell_chronology_window_seconds;
        strategy.updated_at = Utc::now();
        Ok(strategy.clone())
    }

    async fn delete_strategy(&self, id: i64) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        let strategy = inner
            .strategies
            .iter()
            .find(|s| s.id == id)
            .ok_or_else(|| StoreError::NotFound(format!("strategy {id}")))?;
        if strategy.is_active {
            return Err(StoreError::Conflict(
                "cannot delete the active strategy".into(),
            ));
        }
        inner.strategies.retain(|s| s.id != id);
        Ok(())
    }

    async fn active_strategy(&self) -> StoreResult<Strategy> {
        let inner = self.inner.lock().await;
        inner
            .strategies
            .iter()
            .find(|s| s.is_active)
            .cloned()
            .ok_or_else(|| StoreError::NotFound("no active strategy".into()))
    }

    async fn switch_active_strategy(&self, id: i64) -> StoreResult<Strategy> {
        let mut inner = self.inner.lock().await;
        if !inner.strategies.iter().any(|s| s.id == id) {
            return Err(StoreError::NotFound(format!("strategy {id}")));
        }
        for s in inner.strategies.iter_mut() {
            s.is_active = s.id == id;
            if s.is_active {
                s.updated_at = Utc::now();
            }
        }
        let active = inner
            .strategies
            .iter()
            .find(|s| s.id == id)
            .cloned()
            .expect("activated strategy present");
        info!(id, name = %active.name, "active strategy switched");
        Ok(active)
    }

    async fn ensure_default_strategy(&self) -> StoreResult<Strategy> {
        let mut inner = self.inner.lock().await;
        if let Some(active) = inner.strategies.iter().find(|s| s.is_active) {
            return Ok(active.clone());
        }
        if inner.strategies.is_empty() {
            let spec = StrategySpec {
                name: DEFAULT_STRATEGY_NAME.to_string(),
                url: DEFAULT_STRATEGY_URL.to_string(),
                top_n: 20,
                refresh_interval_secs: 60,
                reprocess_enabled: true,
                reprocess_window_seconds: 0,
                respect_sell_chronology_enabled: true,
                sell_chronology_window_seconds: 3600,
            };
            let strategy = inner.insert_strategy(&spec, true);
            info!(name = DEFAULT_STRATEGY_NAME, "seeded default strategy");
            return Ok(strategy);
        }
        // Strategies exist but none is active (should not happen): repair by
        // activating the first one.
        inner.strategies[0].is_active = true;
        Ok(inner.strategies[0].clone())
    }

    async fn record_admin_action(&self, action: &str, details: Option<String>) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        inner.next_admin_action_id += 1;
        let id = inner.next_admin_action_id;
        inner.admin_actions.push(AdminAction {
            id,
            at: Utc::now(),
            action: action.to_string(),
            details,
        });
        Ok(())
    }

    async fn list_admin_actions(&self, limit: usize) -> StoreResult<Vec<AdminAction>> {
        let inner = self.inner.lock().await;
        Ok(inner.admin_actions.iter().rev().take(limit).cloned().collect())
    }

    async fn clear_all(&self) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        // FK order: events reference signals, positions reference signals.
        inner.events.clear();
        inner.positions.clear();
        inner.signals.clear();
        info!("store cleared (events, positions, signals)");
        Ok(())
    }
}

// =============================================================================
// Transactions
// =============================================================================

/// Holds the store lock for its whole scope; `snapshot` restores the tables
/// on rollback or drop-without-commit.
struct MemoryTxn {
    guard: OwnedMutexGuard<MemoryInner>,
    snapshot: Option<MemoryInner>,
    done: bool,
}

#[async_trait]
impl StoreTxn for MemoryTxn {
    async fn reapprove_signal_with_validation(
        &mut self,
        signal_id: Uuid,
        expected: SignalStatus,
        worker_id: &str,
    ) -> StoreResult<()> {
        let current = self
            .guard
            .signals
            .get(&signal_id)
            .map(|row| row.status)
            .ok_or_else(|| StoreError::NotFound(format!("signal {signal_id}")))?;
        if current != expected {
            return Err(StoreError::Conflict(format!(
                "signal {signal_id} is {current}, expected {expected}"
            )));
        }
        self.guard.set_status(
            signal_id,
            SignalStatus::Approved,
            worker_id,
            Some("reapproved".into()),
        )
    }

    async fn is_position_open_or_closing(&mut self, ticker: &str) -> StoreResult<bool> {
        Ok(self.guard.position_open_or_closing(ticker))
    }

    async fn open_position(&mut self, ticker: &str, entry_signal_id: Uuid) -> StoreResult<i64> {
        self.guard.open_position(ticker, entry_signal_id)
    }

    async fn set_signal_status(
        &mut self,
        signal_id: Uuid,
        new_status: SignalStatus,
        worker_id: &str,
        details: Option<String>,
    ) -> StoreResult<()> {
        self.guard.set_status(signal_id, new_status, worker_id, details)
    }

    async fn commit(mut self: Box<Self>) -> StoreResult<()> {
        self.done = true;
        self.snapshot = None;
        Ok(())
    }

    async fn rollback(mut self: Box<Self>) -> StoreResult<()> {
        if let Some(snapshot) = self.snapshot.take() {
            *self.guard = snapshot;
        }
        self.done = true;
        Ok(())
    }
}

impl Drop for MemoryTxn {
    fn drop(&mut self) {
        // Dropping without commit rolls back (e.g. a cancelled worker task).
        if !self.done {
            if let Some(snapshot) = self.snapshot.take() {
                *self.guard = snapshot;
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
