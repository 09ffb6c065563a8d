// =============================================================================
// Position Ledger — at-most-one OPEN/CLOSING position per ticker
// =============================================================================
//
// Thin layer over the Store that owns the admission-relevant position
// invariant. `try_open` re-checks inside the same transaction that inserts,
// so two workers racing on the same ticker can never both open.
// =============================================================================

use std::sync::Arc;

use tracing::{info, warn};
use uuid::Uuid;

use crate::store::{Store, StoreError, StoreResult};

/// Outcome of an open attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenOutcome {
    Opened(i64),
    AlreadyExists,
}

/// Outcome of a close-begin attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseOutcome {
    Closing(i64),
    NotFound,
}

#[derive(Clone)]
pub struct PositionLedger {
    store: Arc<dyn Store>,
}

impl PositionLedger {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Open a position for `ticker` unless one is already OPEN/CLOSING.
    ///
    /// The existence re-check and the insert run in one store transaction;
    /// a store-level uniqueness Conflict maps to `AlreadyExists`.
    pub async fn try_open(&self, ticker: &str, entry_signal_id: Uuid) -> StoreResult<OpenOutcome> {
        let mut txn = self.store.begin().await?;

        if txn.is_position_open_or_closing(ticker).await? {
            txn.rollback().await?;
            return Ok(OpenOutcome::AlreadyExists);
        }

        match txn.open_position(ticker, entry_signal_id).await {
            Ok(position_id) => {
                txn.commit().await?;
                info!(ticker, position_id, entry_signal_id = %entry_signal_id, "position opened");
                Ok(OpenOutcome::Opened(position_id))
            }
            Err(StoreError::Conflict(_)) => {
                txn.rollback().await?;
                Ok(OpenOutcome::AlreadyExists)
            }
            Err(e) => {
                txn.rollback().await?;
                Err(e)
            }
        }
    }

    /// Mark the ticker's newest OPEN position as CLOSING.
    pub async fn try_begin_close(
        &self,
        ticker: &str,
        exit_signal_id: Uuid,
    ) -> StoreResult<CloseOutcome> {
        match self.store.mark_position_closing(ticker, exit_signal_id).await? {
            Some(position_id) => {
                info!(ticker, position_id, exit_signal_id = %exit_signal_id, "position closing");
                Ok(CloseOutcome::Closing(position_id))
            }
            None => Ok(CloseOutcome::NotFound),
        }
    }

    /// Finalize a CLOSING position once its exit was successfully forwarded.
    pub async fn finalize_close(&self, ticker: &str) -> StoreResult<()> {
        match self.store.close_position(ticker).await {
            Ok(()) => Ok(()),
            Err(StoreError::NotFound(msg)) => {
                // Already finalized (or never marked): worth a warning, not a
                // pipeline failure.
                warn!(ticker, %msg, "finalize_close found nothing to close");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

impl std::fmt::Debug for PositionLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PositionLedger").finish_non_exhaustive()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use crate::store::PositionStatus;

    #[tokio::test]
    async fn open_then_duplicate_open_then_close_cycle() {
        let store = Arc::new(MemoryStore::new());
        let ledger = PositionLedger::new(store.clone());

        let entry = Uuid::new_v4();
        let outcome = ledger.try_open("AAPL", entry).await.unwrap();
        assert!(matches!(outcome, OpenOutcome::Opened(_)));

        let dup = ledger.try_open("AAPL", Uuid::new_v4()).await.unwrap();
        assert_eq!(dup, OpenOutcome::AlreadyExists);

        let exit = Uuid::new_v4();
        let close = ledger.try_begin_close("AAPL", exit).await.unwrap();
        assert!(matches!(close, CloseOutcome::Closing(_)));

        // Still occupies the ticker until finalized.
        assert_eq!(
            ledger.try_open("AAPL", Uuid::new_v4()).await.unwrap(),
            OpenOutcome::AlreadyExists
        );

        ledger.finalize_close("AAPL").await.unwrap();
        let positions = store.list_open_positions().await.unwrap();
        assert!(positions.is_empty());

        // Ticker is free again.
        assert!(matches!(
            ledger.try_open("AAPL", Uuid::new_v4()).await.unwrap(),
            OpenOutcome::Opened(_)
        ));
    }

    #[tokio::test]
    async fn begin_close_without_open_position_reports_not_found() {
        let store = Arc::new(MemoryStore::new());
        let ledger = PositionLedger::new(store);
        let outcome = ledger.try_begin_close("MSFT", Uuid::new_v4()).await.unwrap();
        assert_eq!(outcome, CloseOutcome::NotFound);
    }

    #[tokio::test]
    async fn concurrent_opens_admit_exactly_one() {
        let store = Arc::new(MemoryStore::new());
        let ledger = PositionLedger::new(store.clone());

        let a = {
            let ledger = ledger.clone();
            tokio::spawn(async move { ledger.try_open("NVDA", Uuid::new_v4()).await.unwrap() })
        };
        let b = {
            let ledger = ledger.clone();
            tokio::spawn(async move { ledger.try_open("NVDA", Uuid::new_v4()).await.unwrap() })
        };

        let (ra, rb) = (a.await.unwrap(), b.await.unwrap());
        let opened = [ra, rb]
            .iter()
            .filter(|o| matches!(o, OpenOutcome::Opened(_)))
            .count();
        assert_eq!(opened, 1);

        let live = store
            .list_open_positions()
            .await
            .unwrap()
            .iter()
            .filter(|p| p.status == PositionStatus::Open)
            .count();
        assert_eq!(live, 1);
    }
}
