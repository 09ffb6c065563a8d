// =============================================================================
// Ranking Snapshot — published view of the admissible ticker set
// =============================================================================
//
// The refresher publishes a fresh immutable snapshot by swapping an `Arc`
// under a short write lock; readers clone the `Arc` and never hold the lock
// across an await. `generation` is strictly increasing.
// =============================================================================

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;

/// One immutable view of the external ranking.
#[derive(Debug, Clone, Serialize)]
pub struct RankingSnapshot {
    pub tickers: HashSet<String>,
    pub fetched_at: DateTime<Utc>,
    pub generation: u64,
}

impl RankingSnapshot {
    /// The pre-first-fetch snapshot: empty, generation 0.
    fn initial() -> Self {
        Self {
            tickers: HashSet::new(),
            fetched_at: Utc::now(),
            generation: 0,
        }
    }

    pub fn contains(&self, ticker: &str) -> bool {
        self.tickers.contains(ticker)
    }
}

/// Shared handle to the currently published snapshot.
pub struct RankingHandle {
    current: RwLock<Arc<RankingSnapshot>>,
}

impl RankingHandle {
    pub fn new() -> Self {
        Self {
            current: RwLock::new(Arc::new(RankingSnapshot::initial())),
        }
    }

    /// The currently published snapshot.
    pub fn load(&self) -> Arc<RankingSnapshot> {
        self.current.read().clone()
    }

    /// Atomically replace the published snapshot with `tickers`, bumping the
    /// generation. Returns the new snapshot.
    pub fn publish(&self, tickers: HashSet<String>) -> Arc<RankingSnapshot> {
        let mut slot = self.current.write();
        let next = Arc::new(RankingSnapshot {
            tickers,
            fetched_at: Utc::now(),
            generation: slot.generation + 1,
        });
        *slot = next.clone();
        next
    }

    pub fn generation(&self) -> u64 {
        self.current.read().generation
    }
}

impl Default for RankingHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RankingHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snap = self.load();
        f.debug_struct("RankingHandle")
            .field("generation", &snap.generation)
            .field("tickers", &snap.tickers.len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn set(tickers: &[&str]) -> HashSet<String> {
        tickers.iter().map(|t| t.to_string()).collect()
    }

    #[test]
    fn generation_strictly_increases_on_publish() {
        let handle = RankingHandle::new();
        assert_eq!(handle.generation(), 0);

        handle.publish(set(&["AAPL", "MSFT"]));
        assert_eq!(handle.generation(), 1);
        handle.publish(set(&["AAPL"]));
        handle.publish(set(&[]));
        assert_eq!(handle.generation(), 3);
    }

    #[test]
    fn readers_keep_their_snapshot_across_a_publish() {
        let handle = RankingHandle::new();
        handle.publish(set(&["AAPL"]));
        let before = handle.load();

        handle.publish(set(&["MSFT"]));
        // The old Arc is unchanged; the handle serves the new one.
        assert!(before.contains("AAPL"));
        assert!(!handle.load().contains("AAPL"));
        assert!(handle.load().contains("MSFT"));
    }
}
