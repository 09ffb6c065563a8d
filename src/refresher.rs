// =============================================================================
// Ranking Refresher — periodic fetch / diff / apply / reprocess loop
// =============================================================================
//
// One task, driven by the active strategy's refresh interval. Each cycle:
// fetch the ranking from the source, diff against the published snapshot,
// publish the new snapshot atomically, and hand the entered tickers to the
// reprocessing engine when the strategy asks for it.
//
// A fetch failure keeps the last good snapshot: admission keeps evaluating
// against known-good data, and a transient source outage can never empty the
// ranking.
//
// Pause stops fetch ticks; a forced refresh (admin) runs even while paused.
// =============================================================================

use std::collections::HashSet;
use std::sync::Arc;

use tokio::time::Duration;
use tracing::{debug, info, warn};

use crate::app_state::AppState;
use crate::finviz::RankingSource;
use crate::store::{Store, Strategy};

/// Fallback wait when no active strategy can be loaded.
const NO_STRATEGY_RETRY: Duration = Duration::from_secs(30);

/// Run the refresher until the process shuts down.
pub async fn run_refresher(state: Arc<AppState>, source: Arc<dyn RankingSource>) {
    info!("ranking refresher started");

    loop {
        // The strategy is re-read every tick; admin changes apply to the
        // next cycle, never the in-flight one.
        let strategy = match state.store.active_strategy().await {
            Ok(strategy) => strategy,
            Err(e) => {
                warn!(error = %e, "no active strategy — retrying");
                tokio::time::sleep(NO_STRATEGY_RETRY).await;
                continue;
            }
        };

        let tick = Duration::from_secs(strategy.refresh_interval_secs.max(1));
        let forced = tokio::select! {
            _ = tokio::time::sleep(tick) => false,
            _ = state.refresher.force.notified() => true,
        };

        if state.refresher.is_paused() && !forced {
            debug!("refresher paused — fetch skipped");
            continue;
        }
        if forced {
            info!("manual ranking refresh requested");
        }

        run_cycle(&state, source.as_ref(), &strategy).await;
    }
}

/// One fetch → diff → apply → reprocess pass.
pub(crate) async fn run_cycle(state: &Arc<AppState>, source: &dyn RankingSource, strategy: &Strategy) {
    let previous = state.ranking.load();

    let fetched = match source.fetch(&strategy.url, strategy.top_n).await {
        Ok(tickers) => tickers,
        Err(e) => {
            warn!(
                strategy = %strategy.name,
                error = %e,
                "ranking fetch failed — keeping last good snapshot"
            );
            return;
        }
    };

    let entered: HashSet<String> = fetched.difference(&previous.tickers).cloned().collect();
    let departed = previous.tickers.difference(&fetched).count();

    let snapshot = state.ranking.publish(fetched);
    state.increment_version();
    info!(
        generation = snapshot.generation,
        size = snapshot.tickers.len(),
        entered = entered.len(),
        departed,
        "ranking snapshot published"
    );

    if strategy.reprocess_enabled && !entered.is_empty() {
        let summary = state.reprocessor.run_cycle(&entered, strategy).await;
        if summary.successful > 0 {
            info!(
                revived = summary.successful,
                "reprocessing revived rejected BUY signals"
            );
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RelayConfig;
    use crate::store::memory::MemoryStore;
    use crate::store::Store;
    use crate::types::{Signal, SignalStatus, SignalType};
    use anyhow::bail;
    use async_trait::async_trait;
    use chrono::Utc;
    use serde_json::json;
    use std::collections::VecDeque;

    struct ScriptedSource {
        results: tokio::sync::Mutex<VecDeque<anyhow::Result<HashSet<String>>>>,
    }

    impl ScriptedSource {
        fn new(results: Vec<anyhow::Result<HashSet<String>>>) -> Self {
            Self {
                results: tokio::sync::Mutex::new(results.into()),
            }
        }
    }

    #[async_trait]
    impl RankingSource for ScriptedSource {
        async fn fetch(&self, _url: &str, _top_n: usize) -> anyhow::Result<HashSet<String>> {
            match self.results.lock().await.pop_front() {
                Some(result) => result,
                None => bail!("scripted source exhausted"),
            }
        }
    }

    fn set(tickers: &[&str]) -> HashSet<String> {
        tickers.iter().map(|t| t.to_string()).collect()
    }

    async fn test_state() -> Arc<AppState> {
        let store = Arc::new(MemoryStore::new());
        store.ensure_default_strategy().await.unwrap();
        Arc::new(AppState::new(RelayConfig::default(), store))
    }

    #[tokio::test]
    async fn successful_cycle_publishes_and_bumps_generation() {
        let state = test_state().await;
        let strategy = state.store.active_strategy().await.unwrap();
        let source = ScriptedSource::new(vec![Ok(set(&["AAPL", "MSFT"]))]);

        run_cycle(&state, &source, &strategy).await;

        let snapshot = state.ranking.load();
        assert_eq!(snapshot.generation, 1);
        assert!(snapshot.contains("AAPL"));
        assert!(snapshot.contains("MSFT"));
    }

    #[tokio::test]
    async fn failed_fetch_keeps_the_last_good_snapshot() {
        let state = test_state().await;
        let strategy = state.store.active_strategy().await.unwrap();

        let source = ScriptedSource::new(vec![Ok(set(&["AAPL"])), Err(anyhow::anyhow!("boom"))]);
        run_cycle(&state, &source, &strategy).await;
        assert_eq!(state.ranking.generation(), 1);

        run_cycle(&state, &source, &strategy).await;
        // No publish happened: same generation, same tickers.
        let snapshot = state.ranking.load();
        assert_eq!(snapshot.generation, 1);
        assert!(snapshot.contains("AAPL"));
    }

    #[tokio::test]
    async fn entered_ticker_triggers_reprocessing() {
        let state = test_state().await;
        let strategy = state.store.active_strategy().await.unwrap();
        assert!(strategy.reprocess_enabled);

        // A BUY rejected while AAPL was outside the ranking.
        let signal = Signal::new(
            "AAPL".into(),
            Some("buy".into()),
            None,
            None,
            Utc::now(),
            json!({"ticker": "AAPL", "side": "buy"}),
        );
        state
            .store
            .insert_signal(&signal, SignalStatus::Received, SignalType::Buy)
            .await
            .unwrap();
        state
            .store
            .set_signal_status(
                signal.signal_id,
                SignalStatus::Rejected,
                "decision-0",
                Some("not_in_ranking".into()),
            )
            .await
            .unwrap();

        let source = ScriptedSource::new(vec![Ok(set(&["AAPL"]))]);
        run_cycle(&state, &source, &strategy).await;

        assert_eq!(
            state.store.get_signal(signal.signal_id).await.unwrap().status,
            SignalStatus::Approved
        );
        assert!(state.store.is_position_open_or_closing("AAPL").await.unwrap());
        assert_eq!(state.approved_queue.depth(), 1);
    }

    #[tokio::test]
    async fn reprocess_disabled_leaves_rejections_alone() {
        let state = test_state().await;
        let mut strategy = state.store.active_strategy().await.unwrap();
        strategy.reprocess_enabled = false;

        let signal = Signal::new(
            "AAPL".into(),
            Some("buy".into()),
            None,
            None,
            Utc::now(),
            json!({"ticker": "AAPL", "side": "buy"}),
        );
        state
            .store
            .insert_signal(&signal, SignalStatus::Received, SignalType::Buy)
            .await
            .unwrap();
        state
            .store
            .set_signal_status(signal.signal_id, SignalStatus::Rejected, "decision-0", None)
            .await
            .unwrap();

        let source = ScriptedSource::new(vec![Ok(set(&["AAPL"]))]);
        run_cycle(&state, &source, &strategy).await;

        assert_eq!(
            state.store.get_signal(signal.signal_id).await.unwrap().status,
            SignalStatus::Rejected
        );
        assert!(state.approved_queue.is_empty());
    }

    #[tokio::test]
    async fn unchanged_ranking_reprocesses_nothing() {
        let state = test_state().await;
        let strategy = state.store.active_strategy().await.unwrap();

        let source = ScriptedSource::new(vec![Ok(set(&["AAPL"])), Ok(set(&["AAPL"]))]);
        run_cycle(&state, &source, &strategy).await;
        run_cycle(&state, &source, &strategy).await;

        assert_eq!(state.ranking.generation(), 2);
        assert_eq!(state.metrics.snapshot().reprocess_cycles, 1);
    }
}
