// =============================================================================
// Signal Relay — Main Entry Point
// =============================================================================
//
// Trading-signal admission and forwarding pipeline: ingest signals over HTTP,
// admit them against the published ranking and the position ledger, forward
// approved signals to the destination webhook under the outbound rate budget,
// and revive rejected BUYs when their ticker enters the ranking.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod app_state;
mod config;
mod finviz;
mod ledger;
mod metrics;
mod pipeline;
mod queue;
mod ranking;
mod ratelimit;
mod refresher;
mod reprocess;
mod store;
mod types;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::Context;
use tokio::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::config::RelayConfig;
use crate::finviz::{FinvizScreener, RankingSource};
use crate::store::memory::MemoryStore;
use crate::store::Store;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Signal Relay — Starting Up                        ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let mut config = RelayConfig::load("relay_config.json").unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config file, using defaults");
        RelayConfig::default()
    });
    config.apply_env_overrides();
    config.validate()?;

    info!(
        bind_addr = %config.bind_addr,
        decision_workers = config.decision_workers,
        forwarding_workers = config.forwarding_workers,
        max_req_per_min = config.max_req_per_min,
        in_queue_capacity = config.in_queue_capacity,
        "relay configuration resolved"
    );

    // ── 2. Store & shared state ──────────────────────────────────────────
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let strategy = store
        .ensure_default_strategy()
        .await
        .map_err(|e| anyhow::anyhow!("failed to seed default strategy: {e}"))?;
    info!(
        strategy = %strategy.name,
        refresh_interval_secs = strategy.refresh_interval_secs,
        top_n = strategy.top_n,
        "active strategy ready"
    );

    let state = Arc::new(AppState::new(config.clone(), store));
    let mut workers: Vec<tokio::task::JoinHandle<()>> = Vec::new();

    // ── 3. Decision workers ──────────────────────────────────────────────
    for idx in 0..config.decision_workers {
        workers.push(tokio::spawn(pipeline::decision::run_decision_worker(
            state.clone(),
            idx,
        )));
    }

    // ── 4. Forwarding workers ────────────────────────────────────────────
    let client = pipeline::forwarder::build_client();
    for idx in 0..config.forwarding_workers {
        workers.push(tokio::spawn(pipeline::forwarder::run_forwarding_worker(
            state.clone(),
            client.clone(),
            idx,
        )));
    }
    info!(
        decision = config.decision_workers,
        forwarding = config.forwarding_workers,
        "worker pools launched"
    );

    // ── 5. Ranking refresher ─────────────────────────────────────────────
    let source: Arc<dyn RankingSource> = Arc::new(FinvizScreener::new(Duration::from_millis(
        config.source_page_delay_ms,
    )));
    workers.push(tokio::spawn(refresher::run_refresher(
        state.clone(),
        source,
    )));

    // ── 6. WebSocket broadcaster ─────────────────────────────────────────
    workers.push(tokio::spawn(api::ws::run_event_broadcaster(state.clone())));

    // ── 7. API server ────────────────────────────────────────────────────
    let app = api::rest::router(state.clone());
    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("failed to bind API server to {}", config.bind_addr))?;
    info!(addr = %config.bind_addr, "API server listening");
    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "API server failed");
        }
    });

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 8. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received — stopping gracefully");

    // Stop accepting new submissions, then drain the pipeline up to the
    // deadline: InQueue first (decision workers keep running), then the
    // ApprovedQueue behind it.
    state.shutting_down.store(true, Ordering::Relaxed);
    let deadline = Duration::from_secs(config.shutdown_deadline_secs);
    let drained = tokio::time::timeout(deadline, async {
        while !state.in_queue.is_empty() || !state.approved_queue.is_empty() {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    })
    .await
    .is_ok();

    if drained {
        info!("pipeline queues drained");
    } else {
        warn!(
            in_depth = state.in_queue.depth(),
            approved_depth = state.approved_queue.depth(),
            "shutdown deadline hit — cancelling remaining work"
        );
    }

    server.abort();
    for handle in workers {
        handle.abort();
    }

    info!("Signal Relay shut down complete.");
    Ok(())
}
