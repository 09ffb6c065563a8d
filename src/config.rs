// =============================================================================
// Runtime Configuration — Hot-loadable relay settings with atomic save
// =============================================================================
//
// Central configuration hub for the signal relay. Persistence uses an atomic
// tmp + rename pattern to prevent corruption on crash. All fields carry
// `#[serde(default)]` so that adding new fields never breaks loading an older
// config file.
//
// Precedence: JSON file < environment variables. Two inputs are required and
// only accepted from the environment: RELAY_DEST_WEBHOOK_URL and
// RELAY_ADMIN_TOKEN (the token is read per-request by the auth layer; startup
// only verifies it is present).
// =============================================================================

use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_bind_addr() -> String {
    "0.0.0.0:3001".to_string()
}

fn default_dest_webhook_timeout_secs() -> u64 {
    5
}

fn default_max_req_per_min() -> u32 {
    60
}

fn default_decision_workers() -> usize {
    4
}

fn default_forwarding_workers() -> usize {
    4
}

fn default_in_queue_capacity() -> usize {
    100_000
}

fn default_approved_queue_capacity() -> usize {
    10_000
}

fn default_store_retry_cap() -> u32 {
    3
}

fn default_max_signals_per_ticker() -> usize {
    10
}

fn default_reprocess_deadline_secs() -> u64 {
    30
}

fn default_shutdown_deadline_secs() -> u64 {
    20
}

fn default_source_page_delay_ms() -> u64 {
    1000
}

// =============================================================================
// RelayConfig
// =============================================================================

/// Top-level runtime configuration for the signal relay.
///
/// Every field has a serde default so that older JSON files missing new fields
/// will still deserialise correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    // --- Network -------------------------------------------------------------

    /// Address the HTTP API binds to.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Destination webhook for approved signals. Required; env-only in
    /// practice (`RELAY_DEST_WEBHOOK_URL`).
    #[serde(default)]
    pub dest_webhook_url: String,

    /// Hard per-request timeout for outbound forwards, in seconds.
    #[serde(default = "default_dest_webhook_timeout_secs")]
    pub dest_webhook_timeout_secs: u64,

    /// Optional shared token required on `/webhook/in`. Empty = open ingress.
    #[serde(default)]
    pub inbound_token: Option<String>,

    // --- Outbound rate budget ------------------------------------------------

    /// Maximum outbound forwards per rolling 60-second window.
    #[serde(default = "default_max_req_per_min")]
    pub max_req_per_min: u32,

    // --- Worker pools & queues ----------------------------------------------

    /// Number of decision workers draining the InQueue.
    #[serde(default = "default_decision_workers")]
    pub decision_workers: usize,

    /// Number of forwarding workers draining the ApprovedQueue.
    #[serde(default = "default_forwarding_workers")]
    pub forwarding_workers: usize,

    /// InQueue capacity; a full queue rejects ingress with backpressure.
    #[serde(default = "default_in_queue_capacity")]
    pub in_queue_capacity: usize,

    /// ApprovedQueue capacity.
    #[serde(default = "default_approved_queue_capacity")]
    pub approved_queue_capacity: usize,

    // --- Retry / reprocess budgets ------------------------------------------

    /// Transient store failures tolerated per signal before it is rejected.
    #[serde(default = "default_store_retry_cap")]
    pub store_retry_cap: u32,

    /// Cap on rejected-BUY candidates examined per ticker per reprocess run.
    #[serde(default = "default_max_signals_per_ticker")]
    pub max_signals_per_ticker: usize,

    /// Soft deadline for one reprocessing cycle, in seconds.
    #[serde(default = "default_reprocess_deadline_secs")]
    pub reprocess_deadline_secs: u64,

    /// Queue-drain budget during graceful shutdown, in seconds.
    #[serde(default = "default_shutdown_deadline_secs")]
    pub shutdown_deadline_secs: u64,

    // --- Forwarding shape ----------------------------------------------------

    /// When set, outbound payloads gain an `action` field copied from `side`
    /// if the original payload carried no `action`.
    #[serde(default)]
    pub forward_rewrite_side_to_action: bool,

    // --- Ranking source ------------------------------------------------------

    /// Minimum delay between paginated ranking-source requests, in ms.
    #[serde(default = "default_source_page_delay_ms")]
    pub source_page_delay_ms: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            dest_webhook_url: String::new(),
            dest_webhook_timeout_secs: default_dest_webhook_timeout_secs(),
            inbound_token: None,
            max_req_per_min: default_max_req_per_min(),
            decision_workers: default_decision_workers(),
            forwarding_workers: default_forwarding_workers(),
            in_queue_capacity: default_in_queue_capacity(),
            approved_queue_capacity: default_approved_queue_capacity(),
            store_retry_cap: default_store_retry_cap(),
            max_signals_per_ticker: default_max_signals_per_ticker(),
            reprocess_deadline_secs: default_reprocess_deadline_secs(),
            shutdown_deadline_secs: default_shutdown_deadline_secs(),
            forward_rewrite_side_to_action: false,
            source_page_delay_ms: default_source_page_delay_ms(),
        }
    }
}

impl RelayConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read relay config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse relay config from {}", path.display()))?;

        info!(path = %path.display(), "relay config loaded");
        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise relay config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "relay config saved (atomic)");
        Ok(())
    }

    /// Apply `RELAY_*` environment overrides on top of whatever was loaded.
    pub fn apply_env_overrides(&mut self) {
        fn env_string(key: &str) -> Option<String> {
            std::env::var(key).ok().filter(|v| !v.trim().is_empty())
        }

        fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
            let raw = env_string(key)?;
            match raw.trim().parse() {
                Ok(v) => Some(v),
                Err(_) => {
                    warn!(key, value = %raw, "ignoring unparseable env override");
                    None
                }
            }
        }

        if let Some(v) = env_string("RELAY_BIND_ADDR") {
            self.bind_addr = v;
        }
        if let Some(v) = env_string("RELAY_DEST_WEBHOOK_URL") {
            self.dest_webhook_url = v;
        }
        if let Some(v) = env_parse("RELAY_DEST_WEBHOOK_TIMEOUT") {
            self.dest_webhook_timeout_secs = v;
        }
        if let Some(v) = env_string("RELAY_INBOUND_TOKEN") {
            self.inbound_token = Some(v);
        }
        if let Some(v) = env_parse("RELAY_MAX_REQ_PER_MIN") {
            self.max_req_per_min = v;
        }
        if let Some(v) = env_parse("RELAY_DECISION_WORKERS") {
            self.decision_workers = v;
        }
        if let Some(v) = env_parse("RELAY_FORWARDING_WORKERS") {
            self.forwarding_workers = v;
        }
        if let Some(v) = env_parse("RELAY_IN_QUEUE_CAPACITY") {
            self.in_queue_capacity = v;
        }
        if let Some(v) = env_parse("RELAY_APPROVED_QUEUE_CAPACITY") {
            self.approved_queue_capacity = v;
        }
        if let Some(v) = env_parse("RELAY_STORE_RETRY_CAP") {
            self.store_retry_cap = v;
        }
        if let Some(v) = env_parse("RELAY_MAX_SIGNALS_PER_TICKER") {
            self.max_signals_per_ticker = v;
        }
        if let Some(v) = env_parse("RELAY_REPROCESS_DEADLINE") {
            self.reprocess_deadline_secs = v;
        }
        if let Some(v) = env_parse("RELAY_SHUTDOWN_DEADLINE") {
            self.shutdown_deadline_secs = v;
        }
        if let Some(v) = env_parse("RELAY_FORWARD_REWRITE_SIDE") {
            self.forward_rewrite_side_to_action = v;
        }
        if let Some(v) = env_parse("RELAY_SOURCE_PAGE_DELAY_MS") {
            self.source_page_delay_ms = v;
        }
    }

    /// Validate required inputs and numeric sanity. Called once at startup.
    pub fn validate(&self) -> Result<()> {
        if self.dest_webhook_url.trim().is_empty() {
            bail!("RELAY_DEST_WEBHOOK_URL is required");
        }
        if std::env::var("RELAY_ADMIN_TOKEN")
            .map(|t| t.trim().is_empty())
            .unwrap_or(true)
        {
            bail!("RELAY_ADMIN_TOKEN is required");
        }
        if self.max_req_per_min == 0 {
            bail!("max_req_per_min must be >= 1");
        }
        if self.decision_workers == 0 || self.forwarding_workers == 0 {
            bail!("worker pool sizes must be >= 1");
        }
        if self.in_queue_capacity == 0 || self.approved_queue_capacity == 0 {
            bail!("queue capacities must be >= 1");
        }
        Ok(())
    }
}
