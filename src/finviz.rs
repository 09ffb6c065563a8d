// =============================================================================
// Ranking Source — pluggable Top-N ticker provider (Finviz screener impl)
// =============================================================================
//
// The refresher only knows the `RankingSource` trait. The shipped
// implementation pages through a Finviz-style screener with `&r=<row>` offset
// pagination, extracting tickers from `quote.ashx?t=` links, and keeps a
// minimum delay between page requests so the source never sees a burst.
//
// A fetch either yields a complete set or fails as a whole: a mid-pagination
// error must not produce a truncated ranking (the refresher would treat it as
// the new truth and evict live tickers).
// =============================================================================

use std::collections::HashSet;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio::time::Duration;
use tracing::debug;

/// Rows per screener page; Finviz paginates in blocks of 20.
const ROWS_PER_PAGE: usize = 20;

/// Upper bound on pages per fetch, against a source that paginates forever.
const MAX_PAGES: usize = 50;

/// Provider of the external Top-N ranking.
#[async_trait]
pub trait RankingSource: Send + Sync {
    /// Fetch up to `top_n` tickers from `url`, in rank order.
    async fn fetch(&self, url: &str, top_n: usize) -> Result<HashSet<String>>;
}

/// Screener-backed source using paginated HTML pages.
pub struct FinvizScreener {
    client: reqwest::Client,
    page_delay: Duration,
}

impl FinvizScreener {
    pub fn new(page_delay: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .user_agent("Mozilla/5.0 (compatible; signal-relay/1.0)")
            .build()
            .expect("failed to build reqwest client");
        Self { client, page_delay }
    }
}

#[async_trait]
impl RankingSource for FinvizScreener {
    async fn fetch(&self, url: &str, top_n: usize) -> Result<HashSet<String>> {
        let mut tickers: HashSet<String> = HashSet::new();
        let mut row_offset = 1usize;

        for page in 0..MAX_PAGES {
            if tickers.len() >= top_n {
                break;
            }
            if page > 0 {
                tokio::time::sleep(self.page_delay).await;
            }

            let page_url = if row_offset > 1 {
                format!("{url}&r={row_offset}")
            } else {
                url.to_string()
            };

            let body = self
                .client
                .get(&page_url)
                .send()
                .await
                .with_context(|| format!("screener request failed: {page_url}"))?
                .error_for_status()
                .with_context(|| format!("screener returned an error status: {page_url}"))?
                .text()
                .await
                .context("failed to read screener response body")?;

            let page_tickers = extract_tickers(&body);
            if page_tickers.is_empty() {
                // Past the last page.
                break;
            }

            let before = tickers.len();
            for ticker in page_tickers {
                if tickers.len() >= top_n {
                    break;
                }
                tickers.insert(ticker);
            }
            debug!(page, total = tickers.len(), "screener page parsed");

            if tickers.len() == before {
                // Page repeated already-seen symbols; stop rather than loop.
                break;
            }
            row_offset += ROWS_PER_PAGE;
        }

        if tickers.is_empty() {
            bail!("no tickers extracted from {url}");
        }
        Ok(tickers)
    }
}

/// Pull ticker symbols out of `quote.ashx?t=SYMB` links, in document order.
fn extract_tickers(html: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut seen = HashSet::new();

    for fragment in html.split("quote.ashx?t=").skip(1) {
        let symbol: String = fragment
            .chars()
            .take_while(|c| c.is_ascii_alphanumeric() || *c == '.' || *c == '-')
            .collect();
        if symbol.is_empty() || symbol.len() > 10 {
            continue;
        }
        let symbol = symbol.to_ascii_uppercase();
        if seen.insert(symbol.clone()) {
            out.push(symbol);
        }
    }
    out
}

// =============================================================================
// Tests
// =============================================================================
