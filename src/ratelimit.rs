// =============================================================================
// Outbound Rate Limiter — sliding-window budget for webhook forwards
// =============================================================================
//
// At most `max_req_per_min` limited acquisitions succeed within any rolling
// 60-second interval while the limiter is enabled. Waiters queue on a fair
// async mutex that is held across the wait, so wakeups are FIFO.
//
// `pause()` / `resume()` flip an enabled flag checked at the top of `acquire`
// (and re-checked after every sleep): while paused, `acquire` returns a no-op
// permit immediately and applies no pacing.
// =============================================================================

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use serde::Serialize;
use tokio::time::{Duration, Instant};
use tracing::{debug, info};

/// Width of the sliding window.
const WINDOW: Duration = Duration::from_secs(60);

/// Grant to issue exactly one outbound request. Returned to the limiter via
/// `on_response` on every outcome path.
#[derive(Debug)]
pub struct Permit {
    /// False when the limiter was paused at acquisition time.
    pub limited: bool,
}

/// Serialisable view of the limiter for the admin surface.
#[derive(Debug, Clone, Serialize)]
pub struct RateLimiterSnapshot {
    pub enabled: bool,
    pub max_req_per_min: u32,
    /// Acquisitions currently inside the rolling window.
    pub window_used: usize,
    pub acquired_total: u64,
    pub responses_2xx: u64,
    pub responses_err: u64,
}

pub struct OutboundRateLimiter {
    max_per_min: AtomicU32,
    enabled: AtomicBool,
    window: tokio::sync::Mutex<VecDeque<Instant>>,
    acquired_total: AtomicU64,
    responses_2xx: AtomicU64,
    responses_err: AtomicU64,
}

impl OutboundRateLimiter {
    pub fn new(max_req_per_min: u32) -> Self {
        Self {
            max_per_min: AtomicU32::new(max_req_per_min.max(1)),
            enabled: AtomicBool::new(true),
            window: tokio::sync::Mutex::new(VecDeque::new()),
            acquired_total: AtomicU64::new(0),
            responses_2xx: AtomicU64::new(0),
            responses_err: AtomicU64::new(0),
        }
    }

    /// Block cooperatively until the caller may issue one outbound request.
    /// Returns immediately with a no-op permit while paused.
    pub async fn acquire(&self) -> Permit {
        if !self.enabled.load(Ordering::Relaxed) {
            return Permit { limited: false };
        }

        let mut window = self.window.lock().await;
        loop {
            let max = self.max_per_min.load(Ordering::Relaxed) as usize;
            let now = Instant::now();
            while window
                .front()
                .map_or(false, |&t| now.duration_since(t) >= WINDOW)
            {
                window.pop_front();
            }

            if window.len() < max {
                window.push_back(now);
                self.acquired_total.fetch_add(1, Ordering::Relaxed);
                return Permit { limited: true };
            }

            // Window is full: sleep until the oldest entry expires. Holding
            // the mutex across the sleep keeps waiters FIFO.
            let oldest = *window.front().expect("window is non-empty");
            let wait = WINDOW.saturating_sub(now.duration_since(oldest));
            debug!(wait_ms = wait.as_millis() as u64, "outbound budget exhausted — waiting");
            tokio::time::sleep(wait).await;

            if !self.enabled.load(Ordering::Relaxed) {
                return Permit { limited: false };
            }
        }
    }

    /// Release the permit and record the response outcome.
    pub fn on_response(&self, permit: Permit, status: Option<u16>) {
        let _ = permit;
        match status {
            Some(code) if (200..300).contains(&code) => {
                self.responses_2xx.fetch_add(1, Ordering::Relaxed);
            }
            _ => {
                self.responses_err.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn pause(&self) {
        self.enabled.store(false, Ordering::Relaxed);
        info!("outbound rate limiter paused — permits are immediate");
    }

    pub fn resume(&self) {
        self.enabled.store(true, Ordering::Relaxed);
        info!("outbound rate limiter resumed");
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub async fn snapshot(&self) -> RateLimiterSnapshot {
        let mut window = self.window.lock().await;
        let now = Instant::now();
        while window
            .front()
            .map_or(false, |&t| now.duration_since(t) >= WINDOW)
        {
            window.pop_front();
        }
        RateLimiterSnapshot {
            enabled: self.is_enabled(),
            max_req_per_min: self.max_per_min.load(Ordering::Relaxed),
            window_used: window.len(),
            acquired_total: self.acquired_total.load(Ordering::Relaxed),
            responses_2xx: self.responses_2xx.load(Ordering::Relaxed),
            responses_err: self.responses_err.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for OutboundRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboundRateLimiter")
            .field("max_per_min", &self.max_per_min.load(Ordering::Relaxed))
            .field("enabled", &self.enabled.load(Ordering::Relaxed))
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn burst_within_budget_is_immediate() {
        let limiter = OutboundRateLimiter::new(3);
        let start = Instant::now();
        for _ in 0..3 {
            let p = limiter.acquire().await;
            assert!(p.limited);
            limiter.on_response(p, Some(200));
        }
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn excess_acquire_waits_for_the_window_to_roll() {
        let limiter = OutboundRateLimiter::new(2);
        let start = Instant::now();
        limiter.on_response(limiter.acquire().await, Some(200));
        limiter.on_response(limiter.acquire().await, Some(200));

        // Third acquisition must wait the full window.
        let p = limiter.acquire().await;
        assert!(p.limited);
        assert!(start.elapsed() >= Duration::from_secs(60));
        limiter.on_response(p, Some(200));
    }

    #[tokio::test(start_paused = true)]
    async fn rolling_window_admits_at_most_max_per_minute() {
        let limiter = OutboundRateLimiter::new(5);
        let start = Instant::now();
        let mut grant_times = Vec::new();
        for _ in 0..10 {
            let p = limiter.acquire().await;
            grant_times.push(start.elapsed());
            limiter.on_response(p, Some(200));
        }
        // First five immediate, remainder only after the window rolls.
        assert!(grant_times[4] < Duration::from_secs(60));
        assert!(grant_times[5] >= Duration::from_secs(60));
        assert!(grant_times[9] < Duration::from_secs(121));
    }

    #[tokio::test(start_paused = true)]
    async fn paused_limiter_grants_noop_permits_immediately() {
        let limiter = OutboundRateLimiter::new(1);
        limiter.on_response(limiter.acquire().await, Some(200));
        limiter.pause();

        let start = Instant::now();
        let p = limiter.acquire().await;
        assert!(!p.limited);
        assert_eq!(start.elapsed(), Duration::ZERO);
        limiter.on_response(p, Some(200));

        limiter.resume();
        let p = limiter.acquire().await;
        assert!(p.limited);
        limiter.on_response(p, Some(500));

        let snap = limiter.snapshot().await;
        assert!(snap.enabled);
        assert_eq!(snap.responses_err, 1);
    }
}
