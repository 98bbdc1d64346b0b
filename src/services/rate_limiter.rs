//! Sliding-window call counters (§4.2), grounded in the teacher's
//! `middleware::ip_rate_limiter::RateLimiter` (`IpTracker` + periodic sweep),
//! generalized from per-IP to per-key / per-composite-key windows.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

const WINDOW: Duration = Duration::from_secs(60);
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Default)]
struct Window {
    timestamps: Vec<Instant>,
}

pub struct RateLimitOutcome {
    pub allowed: bool,
    pub remaining: Option<u64>,
    pub reset_in_ms: Option<u64>,
}

pub struct RateLimiter {
    windows: Arc<DashMap<String, Window>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        let windows: Arc<DashMap<String, Window>> = Arc::new(DashMap::new());
        let sweep_windows = windows.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(SWEEP_INTERVAL).await;
                let now = Instant::now();
                sweep_windows.retain(|_, w| {
                    w.timestamps.retain(|t| now.duration_since(*t) < WINDOW);
                    !w.timestamps.is_empty()
                });
            }
        });
        Self { windows }
    }

    /// Admission check; does not insert a timestamp. `max = 0` is unlimited.
    pub fn check(&self, key: &str, max: u64) -> RateLimitOutcome {
        if max == 0 {
            return RateLimitOutcome { allowed: true, remaining: None, reset_in_ms: None };
        }
        let now = Instant::now();
        match self.windows.get(key) {
            Some(window) => {
                let count = window
                    .timestamps
                    .iter()
                    .filter(|t| now.duration_since(**t) < WINDOW)
                    .count() as u64;
                if count >= max {
                    let oldest = window
                        .timestamps
                        .iter()
                        .filter(|t| now.duration_since(**t) < WINDOW)
                        .min()
                        .copied();
                    let reset_in_ms = oldest
                        .map(|t| WINDOW.saturating_sub(now.duration_since(t)).as_millis() as u64)
                        .unwrap_or(0);
                    RateLimitOutcome { allowed: false, remaining: Some(0), reset_in_ms: Some(reset_in_ms) }
                } else {
                    RateLimitOutcome { allowed: true, remaining: Some(max - count), reset_in_ms: None }
                }
            }
            None => RateLimitOutcome { allowed: true, remaining: Some(max), reset_in_ms: None },
        }
    }

    /// Records a call. Callers must only invoke this once the overall
    /// pipeline has admitted the call.
    pub fn record(&self, key: &str) {
        let now = Instant::now();
        let mut entry = self.windows.entry(key.to_string()).or_insert_with(Window::default);
        entry.timestamps.push(now);
    }

    pub fn composite_key(api_key: &str, tool: &str) -> String {
        format!("{api_key}:tool:{tool}")
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}
