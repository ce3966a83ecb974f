//! Per-client sliding-window rate limiting for the webhook endpoint.

use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use autodev_core::{Clock, Timestamp};

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, PartialEq)]
pub enum RateLimitDecision {
    Allowed,
    Limited {
        /// Seconds until the oldest request leaves the window
        retry_after: Duration,
    },
}

/// Sliding-window limiter keyed by client address.
pub struct SlidingWindowLimiter {
    clock: Arc<dyn Clock>,
    window: Duration,
    limit: usize,
    hits: Mutex<HashMap<IpAddr, VecDeque<Timestamp>>>,
}

impl SlidingWindowLimiter {
    /// The webhook default: 30 requests per minute per address.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::with_limits(clock, Duration::from_secs(60), 30)
    }

    pub fn with_limits(clock: Arc<dyn Clock>, window: Duration, limit: usize) -> Self {
        Self {
            clock,
            window,
            limit,
            hits: Mutex::new(HashMap::new()),
        }
    }

    /// Record a request from `addr` and decide whether it may proceed.
    pub async fn check(&self, addr: IpAddr) -> RateLimitDecision {
        let now = self.clock.now();
        let mut hits = self.hits.lock().await;
        let window = hits.entry(addr).or_default();

        // Drop requests that have slid out of the window.
        while let Some(oldest) = window.front() {
            if now.duration_since(*oldest) >= self.window {
                window.pop_front();
            } else {
                break;
            }
        }

        if window.len() >= self.limit {
            let oldest = *window.front().expect("window is non-empty at the limit");
            let elapsed = now.duration_since(oldest);
            let retry_after = self.window.saturating_sub(elapsed).max(Duration::from_secs(1));
            return RateLimitDecision::Limited { retry_after };
        }

        window.push_back(now);
        RateLimitDecision::Allowed
    }
}

#[cfg(test)]
#[path = "ratelimit_tests.rs"]
mod tests;
