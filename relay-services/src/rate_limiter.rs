//! Per-identity rate limiter for relay requests
//!
//! Sliding-window counter keyed by caller identity (client address or
//! `x-forwarded-for`). Requests over the limit are rejected, never queued.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use relay_core::{RelayError, RelayResult};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Sliding-window rate limiter
///
/// Each identity keeps the timestamps of its requests within the current
/// window. A request is allowed while fewer than `max_requests` remain in
/// the window after expired entries are dropped.
#[derive(Debug)]
pub struct RateLimiter {
    /// Recent request times per identity
    windows: Mutex<HashMap<String, VecDeque<Instant>>>,
    max_requests: usize,
    window: Duration,
    /// Name for logging purposes
    name: String,
    total_requests: AtomicU64,
    rejected_requests: AtomicU64,
}

impl RateLimiter {
    pub fn new(max_requests: usize, window: Duration, name: &str) -> Self {
        Self {
            windows: Mutex::new(HashMap::new()),
            max_requests,
            window,
            name: name.to_string(),
            total_requests: AtomicU64::new(0),
            rejected_requests: AtomicU64::new(0),
        }
    }

    /// Record a request for `identity`, or reject it with `RateLimited`
    pub async fn check(&self, identity: &str) -> RelayResult<()> {
        let request_num = self.total_requests.fetch_add(1, Ordering::Relaxed) + 1;
        let now = Instant::now();

        let mut windows = self.windows.lock().await;
        let recent = windows.entry(identity.to_string()).or_default();

        while recent
            .front()
            .is_some_and(|at| now.duration_since(*at) >= self.window)
        {
            recent.pop_front();
        }

        if recent.len() >= self.max_requests {
            self.rejected_requests.fetch_add(1, Ordering::Relaxed);
            warn!(
                "[RATE_LIMITER:{}] #{} REJECTED - {} made {} requests in {:?}",
                self.name,
                request_num,
                identity,
                recent.len(),
                self.window
            );
            return Err(RelayError::rate_limited(identity));
        }

        recent.push_back(now);
        debug!(
            "[RATE_LIMITER:{}] #{} allowed for {} ({}/{})",
            self.name,
            request_num,
            identity,
            recent.len(),
            self.max_requests
        );
        Ok(())
    }

    /// Forget identities with no requests in the current window
    pub async fn prune(&self) -> usize {
        let now = Instant::now();
        let mut windows = self.windows.lock().await;
        let before = windows.len();
        windows.retain(|_, recent| {
            recent
                .back()
                .is_some_and(|at| now.duration_since(*at) < self.window)
        });
        before - windows.len()
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn max_requests(&self) -> usize {
        self.max_requests
    }

    /// Get statistics about this rate limiter (for debugging)
    pub async fn stats(&self) -> RateLimiterStats {
        RateLimiterStats {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            rejected_requests: self.rejected_requests.load(Ordering::Relaxed),
            tracked_identities: self.windows.lock().await.len(),
            max_requests: self.max_requests,
            window_ms: self.window.as_millis() as u64,
            name: self.name.clone(),
        }
    }
}

/// Statistics about rate limiter usage
#[derive(Debug, Clone)]
pub struct RateLimiterStats {
    pub total_requests: u64,
    pub rejected_requests: u64,
    pub tracked_identities: usize,
    pub max_requests: usize,
    pub window_ms: u64,
    pub name: String,
}
