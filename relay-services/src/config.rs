//! Relay limits
//!
//! Loaded from environment variables:
//! - RELAY_MAX_CLIENTS: concurrent SSE sessions (default 100)
//! - RELAY_RATE_LIMIT_REQUESTS / RELAY_RATE_LIMIT_WINDOW_MS: requests allowed
//!   per identity per window (default 60 per 60s)
//! - RELAY_CLIENT_QUEUE: per-client output queue capacity (default 256)

use std::time::Duration;

use relay_core::{RelayError, RelayResult};

const MAX_CLIENTS: usize = 100;
const RATE_LIMIT_REQUESTS: usize = 60;
const RATE_LIMIT_WINDOW: Duration = Duration::from_millis(60_000);
const CLIENT_QUEUE: usize = 256;

/// Room for the `connected` and `status` events every session starts with
const MIN_CLIENT_QUEUE: usize = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    pub max_clients: usize,
    pub rate_limit_requests: usize,
    pub rate_limit_window: Duration,
    pub client_queue: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            max_clients: MAX_CLIENTS,
            rate_limit_requests: RATE_LIMIT_REQUESTS,
            rate_limit_window: RATE_LIMIT_WINDOW,
            client_queue: CLIENT_QUEUE,
        }
    }
}

impl RelayConfig {
    pub fn from_env() -> RelayResult<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> RelayResult<Self> {
        let defaults = Self::default();
        let config = Self {
            max_clients: parse_var(&lookup, "RELAY_MAX_CLIENTS")?.unwrap_or(defaults.max_clients),
            rate_limit_requests: parse_var(&lookup, "RELAY_RATE_LIMIT_REQUESTS")?
                .unwrap_or(defaults.rate_limit_requests),
            rate_limit_window: parse_var(&lookup, "RELAY_RATE_LIMIT_WINDOW_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.rate_limit_window),
            client_queue: parse_var(&lookup, "RELAY_CLIENT_QUEUE")?
                .unwrap_or(defaults.client_queue),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> RelayResult<()> {
        if self.max_clients == 0 {
            return Err(RelayError::config("RELAY_MAX_CLIENTS must be at least 1"));
        }
        if self.rate_limit_requests == 0 || self.rate_limit_window.is_zero() {
            return Err(RelayError::config("rate limit must allow at least one request"));
        }
        if self.client_queue < MIN_CLIENT_QUEUE {
            return Err(RelayError::config(format!(
                "RELAY_CLIENT_QUEUE must be at least {}",
                MIN_CLIENT_QUEUE
            )));
        }
        Ok(())
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
) -> RelayResult<Option<T>> {
    match lookup(name) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| RelayError::config(format!("{} has an invalid value: {}", name, raw))),
        _ => Ok(None),
    }
}
