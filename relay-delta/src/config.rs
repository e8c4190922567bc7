//! Connector configuration
//!
//! Loaded from environment variables:
//! - DELTA_WS_URL: realtime feed URL
//! - DELTA_API_KEY / DELTA_API_SECRET: credentials (both or neither)
//! - DELTA_REQUIRE_AUTH: fail at startup without credentials (default true)
//! - DELTA_AUTH_TIMEOUT_MS, DELTA_RECONNECT_BASE_MS, DELTA_RECONNECT_MAX_MS,
//!   DELTA_MAX_RECONNECT_ATTEMPTS: timing and retry limits

use std::time::Duration;

use relay_core::{RelayError, RelayResult};
use url::Url;

use crate::auth::DeltaCredentials;
use crate::reconnect::ReconnectPolicy;

/// Delta realtime feed URL
pub const DELTA_WS_URL: &str = "wss://socket.india.delta.exchange";

/// How long to wait for an auth response before continuing unauthenticated
const AUTH_TIMEOUT: Duration = Duration::from_millis(5000);

/// Reconnect delay base (multiplied by the attempt number)
const RECONNECT_DELAY_BASE: Duration = Duration::from_millis(2000);

/// Reconnect delay cap
const RECONNECT_DELAY_MAX: Duration = Duration::from_millis(30_000);

/// Max consecutive reconnect attempts
const MAX_RECONNECT_ATTEMPTS: u32 = 10;

/// Keepalive ping interval
const PING_INTERVAL: Duration = Duration::from_secs(25);

/// Socket open timeout
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Configuration for DeltaWebSocket
#[derive(Clone)]
pub struct DeltaWebSocketConfig {
    pub ws_url: String,
    pub credentials: Option<DeltaCredentials>,
    pub require_auth: bool,
    pub auth_timeout: Duration,
    pub auto_reconnect: bool,
    pub reconnect_base: Duration,
    pub reconnect_max: Duration,
    pub max_reconnect_attempts: u32,
    pub ping_interval: Duration,
    pub connect_timeout: Duration,
}

impl std::fmt::Debug for DeltaWebSocketConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeltaWebSocketConfig")
            .field("ws_url", &self.ws_url)
            .field("credentials", &self.credentials.as_ref().map(|_| "[REDACTED]"))
            .field("require_auth", &self.require_auth)
            .field("auth_timeout", &self.auth_timeout)
            .field("auto_reconnect", &self.auto_reconnect)
            .field("reconnect_base", &self.reconnect_base)
            .field("reconnect_max", &self.reconnect_max)
            .field("max_reconnect_attempts", &self.max_reconnect_attempts)
            .finish()
    }
}

impl Default for DeltaWebSocketConfig {
    fn default() -> Self {
        Self {
            ws_url: DELTA_WS_URL.to_string(),
            credentials: None,
            require_auth: false,
            auth_timeout: AUTH_TIMEOUT,
            auto_reconnect: true,
            reconnect_base: RECONNECT_DELAY_BASE,
            reconnect_max: RECONNECT_DELAY_MAX,
            max_reconnect_attempts: MAX_RECONNECT_ATTEMPTS,
            ping_interval: PING_INTERVAL,
            connect_timeout: CONNECT_TIMEOUT,
        }
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
) -> RelayResult<Option<T>> {
    match lookup(name) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| RelayError::config(format!("{} has an invalid value '{}'", name, raw))),
        _ => Ok(None),
    }
}

fn parse_bool(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> RelayResult<Option<bool>> {
    match lookup(name).map(|v| v.trim().to_ascii_lowercase()) {
        None => Ok(None),
        Some(v) if v.is_empty() => Ok(None),
        Some(v) if matches!(v.as_str(), "1" | "true" | "yes" | "on") => Ok(Some(true)),
        Some(v) if matches!(v.as_str(), "0" | "false" | "no" | "off") => Ok(Some(false)),
        Some(v) => Err(RelayError::config(format!("{} has an invalid value '{}'", name, v))),
    }
}

impl DeltaWebSocketConfig {
    /// Load configuration from the process environment
    pub fn from_env() -> RelayResult<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through `lookup` (environment-like key/value source)
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> RelayResult<Self> {
        let defaults = Self::default();

        let api_key = lookup("DELTA_API_KEY").filter(|v| !v.trim().is_empty());
        let api_secret = lookup("DELTA_API_SECRET").filter(|v| !v.trim().is_empty());
        let credentials = match (api_key, api_secret) {
            (Some(key), Some(secret)) => Some(DeltaCredentials::new(key, secret)),
            (None, None) => None,
            (Some(_), None) => {
                return Err(RelayError::config("DELTA_API_KEY is set but DELTA_API_SECRET is not"))
            }
            (None, Some(_)) => {
                return Err(RelayError::config("DELTA_API_SECRET is set but DELTA_API_KEY is not"))
            }
        };

        let config = Self {
            ws_url: lookup("DELTA_WS_URL")
                .filter(|v| !v.trim().is_empty())
                .unwrap_or(defaults.ws_url),
            credentials,
            require_auth: parse_bool(&lookup, "DELTA_REQUIRE_AUTH")?.unwrap_or(true),
            auth_timeout: parse_var::<u64>(&lookup, "DELTA_AUTH_TIMEOUT_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.auth_timeout),
            auto_reconnect: defaults.auto_reconnect,
            reconnect_base: parse_var::<u64>(&lookup, "DELTA_RECONNECT_BASE_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.reconnect_base),
            reconnect_max: parse_var::<u64>(&lookup, "DELTA_RECONNECT_MAX_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.reconnect_max),
            max_reconnect_attempts: parse_var::<u32>(&lookup, "DELTA_MAX_RECONNECT_ATTEMPTS")?
                .unwrap_or(defaults.max_reconnect_attempts),
            ping_interval: defaults.ping_interval,
            connect_timeout: defaults.connect_timeout,
        };

        config.validate()?;
        Ok(config)
    }

    /// Check the configuration is usable before any connection is made
    pub fn validate(&self) -> RelayResult<()> {
        let url = Url::parse(&self.ws_url)
            .map_err(|e| RelayError::config(format!("invalid DELTA_WS_URL '{}': {}", self.ws_url, e)))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(RelayError::config(format!(
                "DELTA_WS_URL must use ws:// or wss://, got '{}'",
                url.scheme()
            )));
        }

        if self.require_auth && self.credentials.is_none() {
            return Err(RelayError::config(
                "Missing credentials. Need both DELTA_API_KEY and DELTA_API_SECRET \
                 (or set DELTA_REQUIRE_AUTH=false for public channels only)",
            ));
        }

        if self.reconnect_max < self.reconnect_base {
            return Err(RelayError::config(
                "DELTA_RECONNECT_MAX_MS must be >= DELTA_RECONNECT_BASE_MS",
            ));
        }

        Ok(())
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        let max_attempts = if self.auto_reconnect {
            self.max_reconnect_attempts
        } else {
            0
        };
        ReconnectPolicy::new(self.reconnect_base, self.reconnect_max, max_attempts)
    }
}
