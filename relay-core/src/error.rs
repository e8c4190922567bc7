//! Error types for the relay

use thiserror::Error;

/// Relay-wide error type
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Too many connections: limit of {limit} reached")]
    TooManyConnections { limit: usize },

    #[error("Rate limit exceeded for {identity}")]
    RateLimited { identity: String },

    #[error("Unknown client: {0}")]
    UnknownClient(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RelayError {
    pub fn config(msg: impl Into<String>) -> Self {
        RelayError::Config(msg.into())
    }

    pub fn auth(msg: impl Into<String>) -> Self {
        RelayError::Auth(msg.into())
    }

    pub fn network(msg: impl Into<String>) -> Self {
        RelayError::Network(msg.into())
    }

    pub fn parse(msg: impl Into<String>) -> Self {
        RelayError::Parse(msg.into())
    }

    pub fn rate_limited(identity: impl Into<String>) -> Self {
        RelayError::RateLimited {
            identity: identity.into(),
        }
    }

    pub fn unknown_client(msg: impl Into<String>) -> Self {
        RelayError::UnknownClient(msg.into())
    }

    pub fn invalid_request(msg: impl Into<String>) -> Self {
        RelayError::InvalidRequest(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        RelayError::Internal(msg.into())
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(e: serde_json::Error) -> Self {
        RelayError::Parse(e.to_string())
    }
}

/// Result type alias for relay operations
pub type RelayResult<T> = Result<T, RelayError>;
