//! Stream protocol between the relay and its browser clients
//!
//! Clients hold one SSE stream open and adjust their interest set through
//! a sibling control endpoint. These types define both directions.

use serde::{Deserialize, Serialize};

use crate::channel::ChannelSpec;
use crate::error::RelayError;

// ============================================================================
// Client Identity
// ============================================================================

/// Unique identifier for a client stream session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct ClientId(pub u64);

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

impl std::str::FromStr for ClientId {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.trim();
        let digits = raw.strip_prefix("client-").unwrap_or(raw);
        digits
            .parse::<u64>()
            .map(ClientId)
            .map_err(|_| RelayError::invalid_request(format!("invalid client id '{}'", s)))
    }
}

impl From<ClientId> for String {
    fn from(id: ClientId) -> Self {
        id.to_string()
    }
}

impl TryFrom<String> for ClientId {
    type Error = RelayError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

// ============================================================================
// Client -> Server (control endpoint)
// ============================================================================

/// Interest-set change requested by a client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlAction {
    Subscribe,
    Unsubscribe,
}

/// Body of a control request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlRequest {
    pub action: ControlAction,
    pub channels: Vec<ChannelSpec>,
}

impl ControlRequest {
    pub fn subscribe(channels: Vec<ChannelSpec>) -> Self {
        Self {
            action: ControlAction::Subscribe,
            channels,
        }
    }

    pub fn unsubscribe(channels: Vec<ChannelSpec>) -> Self {
        Self {
            action: ControlAction::Unsubscribe,
            channels,
        }
    }

    /// Validate every channel spec in the request
    pub fn validate(&self) -> Result<(), RelayError> {
        if self.channels.is_empty() {
            return Err(RelayError::invalid_request("no channels given"));
        }
        self.channels.iter().try_for_each(ChannelSpec::validate)
    }
}

/// Reply to a control request: the session's resulting interest set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlResponse {
    pub client_id: ClientId,
    pub channels: Vec<ChannelSpec>,
}

// ============================================================================
// Server -> Client (SSE stream)
// ============================================================================

/// Events pushed down a client's SSE stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// First event of every stream, carries the id for the control endpoint
    Connected { client_id: ClientId },
    /// Upstream connection state
    Status {
        state: ConnectionState,
        authenticated: bool,
    },
    /// A relayed upstream frame
    Market {
        channel: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        symbol: Option<String>,
        data: serde_json::Value,
    },
    /// Subscription confirmed
    Subscribed { channels: Vec<ChannelSpec> },
    /// Unsubscription confirmed
    Unsubscribed { channels: Vec<ChannelSpec> },
    /// Upstream connection went away, a reconnect may follow
    ConnectionClosed { reason: String },
    /// Upstream connection failed
    ConnectionError {
        kind: ConnectionErrorKind,
        message: String,
    },
    /// Automatic reconnection gave up
    ReconnectExhausted { attempts: u32 },
}

impl StreamEvent {
    /// SSE `event:` name for this event
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Connected { .. } => "connected",
            Self::Status { .. } => "status",
            Self::Market { .. } => "market",
            Self::Subscribed { .. } => "subscribed",
            Self::Unsubscribed { .. } => "unsubscribed",
            Self::ConnectionClosed { .. } => "connection_closed",
            Self::ConnectionError { .. } => "connection_error",
            Self::ReconnectExhausted { .. } => "reconnect_exhausted",
        }
    }

    /// Whether this event reports upstream health rather than channel data
    pub fn is_status(&self) -> bool {
        matches!(
            self,
            Self::Status { .. }
                | Self::ConnectionClosed { .. }
                | Self::ConnectionError { .. }
                | Self::ReconnectExhausted { .. }
        )
    }
}

/// Category of an upstream connection failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionErrorKind {
    /// Exchange rejected our credentials
    Auth,
    /// Socket could not be opened or broke
    Network,
    /// Exchange reported an error frame
    Upstream,
}

/// Connection state of the upstream exchange socket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// No socket, possibly waiting to reconnect
    #[default]
    Disconnected,
    /// Opening the socket
    Connecting,
    /// Socket open, waiting on the auth response
    Authenticating,
    /// Receiving data
    Open,
    /// Shutting down
    Closing,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Authenticating => "authenticating",
            Self::Open => "open",
            Self::Closing => "closing",
        }
    }

    /// Connect/authenticate in flight
    pub fn is_in_flight(&self) -> bool {
        matches!(self, Self::Connecting | Self::Authenticating)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
