//! Delta realtime feed wire protocol
//!
//! Outbound frames are `{type, payload}` objects. Inbound frames are
//! classified by their `type` field: auth results, heartbeats and
//! subscription acks are handled by the connector, everything else is
//! channel data relayed to clients.

use serde::Serialize;
use serde_json::Value;

use relay_core::{normalize_symbol, ChannelSpec, RelayResult};

// ============================================================================
// Outbound
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuthPayload {
    pub api_key: String,
    pub signature: String,
    pub timestamp: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelsPayload {
    pub channels: Vec<ChannelSpec>,
}

/// Frame sent to the exchange
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum OutboundFrame {
    Auth(AuthPayload),
    Subscribe(ChannelsPayload),
    Unsubscribe(ChannelsPayload),
    EnableHeartbeat,
}

impl OutboundFrame {
    pub fn auth(api_key: &str, signature: String, timestamp: String) -> Self {
        Self::Auth(AuthPayload {
            api_key: api_key.to_string(),
            signature,
            timestamp,
        })
    }

    pub fn subscribe(channels: Vec<ChannelSpec>) -> Self {
        Self::Subscribe(ChannelsPayload { channels })
    }

    pub fn unsubscribe(channels: Vec<ChannelSpec>) -> Self {
        Self::Unsubscribe(ChannelsPayload { channels })
    }

    pub fn to_json(&self) -> RelayResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

// ============================================================================
// Inbound
// ============================================================================

/// A data frame to relay, tagged with its routing fields
#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamFrame {
    /// Channel name (the frame's `type`)
    pub channel: String,
    /// Normalized symbol, if the frame carries one
    pub symbol: Option<String>,
    /// The frame exactly as received
    pub payload: Value,
}

/// Classified inbound frame
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    AuthResult {
        success: bool,
        message: Option<String>,
    },
    Heartbeat,
    SubscriptionsAck {
        channels: Value,
    },
    Error {
        message: String,
    },
    Data(UpstreamFrame),
    /// JSON without a `type` tag
    Unknown(Value),
}

fn message_of(value: &Value) -> Option<String> {
    ["message", "error", "reason"]
        .iter()
        .find_map(|field| match value.get(*field) {
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Null) | None => None,
            Some(other) => Some(other.to_string()),
        })
}

impl InboundFrame {
    /// Parse and classify a text frame
    pub fn parse(text: &str) -> RelayResult<Self> {
        let value: Value = serde_json::from_str(text)?;
        Ok(Self::classify(value))
    }

    pub fn classify(value: Value) -> Self {
        let Some(frame_type) = value.get("type").and_then(Value::as_str) else {
            return Self::Unknown(value);
        };

        match frame_type {
            "auth" | "key-auth" => Self::AuthResult {
                success: value
                    .get("success")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
                message: message_of(&value),
            },
            "success" => {
                let message = message_of(&value);
                let authenticated = message
                    .as_deref()
                    .is_some_and(|m| m.to_ascii_lowercase().contains("authenticated"));
                if authenticated {
                    Self::AuthResult {
                        success: true,
                        message,
                    }
                } else {
                    Self::SubscriptionsAck {
                        channels: value.get("channels").cloned().unwrap_or(Value::Null),
                    }
                }
            }
            "heartbeat" => Self::Heartbeat,
            "subscriptions" => Self::SubscriptionsAck {
                channels: value.get("channels").cloned().unwrap_or(Value::Null),
            },
            "error" => Self::Error {
                message: message_of(&value).unwrap_or_else(|| value.to_string()),
            },
            channel => {
                let channel = channel.to_string();
                let symbol = value
                    .get("symbol")
                    .and_then(Value::as_str)
                    .map(normalize_symbol);
                Self::Data(UpstreamFrame {
                    channel,
                    symbol,
                    payload: value,
                })
            }
        }
    }
}
