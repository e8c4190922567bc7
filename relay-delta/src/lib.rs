//! Delta Exchange upstream connector
//!
//! Owns the single authenticated WebSocket connection to the exchange's
//! realtime feed: request signing, the auth handshake, reconnection with
//! backoff and channel subscribe/unsubscribe.

pub mod auth;
pub mod config;
pub mod protocol;
pub mod reconnect;
pub mod websocket;

pub use auth::{sign_request, DeltaCredentials};
pub use config::DeltaWebSocketConfig;
pub use protocol::{InboundFrame, OutboundFrame, UpstreamFrame};
pub use reconnect::ReconnectPolicy;
pub use websocket::{DeltaStatus, DeltaWebSocket, UpstreamCommand, UpstreamEvent};
