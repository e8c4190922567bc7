//! Core types for the Delta stream relay
//!
//! This crate defines the shared data structures used across the relay,
//! including channel subscriptions, the client stream protocol, parsed
//! market updates and the client-side market snapshot.

pub mod channel;
pub mod error;
pub mod market;
pub mod serde_util;
pub mod snapshot;
pub mod stream;

pub use channel::{group_keys, normalize_symbol, ChannelSpec, SubscriptionKey};
pub use error::{RelayError, RelayResult};
pub use market::{MarketUpdate, OrderBookLevel, OrderBookUpdate, TickerUpdate};
pub use snapshot::{BookState, MarketSnapshot, TickerState};
pub use stream::{
    ClientId, ConnectionErrorKind, ConnectionState, ControlAction, ControlRequest,
    ControlResponse, StreamEvent,
};
