//! Client library for the Delta stream relay
//!
//! `StreamClient` opens the SSE stream, `ControlClient` changes the
//! session's interest set, and `MarketStore` folds stream events into a
//! market snapshot plus upstream status.

pub mod control;
mod http;
pub mod sse;
pub mod store;
pub mod stream;

pub use control::{ControlClient, RelayStatus, CLIENT_ID_HEADER};
pub use http::{CONNECT_TIMEOUT, REQUEST_TIMEOUT};
pub use sse::{SseFrame, SseParser};
pub use store::{ConnectionStatus, MarketStore, StoreChange};
pub use stream::{EventStream, StreamClient};
