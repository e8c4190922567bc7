//! Seam between the relay and the exchange connector

use relay_core::{ChannelSpec, RelayResult};
use relay_delta::{DeltaStatus, DeltaWebSocket};

/// What the relay needs from the upstream connection
pub trait Upstream: Send + Sync {
    /// Start receiving these channels
    fn subscribe(&self, channels: Vec<ChannelSpec>) -> RelayResult<()>;

    /// Stop receiving these channels
    fn unsubscribe(&self, channels: Vec<ChannelSpec>) -> RelayResult<()>;

    fn status(&self) -> DeltaStatus;
}

impl Upstream for DeltaWebSocket {
    fn subscribe(&self, channels: Vec<ChannelSpec>) -> RelayResult<()> {
        DeltaWebSocket::subscribe(self, channels)
    }

    fn unsubscribe(&self, channels: Vec<ChannelSpec>) -> RelayResult<()> {
        DeltaWebSocket::unsubscribe(self, channels)
    }

    fn status(&self) -> DeltaStatus {
        DeltaWebSocket::status(self)
    }
}
