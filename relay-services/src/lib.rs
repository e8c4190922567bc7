//! Relay services for the Delta stream relay
//!
//! Subscription reference counting, fan-out to client queues, session
//! admission and the hub that routes upstream events to sessions.

pub mod broadcaster;
pub mod config;
pub mod rate_limiter;
pub mod registry;
pub mod relay;
pub mod session;
pub mod subscription;
pub mod upstream;

pub use broadcaster::{Broadcaster, SharedEvent};
pub use config::RelayConfig;
pub use rate_limiter::{RateLimiter, RateLimiterStats};
pub use registry::SessionRegistry;
pub use relay::{ConnectionMetrics, Relay, RelayHealth, UpstreamHealth};
pub use session::ClientSession;
pub use subscription::SubscriptionManager;
pub use upstream::Upstream;
