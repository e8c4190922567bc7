//! Relay hub
//!
//! Consumes upstream connector events, turns them into stream events and
//! routes them through the session registry. Also keeps the upstream health
//! metrics behind `/api/health`.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use relay_core::{ConnectionState, StreamEvent};
use relay_delta::{DeltaStatus, UpstreamEvent};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::RelayConfig;
use crate::registry::SessionRegistry;
use crate::upstream::Upstream;

/// Stale threshold - if no message for this duration, consider connection stale
const STALE_THRESHOLD_SECS: u64 = 60;

/// How often the health line is logged and idle rate-limit entries pruned
const HEALTH_LOG_INTERVAL: Duration = Duration::from_secs(60);

/// Health status for the upstream connection
#[derive(Debug, Clone, Serialize)]
pub struct UpstreamHealth {
    pub state: ConnectionState,
    pub authenticated: bool,
    pub connected: bool,
    pub last_message_time: Option<DateTime<Utc>>,
    pub message_count: u64,
    pub is_stale: bool,
    pub reconnect_attempts: u32,
    pub reconnect_exhausted: bool,
}

/// Overall relay health
#[derive(Debug, Clone, Serialize)]
pub struct RelayHealth {
    pub upstream: UpstreamHealth,
    pub active_clients: usize,
    pub max_clients: usize,
    pub upstream_subscriptions: usize,
    pub healthy: bool,
}

fn now_epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Health metrics for the upstream connection (atomic for thread-safe access)
#[derive(Debug, Default)]
pub struct ConnectionMetrics {
    connected: AtomicBool,
    last_message_epoch_ms: AtomicU64,
    message_count: AtomicU64,
    dropped_frames: AtomicU64,
}

impl ConnectionMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn record_message(&self) {
        self.last_message_epoch_ms
            .store(now_epoch_ms(), Ordering::SeqCst);
        self.message_count.fetch_add(1, Ordering::SeqCst);
    }

    /// A frame nobody was subscribed to
    pub fn record_unrouted(&self) {
        self.dropped_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_count(&self) -> u64 {
        self.message_count.load(Ordering::SeqCst)
    }

    pub fn unrouted_count(&self) -> u64 {
        self.dropped_frames.load(Ordering::Relaxed)
    }

    pub fn get_health(&self, status: &DeltaStatus) -> UpstreamHealth {
        let connected = self.connected.load(Ordering::SeqCst);
        let last_ms = self.last_message_epoch_ms.load(Ordering::SeqCst);
        let message_count = self.message_count.load(Ordering::SeqCst);

        let last_message_time = if last_ms > 0 {
            DateTime::from_timestamp(
                (last_ms / 1000) as i64,
                ((last_ms % 1000) * 1_000_000) as u32,
            )
        } else {
            None
        };

        let is_stale = if connected && last_ms > 0 {
            now_epoch_ms().saturating_sub(last_ms) > STALE_THRESHOLD_SECS * 1000
        } else {
            !connected
        };

        UpstreamHealth {
            state: status.state,
            authenticated: status.authenticated,
            connected,
            last_message_time,
            message_count,
            is_stale,
            reconnect_attempts: status.reconnect_attempts,
            reconnect_exhausted: status.exhausted,
        }
    }
}

/// Routes upstream events to client sessions
#[derive(Debug, Clone)]
pub struct Relay {
    registry: Arc<SessionRegistry>,
    metrics: Arc<ConnectionMetrics>,
}

impl Relay {
    pub fn new(config: RelayConfig, upstream: Arc<dyn Upstream>) -> Self {
        Self {
            registry: Arc::new(SessionRegistry::new(config, upstream)),
            metrics: Arc::new(ConnectionMetrics::new()),
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn metrics(&self) -> &Arc<ConnectionMetrics> {
        &self.metrics
    }

    /// Spawn the event loop and the periodic health task.
    ///
    /// The returned handle finishes when the connector's event channel closes.
    pub fn start(&self, mut events: mpsc::Receiver<UpstreamEvent>) -> JoinHandle<()> {
        info!("[Relay] Starting relay hub");

        let health_relay = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(HEALTH_LOG_INTERVAL);
            loop {
                interval.tick().await;
                health_relay.log_health().await;
            }
        });

        let relay = self.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                relay.handle_event(event);
            }
            info!("[Relay] Upstream event channel closed, ending sessions");
            relay.registry.shutdown();
        })
    }

    /// Route one upstream event
    pub fn handle_event(&self, event: UpstreamEvent) {
        match event {
            UpstreamEvent::Frame(frame) => {
                self.metrics.record_message();
                let channel = frame.channel.clone();
                let symbol = frame.symbol.clone();
                let delivered = self.registry.publish_market(
                    &channel,
                    symbol.as_deref(),
                    StreamEvent::Market {
                        channel: frame.channel,
                        symbol: frame.symbol,
                        data: frame.payload,
                    },
                );
                if delivered == 0 {
                    self.metrics.record_unrouted();
                    debug!(
                        "[Relay] No subscribers for {} {}",
                        channel,
                        symbol.as_deref().unwrap_or("-")
                    );
                }
            }
            UpstreamEvent::State {
                state,
                authenticated,
            } => {
                self.metrics.set_connected(state == ConnectionState::Open);
                debug!("[Relay] Upstream state: {} (authenticated: {})", state, authenticated);
                self.registry.publish_status(StreamEvent::Status {
                    state,
                    authenticated,
                });
            }
            UpstreamEvent::Closed { reason } => {
                self.metrics.set_connected(false);
                warn!("[Relay] Upstream closed: {}", reason);
                self.registry
                    .publish_status(StreamEvent::ConnectionClosed { reason });
            }
            UpstreamEvent::Error { kind, message } => {
                warn!("[Relay] Upstream error ({:?}): {}", kind, message);
                self.registry
                    .publish_status(StreamEvent::ConnectionError { kind, message });
            }
            UpstreamEvent::ReconnectExhausted { attempts } => {
                self.metrics.set_connected(false);
                warn!("[Relay] Upstream gave up after {} reconnect attempts", attempts);
                self.registry
                    .publish_status(StreamEvent::ReconnectExhausted { attempts });
            }
        }
    }

    pub fn upstream_status(&self) -> DeltaStatus {
        self.registry.upstream().status()
    }

    /// Get health status for the relay
    pub fn health(&self) -> RelayHealth {
        let upstream = self.metrics.get_health(&self.upstream_status());
        let healthy = upstream.state == ConnectionState::Open && !upstream.is_stale;

        RelayHealth {
            upstream,
            active_clients: self.registry.active_clients(),
            max_clients: self.registry.max_clients(),
            upstream_subscriptions: self.registry.upstream_subscriptions(),
            healthy,
        }
    }

    async fn log_health(&self) {
        let health = self.health();
        let upstream = if health.upstream.connected {
            format!(
                "{} ({}s ago)",
                health.upstream.state,
                health
                    .upstream
                    .last_message_time
                    .map(|t| (Utc::now() - t).num_seconds())
                    .unwrap_or(0)
            )
        } else {
            health.upstream.state.to_string()
        };

        let pruned = self.registry.rate_limiter().prune().await;
        info!(
            "[Relay] Health: upstream={}, clients={}/{}, subscriptions={}, pruned_rate_limits={}",
            upstream,
            health.active_clients,
            health.max_clients,
            health.upstream_subscriptions,
            pruned
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::testing::RecordingUpstream;
    use futures_util::StreamExt;
    use relay_core::{ChannelSpec, ConnectionErrorKind, ControlRequest};
    use relay_delta::UpstreamFrame;
    use serde_json::json;

    fn relay() -> (Arc<RecordingUpstream>, Relay) {
        let upstream = Arc::new(RecordingUpstream::default());
        (upstream.clone(), Relay::new(RelayConfig::default(), upstream))
    }

    async fn next(session: &mut crate::ClientSession) -> StreamEvent {
        let event = tokio::time::timeout(Duration::from_secs(1), session.next())
            .await
            .expect("timed out")
            .expect("stream ended");
        (*event).clone()
    }

    fn ticker_frame(symbol: &str) -> UpstreamFrame {
        UpstreamFrame {
            channel: "v2/ticker".to_string(),
            symbol: Some(symbol.to_string()),
            payload: json!({"type": "v2/ticker", "symbol": symbol, "mark_price": "100.5"}),
        }
    }

    #[tokio::test]
    async fn test_frames_become_market_events() {
        let (_upstream, relay) = relay();
        let mut session = relay.registry().open("ip").await.unwrap();
        next(&mut session).await;
        next(&mut session).await;
        relay
            .registry()
            .control(
                "ip",
                session.id(),
                ControlRequest::subscribe(vec![ChannelSpec::new("v2/ticker", ["BTCUSD"])]),
            )
            .await
            .unwrap();
        next(&mut session).await;

        relay.handle_event(UpstreamEvent::Frame(ticker_frame("ETHUSD")));
        relay.handle_event(UpstreamEvent::Frame(ticker_frame("BTCUSD")));

        match next(&mut session).await {
            StreamEvent::Market {
                channel,
                symbol,
                data,
            } => {
                assert_eq!(channel, "v2/ticker");
                assert_eq!(symbol.as_deref(), Some("BTCUSD"));
                assert_eq!(data["mark_price"], "100.5");
            }
            other => panic!("unexpected event: {:?}", other),
        }

        assert_eq!(relay.metrics().message_count(), 2);
        assert_eq!(relay.metrics().unrouted_count(), 1);
    }

    #[tokio::test]
    async fn test_disruptions_reach_every_session() {
        let (_upstream, relay) = relay();
        let mut a = relay.registry().open("a").await.unwrap();
        let mut b = relay.registry().open("b").await.unwrap();
        for session in [&mut a, &mut b] {
            next(session).await;
            next(session).await;
        }

        relay.handle_event(UpstreamEvent::Error {
            kind: ConnectionErrorKind::Auth,
            message: "invalid api key".to_string(),
        });
        relay.handle_event(UpstreamEvent::ReconnectExhausted { attempts: 10 });

        for session in [&mut a, &mut b] {
            assert_eq!(
                next(session).await,
                StreamEvent::ConnectionError {
                    kind: ConnectionErrorKind::Auth,
                    message: "invalid api key".to_string()
                }
            );
            assert_eq!(
                next(session).await,
                StreamEvent::ReconnectExhausted { attempts: 10 }
            );
        }
    }

    #[tokio::test]
    async fn test_health_follows_upstream_state() {
        let (upstream, relay) = relay();
        assert!(!relay.health().healthy);

        upstream.status.lock().state = ConnectionState::Open;
        relay.handle_event(UpstreamEvent::State {
            state: ConnectionState::Open,
            authenticated: true,
        });
        relay.handle_event(UpstreamEvent::Frame(ticker_frame("BTCUSD")));

        let health = relay.health();
        assert!(health.healthy);
        assert!(health.upstream.connected);
        assert!(health.upstream.last_message_time.is_some());
        assert_eq!(health.max_clients, 100);

        upstream.status.lock().state = ConnectionState::Disconnected;
        relay.handle_event(UpstreamEvent::Closed {
            reason: "stream ended".to_string(),
        });
        let health = relay.health();
        assert!(!health.healthy);
        assert!(health.upstream.is_stale);
    }

    #[tokio::test]
    async fn test_closed_event_channel_ends_sessions() {
        let (_upstream, relay) = relay();
        let mut session = relay.registry().open("ip").await.unwrap();
        let (tx, rx) = mpsc::channel(8);
        let handle = relay.start(rx);

        tx.send(UpstreamEvent::Closed {
            reason: "going away".to_string(),
        })
        .await
        .unwrap();
        drop(tx);
        handle.await.unwrap();

        next(&mut session).await;
        next(&mut session).await;
        assert_eq!(
            next(&mut session).await,
            StreamEvent::ConnectionClosed {
                reason: "going away".to_string()
            }
        );
        assert!(session.next().await.is_none());
    }
}
