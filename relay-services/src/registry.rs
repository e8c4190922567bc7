//! Client session registry
//!
//! Admits SSE sessions (connection limit, per-identity rate limit), applies
//! control requests and routes events to the sessions that asked for them.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use relay_core::{
    group_keys, ChannelSpec, ClientId, ControlAction, ControlRequest, ControlResponse,
    RelayError, RelayResult, StreamEvent, SubscriptionKey,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::broadcaster::Broadcaster;
use crate::config::RelayConfig;
use crate::rate_limiter::RateLimiter;
use crate::session::ClientSession;
use crate::subscription::SubscriptionManager;
use crate::upstream::Upstream;

pub struct SessionRegistry {
    config: RelayConfig,
    subscriptions: SubscriptionManager,
    broadcaster: Broadcaster,
    rate_limiter: RateLimiter,
    upstream: Arc<dyn Upstream>,
    /// Next client ID to assign
    next_client_id: AtomicU64,
    active_clients: AtomicUsize,
}

impl SessionRegistry {
    pub fn new(config: RelayConfig, upstream: Arc<dyn Upstream>) -> Self {
        Self {
            rate_limiter: RateLimiter::new(
                config.rate_limit_requests,
                config.rate_limit_window,
                "relay",
            ),
            subscriptions: SubscriptionManager::new(Arc::clone(&upstream)),
            broadcaster: Broadcaster::new(),
            upstream,
            next_client_id: AtomicU64::new(1),
            active_clients: AtomicUsize::new(0),
            config,
        }
    }

    /// Admit a new session for `identity`.
    ///
    /// The stream starts with `connected` and the current upstream `status`.
    pub async fn open(self: &Arc<Self>, identity: &str) -> RelayResult<ClientSession> {
        self.rate_limiter.check(identity).await?;

        let limit = self.config.max_clients;
        self.active_clients
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < limit).then_some(n + 1)
            })
            .map_err(|_| {
                warn!("[Relay] Rejecting {}: {} clients connected", identity, limit);
                RelayError::TooManyConnections { limit }
            })?;

        let client_id = ClientId(self.next_client_id.fetch_add(1, Ordering::SeqCst));
        let (tx, rx) = mpsc::channel(self.config.client_queue);

        let status = self.upstream.status();
        for event in [
            StreamEvent::Connected { client_id },
            StreamEvent::Status {
                state: status.state,
                authenticated: status.authenticated,
            },
        ] {
            // Fresh queue with room for both
            let _ = tx.try_send(Arc::new(event));
        }

        self.subscriptions.add_client(client_id);
        self.broadcaster.add(client_id, tx);

        info!(
            "[Relay] {} connected from {} ({}/{} clients)",
            client_id,
            identity,
            self.active_clients(),
            limit
        );

        Ok(ClientSession::new(client_id, rx, Arc::downgrade(self)))
    }

    /// Apply a subscribe/unsubscribe request to a session
    pub async fn control(
        &self,
        identity: &str,
        client_id: ClientId,
        request: ControlRequest,
    ) -> RelayResult<ControlResponse> {
        self.rate_limiter.check(identity).await?;
        request.validate()?;

        if !self.broadcaster.contains(client_id) {
            return Err(RelayError::unknown_client(client_id.to_string()));
        }

        let requested: BTreeSet<SubscriptionKey> = request
            .channels
            .iter()
            .flat_map(ChannelSpec::keys)
            .collect();
        let requested = group_keys(&requested);

        let (channels, event) = match request.action {
            ControlAction::Subscribe => (
                self.subscriptions.subscribe(client_id, &request.channels)?,
                StreamEvent::Subscribed {
                    channels: requested,
                },
            ),
            ControlAction::Unsubscribe => (
                self.subscriptions.unsubscribe(client_id, &request.channels)?,
                StreamEvent::Unsubscribed {
                    channels: requested,
                },
            ),
        };

        debug!("[Relay] {} now subscribed to {:?}", client_id, channels);

        if !self.broadcaster.send_to(client_id, Arc::new(event)) {
            self.close(client_id);
        }

        Ok(ControlResponse {
            client_id,
            channels,
        })
    }

    /// Release a session and its subscriptions. Safe to call more than once.
    pub fn close(&self, client_id: ClientId) -> bool {
        self.broadcaster.remove(client_id);
        if !self.subscriptions.remove_client(client_id) {
            return false;
        }
        let remaining = self.active_clients.fetch_sub(1, Ordering::SeqCst) - 1;
        info!("[Relay] {} closed ({} clients remaining)", client_id, remaining);
        true
    }

    /// Route a market event to the sessions subscribed to it.
    ///
    /// Returns how many sessions it was queued for.
    pub fn publish_market(&self, channel: &str, symbol: Option<&str>, event: StreamEvent) -> usize {
        let recipients = self.subscriptions.recipients(channel, symbol);
        if recipients.is_empty() {
            return 0;
        }

        let failed = self.broadcaster.deliver(&recipients, Arc::new(event));
        self.drop_failed(&failed);
        recipients.len() - failed.len()
    }

    /// Send a connection-status event to every session
    pub fn publish_status(&self, event: StreamEvent) -> usize {
        let failed = self.broadcaster.broadcast(Arc::new(event));
        self.drop_failed(&failed);
        self.broadcaster.len()
    }

    fn drop_failed(&self, failed: &[ClientId]) {
        for client_id in failed {
            warn!("[Relay] Dropping {}: output queue overflowed or closed", client_id);
            self.close(*client_id);
        }
    }

    /// End every session (server shutdown)
    pub fn shutdown(&self) {
        let clients = self.broadcaster.clear();
        info!("[Relay] Closing {} sessions", clients.len());
        for client_id in clients {
            self.close(client_id);
        }
    }

    pub fn active_clients(&self) -> usize {
        self.active_clients.load(Ordering::SeqCst)
    }

    pub fn max_clients(&self) -> usize {
        self.config.max_clients
    }

    pub fn upstream_subscriptions(&self) -> usize {
        self.subscriptions.total_subscriptions()
    }

    pub fn subscriptions(&self) -> &SubscriptionManager {
        &self.subscriptions
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    pub fn upstream(&self) -> &Arc<dyn Upstream> {
        &self.upstream
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("active_clients", &self.active_clients())
            .field("max_clients", &self.config.max_clients)
            .field("subscriptions", &self.subscriptions)
            .finish()
    }
}
