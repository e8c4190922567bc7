//! Subscription manager for relay clients
//!
//! Reference-counts every `(channel, symbol)` key across client sessions and
//! keeps the upstream subscription set equal to the union of what the
//! clients asked for. Upstream changes are sent while the state lock is
//! held, so the connector sees them in the same order they were decided.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use relay_core::{group_keys, ChannelSpec, ClientId, RelayError, RelayResult, SubscriptionKey};
use tracing::{debug, info, warn};

use crate::upstream::Upstream;

#[derive(Debug, Default)]
struct SubscriptionState {
    /// Map of subscription key -> subscribed clients (its size is the ref count)
    subscriptions: HashMap<SubscriptionKey, HashSet<ClientId>>,
    /// Map of client ID -> subscription keys
    client_subscriptions: HashMap<ClientId, BTreeSet<SubscriptionKey>>,
}

impl SubscriptionState {
    /// Drop one reference to `key`. Returns true when nobody needs it anymore.
    fn release(&mut self, key: &SubscriptionKey, client_id: ClientId) -> bool {
        let Some(clients) = self.subscriptions.get_mut(key) else {
            return false;
        };
        clients.remove(&client_id);
        if clients.is_empty() {
            self.subscriptions.remove(key);
            true
        } else {
            false
        }
    }
}

/// Manages client subscriptions and the upstream set derived from them
pub struct SubscriptionManager {
    state: Mutex<SubscriptionState>,
    upstream: Arc<dyn Upstream>,
}

impl SubscriptionManager {
    pub fn new(upstream: Arc<dyn Upstream>) -> Self {
        Self {
            state: Mutex::new(SubscriptionState::default()),
            upstream,
        }
    }

    /// Register a client with an empty interest set
    pub fn add_client(&self, client_id: ClientId) {
        self.state
            .lock()
            .client_subscriptions
            .entry(client_id)
            .or_default();
    }

    /// Add channels to a client's interest set.
    ///
    /// Keys nobody was subscribed to yet are subscribed upstream. Nothing is
    /// recorded unless that upstream call succeeds. Returns the client's
    /// resulting interest set.
    pub fn subscribe(
        &self,
        client_id: ClientId,
        channels: &[ChannelSpec],
    ) -> RelayResult<Vec<ChannelSpec>> {
        let mut state = self.state.lock();

        let client_keys = state
            .client_subscriptions
            .get(&client_id)
            .ok_or_else(|| RelayError::unknown_client(client_id.to_string()))?;

        let new_keys: BTreeSet<SubscriptionKey> = channels
            .iter()
            .flat_map(ChannelSpec::keys)
            .filter(|key| !client_keys.contains(key))
            .collect();

        // 0 -> 1 transitions
        let added: Vec<&SubscriptionKey> = new_keys
            .iter()
            .filter(|key| !state.subscriptions.contains_key(*key))
            .collect();

        if !added.is_empty() {
            let channels = group_keys(added.iter().copied());
            info!("[Relay] Upstream subscribe: {:?}", channels);
            self.upstream.subscribe(channels)?;
        }

        let SubscriptionState {
            subscriptions,
            client_subscriptions,
        } = &mut *state;
        let client_keys = client_subscriptions.entry(client_id).or_default();
        for key in new_keys {
            debug!("Client {} subscribed to {}", client_id, key);
            subscriptions.entry(key.clone()).or_default().insert(client_id);
            client_keys.insert(key);
        }

        Ok(group_keys(client_keys.iter()))
    }

    /// Remove channels from a client's interest set.
    ///
    /// Keys whose last subscriber left are unsubscribed upstream. Nothing is
    /// released unless that upstream call succeeds. Returns the client's
    /// resulting interest set.
    pub fn unsubscribe(
        &self,
        client_id: ClientId,
        channels: &[ChannelSpec],
    ) -> RelayResult<Vec<ChannelSpec>> {
        let mut state = self.state.lock();

        let client_keys = state
            .client_subscriptions
            .get(&client_id)
            .ok_or_else(|| RelayError::unknown_client(client_id.to_string()))?;

        let dropped: BTreeSet<SubscriptionKey> = channels
            .iter()
            .flat_map(ChannelSpec::keys)
            .filter(|key| client_keys.contains(key))
            .collect();

        // 1 -> 0 transitions: this client is the only subscriber left
        let removed: Vec<&SubscriptionKey> = dropped
            .iter()
            .filter(|key| {
                state
                    .subscriptions
                    .get(*key)
                    .is_some_and(|clients| clients.len() == 1)
            })
            .collect();

        if !removed.is_empty() {
            let channels = group_keys(removed.iter().copied());
            info!("[Relay] Upstream unsubscribe: {:?}", channels);
            self.upstream.unsubscribe(channels)?;
        }

        for key in &dropped {
            debug!("Client {} unsubscribed from {}", client_id, key);
            state.release(key, client_id);
        }

        let client_keys = state.client_subscriptions.entry(client_id).or_default();
        for key in &dropped {
            client_keys.remove(key);
        }

        Ok(group_keys(client_keys.iter()))
    }

    /// Remove all subscriptions for a client (on disconnect).
    ///
    /// Returns false if the client was not registered.
    pub fn remove_client(&self, client_id: ClientId) -> bool {
        let mut state = self.state.lock();

        let Some(keys) = state.client_subscriptions.remove(&client_id) else {
            return false;
        };

        let removed: Vec<SubscriptionKey> = keys
            .into_iter()
            .filter(|key| state.release(key, client_id))
            .collect();

        if !removed.is_empty() {
            let channels = group_keys(&removed);
            info!("[Relay] Upstream unsubscribe after {} left: {:?}", client_id, channels);
            if let Err(e) = self.upstream.unsubscribe(channels) {
                warn!("[Relay] Failed to release upstream channels: {}", e);
            }
        }

        info!("Client {} disconnected, removed all subscriptions", client_id);
        true
    }

    /// Clients that should receive a frame for `channel`/`symbol`.
    ///
    /// A symbol matches its own key and the channel's all-symbols key. A frame
    /// without a symbol goes to every subscriber of the channel.
    pub fn recipients(&self, channel: &str, symbol: Option<&str>) -> Vec<ClientId> {
        let state = self.state.lock();

        let recipients: HashSet<ClientId> = match symbol {
            Some(symbol) => [
                SubscriptionKey::new(channel, symbol),
                SubscriptionKey::all_symbols(channel),
            ]
            .iter()
            .filter_map(|key| state.subscriptions.get(key))
            .flatten()
            .copied()
            .collect(),
            None => state
                .subscriptions
                .iter()
                .filter(|(key, _)| key.channel == channel.trim())
                .flat_map(|(_, clients)| clients.iter().copied())
                .collect(),
        };

        recipients.into_iter().collect()
    }

    /// A client's current interest set, or `None` if unknown
    pub fn client_channels(&self, client_id: ClientId) -> Option<Vec<ChannelSpec>> {
        self.state
            .lock()
            .client_subscriptions
            .get(&client_id)
            .map(|keys| group_keys(keys.iter()))
    }

    pub fn is_subscribed(&self, client_id: ClientId, key: &SubscriptionKey) -> bool {
        self.state
            .lock()
            .client_subscriptions
            .get(&client_id)
            .map(|keys| keys.contains(key))
            .unwrap_or(false)
    }

    /// Get the number of subscribers for a subscription
    pub fn subscriber_count(&self, key: &SubscriptionKey) -> usize {
        self.state
            .lock()
            .subscriptions
            .get(key)
            .map(|clients| clients.len())
            .unwrap_or(0)
    }

    /// The keys that should be subscribed upstream right now
    pub fn upstream_keys(&self) -> BTreeSet<SubscriptionKey> {
        self.state.lock().subscriptions.keys().cloned().collect()
    }

    pub fn upstream_channels(&self) -> Vec<ChannelSpec> {
        group_keys(self.upstream_keys().iter())
    }

    /// Get total number of active subscription keys
    pub fn total_subscriptions(&self) -> usize {
        self.state.lock().subscriptions.len()
    }

    /// Get total number of registered clients
    pub fn total_clients(&self) -> usize {
        self.state.lock().client_subscriptions.len()
    }
}

impl std::fmt::Debug for SubscriptionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionManager")
            .field("total_subscriptions", &self.total_subscriptions())
            .field("total_clients", &self.total_clients())
            .finish()
    }
}
