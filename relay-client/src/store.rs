//! Client-side view of the relay: market snapshot plus connection status

use std::collections::BTreeSet;

use relay_core::market::{ORDERBOOK_CHANNELS, TICKER_CHANNELS};
use relay_core::{
    group_keys, BookState, ChannelSpec, ClientId, ConnectionErrorKind, ConnectionState,
    MarketSnapshot, MarketUpdate, StreamEvent, SubscriptionKey, TickerState,
};
use serde::Serialize;
use tracing::{debug, warn};

/// Upstream health as last reported on the stream
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub authenticated: bool,
    pub last_error: Option<String>,
    pub last_error_kind: Option<ConnectionErrorKind>,
    pub reconnect_exhausted: bool,
}

impl ConnectionStatus {
    /// Data may be stale: upstream is not open or has stopped retrying
    pub fn is_degraded(&self) -> bool {
        self.state != ConnectionState::Open || self.reconnect_exhausted
    }
}

/// What an applied event changed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreChange {
    Session(ClientId),
    Status,
    Ticker(String),
    OrderBook(String),
    Subscriptions,
    /// Event carried nothing the store tracks
    Ignored,
}

#[derive(Debug, Clone, Default)]
pub struct MarketStore {
    snapshot: MarketSnapshot,
    status: ConnectionStatus,
    client_id: Option<ClientId>,
    subscriptions: BTreeSet<SubscriptionKey>,
    parse_errors: u64,
}

impl MarketStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, event: &StreamEvent) -> StoreChange {
        match event {
            StreamEvent::Connected { client_id } => {
                // A new session starts with an empty interest set; cached
                // market state is kept until it is refreshed or unsubscribed
                debug!("Relay session {}", client_id);
                self.client_id = Some(*client_id);
                self.subscriptions.clear();
                StoreChange::Session(*client_id)
            }
            StreamEvent::Status {
                state,
                authenticated,
            } => {
                self.status.state = *state;
                self.status.authenticated = *authenticated;
                if *state == ConnectionState::Open {
                    self.status.reconnect_exhausted = false;
                    self.status.last_error = None;
                    self.status.last_error_kind = None;
                }
                StoreChange::Status
            }
            StreamEvent::ConnectionClosed { reason } => {
                self.status.state = ConnectionState::Disconnected;
                self.status.authenticated = false;
                self.status.last_error = Some(reason.clone());
                StoreChange::Status
            }
            StreamEvent::ConnectionError { kind, message } => {
                self.status.last_error = Some(message.clone());
                self.status.last_error_kind = Some(*kind);
                StoreChange::Status
            }
            StreamEvent::ReconnectExhausted { attempts } => {
                warn!("Relay upstream gave up reconnecting after {} attempts", attempts);
                self.status.state = ConnectionState::Disconnected;
                self.status.reconnect_exhausted = true;
                StoreChange::Status
            }
            StreamEvent::Market { channel, data, .. } => match MarketUpdate::parse(channel, data) {
                Some(Ok(update)) => {
                    self.snapshot.apply(&update);
                    match update {
                        MarketUpdate::Ticker(t) => StoreChange::Ticker(t.symbol),
                        MarketUpdate::OrderBook(b) => StoreChange::OrderBook(b.symbol),
                    }
                }
                Some(Err(e)) => {
                    warn!("Dropping malformed {} update: {}", channel, e);
                    self.parse_errors += 1;
                    StoreChange::Ignored
                }
                None => StoreChange::Ignored,
            },
            StreamEvent::Subscribed { channels } => {
                for spec in channels {
                    self.subscriptions.extend(spec.keys());
                }
                StoreChange::Subscriptions
            }
            StreamEvent::Unsubscribed { channels } => {
                let removed: Vec<SubscriptionKey> =
                    channels.iter().flat_map(ChannelSpec::keys).collect();
                for key in &removed {
                    self.subscriptions.remove(key);
                }
                for key in removed.iter().filter(|k| !k.is_all_symbols()) {
                    self.drop_uncovered(key);
                }
                StoreChange::Subscriptions
            }
        }
    }

    /// Remove cached state for a symbol no remaining subscription covers
    fn drop_uncovered(&mut self, key: &SubscriptionKey) {
        let family: &[&str] = if TICKER_CHANNELS.contains(&key.channel.as_str()) {
            TICKER_CHANNELS
        } else if ORDERBOOK_CHANNELS.contains(&key.channel.as_str()) {
            ORDERBOOK_CHANNELS
        } else {
            return;
        };

        let covered = self.subscriptions.iter().any(|k| {
            family.contains(&k.channel.as_str()) && (k.symbol == key.symbol || k.is_all_symbols())
        });
        if covered {
            return;
        }

        if family == TICKER_CHANNELS {
            self.snapshot.remove_ticker(&key.symbol);
        } else {
            self.snapshot.remove_book(&key.symbol);
        }
    }

    pub fn snapshot(&self) -> &MarketSnapshot {
        &self.snapshot
    }

    pub fn ticker(&self, symbol: &str) -> Option<&TickerState> {
        self.snapshot.ticker(symbol)
    }

    pub fn book(&self, symbol: &str) -> Option<&BookState> {
        self.snapshot.book(symbol)
    }

    pub fn status(&self) -> &ConnectionStatus {
        &self.status
    }

    pub fn is_degraded(&self) -> bool {
        self.status.is_degraded()
    }

    /// Id to use on the control endpoint, once `connected` has arrived
    pub fn client_id(&self) -> Option<ClientId> {
        self.client_id
    }

    /// Confirmed interest set in wire form
    pub fn subscriptions(&self) -> Vec<ChannelSpec> {
        group_keys(&self.subscriptions)
    }

    pub fn parse_errors(&self) -> u64 {
        self.parse_errors
    }
}
