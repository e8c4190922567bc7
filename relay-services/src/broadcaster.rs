//! Fan-out of stream events to client queues
//!
//! Every client has a bounded queue. Sends never wait: a full or closed
//! queue marks that client failed and drops it from the set, and delivery
//! to the others carries on.

use std::sync::Arc;

use dashmap::DashMap;
use relay_core::{ClientId, StreamEvent};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

/// Queue item handed to a client session
pub type SharedEvent = Arc<StreamEvent>;

#[derive(Debug, Default)]
pub struct Broadcaster {
    clients: DashMap<ClientId, mpsc::Sender<SharedEvent>>,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, client_id: ClientId, sender: mpsc::Sender<SharedEvent>) {
        self.clients.insert(client_id, sender);
    }

    /// Returns false if the client was not present
    pub fn remove(&self, client_id: ClientId) -> bool {
        self.clients.remove(&client_id).is_some()
    }

    pub fn contains(&self, client_id: ClientId) -> bool {
        self.clients.contains_key(&client_id)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn client_ids(&self) -> Vec<ClientId> {
        self.clients.iter().map(|entry| *entry.key()).collect()
    }

    /// Enqueue for one client. Returns false if the client failed.
    pub fn send_to(&self, client_id: ClientId, event: SharedEvent) -> bool {
        self.deliver(&[client_id], event).is_empty()
    }

    /// Enqueue for the given clients. Returns the clients that failed and
    /// were removed.
    pub fn deliver(&self, recipients: &[ClientId], event: SharedEvent) -> Vec<ClientId> {
        let mut failed = Vec::new();

        for client_id in recipients {
            let result = match self.clients.get(client_id) {
                Some(sender) => sender.try_send(Arc::clone(&event)),
                None => continue,
            };

            match result {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!(
                        "[Relay] Queue full for {}, dropping client ({} event)",
                        client_id,
                        event.event_name()
                    );
                    failed.push(*client_id);
                }
                Err(TrySendError::Closed(_)) => {
                    debug!("[Relay] Queue closed for {}", client_id);
                    failed.push(*client_id);
                }
            }
        }

        for client_id in &failed {
            self.clients.remove(client_id);
        }

        failed
    }

    /// Enqueue for every client. Returns the clients that failed and were
    /// removed.
    pub fn broadcast(&self, event: SharedEvent) -> Vec<ClientId> {
        let recipients = self.client_ids();
        self.deliver(&recipients, event)
    }

    /// Drop every client queue, ending their streams
    pub fn clear(&self) -> Vec<ClientId> {
        let ids = self.client_ids();
        self.clients.clear();
        ids
    }
}
