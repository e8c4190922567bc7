//! A client's event stream
//!
//! Dropping the stream (client disconnect, request cancelled) releases the
//! session and its subscriptions.

use std::pin::Pin;
use std::sync::Weak;
use std::task::{Context, Poll};

use pin_project::pin_project;
use relay_core::ClientId;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::Stream;

use crate::broadcaster::SharedEvent;
use crate::registry::SessionRegistry;

/// Stream of events for one client session
#[pin_project]
pub struct ClientSession {
    id: ClientId,
    #[pin]
    events: ReceiverStream<SharedEvent>,
    guard: SessionGuard,
}

impl ClientSession {
    pub(crate) fn new(
        id: ClientId,
        receiver: mpsc::Receiver<SharedEvent>,
        registry: Weak<SessionRegistry>,
    ) -> Self {
        Self {
            id,
            events: ReceiverStream::new(receiver),
            guard: SessionGuard { id, registry },
        }
    }

    pub fn id(&self) -> ClientId {
        self.id
    }
}

impl Stream for ClientSession {
    type Item = SharedEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.project().events.poll_next(cx)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.events.size_hint()
    }
}

impl std::fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSession").field("id", &self.id).finish()
    }
}

/// Releases the session when the stream goes away
struct SessionGuard {
    id: ClientId,
    registry: Weak<SessionRegistry>,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.close(self.id);
        }
    }
}
