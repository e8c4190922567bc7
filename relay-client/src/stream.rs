//! SSE stream consumer

use std::collections::VecDeque;
use std::pin::Pin;

use futures_util::{stream, Stream, StreamExt};
use relay_core::{RelayError, RelayResult, StreamEvent};
use reqwest::header::ACCEPT;
use reqwest::Client;
use tracing::{debug, warn};

use crate::http::{error_from_response, normalize_base_url, CONNECT_TIMEOUT};
use crate::sse::{SseFrame, SseParser};

/// Events decoded from one open relay stream
pub type EventStream = Pin<Box<dyn Stream<Item = RelayResult<StreamEvent>> + Send>>;

/// Opens `GET /api/stream` and decodes its frames
#[derive(Debug, Clone)]
pub struct StreamClient {
    client: Client,
    base_url: String,
}

impl StreamClient {
    pub fn new(base_url: &str) -> RelayResult<Self> {
        // No overall timeout, the response body never completes
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| RelayError::network(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self::with_client(client, base_url))
    }

    pub fn with_client(client: Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: normalize_base_url(base_url),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Open the stream. The first event is always `connected`.
    ///
    /// The returned stream ends when the relay closes the response.
    pub async fn connect(&self) -> RelayResult<EventStream> {
        let url = format!("{}/api/stream", self.base_url);
        debug!("Opening relay stream: {}", url);

        let response = self
            .client
            .get(&url)
            .header(ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(|e| RelayError::network(format!("Failed to open stream: {}", e)))?;

        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }

        Ok(decode_events(response.bytes_stream()))
    }
}

/// Decode a raw SSE byte stream into relay events
pub(crate) fn decode_events<S, B, E>(bytes: S) -> EventStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let state = (Box::pin(bytes), SseParser::new(), VecDeque::<SseFrame>::new());

    let events = stream::unfold(state, |(mut bytes, mut parser, mut pending)| async move {
        loop {
            if let Some(frame) = pending.pop_front() {
                let event = frame.to_stream_event().inspect_err(|e| {
                    warn!("Undecodable relay frame {:?}: {}", frame.event, e);
                });
                return Some((event, (bytes, parser, pending)));
            }

            match bytes.next().await {
                Some(Ok(chunk)) => pending.extend(parser.feed(chunk.as_ref())),
                Some(Err(e)) => {
                    let err = RelayError::network(format!("Stream read failed: {}", e));
                    return Some((Err(err), (bytes, parser, pending)));
                }
                None => {
                    debug!("Relay stream ended");
                    return None;
                }
            }
        }
    });

    Box::pin(events)
}
