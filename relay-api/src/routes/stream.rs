//! Relay stream endpoints
//!
//! - `GET /stream`: SSE event stream for one client session
//! - `POST /stream`: subscribe/unsubscribe for the session named by `x-client-id`
//! - `HEAD /stream`: upstream and relay status as headers

use std::convert::Infallible;
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, HeaderValue},
    response::{
        sse::{Event, KeepAlive, Sse},
        Json,
    },
    routing::get,
    Router,
};
use futures_util::{Stream, StreamExt};
use relay_core::{ClientId, ControlRequest, ControlResponse, RelayError, StreamEvent};
use tracing::{debug, warn};

use super::identity::ClientIdentity;
use crate::error::ApiError;
use crate::AppState;

pub const CLIENT_ID_HEADER: &str = "x-client-id";

const UPSTREAM_STATUS_HEADER: &str = "x-upstream-status";
const UPSTREAM_AUTHENTICATED_HEADER: &str = "x-upstream-authenticated";
const ACTIVE_CLIENTS_HEADER: &str = "x-active-clients";
const MAX_CLIENTS_HEADER: &str = "x-max-clients";
const UPSTREAM_SUBSCRIPTIONS_HEADER: &str = "x-upstream-subscriptions";

/// Headers set by `HEAD /stream`
pub const STATUS_HEADERS: [&str; 5] = [
    UPSTREAM_STATUS_HEADER,
    UPSTREAM_AUTHENTICATED_HEADER,
    ACTIVE_CLIENTS_HEADER,
    MAX_CLIENTS_HEADER,
    UPSTREAM_SUBSCRIPTIONS_HEADER,
];

const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// Create stream routes
pub fn routes() -> Router<AppState> {
    Router::new().route(
        "/stream",
        get(open_stream).post(control).head(stream_status),
    )
}

fn to_sse(event: &StreamEvent) -> Event {
    match Event::default().event(event.event_name()).json_data(event) {
        Ok(sse) => sse,
        Err(e) => {
            warn!("Failed to encode {} event: {}", event.event_name(), e);
            Event::default().event("error").data(e.to_string())
        }
    }
}

/// Open an SSE session
async fn open_stream(
    State(state): State<AppState>,
    identity: ClientIdentity,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let session = state.relay.registry().open(identity.as_str()).await?;
    debug!("Opened SSE stream for {}", session.id());

    let events = session.map(|event| Ok(to_sse(&event)));

    Ok(Sse::new(events).keep_alive(
        KeepAlive::new()
            .interval(KEEP_ALIVE_INTERVAL)
            .text("keep-alive"),
    ))
}

/// Subscribe or unsubscribe a session
async fn control(
    State(state): State<AppState>,
    identity: ClientIdentity,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<ControlResponse>, ApiError> {
    let client_id: ClientId = headers
        .get(CLIENT_ID_HEADER)
        .ok_or_else(|| RelayError::invalid_request(format!("missing {} header", CLIENT_ID_HEADER)))?
        .to_str()
        .map_err(|_| RelayError::invalid_request(format!("invalid {} header", CLIENT_ID_HEADER)))?
        .parse()?;

    let request: ControlRequest = serde_json::from_slice(&body).map_err(RelayError::from)?;

    let response = state
        .relay
        .registry()
        .control(identity.as_str(), client_id, request)
        .await?;

    Ok(Json(response))
}

/// Relay status as headers only
async fn stream_status(State(state): State<AppState>) -> HeaderMap {
    let registry = state.relay.registry();
    let status = state.relay.upstream_status();

    let mut headers = HeaderMap::new();
    headers.insert(
        UPSTREAM_STATUS_HEADER,
        HeaderValue::from_static(status.state.as_str()),
    );
    headers.insert(
        UPSTREAM_AUTHENTICATED_HEADER,
        HeaderValue::from_static(if status.authenticated { "true" } else { "false" }),
    );
    headers.insert(ACTIVE_CLIENTS_HEADER, HeaderValue::from(registry.active_clients()));
    headers.insert(MAX_CLIENTS_HEADER, HeaderValue::from(registry.max_clients()));
    headers.insert(
        UPSTREAM_SUBSCRIPTIONS_HEADER,
        HeaderValue::from(registry.upstream_subscriptions()),
    );
    headers
}
