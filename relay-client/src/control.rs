//! Control endpoint client

use relay_core::{
    ChannelSpec, ClientId, ConnectionState, ControlRequest, ControlResponse, RelayError,
    RelayResult,
};
use reqwest::header::HeaderMap;
use reqwest::Client;
use serde::Serialize;
use tracing::debug;

use crate::http::{error_from_response, normalize_base_url, REQUEST_TIMEOUT};

/// Header naming the session on control requests
pub const CLIENT_ID_HEADER: &str = "x-client-id";

/// Relay status as reported by `HEAD /api/stream`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RelayStatus {
    pub upstream_state: ConnectionState,
    pub upstream_authenticated: bool,
    pub active_clients: usize,
    pub max_clients: usize,
    pub upstream_subscriptions: usize,
}

impl RelayStatus {
    fn from_headers(headers: &HeaderMap) -> RelayResult<Self> {
        let upstream_state = header(headers, "x-upstream-status")?;
        let upstream_state: ConnectionState =
            serde_json::from_value(serde_json::Value::String(upstream_state))?;

        Ok(Self {
            upstream_state,
            upstream_authenticated: parse_header(headers, "x-upstream-authenticated")?,
            active_clients: parse_header(headers, "x-active-clients")?,
            max_clients: parse_header(headers, "x-max-clients")?,
            upstream_subscriptions: parse_header(headers, "x-upstream-subscriptions")?,
        })
    }
}

fn header(headers: &HeaderMap, name: &str) -> RelayResult<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .ok_or_else(|| RelayError::parse(format!("missing {} header", name)))
}

fn parse_header<T: std::str::FromStr>(headers: &HeaderMap, name: &str) -> RelayResult<T> {
    header(headers, name)?
        .parse()
        .map_err(|_| RelayError::parse(format!("invalid {} header", name)))
}

/// Sends interest-set changes for an open session
#[derive(Debug, Clone)]
pub struct ControlClient {
    client: Client,
    base_url: String,
}

impl ControlClient {
    pub fn new(base_url: &str) -> RelayResult<Self> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
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

    fn stream_url(&self) -> String {
        format!("{}/api/stream", self.base_url)
    }

    pub async fn subscribe(
        &self,
        client_id: ClientId,
        channels: Vec<ChannelSpec>,
    ) -> RelayResult<ControlResponse> {
        self.send(client_id, ControlRequest::subscribe(channels)).await
    }

    pub async fn unsubscribe(
        &self,
        client_id: ClientId,
        channels: Vec<ChannelSpec>,
    ) -> RelayResult<ControlResponse> {
        self.send(client_id, ControlRequest::unsubscribe(channels)).await
    }

    /// Send a control request, returning the session's resulting interest set
    pub async fn send(
        &self,
        client_id: ClientId,
        request: ControlRequest,
    ) -> RelayResult<ControlResponse> {
        // Fail fast on requests the relay would reject
        request.validate()?;

        debug!("Control {:?} for {}", request.action, client_id);

        let response = self
            .client
            .post(self.stream_url())
            .header(CLIENT_ID_HEADER, client_id.to_string())
            .json(&request)
            .send()
            .await
            .map_err(|e| RelayError::network(format!("Failed to send control request: {}", e)))?;

        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }

        response
            .json()
            .await
            .map_err(|e| RelayError::parse(format!("Failed to parse control response: {}", e)))
    }

    /// Relay and upstream status without opening a stream
    pub async fn status(&self) -> RelayResult<RelayStatus> {
        let response = self
            .client
            .head(self.stream_url())
            .send()
            .await
            .map_err(|e| RelayError::network(format!("Failed to fetch status: {}", e)))?;

        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }

        RelayStatus::from_headers(response.headers())
    }
}
