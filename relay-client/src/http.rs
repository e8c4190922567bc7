//! Shared HTTP plumbing for the relay clients

use std::time::Duration;

use relay_core::RelayError;
use reqwest::{Response, StatusCode};
use serde::Deserialize;

/// Default timeout for request/response calls
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Connect timeout for the long-lived SSE request
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
}

pub(crate) fn normalize_base_url(base_url: &str) -> String {
    base_url.trim_end_matches('/').to_string()
}

/// Translate a non-success relay response into a `RelayError`
pub(crate) async fn error_from_response(response: Response) -> RelayError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorBody>(&body)
        .map(|b| b.error)
        .unwrap_or(body);

    error_from_status(status, message)
}

pub(crate) fn error_from_status(status: StatusCode, message: String) -> RelayError {
    match status {
        StatusCode::BAD_REQUEST => RelayError::invalid_request(message),
        StatusCode::NOT_FOUND => RelayError::unknown_client(message),
        StatusCode::TOO_MANY_REQUESTS => RelayError::rate_limited("this client"),
        StatusCode::SERVICE_UNAVAILABLE => RelayError::TooManyConnections {
            limit: parse_limit(&message).unwrap_or(0),
        },
        StatusCode::UNAUTHORIZED => RelayError::auth(message),
        _ => RelayError::network(format!("Relay returned {}: {}", status, message)),
    }
}

/// Pull the limit out of "Too many connections: limit of N reached"
fn parse_limit(message: &str) -> Option<usize> {
    let (_, rest) = message.split_once("limit of ")?;
    rest.split_whitespace().next()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert!(matches!(
            error_from_status(StatusCode::NOT_FOUND, "Unknown client: client-9".into()),
            RelayError::UnknownClient(_)
        ));
        assert!(matches!(
            error_from_status(StatusCode::TOO_MANY_REQUESTS, String::new()),
            RelayError::RateLimited { .. }
        ));
        assert!(matches!(
            error_from_status(StatusCode::BAD_GATEWAY, "upstream".into()),
            RelayError::Network(_)
        ));
    }

    #[test]
    fn test_connection_limit_parsed() {
        let err = error_from_status(
            StatusCode::SERVICE_UNAVAILABLE,
            "Too many connections: limit of 25 reached".into(),
        );
        assert!(matches!(err, RelayError::TooManyConnections { limit: 25 }));

        let err = error_from_status(StatusCode::SERVICE_UNAVAILABLE, "busy".into());
        assert!(matches!(err, RelayError::TooManyConnections { limit: 0 }));
    }

    #[test]
    fn test_base_url_trimmed() {
        assert_eq!(normalize_base_url("http://localhost:3001/"), "http://localhost:3001");
    }
}
