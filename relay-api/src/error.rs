//! HTTP mapping for relay errors

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use relay_core::RelayError;
use serde::Serialize;
use tracing::error;

/// Error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// A `RelayError` returned from a handler
#[derive(Debug)]
pub struct ApiError(pub RelayError);

impl From<RelayError> for ApiError {
    fn from(err: RelayError) -> Self {
        Self(err)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            RelayError::InvalidRequest(_) | RelayError::Parse(_) => StatusCode::BAD_REQUEST,
            RelayError::UnknownClient(_) => StatusCode::NOT_FOUND,
            RelayError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            RelayError::TooManyConnections { .. } => StatusCode::SERVICE_UNAVAILABLE,
            RelayError::Auth(_) => StatusCode::UNAUTHORIZED,
            RelayError::Network(_) => StatusCode::BAD_GATEWAY,
            RelayError::Config(_) | RelayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("Request failed: {}", self.0);
        }
        (
            status,
            Json(ErrorResponse {
                error: self.0.to_string(),
            }),
        )
            .into_response()
    }
}
