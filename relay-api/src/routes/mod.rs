//! API route definitions

mod health;
mod identity;
mod stream;

use axum::{
    http::{header, HeaderName, Method},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::AppState;

pub use stream::CLIENT_ID_HEADER;

/// Create all API routes
pub fn api_routes() -> Router<AppState> {
    Router::new()
        .merge(stream::routes())
        .merge(health::routes())
}

/// Build the full application
pub fn app(state: AppState) -> Router {
    // Configure CORS for browser clients
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::HEAD, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, HeaderName::from_static(CLIENT_ID_HEADER)])
        .expose_headers(stream::STATUS_HEADERS.map(HeaderName::from_static));

    Router::new()
        .nest("/api", api_routes())
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
