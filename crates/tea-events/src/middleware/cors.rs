//! CORS for browser dashboards.
//!
//! Wrapper around tower-http CORS driven by `CorsConfig`.

use crate::domain::config::CorsConfig;
use axum::http::{header, HeaderName, HeaderValue, Method};
use tower_http::cors::{Any, CorsLayer};

/// Headers browsers may send on REST calls
fn allowed_headers() -> [HeaderName; 5] {
    [
        header::CONTENT_TYPE,
        header::AUTHORIZATION,
        HeaderName::from_static("x-user-id"),
        HeaderName::from_static("x-api-key-id"),
        HeaderName::from_static("x-request-id"),
    ]
}

/// Create CORS layer from gateway config
pub fn create_cors_layer(config: &CorsConfig) -> CorsLayer {
    if !config.enabled {
        // no CORS headers at all: browsers fall back to same-origin
        return CorsLayer::new();
    }

    let mut cors = CorsLayer::new()
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers(allowed_headers())
        .expose_headers([HeaderName::from_static("x-request-id")])
        .max_age(config.max_age);

    if config.allowed_origins.iter().any(|o| o == "*") {
        cors = cors.allow_origin(Any);
    } else {
        let origins: Vec<HeaderValue> = config
            .allowed_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        cors = cors.allow_origin(origins);
    }

    cors
}
