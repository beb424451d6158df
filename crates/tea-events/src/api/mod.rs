//! HTTP surface.
//!
//! | Route | Method | Handler |
//! |-------|--------|---------|
//! | `/events/subscriptions` | POST, GET | create, list |
//! | `/events/subscriptions/:id` | GET, PATCH, DELETE | read, update, delete |
//! | `/events/subscriptions/:id/deliveries` | GET | webhook delivery records |
//! | `/events/ws/:id` | GET | WebSocket upgrade |
//! | `/events/sse/:id` | GET | server-sent events |
//! | `/health` | GET | liveness and counters |
//! | `/metrics` | GET | Prometheus text format |

pub mod owner;
pub mod streams;
pub mod subscriptions;

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use std::sync::Arc;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;

use crate::domain::ApiError;
use crate::middleware::{create_cors_layer, RateLimitLayer, TracingLayer};
use crate::service::EventPipeline;

pub use owner::{Caller, MaybeCaller};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<EventPipeline>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(serde_json::json!({ "error": self }))).into_response()
    }
}

/// Build the full router for `pipeline`
pub fn router(pipeline: Arc<EventPipeline>) -> Router {
    let config = pipeline.config().clone();
    let state = AppState {
        pipeline: Arc::clone(&pipeline),
    };

    let rest = Router::new()
        .route(
            "/events/subscriptions",
            get(subscriptions::list).post(subscriptions::create),
        )
        .route(
            "/events/subscriptions/:id",
            get(subscriptions::get_one)
                .patch(subscriptions::update)
                .delete(subscriptions::delete),
        )
        .route(
            "/events/subscriptions/:id/deliveries",
            get(subscriptions::deliveries),
        )
        .layer(RequestBodyLimitLayer::new(config.server.max_body_size))
        .layer(TimeoutLayer::new(config.server.request_timeout))
        .layer(RateLimitLayer::new(
            config.rate_limit.clone(),
            Arc::clone(pipeline.rate_limiter()),
            Arc::clone(pipeline.metrics()),
        ));

    let push = Router::new()
        .route("/events/ws/:id", get(streams::websocket))
        .route("/events/sse/:id", get(streams::sse));

    let admin = Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(prometheus_metrics));

    Router::new()
        .merge(rest)
        .merge(push)
        .merge(admin)
        .layer(create_cors_layer(&config.cors))
        .layer(TracingLayer::new(Arc::clone(pipeline.metrics())))
        .with_state(state)
}

/// Health check endpoint
async fn health_check(axum::extract::State(state): axum::extract::State<AppState>) -> Response {
    let status = if state.pipeline.is_shutting_down() {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (status, Json(state.pipeline.health())).into_response()
}

async fn prometheus_metrics() -> Response {
    match tea_telemetry::encode_metrics() {
        Ok(body) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "failed to encode metrics");
            ApiError::internal().into_response()
        }
    }
}
