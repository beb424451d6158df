//! Request span middleware.
//!
//! Every HTTP request runs inside an `http_request` span carrying a
//! correlation id. The id is taken from `X-Request-ID` when the caller sent a
//! valid one and is echoed back on the response.

use axum::{
    body::Body,
    http::{HeaderValue, Request},
    response::Response,
};
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::{Layer, Service};
use tracing::{info_span, Instrument, Span};

use crate::domain::CorrelationId;
use crate::middleware::metrics::PipelineMetrics;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

#[derive(Clone)]
pub struct TracingLayer {
    metrics: Arc<PipelineMetrics>,
}

impl TracingLayer {
    pub fn new(metrics: Arc<PipelineMetrics>) -> Self {
        Self { metrics }
    }
}

impl<S> Layer<S> for TracingLayer {
    type Service = TracingService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        TracingService {
            inner,
            metrics: Arc::clone(&self.metrics),
        }
    }
}

#[derive(Clone)]
pub struct TracingService<S> {
    inner: S,
    metrics: Arc<PipelineMetrics>,
}

impl<S> Service<Request<Body>> for TracingService<S>
where
    S: Service<Request<Body>, Response = Response> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response;
    type Error = S::Error;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<Body>) -> Self::Future {
        let mut inner = self.inner.clone();
        let metrics = Arc::clone(&self.metrics);

        let correlation_id = correlation_id(&req);
        req.extensions_mut().insert(correlation_id);

        let span = info_span!(
            "http_request",
            http.method = %req.method(),
            http.target = %req.uri().path(),
            correlation_id = %correlation_id,
            http.status_code = tracing::field::Empty,
            otel.kind = "server",
            otel.status_code = tracing::field::Empty,
        );

        Box::pin(
            async move {
                let result = inner.call(req).await;

                match &result {
                    Ok(response) => {
                        let status = response.status();
                        let span = Span::current();
                        span.record("http.status_code", status.as_u16());
                        span.record(
                            "otel.status_code",
                            if status.is_server_error() { "ERROR" } else { "OK" },
                        );
                        metrics.record_request(!status.is_server_error() && !status.is_client_error());
                    }
                    Err(_) => {
                        Span::current().record("otel.status_code", "ERROR");
                        metrics.record_request(false);
                    }
                }

                result.map(|mut response| {
                    if let Ok(value) = HeaderValue::from_str(&correlation_id.to_string()) {
                        response.headers_mut().insert(REQUEST_ID_HEADER, value);
                    }
                    response
                })
            }
            .instrument(span),
        )
    }
}

/// Reuse a caller supplied request id, otherwise mint one.
fn correlation_id<B>(req: &Request<B>) -> CorrelationId {
    req.headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| CorrelationId::parse(s.trim()).ok())
        .unwrap_or_default()
}
