//! Prometheus metrics for the event pipeline.
//!
//! All metrics follow the naming convention: `tea_<area>_<metric>_<unit>`
//!
//! - `tea_events_published_total`: canonical events dispatched
//! - `tea_events_delivered_total{transport}`: successful hand-offs per transport
//! - `tea_events_failed_total{transport}`: failed hand-offs and exhausted webhooks
//! - `tea_webhook_delivery_time_ms`: time from first attempt to a 2xx
//! - `tea_socket_connections_active`: open WebSocket connections

use lazy_static::lazy_static;
use prometheus::{
    exponential_buckets, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, IntCounter, Opts,
    Registry, TextEncoder,
};
use std::sync::Once;

use crate::TelemetryError;

lazy_static! {
    /// Pipeline metrics registry
    pub static ref REGISTRY: Registry = Registry::new();

    /// Canonical events handed to the dispatcher
    pub static ref EVENTS_PUBLISHED: IntCounter = IntCounter::new(
        "tea_events_published_total",
        "Total canonical events dispatched"
    ).expect("metric creation failed");

    /// Hand-offs accepted by a sink
    pub static ref EVENTS_DELIVERED: CounterVec = CounterVec::new(
        Opts::new("tea_events_delivered_total", "Events delivered per transport"),
        &["transport"]  // websocket/sse/webhook
    ).expect("metric creation failed");

    /// Hand-offs rejected by a sink or webhooks that exhausted retries
    pub static ref EVENTS_FAILED: CounterVec = CounterVec::new(
        Opts::new("tea_events_failed_total", "Event delivery failures per transport"),
        &["transport"]
    ).expect("metric creation failed");

    /// Webhook delivery time in milliseconds
    pub static ref WEBHOOK_DELIVERY_TIME_MS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "tea_webhook_delivery_time_ms",
            "Time from first webhook attempt to a 2xx response"
        ).buckets(exponential_buckets(5.0, 2.0, 14).expect("valid buckets"))
    ).expect("metric creation failed");

    /// Open WebSocket connections
    pub static ref SOCKET_CONNECTIONS_ACTIVE: Gauge = Gauge::new(
        "tea_socket_connections_active",
        "Number of currently open WebSocket connections"
    ).expect("metric creation failed");

    /// Running chain listeners
    pub static ref LISTENERS_ACTIVE: Gauge = Gauge::new(
        "tea_listeners_active",
        "Number of ledger channels currently watched"
    ).expect("metric creation failed");

    /// Ledger stream resubscriptions
    pub static ref LEDGER_RECONNECTS: CounterVec = CounterVec::new(
        Opts::new("tea_ledger_reconnects_total", "Ledger watch resubscriptions"),
        &["channel"]
    ).expect("metric creation failed");
}

static REGISTER: Once = Once::new();

/// Register all metrics with the pipeline registry. Safe to call repeatedly.
pub fn register_metrics() -> Result<(), TelemetryError> {
    let mut result = Ok(());
    REGISTER.call_once(|| {
        let metrics: Vec<Box<dyn prometheus::core::Collector>> = vec![
            Box::new(EVENTS_PUBLISHED.clone()),
            Box::new(EVENTS_DELIVERED.clone()),
            Box::new(EVENTS_FAILED.clone()),
            Box::new(WEBHOOK_DELIVERY_TIME_MS.clone()),
            Box::new(SOCKET_CONNECTIONS_ACTIVE.clone()),
            Box::new(LISTENERS_ACTIVE.clone()),
            Box::new(LEDGER_RECONNECTS.clone()),
        ];

        for metric in metrics {
            if let Err(e) = REGISTRY.register(metric) {
                result = Err(TelemetryError::MetricsInit(e.to_string()));
                return;
            }
        }
    });
    result
}

/// Encode all metrics as Prometheus text format.
pub fn encode_metrics() -> Result<String, TelemetryError> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| TelemetryError::MetricsInit(e.to_string()))?;
    String::from_utf8(buffer).map_err(|e| TelemetryError::MetricsInit(e.to_string()))
}
