//! # Tea Telemetry
//!
//! Observability for the tea event pipeline.
//!
//! ## Components
//!
//! - **Logs**: `tracing-subscriber` with an `EnvFilter`, pretty or JSON output
//! - **Traces**: optional OpenTelemetry OTLP export
//! - **Metrics**: Prometheus counters, gauges and histograms on a private registry
//!
//! ## Usage
//!
//! ```rust,ignore
//! use tea_telemetry::{init_telemetry, TelemetryConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = TelemetryConfig::from_env();
//!     let _guard = init_telemetry(config).expect("Failed to init telemetry");
//! }
//! ```
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `OTEL_SERVICE_NAME` | `tea-events` | Service name in traces |
//! | `OTEL_EXPORTER_OTLP_ENDPOINT` | `http://localhost:4317` | OTLP collector |
//! | `TEA_OTLP_ENABLED` | `false` | Export spans over OTLP |
//! | `TEA_LOG_LEVEL` | `info` | Log level filter |
//! | `TEA_JSON_LOGS` | `false` (`true` in containers) | JSON log lines |

mod config;
pub mod metrics;
mod tracing_setup;

pub use config::TelemetryConfig;
pub use metrics::{
    encode_metrics, register_metrics, EVENTS_DELIVERED, EVENTS_FAILED, EVENTS_PUBLISHED,
    LEDGER_RECONNECTS, LISTENERS_ACTIVE, SOCKET_CONNECTIONS_ACTIVE, WEBHOOK_DELIVERY_TIME_MS,
};
pub use tracing_setup::TracingGuard;

use thiserror::Error;

/// Telemetry initialization errors
#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("Failed to initialize OpenTelemetry tracer: {0}")]
    TracerInit(String),

    #[error("Failed to initialize Prometheus metrics: {0}")]
    MetricsInit(String),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// Initialize logging, tracing and metrics.
///
/// Returns a guard that must be held for the lifetime of the application.
/// Dropping it flushes pending spans.
pub fn init_telemetry(config: TelemetryConfig) -> Result<TelemetryGuard, TelemetryError> {
    register_metrics()?;
    let tracing_guard = tracing_setup::init_tracing(&config)?;

    Ok(TelemetryGuard {
        _tracing: tracing_guard,
    })
}

/// Guard that keeps telemetry active. Drop to flush and shutdown.
pub struct TelemetryGuard {
    _tracing: TracingGuard,
}
