//! Telemetry configuration from environment variables.

use std::env;

/// Configuration for logs, traces and metrics.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Service name for traces and logs
    pub service_name: String,

    /// Deployment environment (dev, staging, prod)
    pub environment: String,

    /// OpenTelemetry OTLP endpoint
    pub otlp_endpoint: String,

    /// Export spans over OTLP
    pub otlp_enabled: bool,

    /// Log level filter (trace, debug, info, warn, error)
    pub log_level: String,

    /// Whether to enable console output
    pub console_output: bool,

    /// Whether to enable JSON formatted logs
    pub json_logs: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "tea-events".to_string(),
            environment: "dev".to_string(),
            otlp_endpoint: "http://localhost:4317".to_string(),
            otlp_enabled: false,
            log_level: "info".to_string(),
            console_output: true,
            json_logs: false,
        }
    }
}

impl TelemetryConfig {
    /// Create configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `OTEL_SERVICE_NAME`: Service name (default: tea-events)
    /// - `TEA_ENVIRONMENT`: Deployment environment (default: dev)
    /// - `OTEL_EXPORTER_OTLP_ENDPOINT`: Collector endpoint (default: http://localhost:4317)
    /// - `TEA_OTLP_ENABLED`: Export spans (default: false)
    /// - `TEA_LOG_LEVEL` or `RUST_LOG`: Log level (default: info)
    /// - `TEA_CONSOLE_OUTPUT`: Enable console output (default: true)
    /// - `TEA_JSON_LOGS`: Enable JSON logs (default: false in dev, true in containers)
    pub fn from_env() -> Self {
        let is_container =
            env::var("KUBERNETES_SERVICE_HOST").is_ok() || env::var("DOCKER_CONTAINER").is_ok();

        Self {
            service_name: env::var("OTEL_SERVICE_NAME")
                .unwrap_or_else(|_| "tea-events".to_string()),

            environment: env::var("TEA_ENVIRONMENT").unwrap_or_else(|_| "dev".to_string()),

            otlp_endpoint: env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
                .unwrap_or_else(|_| "http://localhost:4317".to_string()),

            otlp_enabled: env::var("TEA_OTLP_ENABLED")
                .map(|v| parse_flag(&v))
                .unwrap_or(false),

            log_level: env::var("TEA_LOG_LEVEL")
                .or_else(|_| env::var("RUST_LOG"))
                .unwrap_or_else(|_| "info".to_string()),

            console_output: env::var("TEA_CONSOLE_OUTPUT")
                .map(|v| v.to_lowercase() != "false" && v != "0")
                .unwrap_or(true),

            json_logs: env::var("TEA_JSON_LOGS")
                .map(|v| parse_flag(&v))
                .unwrap_or(is_container),
        }
    }
}

fn parse_flag(value: &str) -> bool {
    value.eq_ignore_ascii_case("true") || value == "1"
}
