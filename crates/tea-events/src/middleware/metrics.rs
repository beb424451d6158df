//! In-process pipeline counters.
//!
//! Lock-free atomics readable from `/health` and from tests. Prometheus export
//! goes through `adapters::prometheus`.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use crate::domain::TransportType;
use crate::ports::MetricsSink;

fn slot(transport: TransportType) -> usize {
    match transport {
        TransportType::WebSocket => 0,
        TransportType::Sse => 1,
        TransportType::Webhook => 2,
    }
}

/// Pipeline metrics
#[derive(Default)]
pub struct PipelineMetrics {
    // Dispatch counters
    pub events_published: AtomicU64,
    delivered: [AtomicU64; 3],
    failed: [AtomicU64; 3],

    // Webhook latency (simplified, Prometheus has the histogram)
    webhook_time_total_ms: AtomicU64,
    webhook_successes: AtomicU64,

    // Connections and listeners
    pub socket_connections: AtomicI64,
    pub listeners: AtomicU64,
    pub ledger_reconnects: AtomicU64,

    // HTTP surface
    pub requests_total: AtomicU64,
    pub requests_error: AtomicU64,
    pub rate_limit_rejected: AtomicU64,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delivered(&self, transport: TransportType) -> u64 {
        self.delivered[slot(transport)].load(Ordering::Relaxed)
    }

    pub fn failed(&self, transport: TransportType) -> u64 {
        self.failed[slot(transport)].load(Ordering::Relaxed)
    }

    pub fn published(&self) -> u64 {
        self.events_published.load(Ordering::Relaxed)
    }

    pub fn socket_connections_active(&self) -> i64 {
        self.socket_connections.load(Ordering::Relaxed)
    }

    /// Record a finished HTTP request
    pub fn record_request(&self, success: bool) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.requests_error.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record rate limit rejection
    pub fn record_rate_limit_rejection(&self) {
        self.rate_limit_rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Average time to a successful webhook delivery
    pub fn average_webhook_time_ms(&self) -> f64 {
        let total = self.webhook_time_total_ms.load(Ordering::Relaxed);
        let count = self.webhook_successes.load(Ordering::Relaxed);
        if count == 0 {
            0.0
        } else {
            total as f64 / count as f64
        }
    }

    /// Export metrics as JSON
    pub fn to_json(&self) -> serde_json::Value {
        let per_transport = |counters: &[AtomicU64; 3]| {
            let mut map = serde_json::Map::new();
            for transport in TransportType::ALL {
                map.insert(
                    transport.as_str().to_string(),
                    counters[slot(transport)].load(Ordering::Relaxed).into(),
                );
            }
            serde_json::Value::Object(map)
        };

        serde_json::json!({
            "events": {
                "published": self.published(),
                "delivered": per_transport(&self.delivered),
                "failed": per_transport(&self.failed),
            },
            "webhook": {
                "average_delivery_ms": self.average_webhook_time_ms(),
            },
            "connections": {
                "sockets": self.socket_connections_active(),
                "listeners": self.listeners.load(Ordering::Relaxed),
                "ledger_reconnects": self.ledger_reconnects.load(Ordering::Relaxed),
            },
            "requests": {
                "total": self.requests_total.load(Ordering::Relaxed),
                "error": self.requests_error.load(Ordering::Relaxed),
                "rate_limited": self.rate_limit_rejected.load(Ordering::Relaxed),
            }
        })
    }
}

impl MetricsSink for PipelineMetrics {
    fn event_published(&self) {
        self.events_published.fetch_add(1, Ordering::Relaxed);
    }

    fn event_delivered(&self, transport: TransportType) {
        self.delivered[slot(transport)].fetch_add(1, Ordering::Relaxed);
    }

    fn event_failed(&self, transport: TransportType) {
        self.failed[slot(transport)].fetch_add(1, Ordering::Relaxed);
    }

    fn webhook_delivery_time_ms(&self, millis: f64) {
        self.webhook_time_total_ms
            .fetch_add(millis.max(0.0) as u64, Ordering::Relaxed);
        self.webhook_successes.fetch_add(1, Ordering::Relaxed);
    }

    fn socket_connection_opened(&self) {
        self.socket_connections.fetch_add(1, Ordering::Relaxed);
    }

    fn socket_connection_closed(&self) {
        self.socket_connections.fetch_sub(1, Ordering::Relaxed);
    }

    fn listeners_active(&self, count: usize) {
        self.listeners.store(count as u64, Ordering::Relaxed);
    }

    fn ledger_reconnect(&self, _channel: &str) {
        self.ledger_reconnects.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_counters_are_independent() {
        let metrics = PipelineMetrics::new();
        metrics.event_published();
        metrics.event_delivered(TransportType::WebSocket);
        metrics.event_delivered(TransportType::Webhook);
        metrics.event_failed(TransportType::Webhook);

        assert_eq!(metrics.published(), 1);
        assert_eq!(metrics.delivered(TransportType::WebSocket), 1);
        assert_eq!(metrics.delivered(TransportType::Sse), 0);
        assert_eq!(metrics.failed(TransportType::Webhook), 1);

        let json = metrics.to_json();
        assert_eq!(json["events"]["delivered"]["webhook"], 1);
        assert_eq!(json["events"]["failed"]["websocket"], 0);
    }

    #[test]
    fn test_socket_gauge() {
        let metrics = PipelineMetrics::new();
        metrics.socket_connection_opened();
        metrics.socket_connection_opened();
        metrics.socket_connection_closed();
        assert_eq!(metrics.socket_connections_active(), 1);
    }

    #[test]
    fn test_average_webhook_time() {
        let metrics = PipelineMetrics::new();
        metrics.webhook_delivery_time_ms(100.0);
        metrics.webhook_delivery_time_ms(300.0);
        assert!((metrics.average_webhook_time_ms() - 200.0).abs() < 0.01);
    }
}
