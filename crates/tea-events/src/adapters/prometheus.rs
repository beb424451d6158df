//! Metrics sinks backed by the `tea-telemetry` Prometheus registry.

use std::sync::Arc;

use tea_telemetry::{
    EVENTS_DELIVERED, EVENTS_FAILED, EVENTS_PUBLISHED, LEDGER_RECONNECTS, LISTENERS_ACTIVE,
    SOCKET_CONNECTIONS_ACTIVE, WEBHOOK_DELIVERY_TIME_MS,
};

use crate::domain::TransportType;
use crate::ports::MetricsSink;

/// Writes straight into the global Prometheus collectors.
#[derive(Debug, Default, Clone, Copy)]
pub struct PrometheusMetrics;

impl MetricsSink for PrometheusMetrics {
    fn event_published(&self) {
        EVENTS_PUBLISHED.inc();
    }

    fn event_delivered(&self, transport: TransportType) {
        EVENTS_DELIVERED.with_label_values(&[transport.as_str()]).inc();
    }

    fn event_failed(&self, transport: TransportType) {
        EVENTS_FAILED.with_label_values(&[transport.as_str()]).inc();
    }

    fn webhook_delivery_time_ms(&self, millis: f64) {
        WEBHOOK_DELIVERY_TIME_MS.observe(millis);
    }

    fn socket_connection_opened(&self) {
        SOCKET_CONNECTIONS_ACTIVE.inc();
    }

    fn socket_connection_closed(&self) {
        SOCKET_CONNECTIONS_ACTIVE.dec();
    }

    fn listeners_active(&self, count: usize) {
        LISTENERS_ACTIVE.set(count as f64);
    }

    fn ledger_reconnect(&self, channel: &str) {
        LEDGER_RECONNECTS.with_label_values(&[channel]).inc();
    }
}

/// Forwards every observation to several sinks.
#[derive(Clone, Default)]
pub struct FanoutMetrics {
    sinks: Vec<Arc<dyn MetricsSink>>,
}

impl FanoutMetrics {
    pub fn new(sinks: Vec<Arc<dyn MetricsSink>>) -> Self {
        Self { sinks }
    }
}

impl MetricsSink for FanoutMetrics {
    fn event_published(&self) {
        self.sinks.iter().for_each(|s| s.event_published());
    }

    fn event_delivered(&self, transport: TransportType) {
        self.sinks.iter().for_each(|s| s.event_delivered(transport));
    }

    fn event_failed(&self, transport: TransportType) {
        self.sinks.iter().for_each(|s| s.event_failed(transport));
    }

    fn webhook_delivery_time_ms(&self, millis: f64) {
        self.sinks.iter().for_each(|s| s.webhook_delivery_time_ms(millis));
    }

    fn socket_connection_opened(&self) {
        self.sinks.iter().for_each(|s| s.socket_connection_opened());
    }

    fn socket_connection_closed(&self) {
        self.sinks.iter().for_each(|s| s.socket_connection_closed());
    }

    fn listeners_active(&self, count: usize) {
        self.sinks.iter().for_each(|s| s.listeners_active(count));
    }

    fn ledger_reconnect(&self, channel: &str) {
        self.sinks.iter().for_each(|s| s.ledger_reconnect(channel));
    }
}
