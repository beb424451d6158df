//! Event fan-out.
//!
//! The dispatcher asks the registry which subscriptions an event matches and
//! hands the event to each subscription's sink. It never waits on a client:
//! sinks enqueue and return, so one chain listener can keep draining its
//! channel while webhooks retry in the background.

use std::sync::Arc;
use tracing::{debug, error, warn};

use crate::domain::CanonicalEvent;
use crate::ports::MetricsSink;
use crate::registry::SubscriptionRegistry;
use crate::sinks::{Envelope, Handoff, SinkSet};

/// What happened to one event
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchReport {
    pub matched: usize,
    pub delivered: usize,
    pub failed: usize,
    /// Matched, but nobody was attached
    pub idle: usize,
}

pub struct Dispatcher {
    registry: Arc<SubscriptionRegistry>,
    sinks: SinkSet,
    metrics: Arc<dyn MetricsSink>,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<SubscriptionRegistry>,
        sinks: SinkSet,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            registry,
            sinks,
            metrics,
        }
    }

    /// Deliver one canonical event to every matching subscription.
    pub fn dispatch(&self, event: CanonicalEvent) -> DispatchReport {
        self.metrics.event_published();

        let matched = self.registry.matches(&event);
        let mut report = DispatchReport {
            matched: matched.len(),
            ..DispatchReport::default()
        };
        if matched.is_empty() {
            debug!(
                channel = %event.channel_name,
                event = %event.event_name,
                tx = %event.transaction_id,
                "no subscription matched"
            );
            return report;
        }

        let envelope = match Envelope::new(event) {
            Ok(envelope) => envelope,
            Err(e) => {
                error!(error = %e, "failed to encode canonical event");
                for subscription in &matched {
                    self.metrics.event_failed(subscription.transport);
                }
                report.failed = matched.len();
                return report;
            }
        };

        for subscription in &matched {
            let sink = self.sinks.for_transport(subscription.transport);
            match sink.deliver(subscription, &envelope) {
                Ok(Handoff::Queued(_)) => {
                    report.delivered += 1;
                    self.metrics.event_delivered(subscription.transport);
                }
                Ok(Handoff::NoConsumer) => {
                    report.idle += 1;
                }
                Err(e) => {
                    report.failed += 1;
                    self.metrics.event_failed(subscription.transport);
                    warn!(
                        subscription_id = %subscription.id,
                        transport = %subscription.transport,
                        event_id = %envelope.event.event_id(),
                        error = %e,
                        "event hand-off failed"
                    );
                }
            }
        }

        debug!(
            channel = %envelope.event.channel_name,
            event = %envelope.event.event_name,
            matched = report.matched,
            delivered = report.delivered,
            failed = report.failed,
            "event dispatched"
        );
        report
    }
}
