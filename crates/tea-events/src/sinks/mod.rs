//! Transport sinks.
//!
//! A sink takes an already-matched event and hands it to the transport without
//! waiting for the client. Every sink keeps its own bounded queues so a slow
//! consumer only ever hurts itself.

pub mod signing;
pub mod socket;
pub mod stream;
pub mod webhook;

use std::sync::Arc;

use crate::domain::{CanonicalEvent, Subscription, SubscriptionId, TransportType};

pub use socket::SocketSink;
pub use stream::StreamSink;
pub use webhook::WebhookSink;

/// An event plus its wire encoding, shared by every sink it fans out to.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub event: Arc<CanonicalEvent>,
    pub body: Arc<str>,
}

impl Envelope {
    pub fn new(event: CanonicalEvent) -> Result<Self, serde_json::Error> {
        let body = event.to_json()?;
        Ok(Self {
            event: Arc::new(event),
            body: Arc::from(body),
        })
    }
}

/// Outcome of a successful hand-off
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handoff {
    /// Queued for this many consumers
    Queued(usize),
    /// Nobody is attached to the subscription right now
    NoConsumer,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SinkError {
    #[error("consumer of subscription {0} is too slow and was disconnected")]
    SlowConsumer(SubscriptionId),

    #[error("delivery queue of subscription {0} is full")]
    QueueFull(SubscriptionId),

    #[error("subscription {0} has no webhook url")]
    MissingWebhookUrl(SubscriptionId),

    #[error("sink is shut down")]
    Closed,
}

/// A delivery transport.
pub trait Sink: Send + Sync {
    fn transport(&self) -> TransportType;

    /// Enqueue `envelope` for the consumers of `subscription`. Must not block.
    fn deliver(
        &self,
        subscription: &Arc<Subscription>,
        envelope: &Envelope,
    ) -> Result<Handoff, SinkError>;

    /// Detach every consumer of a subscription that was deleted or deactivated.
    fn close_subscription(&self, id: SubscriptionId);
}

/// One sink per transport
#[derive(Clone)]
pub struct SinkSet {
    pub socket: Arc<SocketSink>,
    pub stream: Arc<StreamSink>,
    pub webhook: Arc<WebhookSink>,
}

impl SinkSet {
    pub fn for_transport(&self, transport: TransportType) -> &dyn Sink {
        match transport {
            TransportType::WebSocket => self.socket.as_ref(),
            TransportType::Sse => self.stream.as_ref(),
            TransportType::Webhook => self.webhook.as_ref(),
        }
    }

    pub fn close_subscription(&self, id: SubscriptionId) {
        self.socket.close_subscription(id);
        self.stream.close_subscription(id);
        self.webhook.close_subscription(id);
    }
}
