//! Outbound ports for the event pipeline.
//!
//! The ledger client, the relational store, the rate limiter and the metrics
//! backend are external collaborators. Adapters live in `crate::adapters`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use std::time::Duration;

use crate::domain::{
    ConnectionId, ConnectionRecord, DeliveryRecord, LedgerError, Owner, RawLedgerRecord,
    StoreError, Subscription, SubscriptionId, TransportType,
};

/// Stream of raw records for one ledger channel. It ends, or yields a fatal
/// error, when the ledger side drops the watch.
pub type LedgerStream = BoxStream<'static, Result<RawLedgerRecord, LedgerError>>;

/// Source of raw ledger activity
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Start watching a channel from its current head.
    async fn watch(&self, channel: &str) -> Result<LedgerStream, LedgerError>;
}

/// Durable storage for subscriptions and the sinks' audit rows
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn create(&self, subscription: &Subscription) -> Result<(), StoreError>;

    async fn get(&self, id: SubscriptionId) -> Result<Subscription, StoreError>;

    /// Owner-scoped page, newest first
    async fn list(
        &self,
        owner: &Owner,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Subscription>, StoreError>;

    /// Every stored subscription, used to rebuild the registry at start
    async fn list_all(&self) -> Result<Vec<Subscription>, StoreError>;

    async fn update(&self, subscription: &Subscription) -> Result<(), StoreError>;

    async fn delete(&self, id: SubscriptionId) -> Result<(), StoreError>;

    async fn create_delivery(&self, record: &DeliveryRecord) -> Result<(), StoreError>;

    async fn update_delivery(&self, record: &DeliveryRecord) -> Result<(), StoreError>;

    /// Delivery records of one subscription, newest first
    async fn list_deliveries(
        &self,
        subscription_id: SubscriptionId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<DeliveryRecord>, StoreError>;

    async fn create_connection(&self, record: &ConnectionRecord) -> Result<(), StoreError>;

    /// Keepalive seen on a connection
    async fn touch_connection(
        &self,
        connection_id: ConnectionId,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn close_connection(
        &self,
        connection_id: ConnectionId,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;
}

/// Shared rate limiter
pub trait RateLimiter: Send + Sync {
    /// Consume one unit for `key`. Returns false when `limit` per `window`
    /// is already used up.
    fn check_and_consume(&self, key: &str, limit: u32, window: Duration) -> bool;

    /// Drop the bucket for `key`, e.g. when its connection closes.
    fn forget(&self, key: &str);
}

/// Metrics backend
pub trait MetricsSink: Send + Sync {
    /// `event.published`
    fn event_published(&self);

    /// `event.delivered{transport}`
    fn event_delivered(&self, transport: TransportType);

    /// `event.failed{transport}`
    fn event_failed(&self, transport: TransportType);

    /// `webhook.delivery_time_ms`
    fn webhook_delivery_time_ms(&self, millis: f64);

    /// `socket.connections_active` +1
    fn socket_connection_opened(&self);

    /// `socket.connections_active` -1
    fn socket_connection_closed(&self);

    /// Listener count changed
    fn listeners_active(&self, _count: usize) {}

    /// A chain listener is resubscribing
    fn ledger_reconnect(&self, _channel: &str) {}
}

/// Time source trait for testability
pub trait TimeSource: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// System time implementation
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
