//! Domain layer: subscriptions, events, audit records, configuration and errors.

pub mod backoff;
pub mod config;
pub mod error;
pub mod event;
pub mod filter;
pub mod ids;
pub mod records;
pub mod subscription;

pub use backoff::Backoff;
pub use config::*;
pub use error::*;
pub use event::{canonicalize, decode_payload, CanonicalEvent, DecodeError, RawChaincodeEvent, RawLedgerRecord};
pub use filter::filters_match;
pub use ids::{ConnectionId, CorrelationId, SubscriptionId};
pub use records::{ClientInfo, ConnectionRecord, DeliveryRecord, DeliveryStatus};
pub use subscription::{
    Filters, NewSubscription, Owner, Subscription, SubscriptionPatch, TransportType,
    ValidationError,
};
