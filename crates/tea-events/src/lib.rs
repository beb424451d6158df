//! Tea Events - real-time ledger event distribution.
//!
//! Chaincode events emitted on the tea traceability ledger are watched per
//! channel, matched against client subscriptions and pushed to consumers over
//! WebSocket, server-sent events or signed webhooks.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────┐
//! │                           TEA EVENTS                                  │
//! ├───────────────────────────────────────────────────────────────────────┤
//! │  REST /events/subscriptions      /events/ws/:id     /events/sse/:id   │
//! │         │                              │                  │           │
//! │  ┌──────┴──────────────┐               │                  │           │
//! │  │  Middleware Stack   │               │                  │           │
//! │  │ Tracing → CORS →    │               │                  │           │
//! │  │ RateLimit → Timeout │               │                  │           │
//! │  └──────┬──────────────┘               │                  │           │
//! │         ▼                              ▼                  ▼           │
//! │  ┌──────────────┐  deltas  ┌────────────────┐                        │
//! │  │  Lifecycle   ├─────────►│ ListenerManager│ one task per channel   │
//! │  │ (service.rs) │          └───────┬────────┘                        │
//! │  └──────┬───────┘                  │ canonical events                │
//! │         ▼                          ▼                                  │
//! │  ┌──────────────┐  match  ┌────────────────┐                         │
//! │  │   Registry   │◄────────┤   Dispatcher   │                         │
//! │  └──────────────┘         └───────┬────────┘                         │
//! │                     ┌─────────────┼──────────────┐                   │
//! │                     ▼             ▼              ▼                   │
//! │               SocketSink     StreamSink     WebhookSink              │
//! │              (bounded q)    (bounded q)   (retry + HMAC)             │
//! └───────────────────────────────────────────────────────────────────────┘
//!          ▲                                          │
//!     Ledger client                          Subscription store
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use tea_events::{EventPipeline, GatewayConfig, PipelineDeps};
//! use tea_events::adapters::{InMemoryStore, WsLedgerClient};
//!
//! let deps = PipelineDeps::new(Arc::new(InMemoryStore::new()), Arc::new(WsLedgerClient::new(url)));
//! let pipeline = EventPipeline::new(GatewayConfig::default(), deps)?;
//! pipeline.start().await?;
//! let server = pipeline.spawn_server(addr).await?;
//! ```

#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod adapters;
pub mod api;
pub mod dispatcher;
pub mod domain;
pub mod listener;
pub mod middleware;
pub mod ports;
pub mod registry;
pub mod service;
pub mod sinks;

pub use dispatcher::{DispatchReport, Dispatcher};
pub use domain::{
    ApiError, CanonicalEvent, GatewayConfig, GatewayError, LifecycleError, NewSubscription, Owner,
    Subscription, SubscriptionId, SubscriptionPatch, TransportType,
};
pub use listener::ListenerManager;
pub use registry::SubscriptionRegistry;
pub use service::{EventPipeline, Page, PipelineDeps, ServerHandle};

/// Crate version, reported on `/health`
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
