//! Adapters: concrete implementations of the ports.
//!
//! - `memory_store`: subscription, delivery and connection records in memory
//! - `memory_ledger`: scriptable ledger for tests and local runs
//! - `ledger_ws`: ledger event socket over WebSocket
//! - `prometheus`: metrics sinks writing to the `tea-telemetry` registry

pub mod ledger_ws;
pub mod memory_ledger;
pub mod memory_store;
pub mod prometheus;

pub use ledger_ws::WsLedgerClient;
pub use memory_ledger::MemoryLedger;
pub use memory_store::InMemoryStore;
pub use prometheus::{FanoutMetrics, PrometheusMetrics};
