//! # Tea Events Test Suite
//!
//! End-to-end flows against a real HTTP server with an in-memory ledger and
//! store behind it.
//!
//! ## Structure
//!
//! ```text
//! tests/
//! ├── benches/
//! │   └── dispatch_benchmarks.rs   # registry matching, encoding, signing
//! └── src/
//!     ├── support.rs               # gateway harness, webhook receiver
//!     └── integration/
//!         ├── lifecycle_flow.rs    # REST surface
//!         ├── push_flow.rs         # WebSocket and SSE
//!         └── webhook_flow.rs      # signing, retries, delivery records
//! ```
//!
//! ## Running Tests
//!
//! ```bash
//! cargo test -p tea-tests
//! cargo test -p tea-tests integration::webhook_flow
//! cargo bench -p tea-tests
//! ```

#![allow(dead_code)]

pub mod integration;
pub mod support;
