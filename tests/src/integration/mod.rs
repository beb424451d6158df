//! Cross-component flows: REST → registry → listener → dispatcher → sinks.

pub mod lifecycle_flow;
pub mod push_flow;
pub mod webhook_flow;
