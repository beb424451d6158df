//! Ports: the contracts the pipeline consumes from its collaborators.

pub mod outbound;

pub use outbound::*;
