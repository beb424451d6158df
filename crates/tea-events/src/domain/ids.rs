//! Time-ordered identifiers for requests and push connections.
//!
//! Both wrap UUID v7 so log lines and connection records sort by creation time.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Subscription identifiers are plain random UUIDs.
pub type SubscriptionId = Uuid;

macro_rules! uuid_v7_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Generate a new identifier (UUID v7)
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }

            /// Parse from string
            pub fn parse(s: &str) -> Result<Self, uuid::Error> {
                Uuid::parse_str(s).map(Self)
            }

            /// Get the underlying UUID
            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }
    };
}

uuid_v7_id!(
    /// Correlation ID for tracking one HTTP request through the logs.
    CorrelationId
);

uuid_v7_id!(
    /// Identity of one WebSocket or SSE connection. Also the rate limiter key
    /// for inbound socket frames.
    ConnectionId
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_unique_and_ordered() {
        let a = ConnectionId::new();
        let b = ConnectionId::new();
        assert_ne!(a, b);
        assert!(a <= b);
    }

    #[test]
    fn test_parse_roundtrip() {
        let id = CorrelationId::new();
        let parsed = CorrelationId::parse(&id.to_string()).unwrap();
        assert_eq!(id, parsed);
        assert_eq!(parsed.as_uuid().get_version_num(), 7);
    }
}
