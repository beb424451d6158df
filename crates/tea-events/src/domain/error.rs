//! Error types for the pipeline and its HTTP surface.
//!
//! `ApiError` is what clients see. Everything else is internal and converts
//! into it at the API boundary.

use serde::Serialize;
use std::fmt;

use super::ids::SubscriptionId;
use super::subscription::{TransportType, ValidationError};

/// Stable machine-readable error codes
pub mod codes {
    pub const INVALID_REQUEST: &str = "invalid_request";
    pub const UNAUTHORIZED: &str = "unauthorized";
    pub const NOT_FOUND: &str = "not_found";
    pub const CONFLICT: &str = "conflict";
    pub const RATE_LIMITED: &str = "rate_limited";
    pub const UNAVAILABLE: &str = "unavailable";
    pub const INTERNAL_ERROR: &str = "internal_error";
}

/// Client-facing error with HTTP status
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiError {
    /// HTTP status code
    pub status: u16,
    /// Error code from [`codes`]
    pub code: &'static str,
    /// Human readable message
    pub message: String,
}

impl ApiError {
    pub fn new(status: u16, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    /// Malformed body, bad parameters or invariant violations
    pub fn invalid_request(details: impl Into<String>) -> Self {
        Self::new(400, codes::INVALID_REQUEST, details)
    }

    /// Missing or ambiguous owner identity
    pub fn unauthorized(details: impl Into<String>) -> Self {
        Self::new(401, codes::UNAUTHORIZED, details)
    }

    /// Unknown subscription or not visible to the caller
    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::new(404, codes::NOT_FOUND, format!("not found: {}", resource.into()))
    }

    /// Request is valid but conflicts with the subscription's state
    pub fn conflict(details: impl Into<String>) -> Self {
        Self::new(409, codes::CONFLICT, details)
    }

    /// Rate limited
    pub fn rate_limited() -> Self {
        Self::new(429, codes::RATE_LIMITED, "rate limit exceeded")
    }

    /// Shutting down
    pub fn unavailable(details: impl Into<String>) -> Self {
        Self::new(503, codes::UNAVAILABLE, details)
    }

    /// Internal error. Details are logged, not returned.
    pub fn internal() -> Self {
        Self::new(500, codes::INTERNAL_ERROR, "internal error")
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for ApiError {}

impl Serialize for ApiError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeStruct;
        let mut state = serializer.serialize_struct("ApiError", 2)?;
        state.serialize_field("code", self.code)?;
        state.serialize_field("message", &self.message)?;
        state.end()
    }
}

impl From<ValidationError> for ApiError {
    fn from(e: ValidationError) -> Self {
        ApiError::invalid_request(e.to_string())
    }
}

/// Result type for API operations
pub type ApiResult<T> = Result<T, ApiError>;

/// Subscription store failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("subscription {0} not found")]
    NotFound(SubscriptionId),

    #[error("record {0} not found")]
    RecordNotFound(String),

    #[error("duplicate id {0}")]
    Duplicate(String),

    #[error("store backend error: {0}")]
    Backend(String),
}

/// Ledger watch failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    /// Could not open the watch stream
    #[error("ledger connect failed: {0}")]
    Connect(String),

    /// Stream broke after it was established
    #[error("ledger stream error: {0}")]
    Stream(String),

    /// One frame could not be decoded. The stream itself is still usable.
    #[error("malformed ledger frame: {0}")]
    Malformed(String),
}

impl LedgerError {
    /// Whether the watch stream must be re-established
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Malformed(_))
    }
}

/// Subscription lifecycle failures
#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("subscription {0} not found")]
    NotFound(SubscriptionId),

    #[error(transparent)]
    Invalid(#[from] ValidationError),

    #[error("subscription {id} uses {actual} transport, not {expected}")]
    WrongTransport {
        id: SubscriptionId,
        expected: TransportType,
        actual: TransportType,
    },

    #[error("subscription {0} is inactive")]
    Inactive(SubscriptionId),

    #[error("pipeline is shutting down")]
    ShuttingDown,

    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for LifecycleError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => LifecycleError::NotFound(id),
            other => LifecycleError::Store(other),
        }
    }
}

impl From<LifecycleError> for ApiError {
    fn from(e: LifecycleError) -> Self {
        match e {
            LifecycleError::NotFound(id) => ApiError::not_found(format!("subscription {id}")),
            LifecycleError::Invalid(v) => v.into(),
            LifecycleError::WrongTransport { .. } | LifecycleError::Inactive(_) => {
                ApiError::conflict(e.to_string())
            }
            LifecycleError::ShuttingDown => ApiError::unavailable(e.to_string()),
            LifecycleError::Store(store) => {
                tracing::error!(error = %store, "subscription store failure");
                ApiError::internal()
            }
        }
    }
}

/// Process-level errors
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Server socket bind error
    #[error("server bind error: {0}")]
    Bind(String),

    /// Startup could not load subscriptions
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Internal server error
    #[error("internal error: {0}")]
    Internal(String),
}
