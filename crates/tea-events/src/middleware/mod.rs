//! HTTP middleware.
//!
//! Layer order on REST routes: Request → Tracing → CORS → RateLimit → Timeout → BodyLimit → Handler.
//! Push routes (`/events/ws`, `/events/sse`) skip the timeout and body limit.

pub mod cors;
pub mod metrics;
pub mod rate_limit;
pub mod tracing;

pub use cors::create_cors_layer;
pub use metrics::PipelineMetrics;
pub use rate_limit::{KeyedRateLimiter, RateLimitLayer};
pub use tracing::TracingLayer;
