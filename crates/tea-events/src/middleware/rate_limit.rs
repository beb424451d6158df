//! Keyed token-bucket rate limiting.
//!
//! One `KeyedRateLimiter` is shared by the whole process: WebSocket connections
//! consume from `conn:<id>` buckets for inbound frames and the REST layer
//! consumes from `ip:<addr>` buckets.

use crate::domain::config::RateLimitConfig;
use crate::domain::error::ApiError;
use crate::middleware::metrics::PipelineMetrics;
use crate::ports;
use axum::{
    body::Body,
    extract::ConnectInfo,
    http::{header, HeaderValue, Request, StatusCode},
    response::Response,
};
use dashmap::DashMap;
use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use std::net::{IpAddr, SocketAddr};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower::{Layer, Service};
use tracing::{debug, warn};

/// Token bucket for one key
struct TokenBucket {
    limiter: RateLimiter<NotKeyed, InMemoryState, DefaultClock>,
    /// Quota the bucket was built for
    limit: u32,
    window: Duration,
    /// Last access time (for cleanup)
    last_access: Instant,
}

impl TokenBucket {
    /// `limit` cells per `window`, all available as burst.
    fn new(limit: NonZeroU32, window: Duration) -> Option<Self> {
        let quota = Quota::with_period(window / limit.get())?.allow_burst(limit);
        Some(Self {
            limiter: RateLimiter::direct(quota),
            limit: limit.get(),
            window,
            last_access: Instant::now(),
        })
    }

    fn consume(&mut self) -> bool {
        self.last_access = Instant::now();
        self.limiter.check().is_ok()
    }
}

/// Shared keyed limiter
#[derive(Default)]
pub struct KeyedRateLimiter {
    buckets: DashMap<String, TokenBucket>,
}

impl KeyedRateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clean up idle buckets (call periodically)
    pub fn cleanup(&self, max_age: Duration) {
        let now = Instant::now();
        self.buckets.retain(|key, bucket| {
            let age = now.duration_since(bucket.last_access);
            if age > max_age {
                debug!(key = %key, age_secs = age.as_secs(), "Removing stale rate limit bucket");
                false
            } else {
                true
            }
        });
    }

    /// Get number of tracked keys
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }
}

impl ports::RateLimiter for KeyedRateLimiter {
    fn check_and_consume(&self, key: &str, limit: u32, window: Duration) -> bool {
        let Some(limit) = NonZeroU32::new(limit) else {
            return false;
        };

        let mut entry = match self.buckets.get_mut(key) {
            Some(bucket) => bucket,
            None => match TokenBucket::new(limit, window) {
                Some(bucket) => self.buckets.entry(key.to_string()).or_insert(bucket),
                None => return false,
            },
        };

        // Quota changed for this key: start a fresh bucket
        if entry.limit != limit.get() || entry.window != window {
            match TokenBucket::new(limit, window) {
                Some(bucket) => *entry = bucket,
                None => return false,
            }
        }

        entry.consume()
    }

    fn forget(&self, key: &str) {
        self.buckets.remove(key);
    }
}

/// REST rate limit layer, keyed by client IP
#[derive(Clone)]
pub struct RateLimitLayer {
    limiter: Arc<KeyedRateLimiter>,
    metrics: Arc<PipelineMetrics>,
    config: RateLimitConfig,
}

impl RateLimitLayer {
    pub fn new(
        config: RateLimitConfig,
        limiter: Arc<KeyedRateLimiter>,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            limiter,
            metrics,
            config,
        }
    }
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimitService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitService {
            inner,
            limiter: Arc::clone(&self.limiter),
            metrics: Arc::clone(&self.metrics),
            config: self.config.clone(),
        }
    }
}

/// Rate limit service
#[derive(Clone)]
pub struct RateLimitService<S> {
    inner: S,
    limiter: Arc<KeyedRateLimiter>,
    metrics: Arc<PipelineMetrics>,
    config: RateLimitConfig,
}

impl<S> RateLimitService<S> {
    fn allow(&self, ip: IpAddr) -> bool {
        use ports::RateLimiter as _;

        if !self.config.enabled {
            return true;
        }
        let burst = self.config.burst_size.max(1);
        let window =
            Duration::from_secs_f64(burst as f64 / self.config.requests_per_second.max(1) as f64);
        self.limiter
            .check_and_consume(&format!("ip:{ip}"), burst, window)
    }
}

impl<S> Service<Request<Body>> for RateLimitService<S>
where
    S: Service<Request<Body>, Response = Response> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response;
    type Error = S::Error;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(
        &mut self,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let ip = extract_client_ip(&req);
        let allowed = self.allow(ip);
        let metrics = Arc::clone(&self.metrics);
        let mut inner = self.inner.clone();

        Box::pin(async move {
            if allowed {
                inner.call(req).await
            } else {
                metrics.record_rate_limit_rejection();
                warn!(ip = %ip, path = %req.uri().path(), "Rate limit exceeded");
                Ok(rate_limit_response())
            }
        })
    }
}

/// Extract client IP from request
pub(crate) fn extract_client_ip<B>(req: &Request<B>) -> IpAddr {
    // Try X-Forwarded-For header first (for proxied requests)
    if let Some(forwarded) = req.headers().get("x-forwarded-for") {
        if let Ok(forwarded_str) = forwarded.to_str() {
            // Take the first IP (original client)
            if let Some(first_ip) = forwarded_str.split(',').next() {
                if let Ok(ip) = first_ip.trim().parse::<IpAddr>() {
                    return ip;
                }
            }
        }
    }

    // Try X-Real-IP header
    if let Some(real_ip) = req.headers().get("x-real-ip") {
        if let Ok(real_ip_str) = real_ip.to_str() {
            if let Ok(ip) = real_ip_str.parse::<IpAddr>() {
                return ip;
            }
        }
    }

    // Fall back to connection info
    if let Some(connect_info) = req.extensions().get::<ConnectInfo<SocketAddr>>() {
        return connect_info.0.ip();
    }

    IpAddr::from([127, 0, 0, 1])
}

/// Create rate limit exceeded response
fn rate_limit_response() -> Response {
    let body = serde_json::json!({ "error": ApiError::rate_limited() });

    let mut response = Response::new(Body::from(serde_json::to_vec(&body).unwrap_or_default()));
    *response.status_mut() = StatusCode::TOO_MANY_REQUESTS;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    response
        .headers_mut()
        .insert(header::RETRY_AFTER, HeaderValue::from_static("1"));
    response
}

/// Background task to clean up stale rate limit buckets
pub async fn cleanup_task(limiter: Arc<KeyedRateLimiter>, interval: Duration, max_age: Duration) {
    let mut cleanup_interval = tokio::time::interval(interval);
    cleanup_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        cleanup_interval.tick().await;
        limiter.cleanup(max_age);
    }
}
