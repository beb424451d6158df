//! Pipeline configuration with validation.
//!
//! Every section has defaults, so an empty TOML file is a valid configuration.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use super::backoff::Backoff;

/// Main pipeline configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// HTTP server configuration
    pub server: ServerConfig,
    /// Ledger connection
    pub ledger: LedgerConfig,
    /// Chain listener resubscription
    pub listener: ListenerConfig,
    /// WebSocket sink configuration
    pub websocket: WebSocketConfig,
    /// SSE sink configuration
    pub sse: SseConfig,
    /// Webhook sink configuration
    pub webhook: WebhookConfig,
    /// REST rate limiting configuration
    pub rate_limit: RateLimitConfig,
    /// CORS configuration
    pub cors: CorsConfig,
}

impl GatewayConfig {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Io {
            path: path.as_ref().display().to_string(),
            error: e.to_string(),
        })?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.websocket.queue_capacity == 0 || self.sse.queue_capacity == 0 {
            return Err(ConfigError::InvalidLimit(
                "queue_capacity cannot be 0".into(),
            ));
        }

        if self.websocket.inbound_messages == 0 || self.websocket.inbound_window.is_zero() {
            return Err(ConfigError::InvalidRateLimit(
                "websocket inbound limit and window must be positive".into(),
            ));
        }

        if self.rate_limit.enabled && self.rate_limit.requests_per_second == 0 {
            return Err(ConfigError::InvalidRateLimit(
                "requests_per_second cannot be 0".into(),
            ));
        }

        if self.webhook.max_attempts == 0 {
            return Err(ConfigError::InvalidLimit(
                "webhook max_attempts cannot be 0".into(),
            ));
        }

        if self.webhook.request_timeout.is_zero() || self.server.request_timeout.is_zero() {
            return Err(ConfigError::InvalidTimeout(
                "request timeouts cannot be 0".into(),
            ));
        }

        for backoff in [&self.webhook.backoff, &self.listener.backoff] {
            if backoff.multiplier < 1.0 || !(0.0..1.0).contains(&backoff.jitter_fraction) {
                return Err(ConfigError::Invalid(
                    "backoff multiplier must be >= 1 and jitter in [0, 1)".into(),
                ));
            }
            if backoff.initial > backoff.max {
                return Err(ConfigError::InvalidTimeout(
                    "backoff initial delay exceeds max".into(),
                ));
            }
        }

        Ok(())
    }

    /// HTTP bind address
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.server.host, self.server.port)
    }
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address
    pub host: IpAddr,
    /// Port (default: 8090)
    pub port: u16,
    /// Timeout for REST requests (streams are exempt)
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Max REST request body in bytes
    pub max_body_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)),
            port: 8090,
            request_timeout: Duration::from_secs(30),
            max_body_size: 64 * 1024,
        }
    }
}

/// Ledger event source
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Base URL of the ledger event socket
    pub url: String,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:7053".to_string(),
        }
    }
}

/// Chain listener resubscription schedule
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenerConfig {
    pub backoff: Backoff,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            backoff: Backoff {
                initial: Duration::from_secs(1),
                max: Duration::from_secs(60),
                multiplier: 2.0,
                jitter_fraction: 0.0,
            },
        }
    }
}

/// WebSocket sink configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebSocketConfig {
    /// Outbound frames buffered per connection before it is closed
    pub queue_capacity: usize,
    /// Ping interval
    #[serde(with = "humantime_serde")]
    pub ping_interval: Duration,
    /// Max inbound message size in bytes
    pub max_message_size: usize,
    /// Inbound frames allowed per window
    pub inbound_messages: u32,
    /// Inbound rate window
    #[serde(with = "humantime_serde")]
    pub inbound_window: Duration,
    /// How long a closing connection may take to flush before it is dropped
    #[serde(with = "humantime_serde")]
    pub close_timeout: Duration,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 100,
            ping_interval: Duration::from_secs(54),
            max_message_size: 512 * 1024,
            inbound_messages: 100,
            inbound_window: Duration::from_secs(60),
            close_timeout: Duration::from_secs(5),
        }
    }
}

/// SSE sink configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SseConfig {
    /// Outbound events buffered per stream before it is closed
    pub queue_capacity: usize,
    /// Comment keep-alive interval
    #[serde(with = "humantime_serde")]
    pub keep_alive: Duration,
}

impl Default for SseConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 100,
            keep_alive: Duration::from_secs(15),
        }
    }
}

/// Webhook sink configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    /// Attempts per delivery, including the first
    pub max_attempts: u32,
    /// Delay schedule between attempts
    pub backoff: Backoff,
    /// Per-request timeout
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Pending events per subscription worker
    pub queue_capacity: usize,
    /// Response body bytes kept on the delivery record
    pub response_body_limit: usize,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff: Backoff {
                jitter_fraction: 0.1,
                ..Backoff::default()
            },
            request_timeout: Duration::from_secs(10),
            queue_capacity: 256,
            response_body_limit: 1024,
        }
    }
}

/// REST rate limiting per client IP
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Enable rate limiting
    pub enabled: bool,
    /// Sustained requests per second
    pub requests_per_second: u32,
    /// Burst size
    pub burst_size: u32,
    /// Idle limiter eviction interval
    #[serde(with = "humantime_serde")]
    pub cleanup_interval: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            requests_per_second: 50,
            burst_size: 100,
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

/// CORS configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CorsConfig {
    /// Enable CORS
    pub enabled: bool,
    /// Allowed origins ("*" for all)
    pub allowed_origins: Vec<String>,
    /// Preflight cache duration
    #[serde(with = "humantime_serde")]
    pub max_age: Duration,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            allowed_origins: vec!["*".to_string()],
            max_age: Duration::from_secs(3600),
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Config file could not be read
    #[error("failed to read {path}: {error}")]
    Io { path: String, error: String },
    /// Config file is not valid TOML for this schema
    #[error("failed to parse config: {0}")]
    Parse(String),
    /// Invalid rate limiting configuration
    #[error("invalid rate limit: {0}")]
    InvalidRateLimit(String),
    /// Invalid size or count limit
    #[error("invalid limit: {0}")]
    InvalidLimit(String),
    /// Invalid timeout value
    #[error("invalid timeout: {0}")]
    InvalidTimeout(String),
    /// General configuration error
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Humantime serde module for Duration serialization
pub(crate) mod humantime_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() == 0 {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        } else {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    pub(crate) fn parse_duration(s: &str) -> Result<Duration, &'static str> {
        let s = s.trim();
        if let Some(ms) = s.strip_suffix("ms") {
            ms.trim()
                .parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|_| "invalid milliseconds")
        } else if let Some(secs) = s.strip_suffix('s') {
            secs.trim()
                .parse::<u64>()
                .map(Duration::from_secs)
                .map_err(|_| "invalid seconds")
        } else if let Some(mins) = s.strip_suffix('m') {
            mins.trim()
                .parse::<u64>()
                .map(|m| Duration::from_secs(m * 60))
                .map_err(|_| "invalid minutes")
        } else {
            // Plain seconds
            s.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(|_| "invalid duration format")
        }
    }
}
