//! Subscription definitions and their validation rules.
//!
//! A subscription always names a ledger channel. Chaincode name, event name and
//! the filter map narrow the match; an empty value means "any".

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

use super::ids::SubscriptionId;

/// Payload predicates: every key must be present in the event payload with an
/// equal scalar value.
pub type Filters = BTreeMap<String, Value>;

/// Delivery transport of a subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportType {
    /// Persistent socket push
    #[serde(rename = "websocket")]
    WebSocket,
    /// One-way event stream
    #[serde(rename = "sse")]
    Sse,
    /// Signed HTTP callback
    #[serde(rename = "webhook")]
    Webhook,
}

impl TransportType {
    /// All transports, in metric label order
    pub const ALL: [TransportType; 3] = [Self::WebSocket, Self::Sse, Self::Webhook];

    /// Metric label and wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WebSocket => "websocket",
            Self::Sse => "sse",
            Self::Webhook => "webhook",
        }
    }
}

impl fmt::Display for TransportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Authenticated principal owning a subscription. Exactly one kind per row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Owner {
    #[serde(rename = "userId")]
    User(String),
    #[serde(rename = "apiKeyId")]
    ApiKey(String),
}

impl fmt::Display for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User(id) => write!(f, "user:{id}"),
            Self::ApiKey(id) => write!(f, "apikey:{id}"),
        }
    }
}

/// A stored subscription
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscription {
    pub id: SubscriptionId,
    #[serde(flatten)]
    pub owner: Owner,
    pub name: String,
    #[serde(rename = "type")]
    pub transport: TransportType,
    pub channel_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chaincode_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
    /// Never echoed back to clients
    #[serde(skip_serializing)]
    pub webhook_secret: Option<String>,
    pub filters: Filters,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Create request body
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSubscription {
    pub name: String,
    #[serde(rename = "type")]
    pub transport: TransportType,
    pub channel_name: String,
    #[serde(default)]
    pub chaincode_name: Option<String>,
    #[serde(default)]
    pub event_name: Option<String>,
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(default)]
    pub webhook_secret: Option<String>,
    #[serde(default)]
    pub filters: Filters,
    #[serde(default)]
    pub active: Option<bool>,
}

/// Partial update body. Channel, chaincode, event name and transport are fixed
/// after creation.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionPatch {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub active: Option<bool>,
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(default)]
    pub webhook_secret: Option<String>,
    #[serde(default)]
    pub filters: Option<Filters>,
}

/// Subscription rule violations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("{0} is required")]
    MissingField(&'static str),

    #[error("{0} is only allowed for webhook subscriptions")]
    WebhookFieldNotAllowed(&'static str),

    #[error("invalid webhook url: {0}")]
    InvalidWebhookUrl(String),
}

impl Subscription {
    /// Build a new subscription from a create request.
    pub fn create(
        owner: Owner,
        request: NewSubscription,
        now: DateTime<Utc>,
    ) -> Result<Self, ValidationError> {
        let subscription = Self {
            id: Uuid::new_v4(),
            owner,
            name: request.name.trim().to_string(),
            transport: request.transport,
            channel_name: request.channel_name.trim().to_string(),
            chaincode_name: non_empty(request.chaincode_name),
            event_name: non_empty(request.event_name),
            webhook_url: non_empty(request.webhook_url),
            webhook_secret: non_empty(request.webhook_secret),
            filters: request.filters,
            active: request.active.unwrap_or(true),
            created_at: now,
            updated_at: now,
        };
        subscription.validate()?;
        Ok(subscription)
    }

    /// Apply a partial update and re-validate.
    pub fn apply(&mut self, patch: SubscriptionPatch, now: DateTime<Utc>) -> Result<(), ValidationError> {
        let mut next = self.clone();
        if let Some(name) = patch.name {
            next.name = name.trim().to_string();
        }
        if let Some(active) = patch.active {
            next.active = active;
        }
        if let Some(url) = patch.webhook_url {
            next.webhook_url = non_empty(Some(url));
        }
        if let Some(secret) = patch.webhook_secret {
            next.webhook_secret = non_empty(Some(secret));
        }
        if let Some(filters) = patch.filters {
            next.filters = filters;
        }
        next.validate()?;
        next.updated_at = now;
        *self = next;
        Ok(())
    }

    /// Check the structural invariants.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.name.is_empty() {
            return Err(ValidationError::MissingField("name"));
        }
        if self.channel_name.is_empty() {
            return Err(ValidationError::MissingField("channelName"));
        }

        match self.transport {
            TransportType::Webhook => {
                let url = self
                    .webhook_url
                    .as_deref()
                    .ok_or(ValidationError::MissingField("webhookUrl"))?;
                if self.webhook_secret.is_none() {
                    return Err(ValidationError::MissingField("webhookSecret"));
                }
                validate_webhook_url(url)?;
            }
            TransportType::WebSocket | TransportType::Sse => {
                if self.webhook_url.is_some() {
                    return Err(ValidationError::WebhookFieldNotAllowed("webhookUrl"));
                }
                if self.webhook_secret.is_some() {
                    return Err(ValidationError::WebhookFieldNotAllowed("webhookSecret"));
                }
            }
        }
        Ok(())
    }

    /// Whether `owner` may see and modify this subscription
    pub fn is_owned_by(&self, owner: &Owner) -> bool {
        &self.owner == owner
    }
}

fn validate_webhook_url(url: &str) -> Result<(), ValidationError> {
    let parsed =
        reqwest::Url::parse(url).map_err(|e| ValidationError::InvalidWebhookUrl(e.to_string()))?;
    match parsed.scheme() {
        "http" | "https" if parsed.host_str().is_some() => Ok(()),
        "http" | "https" => Err(ValidationError::InvalidWebhookUrl("missing host".into())),
        other => Err(ValidationError::InvalidWebhookUrl(format!(
            "unsupported scheme {other}"
        ))),
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
