//! Durable audit rows written by the sinks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::ids::{ConnectionId, SubscriptionId};
use super::subscription::{Owner, TransportType};

/// Webhook delivery state: `pending → success | failed`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Pending,
    Success,
    Failed,
}

/// One webhook delivery, mutated in place across its retries.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryRecord {
    pub id: Uuid,
    pub subscription_id: SubscriptionId,
    pub event_id: String,
    pub webhook_url: String,
    pub payload: String,
    pub status: DeliveryStatus,
    pub status_code: Option<u16>,
    pub response_body: Option<String>,
    pub error_message: Option<String>,
    pub attempts: u32,
    pub delivered_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DeliveryRecord {
    pub fn pending(
        subscription_id: SubscriptionId,
        event_id: String,
        webhook_url: String,
        payload: String,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            subscription_id,
            event_id,
            webhook_url,
            payload,
            status: DeliveryStatus::Pending,
            status_code: None,
            response_body: None,
            error_message: None,
            attempts: 0,
            delivered_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Record an attempt that got an HTTP response. A 2xx is terminal success.
    pub fn record_response(&mut self, status_code: u16, body: String, now: DateTime<Utc>) {
        self.attempts += 1;
        self.status_code = Some(status_code);
        self.response_body = Some(body);
        self.updated_at = now;
        if (200..300).contains(&status_code) {
            self.status = DeliveryStatus::Success;
            self.delivered_at = Some(now);
            self.error_message = None;
        } else {
            self.error_message = Some(format!("endpoint returned HTTP {status_code}"));
        }
    }

    /// Record an attempt that failed before a response arrived.
    pub fn record_error(&mut self, error: String, now: DateTime<Utc>) {
        self.attempts += 1;
        self.status_code = None;
        self.response_body = None;
        self.error_message = Some(error);
        self.updated_at = now;
    }

    /// Attempts exhausted.
    pub fn mark_failed(&mut self, now: DateTime<Utc>) {
        self.status = DeliveryStatus::Failed;
        self.updated_at = now;
    }

    /// Fail without a further attempt: the job was refused or abandoned.
    pub fn reject(&mut self, error: String, now: DateTime<Utc>) {
        self.error_message = Some(error);
        self.mark_failed(now);
    }

    pub fn is_terminal(&self) -> bool {
        self.status != DeliveryStatus::Pending
    }
}

/// Audit row for one push connection (socket or stream).
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionRecord {
    pub id: Uuid,
    pub subscription_id: SubscriptionId,
    pub connection_id: ConnectionId,
    pub transport: TransportType,
    pub owner: Owner,
    pub remote_addr: Option<String>,
    pub user_agent: Option<String>,
    pub connected_at: DateTime<Utc>,
    pub disconnected_at: Option<DateTime<Utc>>,
    pub last_ping_at: Option<DateTime<Utc>>,
}

/// Client details captured at connect time
#[derive(Debug, Clone, Default)]
pub struct ClientInfo {
    pub remote_addr: Option<String>,
    pub user_agent: Option<String>,
}

impl ConnectionRecord {
    pub fn open(
        subscription_id: SubscriptionId,
        connection_id: ConnectionId,
        transport: TransportType,
        owner: Owner,
        client: ClientInfo,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            subscription_id,
            connection_id,
            transport,
            owner,
            remote_addr: client.remote_addr,
            user_agent: client.user_agent,
            connected_at: now,
            disconnected_at: None,
            last_ping_at: None,
        }
    }
}
