//! In-process subscription store.
//!
//! Backs tests and single-node deployments. Rows are kept behind one
//! `RwLock` per table.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use uuid::Uuid;

use crate::domain::{
    ConnectionId, ConnectionRecord, DeliveryRecord, Owner, StoreError, Subscription,
    SubscriptionId,
};
use crate::ports::SubscriptionStore;

#[derive(Default)]
pub struct InMemoryStore {
    subscriptions: RwLock<HashMap<SubscriptionId, Subscription>>,
    deliveries: RwLock<HashMap<Uuid, DeliveryRecord>>,
    connections: RwLock<HashMap<ConnectionId, ConnectionRecord>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All delivery records of a subscription, oldest first
    pub fn deliveries_for(&self, subscription_id: SubscriptionId) -> Vec<DeliveryRecord> {
        let mut records: Vec<_> = self
            .deliveries
            .read()
            .values()
            .filter(|r| r.subscription_id == subscription_id)
            .cloned()
            .collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        records
    }

    /// Connection record by connection id
    pub fn connection(&self, connection_id: ConnectionId) -> Option<ConnectionRecord> {
        self.connections.read().get(&connection_id).cloned()
    }

    /// Connection records of a subscription
    pub fn connections_for(&self, subscription_id: SubscriptionId) -> Vec<ConnectionRecord> {
        let mut records: Vec<_> = self
            .connections
            .read()
            .values()
            .filter(|r| r.subscription_id == subscription_id)
            .cloned()
            .collect();
        records.sort_by_key(|r| r.connection_id);
        records
    }
}

fn newest_first(subs: &mut [Subscription]) {
    subs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
}

#[async_trait]
impl SubscriptionStore for InMemoryStore {
    async fn create(&self, subscription: &Subscription) -> Result<(), StoreError> {
        let mut subs = self.subscriptions.write();
        if subs.contains_key(&subscription.id) {
            return Err(StoreError::Duplicate(subscription.id.to_string()));
        }
        subs.insert(subscription.id, subscription.clone());
        Ok(())
    }

    async fn get(&self, id: SubscriptionId) -> Result<Subscription, StoreError> {
        self.subscriptions
            .read()
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound(id))
    }

    async fn list(
        &self,
        owner: &Owner,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Subscription>, StoreError> {
        let mut owned: Vec<_> = self
            .subscriptions
            .read()
            .values()
            .filter(|s| s.is_owned_by(owner))
            .cloned()
            .collect();
        newest_first(&mut owned);
        Ok(owned.into_iter().skip(offset).take(limit).collect())
    }

    async fn list_all(&self) -> Result<Vec<Subscription>, StoreError> {
        let mut all: Vec<_> = self.subscriptions.read().values().cloned().collect();
        newest_first(&mut all);
        Ok(all)
    }

    async fn update(&self, subscription: &Subscription) -> Result<(), StoreError> {
        match self.subscriptions.write().get_mut(&subscription.id) {
            Some(row) => {
                *row = subscription.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound(subscription.id)),
        }
    }

    async fn delete(&self, id: SubscriptionId) -> Result<(), StoreError> {
        self.subscriptions
            .write()
            .remove(&id)
            .map(|_| ())
            .ok_or(StoreError::NotFound(id))
    }

    async fn create_delivery(&self, record: &DeliveryRecord) -> Result<(), StoreError> {
        let mut rows = self.deliveries.write();
        if rows.contains_key(&record.id) {
            return Err(StoreError::Duplicate(record.id.to_string()));
        }
        rows.insert(record.id, record.clone());
        Ok(())
    }

    async fn update_delivery(&self, record: &DeliveryRecord) -> Result<(), StoreError> {
        match self.deliveries.write().get_mut(&record.id) {
            Some(row) => {
                *row = record.clone();
                Ok(())
            }
            None => Err(StoreError::RecordNotFound(record.id.to_string())),
        }
    }

    async fn list_deliveries(
        &self,
        subscription_id: SubscriptionId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<DeliveryRecord>, StoreError> {
        let mut records = self.deliveries_for(subscription_id);
        records.reverse();
        Ok(records.into_iter().skip(offset).take(limit).collect())
    }

    async fn create_connection(&self, record: &ConnectionRecord) -> Result<(), StoreError> {
        self.connections
            .write()
            .insert(record.connection_id, record.clone());
        Ok(())
    }

    async fn touch_connection(
        &self,
        connection_id: ConnectionId,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        match self.connections.write().get_mut(&connection_id) {
            Some(row) => {
                row.last_ping_at = Some(at);
                Ok(())
            }
            None => Err(StoreError::RecordNotFound(connection_id.to_string())),
        }
    }

    async fn close_connection(
        &self,
        connection_id: ConnectionId,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        match self.connections.write().get_mut(&connection_id) {
            Some(row) => {
                row.disconnected_at.get_or_insert(at);
                Ok(())
            }
            None => Err(StoreError::RecordNotFound(connection_id.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{NewSubscription, TransportType};
    use chrono::Duration;

    fn sub(owner: &str, at: DateTime<Utc>) -> Subscription {
        Subscription::create(
            Owner::User(owner.into()),
            NewSubscription {
                name: "s".into(),
                transport: TransportType::Sse,
                channel_name: "teach1".into(),
                chaincode_name: None,
                event_name: None,
                webhook_url: None,
                webhook_secret: None,
                filters: Default::default(),
                active: None,
            },
            at,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_crud_roundtrip() {
        let store = InMemoryStore::new();
        let mut s = sub("u1", Utc::now());
        store.create(&s).await.unwrap();
        assert!(matches!(store.create(&s).await, Err(StoreError::Duplicate(_))));

        s.active = false;
        store.update(&s).await.unwrap();
        assert!(!store.get(s.id).await.unwrap().active);

        store.delete(s.id).await.unwrap();
        assert_eq!(store.get(s.id).await, Err(StoreError::NotFound(s.id)));
        assert_eq!(store.delete(s.id).await, Err(StoreError::NotFound(s.id)));
    }

    #[tokio::test]
    async fn test_list_is_owner_scoped_and_paginated() {
        let store = InMemoryStore::new();
        let base = Utc::now();
        let mut ids = Vec::new();
        for i in 0..5 {
            let s = sub("u1", base + Duration::seconds(i));
            ids.push(s.id);
            store.create(&s).await.unwrap();
        }
        store.create(&sub("u2", base)).await.unwrap();

        let owner = Owner::User("u1".into());
        let page = store.list(&owner, 2, 0).await.unwrap();
        assert_eq!(page.iter().map(|s| s.id).collect::<Vec<_>>(), vec![ids[4], ids[3]]);
        let page = store.list(&owner, 10, 4).await.unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].id, ids[0]);
        assert_eq!(store.list_all().await.unwrap().len(), 6);
    }

    #[tokio::test]
    async fn test_connection_close_is_sticky() {
        let store = InMemoryStore::new();
        let s = sub("u1", Utc::now());
        let conn = ConnectionRecord::open(
            s.id,
            ConnectionId::new(),
            TransportType::WebSocket,
            s.owner.clone(),
            Default::default(),
            Utc::now(),
        );
        store.create_connection(&conn).await.unwrap();

        let first = Utc::now();
        store.close_connection(conn.connection_id, first).await.unwrap();
        store
            .close_connection(conn.connection_id, first + Duration::seconds(5))
            .await
            .unwrap();
        assert_eq!(
            store.connection(conn.connection_id).unwrap().disconnected_at,
            Some(first)
        );
    }
}
