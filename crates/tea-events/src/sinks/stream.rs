//! Server-sent events sink.
//!
//! At most one stream per subscription: opening a new one ends the previous.
//! Each open stream waits on three things at once and ends on the first:
//! the next queued event, its `done` signal (replaced, deleted, overflowed or
//! shutdown), or the client going away (the body stream is dropped).

use axum::response::sse::Event;
use dashmap::DashMap;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use super::{Envelope, Handoff, Sink, SinkError};
use crate::domain::{
    ClientInfo, ConnectionId, ConnectionRecord, SseConfig, Subscription, SubscriptionId,
    TransportType,
};
use crate::ports::{SubscriptionStore, TimeSource};
use crate::registry::SubscriptionRegistry;

struct StreamEntry {
    connection_id: ConnectionId,
    tx: mpsc::Sender<Arc<str>>,
    done: watch::Sender<bool>,
}

impl StreamEntry {
    fn finish(&self) {
        self.done.send_replace(true);
    }
}

pub struct StreamSink {
    entries: DashMap<SubscriptionId, StreamEntry>,
    config: SseConfig,
    registry: Arc<SubscriptionRegistry>,
    store: Arc<dyn SubscriptionStore>,
    clock: Arc<dyn TimeSource>,
}

/// Deregisters the stream when axum drops the response body.
struct StreamGuard {
    sink: Arc<StreamSink>,
    subscription_id: SubscriptionId,
    connection_id: ConnectionId,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        let connection_id = self.connection_id;
        self.sink
            .entries
            .remove_if(&self.subscription_id, |_, entry| entry.connection_id == connection_id);

        let store = Arc::clone(&self.sink.store);
        let at = self.sink.clock.now();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(e) = store.close_connection(connection_id, at).await {
                    warn!(connection_id = %connection_id, error = %e, "failed to close stream connection record");
                }
            });
        }
        info!(
            subscription_id = %self.subscription_id,
            connection_id = %connection_id,
            "event stream closed"
        );
    }
}

struct StreamState {
    rx: mpsc::Receiver<Arc<str>>,
    done: watch::Receiver<bool>,
    _guard: StreamGuard,
}

impl StreamSink {
    pub fn new(
        config: SseConfig,
        registry: Arc<SubscriptionRegistry>,
        store: Arc<dyn SubscriptionStore>,
        clock: Arc<dyn TimeSource>,
    ) -> Self {
        Self {
            entries: DashMap::new(),
            config,
            registry,
            store,
            clock,
        }
    }

    pub fn config(&self) -> &SseConfig {
        &self.config
    }

    pub fn is_open(&self, subscription_id: SubscriptionId) -> bool {
        self.entries.contains_key(&subscription_id)
    }

    pub fn open_streams(&self) -> usize {
        self.entries.len()
    }

    /// Register a stream for `subscription` and return its event body.
    pub async fn open(
        self: &Arc<Self>,
        subscription: &Subscription,
        client: ClientInfo,
    ) -> BoxStream<'static, Result<Event, Infallible>> {
        let connection_id = ConnectionId::new();
        let (tx, rx) = mpsc::channel(self.config.queue_capacity.max(1));
        let (done_tx, done_rx) = watch::channel(false);

        let entry = StreamEntry {
            connection_id,
            tx,
            done: done_tx,
        };
        if let Some(previous) = self.entries.insert(subscription.id, entry) {
            debug!(
                subscription_id = %subscription.id,
                replaced = %previous.connection_id,
                "replacing open event stream"
            );
            previous.finish();
        }
        // deleted or deactivated between authorization and here
        if !self.registry.contains(subscription.id) {
            if let Some((_, entry)) = self
                .entries
                .remove_if(&subscription.id, |_, e| e.connection_id == connection_id)
            {
                entry.finish();
            }
        }

        let record = ConnectionRecord::open(
            subscription.id,
            connection_id,
            TransportType::Sse,
            subscription.owner.clone(),
            client,
            self.clock.now(),
        );
        if let Err(e) = self.store.create_connection(&record).await {
            warn!(connection_id = %connection_id, error = %e, "failed to record stream connection");
        }
        info!(
            subscription_id = %subscription.id,
            connection_id = %connection_id,
            "event stream opened"
        );

        let state = StreamState {
            rx,
            done: done_rx,
            _guard: StreamGuard {
                sink: Arc::clone(self),
                subscription_id: subscription.id,
                connection_id,
            },
        };

        futures::stream::unfold(state, |mut state| async move {
            let body = tokio::select! {
                biased;

                _ = state.done.wait_for(|done| *done) => None,
                body = state.rx.recv() => body,
            }?;
            Some((Ok::<_, Infallible>(Event::default().data(body.as_ref())), state))
        })
        .boxed()
    }

    /// End every open stream.
    pub fn shutdown(&self) {
        for entry in self.entries.iter() {
            entry.finish();
        }
        self.entries.clear();
    }
}

impl Sink for StreamSink {
    fn transport(&self) -> TransportType {
        TransportType::Sse
    }

    fn deliver(
        &self,
        subscription: &Arc<Subscription>,
        envelope: &Envelope,
    ) -> Result<Handoff, SinkError> {
        let Some(entry) = self.entries.get(&subscription.id) else {
            return Ok(Handoff::NoConsumer);
        };

        match entry.tx.try_send(Arc::clone(&envelope.body)) {
            Ok(()) => Ok(Handoff::Queued(1)),
            Err(mpsc::error::TrySendError::Full(_)) => {
                let connection_id = entry.connection_id;
                warn!(
                    subscription_id = %subscription.id,
                    connection_id = %connection_id,
                    "stream queue full, closing slow consumer"
                );
                entry.finish();
                drop(entry);
                self.entries
                    .remove_if(&subscription.id, |_, e| e.connection_id == connection_id);
                Err(SinkError::SlowConsumer(subscription.id))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                let connection_id = entry.connection_id;
                drop(entry);
                self.entries
                    .remove_if(&subscription.id, |_, e| e.connection_id == connection_id);
                Ok(Handoff::NoConsumer)
            }
        }
    }

    fn close_subscription(&self, id: SubscriptionId) {
        if let Some((_, entry)) = self.entries.remove(&id) {
            entry.finish();
        }
    }
}
