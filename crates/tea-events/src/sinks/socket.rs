//! WebSocket sink.
//!
//! Each upgraded connection gets a bounded outbound queue drained by its own
//! writer task. `deliver` only ever `try_send`s: a connection whose queue is
//! full is closed with policy-violation instead of stalling the listener.
//!
//! ```text
//!  deliver ──try_send──► [queue] ──► writer task ──► socket
//!                                        ▲  ping every N secs
//!  reader loop ── close signal ──────────┘
//!   (pong → touch record, rate-limited)
//! ```

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use dashmap::DashMap;
use futures::stream::SplitStream;
use futures::{SinkExt, StreamExt};
use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::{Envelope, Handoff, Sink, SinkError};
use crate::domain::{
    ClientInfo, ConnectionId, ConnectionRecord, Subscription, SubscriptionId, TransportType,
    WebSocketConfig,
};
use crate::ports::{MetricsSink, RateLimiter, SubscriptionStore, TimeSource};
use crate::registry::SubscriptionRegistry;

/// Why a socket is being closed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    ClientClosed,
    SlowConsumer,
    RateLimited,
    SubscriptionClosed,
    Shutdown,
}

impl CloseReason {
    fn frame(self) -> Option<CloseFrame<'static>> {
        let (code, reason) = match self {
            Self::ClientClosed => return None,
            Self::SlowConsumer => (1008, "slow consumer"),
            Self::RateLimited => (1008, "rate limit exceeded"),
            Self::SubscriptionClosed => (1000, "subscription closed"),
            Self::Shutdown => (1001, "server shutting down"),
        };
        Some(CloseFrame {
            code,
            reason: Cow::Borrowed(reason),
        })
    }
}

type CloseSignal = Arc<watch::Sender<Option<CloseReason>>>;

struct SocketHandle {
    connection_id: ConnectionId,
    tx: mpsc::Sender<Arc<str>>,
    close: CloseSignal,
}

fn signal(close: &watch::Sender<Option<CloseReason>>, reason: CloseReason) {
    // first reason wins
    close.send_if_modified(|current| {
        if current.is_none() {
            *current = Some(reason);
            true
        } else {
            false
        }
    });
}

/// A freshly registered connection slot
pub(crate) struct Attachment {
    pub(crate) connection_id: ConnectionId,
    pub(crate) rx: mpsc::Receiver<Arc<str>>,
    pub(crate) close_rx: watch::Receiver<Option<CloseReason>>,
    pub(crate) close_tx: CloseSignal,
}

pub struct SocketSink {
    connections: DashMap<SubscriptionId, Vec<SocketHandle>>,
    config: WebSocketConfig,
    registry: Arc<SubscriptionRegistry>,
    store: Arc<dyn SubscriptionStore>,
    rate_limiter: Arc<dyn RateLimiter>,
    metrics: Arc<dyn MetricsSink>,
    clock: Arc<dyn TimeSource>,
}

impl SocketSink {
    pub fn new(
        config: WebSocketConfig,
        registry: Arc<SubscriptionRegistry>,
        store: Arc<dyn SubscriptionStore>,
        rate_limiter: Arc<dyn RateLimiter>,
        metrics: Arc<dyn MetricsSink>,
        clock: Arc<dyn TimeSource>,
    ) -> Self {
        Self {
            connections: DashMap::new(),
            config,
            registry,
            store,
            rate_limiter,
            metrics,
            clock,
        }
    }

    pub fn config(&self) -> &WebSocketConfig {
        &self.config
    }

    /// Open connections for one subscription
    pub fn connection_count(&self, subscription_id: SubscriptionId) -> usize {
        self.connections
            .get(&subscription_id)
            .map(|handles| handles.len())
            .unwrap_or(0)
    }

    pub fn total_connections(&self) -> usize {
        self.connections.iter().map(|entry| entry.len()).sum()
    }

    pub(crate) fn attach(&self, subscription_id: SubscriptionId) -> Attachment {
        let connection_id = ConnectionId::new();
        let (tx, rx) = mpsc::channel(self.config.queue_capacity.max(1));
        let (close_tx, close_rx) = watch::channel(None);
        let close_tx = Arc::new(close_tx);

        self.connections
            .entry(subscription_id)
            .or_default()
            .push(SocketHandle {
                connection_id,
                tx,
                close: Arc::clone(&close_tx),
            });

        Attachment {
            connection_id,
            rx,
            close_rx,
            close_tx,
        }
    }

    /// Attach, then close straight away if the subscription was deleted or
    /// deactivated while the upgrade was in flight.
    pub(crate) fn attach_live(&self, subscription_id: SubscriptionId) -> Attachment {
        let attachment = self.attach(subscription_id);
        if !self.registry.contains(subscription_id) {
            signal(&attachment.close_tx, CloseReason::SubscriptionClosed);
            self.detach(subscription_id, attachment.connection_id);
        }
        attachment
    }

    fn detach(&self, subscription_id: SubscriptionId, connection_id: ConnectionId) {
        if let Some(mut handles) = self.connections.get_mut(&subscription_id) {
            handles.retain(|h| h.connection_id != connection_id);
        }
        self.connections
            .remove_if(&subscription_id, |_, handles| handles.is_empty());
    }

    /// Close every connection with `Shutdown`.
    pub fn shutdown(&self) {
        for entry in self.connections.iter() {
            for handle in entry.value() {
                signal(&handle.close, CloseReason::Shutdown);
            }
        }
        self.connections.clear();
    }

    /// Run one upgraded connection until either side closes it.
    pub async fn serve(self: Arc<Self>, socket: WebSocket, subscription: Subscription, client: ClientInfo) {
        let attachment = self.attach_live(subscription.id);
        let connection_id = attachment.connection_id;

        let record = ConnectionRecord::open(
            subscription.id,
            connection_id,
            TransportType::WebSocket,
            subscription.owner.clone(),
            client,
            self.clock.now(),
        );
        if let Err(e) = self.store.create_connection(&record).await {
            warn!(connection_id = %connection_id, error = %e, "failed to record socket connection");
        }
        self.metrics.socket_connection_opened();
        info!(
            subscription_id = %subscription.id,
            connection_id = %connection_id,
            remote = record.remote_addr.as_deref().unwrap_or("-"),
            "socket connected"
        );

        let (sender, receiver) = socket.split();
        let reader_close = attachment.close_rx.clone();
        let writer = tokio::spawn(write_loop(
            sender,
            attachment.rx,
            attachment.close_rx,
            self.config.ping_interval,
        ));

        let reason = self.read_loop(receiver, connection_id, reader_close).await;
        signal(&attachment.close_tx, reason);
        stop_writer(writer, self.config.close_timeout, connection_id).await;

        self.detach(subscription.id, connection_id);
        self.rate_limiter.forget(&inbound_key(connection_id));
        self.metrics.socket_connection_closed();
        if let Err(e) = self
            .store
            .close_connection(connection_id, self.clock.now())
            .await
        {
            warn!(connection_id = %connection_id, error = %e, "failed to close socket connection record");
        }
        let reason = (*attachment.close_tx.borrow()).unwrap_or(reason);
        info!(
            subscription_id = %subscription.id,
            connection_id = %connection_id,
            reason = ?reason,
            "socket disconnected"
        );
    }

    async fn read_loop(
        &self,
        mut receiver: SplitStream<WebSocket>,
        connection_id: ConnectionId,
        mut close_rx: watch::Receiver<Option<CloseReason>>,
    ) -> CloseReason {
        let key = inbound_key(connection_id);

        loop {
            tokio::select! {
                changed = close_rx.changed() => {
                    let reason = *close_rx.borrow();
                    return match (changed, reason) {
                        (Ok(()), Some(reason)) => reason,
                        _ => CloseReason::Shutdown,
                    };
                }
                message = receiver.next() => {
                    let message = match message {
                        Some(Ok(message)) => message,
                        Some(Err(e)) => {
                            debug!(connection_id = %connection_id, error = %e, "socket read error");
                            return CloseReason::ClientClosed;
                        }
                        None => return CloseReason::ClientClosed,
                    };

                    if !self.rate_limiter.check_and_consume(
                        &key,
                        self.config.inbound_messages,
                        self.config.inbound_window,
                    ) {
                        warn!(connection_id = %connection_id, "inbound message rate exceeded");
                        return CloseReason::RateLimited;
                    }

                    match message {
                        Message::Ping(_) | Message::Pong(_) => {
                            if let Err(e) = self
                                .store
                                .touch_connection(connection_id, self.clock.now())
                                .await
                            {
                                debug!(connection_id = %connection_id, error = %e, "failed to touch connection");
                            }
                        }
                        Message::Close(_) => return CloseReason::ClientClosed,
                        _ => debug!(connection_id = %connection_id, "ignoring inbound frame"),
                    }
                }
            }
        }
    }
}

fn inbound_key(connection_id: ConnectionId) -> String {
    format!("conn:{connection_id}")
}

/// Give the writer `grace` to flush its close frame; abort it if a send is
/// stuck on a client that stopped reading. Returns false when aborted.
async fn stop_writer(writer: JoinHandle<()>, grace: Duration, connection_id: ConnectionId) -> bool {
    let abort = writer.abort_handle();
    match tokio::time::timeout(grace, writer).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            warn!(connection_id = %connection_id, error = %e, "socket writer task failed");
            true
        }
        Err(_) => {
            warn!(connection_id = %connection_id, "socket writer stalled, aborting");
            abort.abort();
            false
        }
    }
}

async fn write_loop<S>(
    mut sender: S,
    mut rx: mpsc::Receiver<Arc<str>>,
    mut close_rx: watch::Receiver<Option<CloseReason>>,
    ping_interval: Duration,
) where
    S: futures::Sink<Message> + Unpin,
{
    let mut ping = interval_at(Instant::now() + ping_interval, ping_interval);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;

            changed = close_rx.changed() => {
                let reason = if changed.is_ok() { *close_rx.borrow() } else { Some(CloseReason::Shutdown) };
                if let Some(frame) = reason.and_then(CloseReason::frame) {
                    let _ = sender.send(Message::Close(Some(frame))).await;
                }
                break;
            }
            body = rx.recv() => match body {
                Some(body) => {
                    if sender.send(Message::Text(body.to_string())).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            _ = ping.tick() => {
                if sender.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        }
    }
}

impl Sink for SocketSink {
    fn transport(&self) -> TransportType {
        TransportType::WebSocket
    }

    fn deliver(
        &self,
        subscription: &Arc<Subscription>,
        envelope: &Envelope,
    ) -> Result<Handoff, SinkError> {
        let Some(mut handles) = self.connections.get_mut(&subscription.id) else {
            return Ok(Handoff::NoConsumer);
        };

        let mut queued = 0;
        let mut dropped = 0;
        handles.retain(|handle| match handle.tx.try_send(Arc::clone(&envelope.body)) {
            Ok(()) => {
                queued += 1;
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(
                    subscription_id = %subscription.id,
                    connection_id = %handle.connection_id,
                    "socket queue full, closing slow consumer"
                );
                signal(&handle.close, CloseReason::SlowConsumer);
                dropped += 1;
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
        let empty = handles.is_empty();
        drop(handles);
        if empty {
            self.connections
                .remove_if(&subscription.id, |_, handles| handles.is_empty());
        }

        match (queued, dropped) {
            (0, 0) => Ok(Handoff::NoConsumer),
            (0, _) => Err(SinkError::SlowConsumer(subscription.id)),
            (n, _) => Ok(Handoff::Queued(n)),
        }
    }

    fn close_subscription(&self, id: SubscriptionId) {
        if let Some((_, handles)) = self.connections.remove(&id) {
            for handle in &handles {
                signal(&handle.close, CloseReason::SubscriptionClosed);
            }
            debug!(subscription_id = %id, connections = handles.len(), "closed socket connections");
        }
    }
}
