//! Webhook sink.
//!
//! Every webhook subscription gets a lazily spawned worker with a bounded job
//! queue, so deliveries to one endpoint stay in order while retries never hold
//! up the chain listener or other subscriptions.
//!
//! Every hand-off becomes one `DeliveryRecord`, written `pending` as the job is
//! queued, updated after every attempt, and finished as `success` on the first
//! 2xx or `failed` once `max_attempts` are used up. A hand-off the queue
//! rejects is written straight away as `failed`, and jobs still outstanding
//! when shutdown gives up are marked `failed` too.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use reqwest::header::CONTENT_TYPE;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::signing;
use super::{Envelope, Handoff, Sink, SinkError};
use crate::domain::{
    DeliveryRecord, DeliveryStatus, GatewayError, Subscription, SubscriptionId, TransportType,
    WebhookConfig,
};
use crate::ports::{MetricsSink, SubscriptionStore, TimeSource};
use crate::registry::SubscriptionRegistry;

struct Job {
    subscription: Arc<Subscription>,
    envelope: Envelope,
    record: DeliveryRecord,
    /// Write of the pending row; awaited before the first update
    created: JoinHandle<()>,
}

struct Worker {
    tx: mpsc::Sender<Job>,
    task: JoinHandle<()>,
}

struct WebhookContext {
    client: reqwest::Client,
    config: WebhookConfig,
    store: Arc<dyn SubscriptionStore>,
    metrics: Arc<dyn MetricsSink>,
    clock: Arc<dyn TimeSource>,
    /// Latest state of every queued or in-flight delivery
    outstanding: DashMap<Uuid, DeliveryRecord>,
}

pub struct WebhookSink {
    workers: DashMap<SubscriptionId, Worker>,
    /// Released workers still finishing their queue
    draining: Mutex<Vec<JoinHandle<()>>>,
    ctx: Arc<WebhookContext>,
    registry: Arc<SubscriptionRegistry>,
    closed: AtomicBool,
}

impl WebhookSink {
    pub fn new(
        config: WebhookConfig,
        registry: Arc<SubscriptionRegistry>,
        store: Arc<dyn SubscriptionStore>,
        metrics: Arc<dyn MetricsSink>,
        clock: Arc<dyn TimeSource>,
    ) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .user_agent(concat!("tea-events/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| GatewayError::Internal(format!("webhook http client: {e}")))?;

        Ok(Self {
            workers: DashMap::new(),
            draining: Mutex::new(Vec::new()),
            ctx: Arc::new(WebhookContext {
                client,
                config,
                store,
                metrics,
                clock,
                outstanding: DashMap::new(),
            }),
            registry,
            closed: AtomicBool::new(false),
        })
    }

    /// Subscriptions with a running worker
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Deliveries handed off but not yet finished
    pub fn outstanding(&self) -> usize {
        self.ctx.outstanding.len()
    }

    fn spawn_worker(&self, subscription_id: SubscriptionId) -> Worker {
        let (tx, rx) = mpsc::channel(self.ctx.config.queue_capacity.max(1));
        let task = tokio::spawn(run_worker(Arc::clone(&self.ctx), subscription_id, rx));
        debug!(subscription_id = %subscription_id, "webhook worker started");
        Worker { tx, task }
    }

    /// Stop accepting jobs and give queued ones up to `grace` to finish.
    pub async fn shutdown(&self, grace: Duration) {
        self.closed.store(true, Ordering::SeqCst);

        let ids: Vec<SubscriptionId> = self.workers.iter().map(|w| *w.key()).collect();
        let mut tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.draining.lock());
        for id in ids {
            if let Some((_, worker)) = self.workers.remove(&id) {
                tasks.push(worker.task);
            }
        }
        let aborts: Vec<AbortHandle> = tasks.iter().map(JoinHandle::abort_handle).collect();

        if !tasks.is_empty()
            && tokio::time::timeout(grace, futures::future::join_all(tasks))
                .await
                .is_err()
        {
            warn!(workers = aborts.len(), "webhook workers did not drain in time, aborting");
            aborts.iter().for_each(AbortHandle::abort);
        }
        self.ctx.abandon_outstanding().await;
    }

    fn job(&self, subscription: &Arc<Subscription>, envelope: &Envelope, record: DeliveryRecord) -> Job {
        let store = Arc::clone(&self.ctx.store);
        let pending = record.clone();
        let created = tokio::spawn(async move {
            if let Err(e) = store.create_delivery(&pending).await {
                warn!(delivery_id = %pending.id, error = %e, "failed to persist pending delivery");
            }
        });
        Job {
            subscription: Arc::clone(subscription),
            envelope: envelope.clone(),
            record,
            created,
        }
    }

    fn pending_record(&self, subscription: &Subscription, url: &str, envelope: &Envelope) -> DeliveryRecord {
        DeliveryRecord::pending(
            subscription.id,
            envelope.event.event_id(),
            url.to_string(),
            envelope.body.to_string(),
            self.ctx.clock.now(),
        )
    }

    /// Persist a hand-off the queue refused as an already failed delivery.
    fn record_rejected(&self, mut record: DeliveryRecord, error: &SinkError) {
        record.reject(error.to_string(), self.ctx.clock.now());
        let store = Arc::clone(&self.ctx.store);
        tokio::spawn(async move {
            if let Err(e) = store.create_delivery(&record).await {
                warn!(delivery_id = %record.id, error = %e, "failed to persist rejected delivery");
            }
        });
    }
}

impl Sink for WebhookSink {
    fn transport(&self) -> TransportType {
        TransportType::Webhook
    }

    fn deliver(
        &self,
        subscription: &Arc<Subscription>,
        envelope: &Envelope,
    ) -> Result<Handoff, SinkError> {
        let Some(url) = subscription.webhook_url.as_deref() else {
            return Err(SinkError::MissingWebhookUrl(subscription.id));
        };
        if self.closed.load(Ordering::SeqCst) {
            let record = self.pending_record(subscription, url, envelope);
            self.record_rejected(record, &SinkError::Closed);
            return Err(SinkError::Closed);
        }

        let mut worker = match self.workers.entry(subscription.id) {
            Entry::Occupied(entry) => entry.into_ref(),
            Entry::Vacant(entry) => {
                // deleted or deactivated after the dispatcher matched it
                if !self.registry.contains(subscription.id) {
                    return Ok(Handoff::NoConsumer);
                }
                entry.insert(self.spawn_worker(subscription.id))
            }
        };
        if worker.tx.is_closed() {
            warn!(subscription_id = %subscription.id, "webhook worker gone, restarting");
            *worker = self.spawn_worker(subscription.id);
        }

        let record = self.pending_record(subscription, url, envelope);
        let outcome = match worker.tx.try_reserve() {
            Ok(permit) => {
                self.ctx.outstanding.insert(record.id, record.clone());
                permit.send(self.job(subscription, envelope, record));
                Ok(Handoff::Queued(1))
            }
            Err(_) => {
                let error = SinkError::QueueFull(subscription.id);
                self.record_rejected(record, &error);
                Err(error)
            }
        };
        outcome
    }

    fn close_subscription(&self, id: SubscriptionId) {
        // dropping the sender lets the worker finish what is queued and exit
        if let Some((_, worker)) = self.workers.remove(&id) {
            let mut draining = self.draining.lock();
            draining.retain(|task| !task.is_finished());
            draining.push(worker.task);
            debug!(subscription_id = %id, "webhook worker released");
        }
    }
}

async fn run_worker(
    ctx: Arc<WebhookContext>,
    subscription_id: SubscriptionId,
    mut rx: mpsc::Receiver<Job>,
) {
    while let Some(job) = rx.recv().await {
        ctx.deliver_with_retry(job).await;
    }
    debug!(subscription_id = %subscription_id, "webhook worker stopped");
}

impl WebhookContext {
    async fn deliver_with_retry(&self, job: Job) {
        let Job {
            subscription,
            envelope,
            mut record,
            created,
        } = job;
        let _ = created.await;
        let url = record.webhook_url.clone();
        let secret = subscription.webhook_secret.as_deref().unwrap_or_default();
        let signature = signing::sign(secret.as_bytes(), envelope.body.as_bytes());

        let max_attempts = self.config.max_attempts.max(1);
        for attempt in 1..=max_attempts {
            let started = Instant::now();
            match self
                .post(&url, &subscription, &envelope, &signature, attempt)
                .await
            {
                Ok((status, body)) => record.record_response(status, body, self.clock.now()),
                Err(e) => record.record_error(e.to_string(), self.clock.now()),
            }

            if record.status == DeliveryStatus::Success {
                self.metrics
                    .webhook_delivery_time_ms(started.elapsed().as_secs_f64() * 1000.0);
                self.persist(&record).await;
                info!(
                    subscription_id = %subscription.id,
                    event_id = %record.event_id,
                    attempts = record.attempts,
                    "webhook delivered"
                );
                return;
            }

            if attempt == max_attempts {
                break;
            }
            self.persist(&record).await;

            let delay = self.config.backoff.delay(attempt);
            debug!(
                subscription_id = %subscription.id,
                event_id = %record.event_id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = record.error_message.as_deref().unwrap_or("-"),
                "webhook attempt failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }

        record.mark_failed(self.clock.now());
        self.persist(&record).await;
        self.metrics.event_failed(TransportType::Webhook);
        warn!(
            subscription_id = %subscription.id,
            event_id = %record.event_id,
            attempts = record.attempts,
            error = record.error_message.as_deref().unwrap_or("-"),
            "webhook delivery failed"
        );
    }

    async fn persist(&self, record: &DeliveryRecord) {
        if record.is_terminal() {
            self.outstanding.remove(&record.id);
        } else {
            self.outstanding.insert(record.id, record.clone());
        }
        if let Err(e) = self.store.update_delivery(record).await {
            warn!(delivery_id = %record.id, error = %e, "failed to persist delivery record");
        }
    }

    /// Mark every delivery the workers never finished as failed.
    async fn abandon_outstanding(&self) {
        let ids: Vec<Uuid> = self.outstanding.iter().map(|r| *r.key()).collect();
        for id in ids {
            let Some((_, mut record)) = self.outstanding.remove(&id) else {
                continue;
            };
            record.reject("abandoned at shutdown".into(), self.clock.now());
            if self.store.update_delivery(&record).await.is_err() {
                if let Err(e) = self.store.create_delivery(&record).await {
                    warn!(delivery_id = %record.id, error = %e, "failed to persist abandoned delivery");
                }
            }
            self.metrics.event_failed(TransportType::Webhook);
        }
    }

    /// One POST. Returns the status code and the head of the response body.
    async fn post(
        &self,
        url: &str,
        subscription: &Subscription,
        envelope: &Envelope,
        signature: &str,
        attempt: u32,
    ) -> Result<(u16, String), reqwest::Error> {
        let event = &envelope.event;
        let mut response = self
            .client
            .post(url)
            .header(CONTENT_TYPE, "application/json")
            .header("X-Event-Type", "chaincode-event")
            .header("X-Subscription-ID", subscription.id.to_string())
            .header("X-Channel-Name", event.channel_name.as_str())
            .header("X-Chaincode-Name", event.chaincode_name.as_str())
            .header("X-Event-Name", event.event_name.as_str())
            .header("X-Transaction-ID", event.transaction_id.as_str())
            .header("X-Event-ID", event.event_id())
            .header("X-Delivery-Attempt", attempt.to_string())
            .header("X-Webhook-Signature", signature)
            .body(envelope.body.to_string())
            .send()
            .await?;

        let status = response.status().as_u16();
        let limit = self.config.response_body_limit;
        let mut body = Vec::new();
        while body.len() < limit {
            match response.chunk().await {
                Ok(Some(chunk)) => body.extend_from_slice(&chunk),
                _ => break,
            }
        }
        body.truncate(limit);
        Ok((status, String::from_utf8_lossy(&body).into_owned()))
    }
}
