//! Event pipeline service: wiring plus the subscription lifecycle.
//!
//! `EventPipeline` owns the registry, the chain listeners, the dispatcher and
//! the three sinks. Every create/update/delete is serialized behind one async
//! lock so the store, the registry and the listener ref-counts never disagree.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::adapters::prometheus::FanoutMetrics;
use crate::api;
use crate::dispatcher::Dispatcher;
use crate::domain::{
    DeliveryRecord, GatewayConfig, GatewayError, LifecycleError, NewSubscription, Owner,
    Subscription, SubscriptionId, SubscriptionPatch, TransportType,
};
use crate::listener::ListenerManager;
use crate::middleware::rate_limit::{cleanup_task, KeyedRateLimiter};
use crate::middleware::PipelineMetrics;
use crate::ports::{LedgerClient, MetricsSink, SubscriptionStore, SystemTimeSource, TimeSource};
use crate::registry::SubscriptionRegistry;
use crate::sinks::{SinkSet, SocketSink, StreamSink, WebhookSink};

/// Default page size for list endpoints
pub const DEFAULT_PAGE_SIZE: usize = 50;
/// Largest accepted page size
pub const MAX_PAGE_SIZE: usize = 100;

/// How long shutdown waits for listeners and webhook workers
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Pagination window, clamped to `1..=MAX_PAGE_SIZE`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub limit: usize,
    pub offset: usize,
}

impl Page {
    pub fn new(limit: Option<usize>, offset: Option<usize>) -> Self {
        Self {
            limit: limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE),
            offset: offset.unwrap_or(0),
        }
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new(None, None)
    }
}

/// External collaborators of the pipeline
pub struct PipelineDeps {
    pub store: Arc<dyn SubscriptionStore>,
    pub ledger: Arc<dyn LedgerClient>,
    pub clock: Arc<dyn TimeSource>,
    /// Extra metrics backends next to the built-in counters
    pub metrics: Vec<Arc<dyn MetricsSink>>,
}

impl PipelineDeps {
    pub fn new(store: Arc<dyn SubscriptionStore>, ledger: Arc<dyn LedgerClient>) -> Self {
        Self {
            store,
            ledger,
            clock: Arc::new(SystemTimeSource),
            metrics: Vec::new(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn TimeSource>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_metrics(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.metrics.push(sink);
        self
    }
}

pub struct EventPipeline {
    config: GatewayConfig,
    store: Arc<dyn SubscriptionStore>,
    registry: Arc<SubscriptionRegistry>,
    listeners: ListenerManager,
    dispatcher: Arc<Dispatcher>,
    sinks: SinkSet,
    rate_limiter: Arc<KeyedRateLimiter>,
    metrics: Arc<PipelineMetrics>,
    clock: Arc<dyn TimeSource>,
    lifecycle: tokio::sync::Mutex<()>,
    shutting_down: AtomicBool,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl EventPipeline {
    pub fn new(config: GatewayConfig, deps: PipelineDeps) -> Result<Arc<Self>, GatewayError> {
        config
            .validate()
            .map_err(|e| GatewayError::Config(e.to_string()))?;

        let PipelineDeps {
            store,
            ledger,
            clock,
            metrics: extra_metrics,
        } = deps;

        let metrics = Arc::new(PipelineMetrics::new());
        let metrics_sink: Arc<dyn MetricsSink> = if extra_metrics.is_empty() {
            metrics.clone()
        } else {
            let mut all: Vec<Arc<dyn MetricsSink>> = vec![metrics.clone()];
            all.extend(extra_metrics);
            Arc::new(FanoutMetrics::new(all))
        };

        let rate_limiter = Arc::new(KeyedRateLimiter::new());
        let registry = Arc::new(SubscriptionRegistry::new());

        let sinks = SinkSet {
            socket: Arc::new(SocketSink::new(
                config.websocket.clone(),
                Arc::clone(&registry),
                Arc::clone(&store),
                rate_limiter.clone(),
                Arc::clone(&metrics_sink),
                Arc::clone(&clock),
            )),
            stream: Arc::new(StreamSink::new(
                config.sse.clone(),
                Arc::clone(&registry),
                Arc::clone(&store),
                Arc::clone(&clock),
            )),
            webhook: Arc::new(WebhookSink::new(
                config.webhook.clone(),
                Arc::clone(&registry),
                Arc::clone(&store),
                Arc::clone(&metrics_sink),
                Arc::clone(&clock),
            )?),
        };

        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&registry),
            sinks.clone(),
            Arc::clone(&metrics_sink),
        ));

        let listeners = ListenerManager::new(
            ledger,
            Arc::clone(&dispatcher),
            config.listener.backoff.clone(),
            metrics_sink,
            Arc::clone(&clock),
        );

        Ok(Arc::new(Self {
            config,
            store,
            registry,
            listeners,
            dispatcher,
            sinks,
            rate_limiter,
            metrics,
            clock,
            lifecycle: tokio::sync::Mutex::new(()),
            shutting_down: AtomicBool::new(false),
            background: Mutex::new(Vec::new()),
        }))
    }

    /// Rebuild the registry from the store and start the listeners it needs.
    /// Returns the number of live subscriptions.
    pub async fn start(&self) -> Result<usize, GatewayError> {
        let _guard = self.lifecycle.lock().await;

        let subscriptions = self.store.list_all().await?;
        let total = subscriptions.len();
        for subscription in subscriptions {
            let delta = self.registry.register(subscription);
            self.listeners.apply(&delta);
        }

        // idle buckets, both REST `ip:` and socket `conn:` keys
        let interval = self.config.rate_limit.cleanup_interval;
        let max_age = (interval * 2).max(self.config.websocket.inbound_window);
        let task = tokio::spawn(cleanup_task(Arc::clone(&self.rate_limiter), interval, max_age));
        self.background.lock().push(task);

        info!(
            stored = total,
            live = self.registry.len(),
            channels = ?self.listeners.active_channels(),
            "event pipeline started"
        );
        Ok(self.registry.len())
    }

    fn ensure_running(&self) -> Result<(), LifecycleError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            Err(LifecycleError::ShuttingDown)
        } else {
            Ok(())
        }
    }

    /// Load a subscription, hiding other owners' subscriptions as not found.
    async fn owned(&self, owner: &Owner, id: SubscriptionId) -> Result<Subscription, LifecycleError> {
        let subscription = self.store.get(id).await?;
        if subscription.is_owned_by(owner) {
            Ok(subscription)
        } else {
            Err(LifecycleError::NotFound(id))
        }
    }

    pub async fn create_subscription(
        &self,
        owner: Owner,
        request: NewSubscription,
    ) -> Result<Subscription, LifecycleError> {
        self.ensure_running()?;
        let subscription = Subscription::create(owner, request, self.clock.now())?;

        let _guard = self.lifecycle.lock().await;
        self.store.create(&subscription).await?;
        let delta = self.registry.register(subscription.clone());
        self.listeners.apply(&delta);

        info!(
            subscription_id = %subscription.id,
            owner = %subscription.owner,
            transport = %subscription.transport,
            channel = %subscription.channel_name,
            active = subscription.active,
            "subscription created"
        );
        Ok(subscription)
    }

    pub async fn get_subscription(
        &self,
        owner: &Owner,
        id: SubscriptionId,
    ) -> Result<Subscription, LifecycleError> {
        self.owned(owner, id).await
    }

    pub async fn list_subscriptions(
        &self,
        owner: &Owner,
        page: Page,
    ) -> Result<Vec<Subscription>, LifecycleError> {
        Ok(self.store.list(owner, page.limit, page.offset).await?)
    }

    /// Apply a partial update. Deactivating detaches every push consumer.
    pub async fn update_subscription(
        &self,
        owner: &Owner,
        id: SubscriptionId,
        patch: SubscriptionPatch,
    ) -> Result<Subscription, LifecycleError> {
        self.ensure_running()?;
        let _guard = self.lifecycle.lock().await;

        let mut subscription = self.owned(owner, id).await?;
        let was_active = subscription.active;
        subscription.apply(patch, self.clock.now())?;
        self.store.update(&subscription).await?;

        let delta = self.registry.register(subscription.clone());
        self.listeners.apply(&delta);
        if was_active && !subscription.active {
            self.sinks.close_subscription(id);
        }

        info!(
            subscription_id = %id,
            active = subscription.active,
            "subscription updated"
        );
        Ok(subscription)
    }

    pub async fn delete_subscription(
        &self,
        owner: &Owner,
        id: SubscriptionId,
    ) -> Result<(), LifecycleError> {
        self.ensure_running()?;
        let _guard = self.lifecycle.lock().await;

        let subscription = self.owned(owner, id).await?;

        let delta = self.registry.unregister(id);
        self.listeners.apply(&delta);
        self.sinks.close_subscription(id);

        if let Err(e) = self.store.delete(id).await {
            // row still exists: put the live entry back
            let delta = self.registry.register(subscription);
            self.listeners.apply(&delta);
            return Err(e.into());
        }

        info!(subscription_id = %id, "subscription deleted");
        Ok(())
    }

    pub async fn list_deliveries(
        &self,
        owner: &Owner,
        id: SubscriptionId,
        page: Page,
    ) -> Result<Vec<DeliveryRecord>, LifecycleError> {
        self.owned(owner, id).await?;
        Ok(self
            .store
            .list_deliveries(id, page.limit, page.offset)
            .await?)
    }

    /// Check that a push connection may attach to `id`: the subscription
    /// exists, belongs to `owner` when one is given, uses `transport` and is
    /// active.
    pub async fn authorize_push(
        &self,
        owner: Option<&Owner>,
        id: SubscriptionId,
        transport: TransportType,
    ) -> Result<Subscription, LifecycleError> {
        self.ensure_running()?;
        let subscription = self.store.get(id).await?;

        if let Some(owner) = owner {
            if !subscription.is_owned_by(owner) {
                return Err(LifecycleError::NotFound(id));
            }
        }
        if subscription.transport != transport {
            return Err(LifecycleError::WrongTransport {
                id,
                expected: transport,
                actual: subscription.transport,
            });
        }
        if !subscription.active {
            return Err(LifecycleError::Inactive(id));
        }
        Ok(subscription)
    }

    /// Stop listeners, close push connections and drain webhook workers.
    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("event pipeline shutting down");

        self.listeners.shutdown_all(SHUTDOWN_GRACE).await;
        self.sinks.socket.shutdown();
        self.sinks.stream.shutdown();
        self.sinks.webhook.shutdown(SHUTDOWN_GRACE).await;

        for task in self.background.lock().drain(..) {
            task.abort();
        }
        info!("event pipeline stopped");
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Liveness and pipeline counters for `/health`
    pub fn health(&self) -> serde_json::Value {
        serde_json::json!({
            "status": if self.is_shutting_down() { "shutting_down" } else { "ok" },
            "version": crate::VERSION,
            "subscriptions": self.registry.len(),
            "channels": self.listeners.active_channels(),
            "sockets": self.sinks.socket.total_connections(),
            "streams": self.sinks.stream.open_streams(),
            "webhookWorkers": self.sinks.webhook.worker_count(),
            "metrics": self.metrics.to_json(),
        })
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    pub fn listeners(&self) -> &ListenerManager {
        &self.listeners
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn sinks(&self) -> &SinkSet {
        &self.sinks
    }

    pub fn metrics(&self) -> &Arc<PipelineMetrics> {
        &self.metrics
    }

    pub fn rate_limiter(&self) -> &Arc<KeyedRateLimiter> {
        &self.rate_limiter
    }

    /// Serve the HTTP surface on `listener` until `shutdown` resolves, then
    /// shut the pipeline down so open streams end and the server can drain.
    pub async fn serve<F>(self: Arc<Self>, listener: TcpListener, shutdown: F) -> Result<(), GatewayError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = listener
            .local_addr()
            .map_err(|e| GatewayError::Bind(e.to_string()))?;
        let app = api::router(Arc::clone(&self));
        info!(addr = %addr, "HTTP server listening");

        let pipeline = Arc::clone(&self);
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            shutdown.await;
            pipeline.shutdown().await;
        })
        .await
        .map_err(|e| GatewayError::Internal(e.to_string()))
    }

    /// Bind `addr` and serve in the background.
    pub async fn spawn_server(self: &Arc<Self>, addr: SocketAddr) -> Result<ServerHandle, GatewayError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| GatewayError::Bind(format!("{addr}: {e}")))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| GatewayError::Bind(e.to_string()))?;

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let pipeline = Arc::clone(self);
        let task = tokio::spawn(async move {
            let result = pipeline
                .serve(listener, async move {
                    let _ = shutdown_rx.await;
                })
                .await;
            if let Err(e) = &result {
                error!(error = %e, "HTTP server failed");
            }
            result
        });

        Ok(ServerHandle {
            addr: local_addr,
            shutdown: Some(shutdown_tx),
            task,
        })
    }
}

/// A running server started with `EventPipeline::spawn_server`
pub struct ServerHandle {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<(), GatewayError>>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Trigger graceful shutdown and wait for the server to finish.
    pub async fn stop(mut self) -> Result<(), GatewayError> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        match self.task.await {
            Ok(result) => result,
            Err(e) => {
                warn!(error = %e, "HTTP server task ended abnormally");
                Err(GatewayError::Internal(e.to_string()))
            }
        }
    }
}
