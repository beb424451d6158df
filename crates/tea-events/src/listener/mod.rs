//! Ref-counted chain listeners.
//!
//! A channel is watched while at least one active subscription names it. The
//! manager starts a listener on the 0→1 transition and stops it on 1→0; the
//! counts come from the registry's `ListenerDelta`s.

mod chain;

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::dispatcher::Dispatcher;
use crate::domain::Backoff;
use crate::ports::{LedgerClient, MetricsSink, TimeSource};
use crate::registry::ListenerDelta;
use chain::ChainContext;

struct Listener {
    refs: usize,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

pub struct ListenerManager {
    listeners: Mutex<HashMap<String, Listener>>,
    ctx: ChainContext,
}

impl ListenerManager {
    pub fn new(
        ledger: Arc<dyn LedgerClient>,
        dispatcher: Arc<Dispatcher>,
        backoff: Backoff,
        metrics: Arc<dyn MetricsSink>,
        clock: Arc<dyn TimeSource>,
    ) -> Self {
        Self {
            listeners: Mutex::new(HashMap::new()),
            ctx: ChainContext {
                ledger,
                dispatcher,
                backoff,
                metrics,
                clock,
            },
        }
    }

    /// Take a reference on `channel`, starting its listener if it was idle.
    /// Must be called from within a Tokio runtime.
    pub fn acquire(&self, channel: &str) -> usize {
        let mut listeners = self.listeners.lock();
        let refs = match listeners.get_mut(channel) {
            Some(listener) => {
                listener.refs += 1;
                listener.refs
            }
            None => {
                let (shutdown, rx) = oneshot::channel();
                let task = tokio::spawn(chain::run(self.ctx.clone(), channel.to_string(), rx));
                listeners.insert(
                    channel.to_string(),
                    Listener {
                        refs: 1,
                        shutdown,
                        task,
                    },
                );
                info!(channel, "chain listener started");
                1
            }
        };
        self.ctx.metrics.listeners_active(listeners.len());
        refs
    }

    /// Drop a reference on `channel`, stopping its listener on the last one.
    pub fn release(&self, channel: &str) -> usize {
        let mut listeners = self.listeners.lock();
        let Some(listener) = listeners.get_mut(channel) else {
            warn!(channel, "release of a channel without listener");
            return 0;
        };

        listener.refs = listener.refs.saturating_sub(1);
        let refs = listener.refs;
        if refs == 0 {
            if let Some(listener) = listeners.remove(channel) {
                let _ = listener.shutdown.send(());
                debug!(channel, "chain listener stopping");
            }
        }
        self.ctx.metrics.listeners_active(listeners.len());
        refs
    }

    /// Apply a registry delta, acquire before release so a subscription that
    /// stays on its channel never bounces the listener.
    pub fn apply(&self, delta: &ListenerDelta) {
        if let Some(channel) = &delta.acquire {
            self.acquire(channel);
        }
        if let Some(channel) = &delta.release {
            self.release(channel);
        }
    }

    pub fn ref_count(&self, channel: &str) -> usize {
        self.listeners
            .lock()
            .get(channel)
            .map(|l| l.refs)
            .unwrap_or(0)
    }

    pub fn is_listening(&self, channel: &str) -> bool {
        self.listeners.lock().contains_key(channel)
    }

    /// Channels with a running listener, sorted
    pub fn active_channels(&self) -> Vec<String> {
        let mut channels: Vec<String> = self.listeners.lock().keys().cloned().collect();
        channels.sort();
        channels
    }

    /// Stop every listener and wait up to `grace` for them to exit.
    pub async fn shutdown_all(&self, grace: Duration) {
        let drained: Vec<(String, Listener)> = self.listeners.lock().drain().collect();
        self.ctx.metrics.listeners_active(0);

        for (channel, listener) in drained {
            let _ = listener.shutdown.send(());
            let abort = listener.task.abort_handle();
            if tokio::time::timeout(grace, listener.task).await.is_err() {
                warn!(channel = %channel, "chain listener did not stop in time, aborting");
                abort.abort();
            }
        }
    }
}
