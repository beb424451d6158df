//! Scriptable in-process ledger.
//!
//! Every `watch` call gets its own unbounded channel. `publish` fans a record
//! out to all live watchers of a channel, `fail` breaks them.

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::domain::{LedgerError, RawLedgerRecord};
use crate::ports::{LedgerClient, LedgerStream};

type Watcher = mpsc::UnboundedSender<Result<RawLedgerRecord, LedgerError>>;

#[derive(Default)]
struct ChannelState {
    watchers: Vec<Watcher>,
    watch_calls: usize,
}

#[derive(Default)]
pub struct MemoryLedger {
    channels: Mutex<HashMap<String, ChannelState>>,
    unavailable: AtomicBool,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver a record to every live watcher of `channel`. Returns how many
    /// watchers received it.
    pub fn publish(&self, channel: &str, record: RawLedgerRecord) -> usize {
        let mut channels = self.channels.lock();
        let Some(state) = channels.get_mut(channel) else {
            return 0;
        };
        state
            .watchers
            .retain(|watcher| watcher.send(Ok(record.clone())).is_ok());
        state.watchers.len()
    }

    /// Send a fatal stream error to every watcher of `channel` and drop them.
    pub fn fail(&self, channel: &str, reason: &str) {
        if let Some(state) = self.channels.lock().get_mut(channel) {
            for watcher in state.watchers.drain(..) {
                let _ = watcher.send(Err(LedgerError::Stream(reason.to_string())));
            }
        }
    }

    /// End every watch stream of `channel` without an error.
    pub fn close(&self, channel: &str) {
        if let Some(state) = self.channels.lock().get_mut(channel) {
            state.watchers.clear();
        }
    }

    /// Make subsequent `watch` calls fail to connect.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Live watchers of `channel`
    pub fn watcher_count(&self, channel: &str) -> usize {
        self.channels
            .lock()
            .get_mut(channel)
            .map(|state| {
                state.watchers.retain(|w| !w.is_closed());
                state.watchers.len()
            })
            .unwrap_or(0)
    }

    /// Total `watch` calls made for `channel`, successful or not
    pub fn watch_calls(&self, channel: &str) -> usize {
        self.channels
            .lock()
            .get(channel)
            .map(|state| state.watch_calls)
            .unwrap_or(0)
    }

    /// Poll until `channel` has exactly `count` live watchers.
    pub async fn wait_for_watchers(&self, channel: &str, count: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.watcher_count(channel) == count {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

#[async_trait]
impl LedgerClient for MemoryLedger {
    async fn watch(&self, channel: &str) -> Result<LedgerStream, LedgerError> {
        let mut channels = self.channels.lock();
        let state = channels.entry(channel.to_string()).or_default();
        state.watch_calls += 1;

        if self.unavailable.load(Ordering::SeqCst) {
            return Err(LedgerError::Connect("ledger unavailable".into()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        state.watchers.push(tx);
        Ok(UnboundedReceiverStream::new(rx).boxed())
    }
}
