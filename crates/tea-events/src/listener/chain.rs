//! The per-channel watch loop.
//!
//! One task per channel reads the ledger stream, canonicalizes each record and
//! dispatches the events inline, so events of a channel reach the sinks in
//! ledger order. A broken or finished stream is re-established after a
//! backoff delay that resets once records flow again.

use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::dispatcher::Dispatcher;
use crate::domain::{canonicalize, Backoff, RawLedgerRecord};
use crate::ports::{LedgerClient, MetricsSink, TimeSource};

/// What a chain listener needs to run
#[derive(Clone)]
pub(crate) struct ChainContext {
    pub(crate) ledger: Arc<dyn LedgerClient>,
    pub(crate) dispatcher: Arc<Dispatcher>,
    pub(crate) backoff: Backoff,
    pub(crate) metrics: Arc<dyn MetricsSink>,
    pub(crate) clock: Arc<dyn TimeSource>,
}

impl ChainContext {
    fn process(&self, channel: &str, record: &RawLedgerRecord) {
        let observed_at = self.clock.now();
        for result in canonicalize(channel, record, observed_at) {
            match result {
                Ok(event) => {
                    self.dispatcher.dispatch(event);
                }
                Err(e) => warn!(channel, error = %e, "skipping undecodable chaincode event"),
            }
        }
    }
}

/// Watch `channel` until `shutdown` fires or its sender is dropped.
pub(crate) async fn run(ctx: ChainContext, channel: String, mut shutdown: oneshot::Receiver<()>) {
    let mut failures: u32 = 0;

    loop {
        let watch = tokio::select! {
            biased;
            _ = &mut shutdown => break,
            watch = ctx.ledger.watch(&channel) => watch,
        };

        match watch {
            Ok(mut stream) => {
                info!(channel = %channel, "watching ledger channel");
                let ended = loop {
                    tokio::select! {
                        biased;
                        _ = &mut shutdown => {
                            info!(channel = %channel, "chain listener stopped");
                            return;
                        }
                        item = stream.next() => match item {
                            Some(Ok(record)) => {
                                failures = 0;
                                debug!(channel = %channel, block = record.block_number, events = record.events.len(), "ledger record");
                                ctx.process(&channel, &record);
                            }
                            Some(Err(e)) if !e.is_fatal() => {
                                warn!(channel = %channel, error = %e, "skipping ledger frame");
                            }
                            Some(Err(e)) => break Some(e),
                            None => break None,
                        }
                    }
                };
                match ended {
                    Some(e) => warn!(channel = %channel, error = %e, "ledger watch broke"),
                    None => warn!(channel = %channel, "ledger watch ended"),
                }
            }
            Err(e) => warn!(channel = %channel, error = %e, "ledger watch failed"),
        }

        failures = failures.saturating_add(1);
        ctx.metrics.ledger_reconnect(&channel);
        let delay = ctx.backoff.delay(failures);
        info!(channel = %channel, attempt = failures, delay_ms = delay.as_millis() as u64, "resubscribing to ledger");

        tokio::select! {
            biased;
            _ = &mut shutdown => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    info!(channel = %channel, "chain listener stopped");
}
