//! Consumer-group dispatcher: claims new log entries and hands each one to
//! exactly one pool worker.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broker::{Broker, Entry};
use crate::error::Result;

/// Consumer name the dispatcher claims under. Fan-out to individual
/// workers happens after the claim, not at the broker.
pub const DISPATCHER_CONSUMER: &str = "dispatcher";

pub struct Dispatcher {
    broker: Arc<dyn Broker>,
    stream: String,
    group: String,
    block: Duration,
}

impl Dispatcher {
    pub fn new(broker: Arc<dyn Broker>, stream: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            broker,
            stream: stream.into(),
            group: group.into(),
            block: Duration::from_secs(5),
        }
    }

    /// How long one claim-read waits for a new entry before re-checking
    /// for shutdown.
    pub fn block(mut self, block: Duration) -> Self {
        self.block = block;
        self
    }

    /// Create the consumer group at the stream's tail if it does not exist.
    pub async fn ensure_group(&self) -> Result<()> {
        self.broker.create_group(&self.stream, &self.group).await
    }

    /// Claim entries until cancelled, handing each to `tx`.
    ///
    /// The send waits for a worker to take the entry, so a busy pool holds
    /// back further claims. Read errors are logged and the read is retried
    /// straight away; the blocking read paces the loop.
    pub async fn run(&self, tx: mpsc::Sender<Entry>, cancel: CancellationToken) -> Result<()> {
        self.ensure_group().await?;
        info!(stream = %self.stream, group = %self.group, "dispatcher started");

        loop {
            let read = tokio::select! {
                _ = cancel.cancelled() => break,
                read = self.broker.read_group(
                    &self.stream,
                    &self.group,
                    DISPATCHER_CONSUMER,
                    self.block,
                ) => read,
            };

            let entry = match read {
                Ok(Some(entry)) => entry,
                Ok(None) => continue,
                Err(e) => {
                    warn!(stream = %self.stream, group = %self.group, "claim-read failed: {e}, retrying");
                    tokio::task::yield_now().await;
                    continue;
                }
            };

            let entry_id = entry.id;
            debug!(%entry_id, "entry claimed");
            tokio::select! {
                _ = cancel.cancelled() => {
                    warn!(%entry_id, "shutting down with a claimed entry undelivered, it stays pending");
                    break;
                }
                sent = tx.send(entry) => {
                    if sent.is_err() {
                        warn!(%entry_id, "worker pool closed, entry stays pending");
                        break;
                    }
                }
            }
        }

        info!(stream = %self.stream, group = %self.group, "dispatcher stopped");
        Ok(())
    }
}
