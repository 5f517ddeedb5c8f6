//! Reclaim sweep: entries left pending too long (crashed or hung worker,
//! undecodable payload) are claimed again and handed back to the pool.
//! Entries delivered more than `max_deliveries` times are dead-lettered and
//! announced as failed.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broadcast::StatusBroadcaster;
use crate::broker::{Broker, Entry};
use crate::engine::pool::dead_letter_fields;
use crate::error::Result;
use crate::event::StatusEvent;
use crate::queue;

/// Consumer name reclaimed entries are transferred to.
pub const RECLAIM_CONSUMER: &str = "reclaimer";

/// Entries claimed per sweep.
const SWEEP_BATCH: usize = 100;

/// Counts from one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub redelivered: usize,
    pub dead_lettered: usize,
}

pub struct Reclaimer {
    broker: Arc<dyn Broker>,
    broadcaster: StatusBroadcaster,
    stream: String,
    group: String,
    dead_letter_stream: String,
    visibility_timeout: Duration,
    interval: Duration,
    max_deliveries: u32,
}

impl Reclaimer {
    pub fn new(
        broker: Arc<dyn Broker>,
        broadcaster: StatusBroadcaster,
        stream: impl Into<String>,
        group: impl Into<String>,
        dead_letter_stream: impl Into<String>,
    ) -> Self {
        Self {
            broker,
            broadcaster,
            stream: stream.into(),
            group: group.into(),
            dead_letter_stream: dead_letter_stream.into(),
            visibility_timeout: Duration::from_secs(60),
            interval: Duration::from_secs(15),
            max_deliveries: 5,
        }
    }

    /// How long an entry may stay pending before it is reclaimed.
    pub fn visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Deliveries allowed before an entry is dead-lettered instead.
    pub fn max_deliveries(mut self, n: u32) -> Self {
        self.max_deliveries = n;
        self
    }

    /// Claim stale entries once. Redeliverable ones are sent to `tx`.
    pub async fn sweep(&self, tx: &mpsc::Sender<Entry>) -> Result<SweepReport> {
        let stale = self
            .broker
            .claim_idle(
                &self.stream,
                &self.group,
                RECLAIM_CONSUMER,
                self.visibility_timeout,
                SWEEP_BATCH,
            )
            .await?;

        let mut report = SweepReport::default();
        for entry in stale {
            if entry.delivery_count > self.max_deliveries {
                self.dead_letter(&entry).await?;
                report.dead_lettered += 1;
                continue;
            }
            info!(entry_id = %entry.id, deliveries = entry.delivery_count, "redelivering stale entry");
            if tx.send(entry).await.is_err() {
                break;
            }
            report.redelivered += 1;
        }
        Ok(report)
    }

    async fn dead_letter(&self, entry: &Entry) -> Result<()> {
        let reason = format!("exceeded {} deliveries", self.max_deliveries);
        let fields = dead_letter_fields(entry.fields.clone(), entry, &reason);
        self.broker.append(&self.dead_letter_stream, fields).await?;
        self.broker.ack(&self.stream, &self.group, entry.id).await?;
        // Undecodable entries have no task id to report against.
        if let Ok(task) = queue::decode_entry(entry) {
            self.broadcaster
                .publish(&StatusEvent::failed(&task.id, RECLAIM_CONSUMER, &reason))
                .await;
        }
        warn!(entry_id = %entry.id, deliveries = entry.delivery_count, stream = %self.dead_letter_stream, "entry dead-lettered: {reason}");
        Ok(())
    }

    /// Sweep every `interval` until cancelled.
    pub async fn run(&self, tx: mpsc::Sender<Entry>, cancel: CancellationToken) {
        info!(
            stream = %self.stream,
            group = %self.group,
            visibility_timeout_secs = self.visibility_timeout.as_secs(),
            "reclaimer started"
        );
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let swept = tokio::select! {
                _ = cancel.cancelled() => break,
                swept = self.sweep(&tx) => swept,
            };
            match swept {
                Ok(report) if report != SweepReport::default() => {
                    info!(redelivered = report.redelivered, dead_lettered = report.dead_lettered, "reclaim sweep");
                }
                Ok(_) => debug!("reclaim sweep found nothing"),
                Err(e) => warn!("reclaim sweep failed: {e}"),
            }
        }
        info!("reclaimer stopped");
    }
}
