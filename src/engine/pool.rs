//! Worker pool: fixed number of workers sharing the dispatcher's channel.
//!
//! Per entry a worker decodes the task, announces the start, runs the
//! handler, acknowledges the entry and then announces completion. Failed
//! attempts are re-enqueued while retry budget remains and dead-lettered
//! once it is spent.

use std::sync::Arc;
use std::time::{Duration, Instant};

use opentelemetry::KeyValue;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, warn};

use crate::broadcast::StatusBroadcaster;
use crate::broker::{Broker, Entry};
use crate::error::{Error, Result};
use crate::event::StatusEvent;
use crate::handler::{HandlerRegistry, Progress};
use crate::model::{Status, Task};
use crate::queue::{self, StreamQueue};
use crate::telemetry::metrics;
use crate::telemetry::task::{record_state_transition, start_task_span};

/// Receiving half of the dispatcher channel, shared by all workers.
pub type SharedReceiver = Arc<Mutex<mpsc::Receiver<Entry>>>;

/// What happened to one delivered entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Handler succeeded; entry acknowledged.
    Completed,
    /// Handler failed with budget left; task re-enqueued, entry acknowledged.
    Retried { retries: u32 },
    /// Task moved to the dead-letter stream; entry acknowledged.
    DeadLettered,
    /// Entry could not be decoded; left pending.
    Invalid,
    /// A broker command failed mid-way; entry left pending for reclaim.
    BrokerError,
    /// Handler succeeded but the entry had already been acknowledged by
    /// another delivery; no completion is announced.
    Superseded,
}

/// Default interval between pending-entry refreshes while a handler runs.
const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(20);

struct Shared {
    broker: Arc<dyn Broker>,
    queue: StreamQueue,
    broadcaster: StatusBroadcaster,
    registry: HandlerRegistry,
    group: String,
    dead_letter_stream: String,
}

/// A fixed-size set of workers.
pub struct WorkerPool {
    shared: Arc<Shared>,
    size: usize,
    handler_timeout: Option<Duration>,
    heartbeat: Duration,
}

impl WorkerPool {
    /// Build a pool of `size` workers. Entries are acknowledged against
    /// `group` on the queue's stream.
    pub fn new(
        broker: Arc<dyn Broker>,
        queue: StreamQueue,
        broadcaster: StatusBroadcaster,
        registry: HandlerRegistry,
        group: impl Into<String>,
        dead_letter_stream: impl Into<String>,
        size: usize,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                broker,
                queue,
                broadcaster,
                registry,
                group: group.into(),
                dead_letter_stream: dead_letter_stream.into(),
            }),
            size: size.max(1),
            handler_timeout: None,
            heartbeat: DEFAULT_HEARTBEAT,
        }
    }

    /// Fail an attempt whose handler runs longer than `timeout`.
    pub fn handler_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.handler_timeout = timeout;
        self
    }

    /// Refresh the entry's pending time this often while its handler runs,
    /// so the reclaim sweep leaves it alone. Keep it well under the
    /// visibility timeout.
    pub fn heartbeat(mut self, every: Duration) -> Self {
        self.heartbeat = every.max(Duration::from_millis(1));
        self
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Worker number `n` (1-based), for driving entries by hand.
    pub fn worker(&self, n: usize) -> Worker {
        Worker {
            name: format!("worker-{n}"),
            shared: Arc::clone(&self.shared),
            handler_timeout: self.handler_timeout,
            heartbeat: self.heartbeat,
        }
    }

    /// Spawn every worker onto `set`. Each runs until the channel closes or
    /// `cancel` fires; a task already being processed is finished first.
    pub fn spawn(&self, set: &mut JoinSet<()>, rx: SharedReceiver, cancel: CancellationToken) {
        for n in 1..=self.size {
            let worker = self.worker(n);
            let rx = Arc::clone(&rx);
            let cancel = cancel.clone();
            set.spawn(async move { worker.run(rx, cancel).await });
        }
        info!(size = self.size, "worker pool started");
    }
}

/// One pool worker.
pub struct Worker {
    name: String,
    shared: Arc<Shared>,
    handler_timeout: Option<Duration>,
    heartbeat: Duration,
}

impl Worker {
    pub fn name(&self) -> &str {
        &self.name
    }

    async fn run(self, rx: SharedReceiver, cancel: CancellationToken) {
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => None,
                next = async { rx.lock().await.recv().await } => next,
            };
            let Some(entry) = next else {
                break;
            };
            self.process(entry).await;
        }
        info!(worker = %self.name, "worker stopped");
    }

    /// Process one claimed entry to its outcome.
    pub async fn process(&self, entry: Entry) -> Outcome {
        let mut task = match queue::decode_entry(&entry) {
            Ok(task) => task,
            Err(e) => {
                let reason = match e {
                    Error::InvalidEntry { .. } => "shape",
                    _ => "decode",
                };
                warn!(worker = %self.name, entry_id = %entry.id, "skipping entry, left pending: {e}");
                metrics::invalid_entries().add(1, &[KeyValue::new("reason", reason)]);
                return Outcome::Invalid;
            }
        };

        let span = start_task_span(&task.name, &task.id, entry.id, &self.name);
        async {
            info!("received task");

            let Some(handler) = self.shared.registry.get(&task.name) else {
                warn!(name = %task.name, "no handler for task name, dead-lettering");
                task.status = Status::Failed;
                let reason = format!("no handler registered for task name {}", task.name);
                return self.dead_letter(&entry, &task, &reason).await;
            };

            self.transition(&span, &mut task, Status::Running);
            self.publish(StatusEvent::processing(
                &task.id,
                &self.name,
                "Allocating resources and starting execution",
            ))
            .await;

            let progress = Progress::new(
                self.shared.broadcaster.clone(),
                task.id.clone(),
                self.name.clone(),
            );
            let started = Instant::now();
            let result = self
                .run_handler(&entry, handler.handle(&task, &progress))
                .await;
            let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

            match result {
                Ok(()) => {
                    metrics::task_duration_ms().record(
                        elapsed_ms,
                        &[
                            KeyValue::new("name", task.name.clone()),
                            KeyValue::new("outcome", "completed"),
                        ],
                    );
                    self.complete(&span, &entry, &mut task).await
                }
                Err(e) => {
                    metrics::task_duration_ms().record(
                        elapsed_ms,
                        &[
                            KeyValue::new("name", task.name.clone()),
                            KeyValue::new("outcome", "failed"),
                        ],
                    );
                    self.fail(&span, &entry, &mut task, e).await
                }
            }
        }
        .instrument(span.clone())
        .await
    }

    /// Drive the handler future to completion under the handler timeout,
    /// touching the pending entry every heartbeat meanwhile.
    async fn run_handler(
        &self,
        entry: &Entry,
        work: impl std::future::Future<Output = Result<()>>,
    ) -> Result<()> {
        let work = async {
            match self.handler_timeout {
                Some(limit) => tokio::time::timeout(limit, work)
                    .await
                    .unwrap_or(Err(Error::HandlerTimeout(limit))),
                None => work.await,
            }
        };
        tokio::pin!(work);

        let mut beat = tokio::time::interval(self.heartbeat);
        beat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately; the entry was just delivered.
        beat.tick().await;
        loop {
            tokio::select! {
                result = &mut work => return result,
                _ = beat.tick() => self.touch(entry).await,
            }
        }
    }

    async fn touch(&self, entry: &Entry) {
        match self
            .shared
            .broker
            .touch(self.shared.queue.stream(), &self.shared.group, entry.id)
            .await
        {
            Ok(true) => debug!(entry_id = %entry.id, "pending entry refreshed"),
            Ok(false) => warn!(entry_id = %entry.id, "entry no longer pending while handler runs"),
            Err(e) => warn!(entry_id = %entry.id, "heartbeat failed: {e}"),
        }
    }

    async fn complete(&self, span: &tracing::Span, entry: &Entry, task: &mut Task) -> Outcome {
        // Ack first: the completed event goes out only once the entry has
        // left the pending set, and only by the delivery that removed it.
        match self.ack(entry).await {
            Ok(true) => {}
            Ok(false) => {
                warn!("entry already acknowledged elsewhere, completion not announced");
                return Outcome::Superseded;
            }
            Err(e) => {
                error!("ack failed, entry will be redelivered: {e}");
                return Outcome::BrokerError;
            }
        }
        self.transition(span, task, Status::Completed);
        self.publish(StatusEvent::completed(&task.id, &self.name)).await;
        info!("finished and acked");
        Outcome::Completed
    }

    async fn fail(&self, span: &tracing::Span, entry: &Entry, task: &mut Task, e: Error) -> Outcome {
        task.retries += 1;
        warn!(retries = task.retries, max_retries = task.max_retries, "task attempt failed: {e}");

        if !task.can_retry() {
            self.transition(span, task, Status::Failed);
            let reason = format!(
                "Task failed after {} attempt(s): {e}",
                task.retries
            );
            return self.dead_letter(entry, task, &reason).await;
        }

        self.transition(span, task, Status::Pending);
        let message = format!(
            "Retry {}/{} queued after failure: {e}",
            task.retries, task.max_retries
        );
        if let Err(err) = self
            .shared
            .queue
            .append_with_message(task, &self.name, &message)
            .await {
            error!("re-enqueue failed, entry will be redelivered: {err}");
            return Outcome::BrokerError;
        }
        if let Err(err) = self.ack(entry).await {
            // The retry is already in the log; a redelivery of this entry
            // would run the task once more.
            error!("ack after re-enqueue failed: {err}");
            return Outcome::BrokerError;
        }
        Outcome::Retried {
            retries: task.retries,
        }
    }

    /// Move the task to the dead-letter stream, ack the entry and publish
    /// the terminal failed event.
    async fn dead_letter(&self, entry: &Entry, task: &Task, reason: &str) -> Outcome {
        let fields = match queue::encode_entry(task) {
            Ok(fields) => dead_letter_fields(fields, entry, reason),
            Err(e) => dead_letter_fields(entry.fields.clone(), entry, &format!("{reason} ({e})")),
        };
        if let Err(e) = self
            .shared
            .broker
            .append(&self.shared.dead_letter_stream, fields)
            .await
        {
            error!("dead-letter append failed, entry will be redelivered: {e}");
            return Outcome::BrokerError;
        }
        if let Err(e) = self.ack(entry).await {
            error!("ack after dead-letter failed: {e}");
            return Outcome::BrokerError;
        }
        self.publish(StatusEvent::failed(&task.id, &self.name, reason))
            .await;
        warn!(stream = %self.shared.dead_letter_stream, "task dead-lettered: {reason}");
        Outcome::DeadLettered
    }

    /// Whether this call removed the entry from the pending set.
    async fn ack(&self, entry: &Entry) -> Result<bool> {
        let acked = self
            .shared
            .broker
            .ack(self.shared.queue.stream(), &self.shared.group, entry.id)
            .await?;
        if !acked {
            warn!(entry_id = %entry.id, "entry was not pending at ack time");
        }
        Ok(acked)
    }

    async fn publish(&self, event: StatusEvent) {
        self.shared.broadcaster.publish(&event).await;
    }

    fn transition(&self, span: &tracing::Span, task: &mut Task, to: Status) {
        let from = task.status;
        if !from.can_transition_to(to) {
            warn!(%from, %to, "unexpected status transition");
        }
        record_state_transition(span, &from.to_string(), &to.to_string());
        metrics::task_state_transitions().add(
            1,
            &[
                KeyValue::new("from", from.to_string()),
                KeyValue::new("to", to.to_string()),
            ],
        );
        task.status = to;
    }
}

/// Fields for a dead-letter entry: the task (or original fields) plus the
/// reason and the entry it came from.
pub(crate) fn dead_letter_fields(
    fields: serde_json::Value,
    source: &Entry,
    reason: &str,
) -> serde_json::Value {
    let mut map = match fields {
        serde_json::Value::Object(map) => map,
        other => {
            let mut map = serde_json::Map::new();
            map.insert("original".to_string(), other);
            map
        }
    };
    map.insert("error".to_string(), serde_json::Value::String(reason.to_string()));
    map.insert("source_entry".to_string(), serde_json::json!(source.id.0));
    serde_json::Value::Object(map)
}
