//! Durable queue: producers append tasks to a named stream.
//!
//! Each log entry carries a single `task_data` field holding the task's
//! JSON. A successful enqueue also publishes the initial "pending" status
//! so observers see the task before any worker claims it.

use std::sync::Arc;

use async_trait::async_trait;
use opentelemetry::KeyValue;
use tracing::{info, warn};

use crate::broadcast::StatusBroadcaster;
use crate::broker::{Broker, Entry, EntryId};
use crate::error::{Error, QueueError, Result};
use crate::event::{EventStatus, MANAGER, StatusEvent};
use crate::model::Task;
use crate::telemetry::metrics;

/// Entry field holding the serialized task.
pub const TASK_FIELD: &str = "task_data";

/// Default stream name.
pub const DEFAULT_STREAM: &str = "task_stream";

const ACCEPTED: &str = "Task accepted and waiting in queue";

#[async_trait]
pub trait Queue: Send + Sync {
    /// Append a task to the log. Does not wait for any consumer.
    ///
    /// # Errors
    ///
    /// [`Error::MissingTaskId`] if the task has no id,
    /// [`Error::Serialization`] if it cannot be encoded and
    /// [`Error::BrokerUnavailable`] if the log cannot be written. Nothing is
    /// retried here.
    async fn enqueue(&self, task: &Task) -> std::result::Result<(), QueueError>;
}

/// Queue backed by a broker stream.
#[derive(Clone)]
pub struct StreamQueue {
    broker: Arc<dyn Broker>,
    stream: String,
    broadcaster: Option<StatusBroadcaster>,
}

impl StreamQueue {
    pub fn new(broker: Arc<dyn Broker>, stream: impl Into<String>) -> Self {
        Self {
            broker,
            stream: stream.into(),
            broadcaster: None,
        }
    }

    /// Publish a "pending" status on every successful enqueue.
    pub fn with_broadcaster(mut self, broadcaster: StatusBroadcaster) -> Self {
        self.broadcaster = Some(broadcaster);
        self
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }

    /// Append and return the log-assigned entry id. The id stays inside the
    /// consumer side; [`Queue::enqueue`] does not expose it.
    pub async fn append(&self, task: &Task) -> Result<EntryId> {
        self.append_with_message(task, MANAGER, ACCEPTED).await
    }

    /// Append with a custom origin and message on the pending event. Retries
    /// name the worker that re-enqueued the task.
    pub async fn append_with_message(
        &self,
        task: &Task,
        worker: &str,
        message: &str,
    ) -> Result<EntryId> {
        if task.id.is_empty() {
            return Err(Error::MissingTaskId);
        }

        let result = async {
            let fields = encode_entry(task)?;
            self.broker.append(&self.stream, fields).await
        }
        .await;

        metrics::tasks_enqueued().add(
            1,
            &[
                KeyValue::new("name", task.name.clone()),
                KeyValue::new("result", if result.is_ok() { "ok" } else { "error" }),
            ],
        );

        let entry_id = match result {
            Ok(id) => id,
            Err(e) => {
                warn!(task_id = %task.id, stream = %self.stream, "enqueue failed: {e}");
                return Err(e);
            }
        };
        info!(task_id = %task.id, %entry_id, stream = %self.stream, "task enqueued");

        if let Some(ref broadcaster) = self.broadcaster {
            broadcaster
                .publish(&StatusEvent::new(&task.id, EventStatus::Pending, worker, message))
                .await;
        }
        Ok(entry_id)
    }
}

#[async_trait]
impl Queue for StreamQueue {
    async fn enqueue(&self, task: &Task) -> std::result::Result<(), QueueError> {
        self.append(task).await.map(|_| ())
    }
}

/// Wire form of a task inside a log entry.
pub fn encode_entry(task: &Task) -> Result<serde_json::Value> {
    let mut fields = serde_json::Map::new();
    fields.insert(TASK_FIELD.to_string(), serde_json::Value::String(task.to_json()?));
    Ok(serde_json::Value::Object(fields))
}

/// Decode a claimed entry back into a task.
///
/// # Errors
///
/// [`Error::InvalidEntry`] if the `task_data` field is missing or not a
/// string; [`Error::Serialization`] if its content is not a task.
pub fn decode_entry(entry: &Entry) -> Result<Task> {
    let data = entry.field(TASK_FIELD).ok_or_else(|| Error::InvalidEntry {
        entry_id: entry.id,
        reason: format!("missing string field {TASK_FIELD}"),
    })?;
    Task::from_json(data)
}
