//! Status events: the ephemeral lifecycle notifications fanned out to
//! observers.
//!
//! Events are not stored. They are created at a transition, published once,
//! and seen only by subscribers attached at that moment.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

use crate::model::TaskId;

/// Worker name used for events published on the producer side.
pub const MANAGER: &str = "manager";

/// Wire form: `{id, status, time (HH:MM:SS), worker, message}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusEvent {
    pub id: String,
    pub status: EventStatus,
    pub time: String,
    pub worker: String,
    pub message: String,
}

/// Status vocabulary understood by observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl std::fmt::Display for EventStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EventStatus::Pending => "pending",
            EventStatus::Processing => "processing",
            EventStatus::Completed => "completed",
            EventStatus::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

impl StatusEvent {
    /// Build an event stamped with the current local wall-clock time.
    pub fn new(
        task_id: &TaskId,
        status: EventStatus,
        worker: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::at(task_id, status, worker, message, Local::now())
    }

    pub fn at(
        task_id: &TaskId,
        status: EventStatus,
        worker: impl Into<String>,
        message: impl Into<String>,
        when: DateTime<Local>,
    ) -> Self {
        Self {
            id: task_id.to_string(),
            status,
            time: when.format("%H:%M:%S").to_string(),
            worker: worker.into(),
            message: message.into(),
        }
    }

    pub fn pending(task_id: &TaskId, message: impl Into<String>) -> Self {
        Self::new(task_id, EventStatus::Pending, MANAGER, message)
    }

    pub fn processing(task_id: &TaskId, worker: &str, message: impl Into<String>) -> Self {
        Self::new(task_id, EventStatus::Processing, worker, message)
    }

    pub fn completed(task_id: &TaskId, worker: &str) -> Self {
        Self::new(
            task_id,
            EventStatus::Completed,
            worker,
            "Task execution finalized successfully",
        )
    }

    pub fn failed(task_id: &TaskId, worker: &str, message: impl Into<String>) -> Self {
        Self::new(task_id, EventStatus::Failed, worker, message)
    }

    pub fn to_json(&self) -> crate::error::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(s: &str) -> crate::error::Result<Self> {
        Ok(serde_json::from_str(s)?)
    }
}
