//! Core data model.
//!
//! A task is a unit of work handed from a producer to the worker pool. It
//! carries identity, an opaque payload, lifecycle status and retry counters.
//! Its JSON form is what travels inside a log entry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Retry budget used when the producer does not set one.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// A unit of work. Unknown fields are ignored when decoding, and every
/// field is always emitted when encoding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Producer-assigned identifier. Never reused.
    pub id: TaskId,

    /// Task type / label (e.g. "ExampleTask"). Selects the handler.
    pub name: String,

    /// Task-specific input. Opaque to the queue; base64 on the wire.
    #[serde(with = "payload_bytes", default)]
    pub payload: Vec<u8>,

    pub status: Status,

    /// Failed attempts so far.
    #[serde(default)]
    pub retries: u32,

    /// Failed attempts allowed before the task is dead-lettered.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    pub created_at: DateTime<Utc>,
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

impl Task {
    /// Create a pending task with a fresh id.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_id(TaskId::generate(), name)
    }

    /// Create a pending task with a caller-chosen id.
    pub fn with_id(id: TaskId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            payload: Vec::new(),
            status: Status::Pending,
            retries: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            created_at: Utc::now(),
        }
    }

    pub fn payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.payload = payload.into();
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.max_retries = n;
        self
    }

    /// Whether another attempt is allowed after the current failure count.
    pub fn can_retry(&self) -> bool {
        self.retries < self.max_retries
    }

    pub fn to_json(&self) -> crate::error::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(s: &str) -> crate::error::Result<Self> {
        Ok(serde_json::from_str(s)?)
    }
}

/// Newtype for task ids. Generated ids are UUID v4 strings, but any
/// non-empty string supplied by a producer is accepted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Lifecycle status of a task. Only ever advances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// In the log, waiting for a worker.
    Pending,
    /// Claimed by a worker and executing.
    Running,
    /// Done successfully. Terminal.
    Completed,
    /// Exhausted retries. Terminal.
    Failed,
}

impl Status {
    /// Can transition from self to `to`?
    ///
    /// `Running -> Pending` is the retry path: a failed attempt that still
    /// has budget goes back into the log.
    pub fn can_transition_to(self, to: Status) -> bool {
        use Status::*;
        matches!(
            (self, to),
            (Pending, Running) | (Running, Completed) | (Running, Failed) | (Running, Pending)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Completed | Status::Failed)
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Status::Pending => "pending",
            Status::Running => "running",
            Status::Completed => "completed",
            Status::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for Status {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Status::Pending),
            "running" => Ok(Status::Running),
            "completed" => Ok(Status::Completed),
            "failed" => Ok(Status::Failed),
            other => Err(crate::error::Error::Other(format!("unknown status: {other}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Payload encoding
// ---------------------------------------------------------------------------

/// Payload bytes as standard base64. A missing or null payload decodes
/// as empty.
mod payload_bytes {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Option::<String>::deserialize(deserializer)? {
            Some(s) => STANDARD.decode(s).map_err(serde::de::Error::custom),
            None => Ok(Vec::new()),
        }
    }
}
