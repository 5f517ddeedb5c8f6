//! Error types for taskstream.

use thiserror::Error;

use crate::broker::EntryId;

#[derive(Debug, Error)]
pub enum Error {
    /// A task or event could not be encoded or decoded. Not retryable.
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("broker unavailable: {0}")]
    BrokerUnavailable(String),

    /// A claimed log entry does not carry the expected payload shape.
    #[error("invalid entry {entry_id}: {reason}")]
    InvalidEntry { entry_id: EntryId, reason: String },

    #[error("task handler failed: {0}")]
    HandlerFailure(String),

    #[error("task handler timed out after {0:?}")]
    HandlerTimeout(std::time::Duration),

    #[error("task has no id")]
    MissingTaskId,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl From<sqlx::Error> for Error {
    fn from(e: sqlx::Error) -> Self {
        Error::BrokerUnavailable(e.to_string())
    }
}

impl From<sqlx::migrate::MigrateError> for Error {
    fn from(e: sqlx::migrate::MigrateError) -> Self {
        Error::BrokerUnavailable(format!("migration failed: {e}"))
    }
}

impl Error {
    /// Whether the failure came from talking to the broker, as opposed to
    /// bad data or a failing handler.
    pub fn is_broker(&self) -> bool {
        matches!(self, Error::BrokerUnavailable(_))
    }
}

/// Error returned by [`crate::queue::Queue::enqueue`].
pub type QueueError = Error;

pub type Result<T> = std::result::Result<T, Error>;
