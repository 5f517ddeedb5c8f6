//! The broker seam: an append-only log with consumer groups, plus
//! fire-and-forget pub/sub channels.
//!
//! One broker handle is shared by producers, the dispatcher, pool workers
//! and the reclaimer. Every component takes it explicitly at construction.
//! Implementations serialize concurrent commands themselves, so callers
//! never add locking around it.

pub mod memory;
pub mod postgres;

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::error::Result;

pub use memory::MemoryBroker;
pub use postgres::PgBroker;

/// Log-assigned entry identifier. Strictly increasing within a stream and
/// never shown to producers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryId(pub i64);

impl std::fmt::Display for EntryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An entry read from a stream.
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    pub id: EntryId,
    /// Field map as written by the producer (a JSON object).
    pub fields: serde_json::Value,
    /// How many times this entry has been handed to a group consumer.
    /// Zero for entries read outside a group.
    pub delivery_count: u32,
}

impl Entry {
    /// String value of a field, if present and a string.
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(|v| v.as_str())
    }
}

/// A delivered-but-unacknowledged entry in a consumer group.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingEntry {
    pub id: EntryId,
    pub consumer: String,
    /// Time since the entry was last delivered.
    pub idle: Duration,
    pub delivery_count: u32,
}

/// Live feed of channel payloads. Infinite while the broker lives; only
/// carries messages published after the subscription was made.
pub type MessageStream = BoxStream<'static, String>;

#[async_trait]
pub trait Broker: Send + Sync {
    /// Round-trip check against the backend.
    async fn ping(&self) -> Result<()>;

    /// Append an entry to the tail of `stream`, creating the stream if
    /// needed. Returns once the entry is durable; never waits for readers.
    async fn append(&self, stream: &str, fields: serde_json::Value) -> Result<EntryId>;

    /// Create `group` on `stream` positioned at the current tail. Creating a
    /// group that already exists is not an error and leaves it untouched.
    async fn create_group(&self, stream: &str, group: &str) -> Result<()>;

    /// Claim the next never-delivered entry for `group` on behalf of
    /// `consumer`, waiting up to `block` for one to arrive. The claimed entry
    /// stays pending in the group until acknowledged.
    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        block: Duration,
    ) -> Result<Option<Entry>>;

    /// Remove an entry from the group's pending set. Returns whether it was
    /// pending.
    async fn ack(&self, stream: &str, group: &str, id: EntryId) -> Result<bool>;

    /// Reset the idle time of a pending entry, keeping it out of reach of
    /// `claim_idle` while its holder is still working on it. Returns
    /// whether the entry was still pending.
    async fn touch(&self, stream: &str, group: &str, id: EntryId) -> Result<bool>;

    /// The group's pending set, oldest entry first.
    async fn pending(&self, stream: &str, group: &str) -> Result<Vec<PendingEntry>>;

    /// Transfer up to `count` entries that have been pending for at least
    /// `min_idle` to `consumer`, bumping their delivery counts.
    async fn claim_idle(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<Entry>>;

    /// Up to `limit` entries of `stream` from the head, regardless of groups.
    async fn entries(&self, stream: &str, limit: usize) -> Result<Vec<Entry>>;

    /// Publish a payload to every current subscriber of `channel`.
    async fn publish(&self, channel: &str, payload: &str) -> Result<()>;

    /// Attach a new subscriber to `channel`.
    async fn subscribe(&self, channel: &str) -> Result<MessageStream>;
}
