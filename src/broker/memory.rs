//! Process-local broker on tokio primitives.
//!
//! Same semantics as the Postgres broker without durability across
//! restarts: FIFO streams with consumer-group cursors and pending sets,
//! blocking group reads woken on append, and broadcast channels for pub/sub.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::{Notify, broadcast};
use tokio::time::Instant;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tracing::warn;

use super::{Broker, Entry, EntryId, MessageStream, PendingEntry};
use crate::error::{Error, Result};

/// Buffered messages per channel before a slow subscriber starts lagging.
const CHANNEL_CAPACITY: usize = 1024;

#[derive(Default)]
struct Inner {
    streams: HashMap<String, StreamLog>,
    channels: HashMap<String, broadcast::Sender<String>>,
    next_id: i64,
}

#[derive(Default)]
struct StreamLog {
    entries: Vec<(EntryId, serde_json::Value)>,
    groups: HashMap<String, GroupCursor>,
}

struct GroupCursor {
    last_delivered: EntryId,
    pending: BTreeMap<EntryId, Delivery>,
}

struct Delivery {
    consumer: String,
    delivered_at: Instant,
    count: u32,
}

impl StreamLog {
    fn tail(&self) -> EntryId {
        self.entries.last().map(|(id, _)| *id).unwrap_or(EntryId(0))
    }

    fn get(&self, id: EntryId) -> Option<&serde_json::Value> {
        self.entries
            .binary_search_by_key(&id, |(eid, _)| *eid)
            .ok()
            .map(|i| &self.entries[i].1)
    }
}

/// In-memory broker. Cheap to construct; share it behind an `Arc`.
pub struct MemoryBroker {
    inner: Mutex<Inner>,
    appended: Notify,
    available: AtomicBool,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            appended: Notify::new(),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate losing (or regaining) the backend. While unavailable every
    /// command fails with [`Error::BrokerUnavailable`].
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn state(&self) -> Result<MutexGuard<'_, Inner>> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(Error::BrokerUnavailable("memory broker offline".to_string()));
        }
        Ok(self.inner.lock().unwrap_or_else(PoisonError::into_inner))
    }

    fn try_claim(&self, stream: &str, group: &str, consumer: &str) -> Result<Option<Entry>> {
        let mut inner = self.state()?;
        let log = inner
            .streams
            .get_mut(stream)
            .ok_or_else(|| no_group(stream, group))?;
        let cursor = log
            .groups
            .get(group)
            .ok_or_else(|| no_group(stream, group))?;

        let next = log.entries.partition_point(|(id, _)| *id <= cursor.last_delivered);
        let Some((id, fields)) = log.entries.get(next).cloned() else {
            return Ok(None);
        };

        if let Some(cursor) = log.groups.get_mut(group) {
            cursor.last_delivered = id;
            cursor.pending.insert(
                id,
                Delivery {
                    consumer: consumer.to_string(),
                    delivered_at: Instant::now(),
                    count: 1,
                },
            );
        }

        Ok(Some(Entry {
            id,
            fields,
            delivery_count: 1,
        }))
    }
}

fn no_group(stream: &str, group: &str) -> Error {
    Error::Other(format!("no consumer group {group} on stream {stream}"))
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn ping(&self) -> Result<()> {
        self.state().map(|_| ())
    }

    async fn append(&self, stream: &str, fields: serde_json::Value) -> Result<EntryId> {
        let id = {
            let mut inner = self.state()?;
            inner.next_id += 1;
            let id = EntryId(inner.next_id);
            inner
                .streams
                .entry(stream.to_string())
                .or_default()
                .entries
                .push((id, fields));
            id
        };
        self.appended.notify_waiters();
        Ok(id)
    }

    async fn create_group(&self, stream: &str, group: &str) -> Result<()> {
        let mut inner = self.state()?;
        let log = inner.streams.entry(stream.to_string()).or_default();
        let tail = log.tail();
        log.groups
            .entry(group.to_string())
            .or_insert_with(|| GroupCursor {
                last_delivered: tail,
                pending: BTreeMap::new(),
            });
        Ok(())
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        block: Duration,
    ) -> Result<Option<Entry>> {
        // No deadline when `block` is too large to represent: wait for an append.
        let deadline = Instant::now().checked_add(block);
        loop {
            // Register for wake-ups before looking, so an append between the
            // look and the wait is not missed.
            let notified = self.appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(entry) = self.try_claim(stream, group, consumer)? {
                return Ok(Some(entry));
            }

            match deadline {
                Some(deadline) if Instant::now() >= deadline => return Ok(None),
                Some(deadline) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep_until(deadline) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    async fn ack(&self, stream: &str, group: &str, id: EntryId) -> Result<bool> {
        let mut inner = self.state()?;
        let acked = inner
            .streams
            .get_mut(stream)
            .and_then(|log| log.groups.get_mut(group))
            .map(|cursor| cursor.pending.remove(&id).is_some())
            .unwrap_or(false);
        Ok(acked)
    }

    async fn touch(&self, stream: &str, group: &str, id: EntryId) -> Result<bool> {
        let mut inner = self.state()?;
        let touched = inner
            .streams
            .get_mut(stream)
            .and_then(|log| log.groups.get_mut(group))
            .and_then(|cursor| cursor.pending.get_mut(&id))
            .map(|d| d.delivered_at = Instant::now())
            .is_some();
        Ok(touched)
    }

    async fn pending(&self, stream: &str, group: &str) -> Result<Vec<PendingEntry>> {
        let inner = self.state()?;
        let now = Instant::now();
        let pending = inner
            .streams
            .get(stream)
            .and_then(|log| log.groups.get(group))
            .map(|cursor| {
                cursor
                    .pending
                    .iter()
                    .map(|(id, d)| PendingEntry {
                        id: *id,
                        consumer: d.consumer.clone(),
                        idle: now.saturating_duration_since(d.delivered_at),
                        delivery_count: d.count,
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(pending)
    }

    async fn claim_idle(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<Entry>> {
        let mut inner = self.state()?;
        let Some(log) = inner.streams.get_mut(stream) else {
            return Ok(Vec::new());
        };
        let now = Instant::now();

        let stale: Vec<EntryId> = match log.groups.get(group) {
            Some(cursor) => cursor
                .pending
                .iter()
                .filter(|(_, d)| now.saturating_duration_since(d.delivered_at) >= min_idle)
                .map(|(id, _)| *id)
                .take(count)
                .collect(),
            None => return Err(no_group(stream, group)),
        };

        let mut claimed = Vec::with_capacity(stale.len());
        for id in stale {
            let Some(fields) = log.get(id).cloned() else {
                continue;
            };
            if let Some(d) = log
                .groups
                .get_mut(group)
                .and_then(|cursor| cursor.pending.get_mut(&id))
            {
                d.consumer = consumer.to_string();
                d.delivered_at = now;
                d.count += 1;
                claimed.push(Entry {
                    id,
                    fields,
                    delivery_count: d.count,
                });
            }
        }
        Ok(claimed)
    }

    async fn entries(&self, stream: &str, limit: usize) -> Result<Vec<Entry>> {
        let inner = self.state()?;
        let entries = inner
            .streams
            .get(stream)
            .map(|log| {
                log.entries
                    .iter()
                    .take(limit)
                    .map(|(id, fields)| Entry {
                        id: *id,
                        fields: fields.clone(),
                        delivery_count: 0,
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(entries)
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        let mut inner = self.state()?;
        let tx = inner
            .channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        // No receivers is fine: nobody is listening, the message is dropped.
        let _ = tx.send(payload.to_string());
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<MessageStream> {
        let mut inner = self.state()?;
        let rx = inner
            .channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe();
        let channel = channel.to_string();
        let stream = BroadcastStream::new(rx).filter_map(move |msg| {
            let channel = channel.clone();
            async move {
                match msg {
                    Ok(payload) => Some(payload),
                    Err(BroadcastStreamRecvError::Lagged(n)) => {
                        warn!(%channel, skipped = n, "subscriber lagged, messages dropped");
                        None
                    }
                }
            }
        });
        Ok(stream.boxed())
    }
}
