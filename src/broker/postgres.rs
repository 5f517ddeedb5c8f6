//! Durable broker on Postgres via direct SQLx.
//!
//! Streams live in `stream_entries`, group cursors in `stream_groups` and
//! delivered-but-unacknowledged entries in `stream_pending` (see
//! `migrations/`). Appends fire a NOTIFY so blocking group reads wake
//! promptly; a poll interval covers missed notifications. Pub/sub channels
//! map directly onto LISTEN/NOTIFY.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use opentelemetry::KeyValue;
use sqlx::PgPool;
use sqlx::postgres::{PgListener, PgPoolOptions};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{Broker, Entry, EntryId, MessageStream, PendingEntry};
use crate::error::{Error, Result};
use crate::telemetry::metrics;

/// NOTIFY channel carrying the name of the stream that was appended to.
const APPEND_CHANNEL: &str = "taskstream_appended";

/// Postgres-backed broker. Owns the connection pool shared by all components.
pub struct PgBroker {
    pool: PgPool,
    appended: Arc<Notify>,
    poll_interval: Duration,
    listener: JoinHandle<()>,
}

impl PgBroker {
    /// Connect to Postgres and start the append listener.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(url)
            .await?;
        Ok(Self::from_pool(pool))
    }

    /// Wrap an existing pool. Must be called inside a tokio runtime.
    pub fn from_pool(pool: PgPool) -> Self {
        let appended = Arc::new(Notify::new());
        let poll_interval = Duration::from_secs(1);
        let listener = tokio::spawn(listen_appends(
            pool.clone(),
            Arc::clone(&appended),
            poll_interval,
        ));
        Self {
            pool,
            appended,
            poll_interval,
            listener,
        }
    }

    /// Run all pending migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn try_claim(&self, stream: &str, group: &str, consumer: &str) -> Result<Option<Entry>> {
        let mut tx = self.pool.begin().await?;

        let cursor: Option<(i64,)> = sqlx::query_as(
            "SELECT last_delivered_id FROM stream_groups
             WHERE stream = $1 AND group_name = $2
             FOR UPDATE",
        )
        .bind(stream)
        .bind(group)
        .fetch_optional(&mut *tx)
        .await?;
        let Some((last_delivered,)) = cursor else {
            return Err(Error::Other(format!(
                "no consumer group {group} on stream {stream}"
            )));
        };

        let next: Option<(i64, serde_json::Value)> = sqlx::query_as(
            "SELECT id, fields FROM stream_entries
             WHERE stream = $1 AND id > $2
             ORDER BY id LIMIT 1",
        )
        .bind(stream)
        .bind(last_delivered)
        .fetch_optional(&mut *tx)
        .await?;
        let Some((id, fields)) = next else {
            return Ok(None);
        };

        sqlx::query(
            "INSERT INTO stream_pending (stream, group_name, entry_id, consumer)
             VALUES ($1, $2, $3, $4)",
        )
        .bind(stream)
        .bind(group)
        .bind(id)
        .bind(consumer)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE stream_groups SET last_delivered_id = $3
             WHERE stream = $1 AND group_name = $2",
        )
        .bind(stream)
        .bind(group)
        .bind(id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        record(stream, "read_group");

        Ok(Some(Entry {
            id: EntryId(id),
            fields,
            delivery_count: 1,
        }))
    }
}

impl Drop for PgBroker {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

/// Forward append notifications to blocked readers for the broker's lifetime.
async fn listen_appends(pool: PgPool, appended: Arc<Notify>, retry: Duration) {
    loop {
        let mut listener = match PgListener::connect_with(&pool).await {
            Ok(l) => l,
            Err(e) => {
                warn!("append listener connect failed: {e}, relying on poll");
                tokio::time::sleep(retry).await;
                continue;
            }
        };
        if let Err(e) = listener.listen(APPEND_CHANNEL).await {
            warn!("LISTEN {APPEND_CHANNEL} failed: {e}, relying on poll");
            tokio::time::sleep(retry).await;
            continue;
        }
        loop {
            match listener.recv().await {
                Ok(n) => {
                    debug!(stream = n.payload(), "append notification");
                    appended.notify_waiters();
                }
                Err(e) => {
                    warn!("PgListener error: {e}, falling back to poll");
                    break;
                }
            }
        }
    }
}

fn record(stream: &str, operation: &'static str) {
    metrics::stream_operations().add(
        1,
        &[
            KeyValue::new("stream", stream.to_string()),
            KeyValue::new("operation", operation),
        ],
    );
}

#[async_trait]
impl Broker for PgBroker {
    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn append(&self, stream: &str, fields: serde_json::Value) -> Result<EntryId> {
        let mut tx = self.pool.begin().await?;

        // Serialize appends per stream so ids commit in order and a reader
        // never advances its cursor past an id that is still in flight.
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(stream)
            .execute(&mut *tx)
            .await?;

        let (id,): (i64,) = sqlx::query_as(
            "INSERT INTO stream_entries (stream, fields) VALUES ($1, $2) RETURNING id",
        )
        .bind(stream)
        .bind(&fields)
        .fetch_one(&mut *tx)
        .await?;

        // NOTIFY is transactional: only fires on commit
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(APPEND_CHANNEL)
            .bind(stream)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        record(stream, "append");
        Ok(EntryId(id))
    }

    async fn create_group(&self, stream: &str, group: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO stream_groups (stream, group_name, last_delivered_id)
             VALUES ($1, $2, COALESCE((SELECT max(id) FROM stream_entries WHERE stream = $1), 0))
             ON CONFLICT (stream, group_name) DO NOTHING",
        )
        .bind(stream)
        .bind(group)
        .execute(&self.pool)
        .await?;
        record(stream, "create_group");
        Ok(())
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        block: Duration,
    ) -> Result<Option<Entry>> {
        let deadline = Instant::now().checked_add(block);
        loop {
            let notified = self.appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(entry) = self.try_claim(stream, group, consumer).await? {
                return Ok(Some(entry));
            }

            let now = Instant::now();
            let poll = now + self.poll_interval;
            let wake = match deadline {
                Some(deadline) if now >= deadline => return Ok(None),
                Some(deadline) => deadline.min(poll),
                None => poll,
            };
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(wake) => {}
            }
        }
    }

    async fn ack(&self, stream: &str, group: &str, id: EntryId) -> Result<bool> {
        let rows = sqlx::query(
            "DELETE FROM stream_pending
             WHERE stream = $1 AND group_name = $2 AND entry_id = $3",
        )
        .bind(stream)
        .bind(group)
        .bind(id.0)
        .execute(&self.pool)
        .await?
        .rows_affected();
        record(stream, "ack");
        Ok(rows > 0)
    }

    async fn touch(&self, stream: &str, group: &str, id: EntryId) -> Result<bool> {
        let rows = sqlx::query(
            "UPDATE stream_pending SET delivered_at = now()
             WHERE stream = $1 AND group_name = $2 AND entry_id = $3",
        )
        .bind(stream)
        .bind(group)
        .bind(id.0)
        .execute(&self.pool)
        .await?
        .rows_affected();
        record(stream, "touch");
        Ok(rows > 0)
    }

    async fn pending(&self, stream: &str, group: &str) -> Result<Vec<PendingEntry>> {
        let rows: Vec<(i64, String, f64, i32)> = sqlx::query_as(
            "SELECT entry_id, consumer,
                    EXTRACT(EPOCH FROM (now() - delivered_at))::float8,
                    delivery_count
             FROM stream_pending
             WHERE stream = $1 AND group_name = $2
             ORDER BY entry_id",
        )
        .bind(stream)
        .bind(group)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(id, consumer, idle_secs, count)| PendingEntry {
                id: EntryId(id),
                consumer,
                idle: Duration::from_secs_f64(idle_secs.max(0.0)),
                delivery_count: count.max(0) as u32,
            })
            .collect())
    }

    async fn claim_idle(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<Entry>> {
        let rows: Vec<(i64, i32, serde_json::Value)> = sqlx::query_as(
            "WITH stale AS (
                 SELECT entry_id FROM stream_pending
                 WHERE stream = $1 AND group_name = $2
                   AND delivered_at <= now() - make_interval(secs => $3)
                 ORDER BY entry_id
                 LIMIT $4
                 FOR UPDATE SKIP LOCKED
             )
             UPDATE stream_pending p
             SET consumer = $5, delivered_at = now(), delivery_count = p.delivery_count + 1
             FROM stale, stream_entries e
             WHERE p.stream = $1 AND p.group_name = $2
               AND p.entry_id = stale.entry_id AND e.id = p.entry_id
             RETURNING p.entry_id, p.delivery_count, e.fields",
        )
        .bind(stream)
        .bind(group)
        .bind(min_idle.as_secs_f64())
        .bind(count as i64)
        .bind(consumer)
        .fetch_all(&self.pool)
        .await?;
        record(stream, "claim_idle");

        let mut entries: Vec<Entry> = rows
            .into_iter()
            .map(|(id, count, fields)| Entry {
                id: EntryId(id),
                fields,
                delivery_count: count.max(0) as u32,
            })
            .collect();
        entries.sort_by_key(|e| e.id);
        Ok(entries)
    }

    async fn entries(&self, stream: &str, limit: usize) -> Result<Vec<Entry>> {
        let rows: Vec<(i64, serde_json::Value)> = sqlx::query_as(
            "SELECT id, fields FROM stream_entries WHERE stream = $1 ORDER BY id LIMIT $2",
        )
        .bind(stream)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(id, fields)| Entry {
                id: EntryId(id),
                fields,
                delivery_count: 0,
            })
            .collect())
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(channel)
            .bind(payload)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<MessageStream> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(channel).await?;
        let channel = channel.to_string();
        let stream = listener.into_stream().filter_map(move |n| {
            let channel = channel.clone();
            async move {
                match n {
                    Ok(n) => Some(n.payload().to_string()),
                    Err(e) => {
                        warn!(%channel, "subscription error: {e}");
                        None
                    }
                }
            }
        });
        Ok(stream.boxed())
    }
}
