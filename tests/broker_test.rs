//! Tests for the in-memory broker: log, consumer groups and pub/sub.

use std::time::Duration;

use futures::StreamExt;
use serde_json::json;
use taskstream::broker::{Broker, EntryId, MemoryBroker};
use taskstream::error::Error;

const STREAM: &str = "s";
const GROUP: &str = "g";
const NO_WAIT: Duration = Duration::ZERO;

async fn broker_with_group() -> MemoryBroker {
    let broker = MemoryBroker::new();
    broker.create_group(STREAM, GROUP).await.unwrap();
    broker
}

// ---------------------------------------------------------------------------
// Log and groups
// ---------------------------------------------------------------------------

#[tokio::test]
async fn append_ids_increase() {
    let broker = MemoryBroker::new();
    let a = broker.append(STREAM, json!({"n": 1})).await.unwrap();
    let b = broker.append(STREAM, json!({"n": 2})).await.unwrap();
    assert!(b > a);

    let entries = broker.entries(STREAM, 10).await.unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].id, a);
    assert_eq!(entries[1].fields["n"], 2);
}

#[tokio::test]
async fn group_reads_in_append_order() {
    let broker = broker_with_group().await;
    for n in 0..3 {
        broker.append(STREAM, json!({"n": n})).await.unwrap();
    }

    for n in 0..3 {
        let entry = broker
            .read_group(STREAM, GROUP, "c", NO_WAIT)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.fields["n"], n);
        assert_eq!(entry.delivery_count, 1);
    }
    assert!(broker.read_group(STREAM, GROUP, "c", NO_WAIT).await.unwrap().is_none());
}

#[tokio::test]
async fn group_starts_at_tail() {
    let broker = MemoryBroker::new();
    broker.append(STREAM, json!({"old": true})).await.unwrap();
    broker.create_group(STREAM, GROUP).await.unwrap();
    assert!(broker.read_group(STREAM, GROUP, "c", NO_WAIT).await.unwrap().is_none());

    broker.append(STREAM, json!({"new": true})).await.unwrap();
    let entry = broker.read_group(STREAM, GROUP, "c", NO_WAIT).await.unwrap().unwrap();
    assert_eq!(entry.fields["new"], true);
}

#[tokio::test]
async fn create_group_is_idempotent() {
    let broker = broker_with_group().await;
    broker.append(STREAM, json!({})).await.unwrap();

    // Re-creating must not move the cursor past the unread entry.
    broker.create_group(STREAM, GROUP).await.unwrap();
    assert!(broker.read_group(STREAM, GROUP, "c", NO_WAIT).await.unwrap().is_some());
}

#[tokio::test]
async fn read_without_group_fails() {
    let broker = MemoryBroker::new();
    broker.append(STREAM, json!({})).await.unwrap();
    assert!(broker.read_group(STREAM, "missing", "c", NO_WAIT).await.is_err());
}

#[tokio::test]
async fn groups_are_independent() {
    let broker = broker_with_group().await;
    broker.create_group(STREAM, "other").await.unwrap();
    broker.append(STREAM, json!({})).await.unwrap();

    assert!(broker.read_group(STREAM, GROUP, "c", NO_WAIT).await.unwrap().is_some());
    assert!(broker.read_group(STREAM, "other", "c", NO_WAIT).await.unwrap().is_some());
}

#[tokio::test]
async fn claimed_entry_is_pending_until_acked() {
    let broker = broker_with_group().await;
    let id = broker.append(STREAM, json!({})).await.unwrap();
    broker.read_group(STREAM, GROUP, "c1", NO_WAIT).await.unwrap();

    let pending = broker.pending(STREAM, GROUP).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, id);
    assert_eq!(pending[0].consumer, "c1");

    assert!(broker.ack(STREAM, GROUP, id).await.unwrap());
    assert!(broker.pending(STREAM, GROUP).await.unwrap().is_empty());
    // Second ack is a no-op.
    assert!(!broker.ack(STREAM, GROUP, id).await.unwrap());
}

#[tokio::test]
async fn ack_unknown_entry_returns_false() {
    let broker = broker_with_group().await;
    assert!(!broker.ack(STREAM, GROUP, EntryId(999)).await.unwrap());
}

#[tokio::test]
async fn unacked_entry_is_not_redelivered_by_group_read() {
    let broker = broker_with_group().await;
    broker.append(STREAM, json!({})).await.unwrap();
    broker.read_group(STREAM, GROUP, "c", NO_WAIT).await.unwrap();

    // A consumer that died without acking: the group cursor has moved on.
    assert!(broker.read_group(STREAM, GROUP, "c", NO_WAIT).await.unwrap().is_none());
    assert_eq!(broker.pending(STREAM, GROUP).await.unwrap().len(), 1);
}

#[tokio::test]
async fn claim_idle_transfers_stale_entries() {
    let broker = broker_with_group().await;
    let id = broker.append(STREAM, json!({"n": 1})).await.unwrap();
    broker.read_group(STREAM, GROUP, "crashed", NO_WAIT).await.unwrap();

    // Not idle long enough yet.
    let claimed = broker
        .claim_idle(STREAM, GROUP, "rescuer", Duration::from_secs(60), 10)
        .await
        .unwrap();
    assert!(claimed.is_empty());

    let claimed = broker
        .claim_idle(STREAM, GROUP, "rescuer", Duration::ZERO, 10)
        .await
        .unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].id, id);
    assert_eq!(claimed[0].delivery_count, 2);
    assert_eq!(claimed[0].fields["n"], 1);

    let pending = broker.pending(STREAM, GROUP).await.unwrap();
    assert_eq!(pending[0].consumer, "rescuer");
    assert_eq!(pending[0].delivery_count, 2);
}

#[tokio::test]
async fn claim_idle_respects_count() {
    let broker = broker_with_group().await;
    for _ in 0..3 {
        broker.append(STREAM, json!({})).await.unwrap();
        broker.read_group(STREAM, GROUP, "c", NO_WAIT).await.unwrap();
    }
    let claimed = broker
        .claim_idle(STREAM, GROUP, "r", Duration::ZERO, 2)
        .await
        .unwrap();
    assert_eq!(claimed.len(), 2);
}

#[tokio::test]
async fn blocking_read_wakes_on_append() {
    let broker = std::sync::Arc::new(broker_with_group().await);

    let reader = {
        let broker = broker.clone();
        tokio::spawn(async move {
            broker
                .read_group(STREAM, GROUP, "c", Duration::from_secs(5))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    broker.append(STREAM, json!({"late": true})).await.unwrap();

    let entry = tokio::time::timeout(Duration::from_secs(1), reader)
        .await
        .expect("reader should wake before its block expires")
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(entry.fields["late"], true);
}

#[tokio::test]
async fn unbounded_block_returns_available_entry_and_waits_for_appends() {
    let broker = std::sync::Arc::new(broker_with_group().await);
    broker.append(STREAM, json!({"n": 1})).await.unwrap();
    let first = broker
        .read_group(STREAM, GROUP, "c", Duration::MAX)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.fields["n"], 1);

    let reader = {
        let broker = broker.clone();
        tokio::spawn(async move { broker.read_group(STREAM, GROUP, "c", Duration::MAX).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    broker.append(STREAM, json!({"n": 2})).await.unwrap();

    let second = tokio::time::timeout(Duration::from_secs(1), reader)
        .await
        .expect("reader should wake on append")
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(second.fields["n"], 2);
}

#[tokio::test]
async fn touch_keeps_entry_from_idle_claims() {
    let broker = broker_with_group().await;
    let id = broker.append(STREAM, json!({})).await.unwrap();
    broker.read_group(STREAM, GROUP, "busy", NO_WAIT).await.unwrap();
    tokio::time::sleep(Duration::from_millis(60)).await;

    assert!(broker.touch(STREAM, GROUP, id).await.unwrap());
    let claimed = broker
        .claim_idle(STREAM, GROUP, "r", Duration::from_millis(50), 10)
        .await
        .unwrap();
    assert!(claimed.is_empty());
    let pending = broker.pending(STREAM, GROUP).await.unwrap();
    assert_eq!(pending[0].consumer, "busy");
    assert_eq!(pending[0].delivery_count, 1);

    assert!(broker.ack(STREAM, GROUP, id).await.unwrap());
    assert!(!broker.touch(STREAM, GROUP, id).await.unwrap());
}

#[tokio::test]
async fn blocking_read_times_out_empty() {
    let broker = broker_with_group().await;
    let read = broker
        .read_group(STREAM, GROUP, "c", Duration::from_millis(20))
        .await
        .unwrap();
    assert!(read.is_none());
}

// ---------------------------------------------------------------------------
// Pub/sub
// ---------------------------------------------------------------------------

#[tokio::test]
async fn every_subscriber_sees_every_message_in_order() {
    let broker = MemoryBroker::new();
    let mut a = broker.subscribe("ch").await.unwrap();
    let mut b = broker.subscribe("ch").await.unwrap();

    broker.publish("ch", "one").await.unwrap();
    broker.publish("ch", "two").await.unwrap();

    for sub in [&mut a, &mut b] {
        assert_eq!(sub.next().await.as_deref(), Some("one"));
        assert_eq!(sub.next().await.as_deref(), Some("two"));
    }
}

#[tokio::test]
async fn late_subscriber_gets_no_replay() {
    let broker = MemoryBroker::new();
    broker.publish("ch", "early").await.unwrap();

    let mut sub = broker.subscribe("ch").await.unwrap();
    broker.publish("ch", "late").await.unwrap();
    assert_eq!(sub.next().await.as_deref(), Some("late"));
}

#[tokio::test]
async fn channels_are_isolated() {
    let broker = MemoryBroker::new();
    let mut sub = broker.subscribe("a").await.unwrap();
    broker.publish("b", "elsewhere").await.unwrap();
    broker.publish("a", "here").await.unwrap();
    assert_eq!(sub.next().await.as_deref(), Some("here"));
}

#[tokio::test]
async fn publish_without_subscribers_succeeds() {
    let broker = MemoryBroker::new();
    broker.publish("nobody", "hello").await.unwrap();
}

// ---------------------------------------------------------------------------
// Availability
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unavailable_broker_fails_every_command() {
    let broker = broker_with_group().await;
    broker.set_available(false);

    assert!(matches!(broker.ping().await, Err(Error::BrokerUnavailable(_))));
    assert!(matches!(
        broker.append(STREAM, json!({})).await,
        Err(Error::BrokerUnavailable(_))
    ));
    assert!(broker.publish("ch", "x").await.is_err());
    assert!(broker.read_group(STREAM, GROUP, "c", NO_WAIT).await.is_err());

    broker.set_available(true);
    broker.ping().await.unwrap();
    broker.append(STREAM, json!({})).await.unwrap();
}
