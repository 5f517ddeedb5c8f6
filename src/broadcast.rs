//! Status broadcaster: fan-out of lifecycle events to observers.
//!
//! `publish` is fire-and-forget. Nothing is persisted, so a subscriber only
//! sees events published after it attached. Every subscriber receives every
//! event; ordering holds per publisher issuing sequential calls.

use std::sync::Arc;

use futures::StreamExt;
use futures::stream::BoxStream;
use opentelemetry::KeyValue;
use tracing::{debug, warn};

use crate::broker::{Broker, MessageStream};
use crate::error::Result;
use crate::event::StatusEvent;
use crate::telemetry::metrics;

/// Default broadcast channel name.
pub const DEFAULT_CHANNEL: &str = "task_updates";

/// Live, infinite, non-restartable sequence of decoded status events.
pub type StatusStream = BoxStream<'static, StatusEvent>;

/// Publishes status events onto one broker channel.
#[derive(Clone)]
pub struct StatusBroadcaster {
    broker: Arc<dyn Broker>,
    channel: String,
}

impl StatusBroadcaster {
    pub fn new(broker: Arc<dyn Broker>, channel: impl Into<String>) -> Self {
        Self {
            broker,
            channel: channel.into(),
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Publish an event. Failures are logged and swallowed: observers are
    /// never allowed to hold up task processing.
    pub async fn publish(&self, event: &StatusEvent) {
        let payload = match event.to_json() {
            Ok(p) => p,
            Err(e) => {
                warn!(task_id = %event.id, "status event not encodable: {e}");
                return;
            }
        };
        match self.broker.publish(&self.channel, &payload).await {
            Ok(()) => {
                debug!(task_id = %event.id, status = %event.status, worker = %event.worker, "status published");
                metrics::events_published()
                    .add(1, &[KeyValue::new("status", event.status.to_string())]);
            }
            Err(e) => {
                warn!(task_id = %event.id, status = %event.status, "status publish failed: {e}");
            }
        }
    }

    /// Attach a subscriber receiving raw payloads exactly as published.
    /// This is what the observer relay forwards.
    pub async fn subscribe_raw(&self) -> Result<MessageStream> {
        self.broker.subscribe(&self.channel).await
    }

    /// Attach a subscriber receiving decoded events. Payloads that are not
    /// status events are skipped.
    pub async fn subscribe(&self) -> Result<StatusStream> {
        let raw = self.subscribe_raw().await?;
        let events = raw.filter_map(|payload| async move {
            match StatusEvent::from_json(&payload) {
                Ok(event) => Some(event),
                Err(e) => {
                    warn!("ignoring undecodable status payload: {e}");
                    None
                }
            }
        });
        Ok(events.boxed())
    }
}
