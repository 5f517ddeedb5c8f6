//! Task handlers: the pluggable part of task execution.
//!
//! The pool resolves a handler by task name. A handler may report
//! intermediate progress, which observers see as "processing" events.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::broadcast::StatusBroadcaster;
use crate::error::Result;
use crate::event::StatusEvent;
use crate::model::{Task, TaskId};

#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Execute the task. An error marks this attempt as failed.
    async fn handle(&self, task: &Task, progress: &Progress) -> Result<()>;
}

/// Progress reporter handed to a handler for one task.
pub struct Progress {
    broadcaster: StatusBroadcaster,
    task_id: TaskId,
    worker: String,
}

impl Progress {
    pub fn new(broadcaster: StatusBroadcaster, task_id: TaskId, worker: impl Into<String>) -> Self {
        Self {
            broadcaster,
            task_id,
            worker: worker.into(),
        }
    }

    pub fn worker(&self) -> &str {
        &self.worker
    }

    /// Publish an intermediate "processing" event.
    pub async fn report(&self, message: impl Into<String>) {
        self.broadcaster
            .publish(&StatusEvent::processing(&self.task_id, &self.worker, message))
            .await;
    }
}

/// Fixed-duration stand-in for real work: sleeps, reports progress once,
/// sleeps again.
#[derive(Debug, Clone)]
pub struct SimulatedHandler {
    pub analyze_after: Duration,
    pub finish_after: Duration,
}

impl Default for SimulatedHandler {
    fn default() -> Self {
        Self {
            analyze_after: Duration::from_secs(2),
            finish_after: Duration::from_secs(3),
        }
    }
}

impl SimulatedHandler {
    pub fn new(analyze_after: Duration, finish_after: Duration) -> Self {
        Self {
            analyze_after,
            finish_after,
        }
    }
}

#[async_trait]
impl TaskHandler for SimulatedHandler {
    async fn handle(&self, _task: &Task, progress: &Progress) -> Result<()> {
        tokio::time::sleep(self.analyze_after).await;
        progress.report("Analyzing task payload and optimizing").await;
        tokio::time::sleep(self.finish_after).await;
        Ok(())
    }
}

/// Handlers indexed by task name, with an optional fallback.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
    fallback: Option<Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    /// Create an empty registry: every task is unroutable.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Registry where every task name goes to `handler`.
    pub fn with_fallback(handler: impl TaskHandler + 'static) -> Self {
        Self {
            handlers: HashMap::new(),
            fallback: Some(Arc::new(handler)),
        }
    }

    pub fn register(mut self, name: impl Into<String>, handler: impl TaskHandler + 'static) -> Self {
        self.handlers.insert(name.into(), Arc::new(handler));
        self
    }

    /// Look up the handler for a task name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers
            .get(name)
            .or(self.fallback.as_ref())
            .cloned()
    }
}
