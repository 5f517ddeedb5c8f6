//! Consumer side: dispatcher, worker pool and reclaim sweep, wired together
//! under one cancellation token.

pub mod dispatcher;
pub mod pool;
pub mod reclaim;

pub use dispatcher::Dispatcher;
pub use pool::{Outcome, Worker, WorkerPool};
pub use reclaim::{Reclaimer, SweepReport};

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::broadcast::StatusBroadcaster;
use crate::broker::Broker;
use crate::error::Result;
use crate::handler::HandlerRegistry;
use crate::queue::StreamQueue;

/// Configuration for the consumer side.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub stream: String,
    pub group: String,
    pub dead_letter_stream: String,
    /// Number of pool workers.
    pub pool_size: usize,
    /// Wait per dispatcher claim-read.
    pub block: Duration,
    /// Pending time after which an entry is reclaimed.
    pub visibility_timeout: Duration,
    pub reclaim_interval: Duration,
    /// Deliveries allowed before an entry is dead-lettered by the sweep.
    pub max_deliveries: u32,
    pub handler_timeout: Option<Duration>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            stream: crate::queue::DEFAULT_STREAM.to_string(),
            group: "worker_group".to_string(),
            dead_letter_stream: format!("{}:dead", crate::queue::DEFAULT_STREAM),
            pool_size: 3,
            block: Duration::from_secs(5),
            visibility_timeout: Duration::from_secs(60),
            reclaim_interval: Duration::from_secs(15),
            max_deliveries: 5,
            handler_timeout: None,
        }
    }
}

/// The consumer side of the queue.
pub struct Engine {
    broker: Arc<dyn Broker>,
    broadcaster: StatusBroadcaster,
    registry: HandlerRegistry,
    config: EngineConfig,
    cancel: CancellationToken,
}

/// Running engine tasks.
pub struct EngineHandle {
    tasks: JoinSet<()>,
    cancel: CancellationToken,
}

impl Engine {
    pub fn new(
        broker: Arc<dyn Broker>,
        broadcaster: StatusBroadcaster,
        registry: HandlerRegistry,
        config: EngineConfig,
    ) -> Self {
        Self {
            broker,
            broadcaster,
            registry,
            config,
            cancel: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Queue on the engine's stream, publishing through its broadcaster.
    /// Used for retries and handy for producers in the same process.
    pub fn queue(&self) -> StreamQueue {
        StreamQueue::new(Arc::clone(&self.broker), self.config.stream.clone())
            .with_broadcaster(self.broadcaster.clone())
    }

    pub fn dispatcher(&self) -> Dispatcher {
        Dispatcher::new(
            Arc::clone(&self.broker),
            self.config.stream.clone(),
            self.config.group.clone(),
        )
        .block(self.config.block)
    }

    pub fn pool(&self) -> WorkerPool {
        WorkerPool::new(
            Arc::clone(&self.broker),
            self.queue(),
            self.broadcaster.clone(),
            self.registry.clone(),
            self.config.group.clone(),
            self.config.dead_letter_stream.clone(),
            self.config.pool_size,
        )
        .handler_timeout(self.config.handler_timeout)
        .heartbeat(heartbeat(self.config.visibility_timeout))
    }

    pub fn reclaimer(&self) -> Reclaimer {
        Reclaimer::new(
            Arc::clone(&self.broker),
            self.broadcaster.clone(),
            self.config.stream.clone(),
            self.config.group.clone(),
            self.config.dead_letter_stream.clone(),
        )
        .visibility_timeout(self.config.visibility_timeout)
        .interval(self.config.reclaim_interval)
        .max_deliveries(self.config.max_deliveries)
    }

    /// Signal every engine task to stop. In-flight tasks are finished.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Ensure the consumer group exists, then spawn the dispatcher, the
    /// workers and the reclaimer. Entries appended after this returns are
    /// delivered.
    pub async fn start(&self) -> Result<EngineHandle> {
        let dispatcher = self.dispatcher();
        dispatcher.ensure_group().await?;

        // Capacity 1: the dispatcher blocks until a worker takes the entry.
        let (tx, rx) = mpsc::channel(1);
        let rx = Arc::new(Mutex::new(rx));
        let mut tasks = JoinSet::new();

        self.pool().spawn(&mut tasks, rx, self.cancel.clone());

        let reclaimer = self.reclaimer();
        let reclaim_tx = tx.clone();
        let cancel = self.cancel.clone();
        tasks.spawn(async move { reclaimer.run(reclaim_tx, cancel).await });

        let cancel = self.cancel.clone();
        tasks.spawn(async move {
            if let Err(e) = dispatcher.run(tx, cancel).await {
                error!("dispatcher exited: {e}");
            }
        });

        info!(
            stream = %self.config.stream,
            group = %self.config.group,
            pool_size = self.config.pool_size,
            "engine started"
        );
        Ok(EngineHandle {
            tasks,
            cancel: self.cancel.clone(),
        })
    }

    /// Start and run until [`Engine::shutdown`] is called.
    pub async fn run(&self) -> Result<()> {
        self.start().await?.join().await;
        Ok(())
    }
}

/// Heartbeat period for a visibility timeout: three refreshes per window.
fn heartbeat(visibility_timeout: Duration) -> Duration {
    (visibility_timeout / 3).max(Duration::from_millis(10))
}

impl EngineHandle {
    /// Wait for every engine task to finish.
    pub async fn join(mut self) {
        while let Some(joined) = self.tasks.join_next().await {
            if let Err(e) = joined {
                error!("engine task panicked or was aborted: {e}");
            }
        }
        info!("engine stopped");
    }

    /// Cancel and wait.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        self.join().await;
    }
}
