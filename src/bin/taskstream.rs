//! taskstream CLI: submission service, observer relay, worker engine and
//! operator commands.

use std::sync::Arc;

use clap::{Parser, Subcommand};
use secrecy::ExposeSecret;
use taskstream::broadcast::StatusBroadcaster;
use taskstream::broker::{Broker, MemoryBroker, PgBroker};
use taskstream::config::Config;
use taskstream::engine::Engine;
use taskstream::handler::{HandlerRegistry, SimulatedHandler};
use taskstream::model::Task;
use taskstream::queue::{Queue, StreamQueue, TASK_FIELD};
use taskstream::server;
use taskstream::telemetry::{TelemetryConfig, init_telemetry};
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Parser)]
#[command(name = "taskstream", about = "Durable task distribution with live status")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the task submission service (POST /submit, GET /health)
    Manager,
    /// Run the WebSocket relay forwarding status events (GET /ws)
    Dashboard,
    /// Run the dispatcher, worker pool and reclaim sweep
    Worker {
        /// Override POOL_SIZE
        #[arg(long)]
        pool_size: Option<usize>,
    },
    /// Run manager, dashboard and worker in one process on an in-memory broker
    Demo,
    /// Enqueue a single task
    Submit {
        /// Task name (selects the handler)
        #[arg(default_value = "ExampleTask")]
        name: String,
        /// Task payload
        #[arg(long)]
        payload: Option<String>,
        /// Failed attempts allowed before dead-lettering
        #[arg(long)]
        max_retries: Option<u32>,
    },
    /// List entries delivered but not yet acknowledged
    Pending,
    /// List dead-lettered entries
    DeadLetters {
        /// Maximum entries to show
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = match cli.command {
        Command::Demo => Config::from_env_allow_memory()?,
        _ => Config::from_env()?,
    };

    match cli.command {
        Command::Manager => {
            let _guard = telemetry(&config, "taskstream-manager")?;
            let broker = connect(&config).await?;
            cmd_manager(&config, broker, shutdown_on_ctrl_c()).await
        }
        Command::Dashboard => {
            let _guard = telemetry(&config, "taskstream-dashboard")?;
            let broker = connect(&config).await?;
            cmd_dashboard(&config, broker, shutdown_on_ctrl_c()).await
        }
        Command::Worker { pool_size } => {
            let _guard = telemetry(&config, "taskstream-worker")?;
            let broker = connect(&config).await?;
            cmd_worker(&config, broker, pool_size).await
        }
        Command::Submit {
            name,
            payload,
            max_retries,
        } => {
            let broker = connect(&config).await?;
            let task = Task::new(name)
                .payload(payload.unwrap_or_default())
                .max_retries(max_retries.unwrap_or(config.max_retries));
            queue(&config, broker).enqueue(&task).await?;
            println!("Enqueued: {}", task.id);
            Ok(())
        }
        Command::Pending => {
            let broker = connect(&config).await?;
            cmd_pending(&config, broker.as_ref()).await
        }
        Command::DeadLetters { limit } => {
            let broker = connect(&config).await?;
            cmd_dead_letters(&config, broker.as_ref(), limit).await
        }
        Command::Demo => {
            let _guard = telemetry(&config, "taskstream-demo")?;
            cmd_demo(config).await
        }
    }
}

fn telemetry(
    config: &Config,
    service_name: &str,
) -> anyhow::Result<taskstream::telemetry::TelemetryGuard> {
    Ok(init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: service_name.to_string(),
        log_level: config.log_level.clone(),
    })?)
}

async fn connect(config: &Config) -> anyhow::Result<Arc<dyn Broker>> {
    let url = config
        .database_url
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("DATABASE_URL is not set"))?;
    let broker = PgBroker::connect(url.expose_secret()).await?;
    broker.migrate().await?;
    broker.ping().await?;
    Ok(Arc::new(broker))
}

fn broadcaster(config: &Config, broker: Arc<dyn Broker>) -> StatusBroadcaster {
    StatusBroadcaster::new(broker, config.status_channel.clone())
}

fn queue(config: &Config, broker: Arc<dyn Broker>) -> StreamQueue {
    StreamQueue::new(Arc::clone(&broker), config.stream.clone())
        .with_broadcaster(broadcaster(config, broker))
}

fn shutdown_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("ctrl-c received, shutting down");
        token.cancel();
    });
    cancel
}

async fn cmd_manager(
    config: &Config,
    broker: Arc<dyn Broker>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let app = server::submission_router(
        Arc::new(queue(config, broker)),
        config.max_retries,
        &config.allowed_origin,
    )?;
    info!(port = config.port, stream = %config.stream, "manager starting");
    server::serve(app, config.port, cancel).await?;
    Ok(())
}

async fn cmd_dashboard(
    config: &Config,
    broker: Arc<dyn Broker>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let app = server::relay_router(broadcaster(config, broker));
    info!(port = config.dashboard_port, channel = %config.status_channel, "dashboard relay starting");
    server::serve(app, config.dashboard_port, cancel).await?;
    Ok(())
}

async fn cmd_worker(
    config: &Config,
    broker: Arc<dyn Broker>,
    pool_size: Option<usize>,
) -> anyhow::Result<()> {
    let mut engine_config = config.engine();
    if let Some(n) = pool_size {
        engine_config.pool_size = n;
    }
    let engine = Engine::new(
        Arc::clone(&broker),
        broadcaster(config, broker),
        HandlerRegistry::with_fallback(SimulatedHandler::default()),
        engine_config,
    );

    let handle = engine.start().await?;
    tokio::signal::ctrl_c().await.ok();
    info!("ctrl-c received, finishing in-flight tasks");
    handle.shutdown().await;
    Ok(())
}

async fn cmd_demo(config: Config) -> anyhow::Result<()> {
    let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());
    let engine = Engine::new(
        Arc::clone(&broker),
        broadcaster(&config, Arc::clone(&broker)),
        HandlerRegistry::with_fallback(SimulatedHandler::default()),
        config.engine(),
    );
    let handle = engine.start().await?;

    let cancel = shutdown_on_ctrl_c();
    let (manager, dashboard) = tokio::join!(
        cmd_manager(&config, Arc::clone(&broker), cancel.clone()),
        cmd_dashboard(&config, Arc::clone(&broker), cancel.clone()),
    );
    handle.shutdown().await;
    manager?;
    dashboard?;
    Ok(())
}

async fn cmd_pending(config: &Config, broker: &dyn Broker) -> anyhow::Result<()> {
    let pending = broker.pending(&config.stream, &config.group).await?;
    if pending.is_empty() {
        println!("No pending entries.");
        return Ok(());
    }

    println!(
        "{:<12}  {:<14}  {:>10}  DELIVERIES",
        "ENTRY", "CONSUMER", "IDLE"
    );
    println!("{}", "-".repeat(52));
    for p in &pending {
        println!(
            "{:<12}  {:<14}  {:>9}s  {}",
            p.id,
            p.consumer,
            p.idle.as_secs(),
            p.delivery_count
        );
    }
    println!("\n{} pending entr{}", pending.len(), if pending.len() == 1 { "y" } else { "ies" });
    Ok(())
}

async fn cmd_dead_letters(config: &Config, broker: &dyn Broker, limit: usize) -> anyhow::Result<()> {
    let entries = broker.entries(&config.dead_letter_stream, limit).await?;
    if entries.is_empty() {
        println!("No dead-lettered entries.");
        return Ok(());
    }

    for entry in &entries {
        let task = entry
            .field(TASK_FIELD)
            .and_then(|data| Task::from_json(data).ok());
        let error = entry.field("error").unwrap_or("-");
        match task {
            Some(task) => println!(
                "{:<8}  {:<36}  {:<16}  retries {}/{}  {}",
                entry.id, task.id, task.name, task.retries, task.max_retries, error
            ),
            None => println!("{:<8}  <undecodable entry>  {}", entry.id, error),
        }
    }
    println!("\n{} entr{}", entries.len(), if entries.len() == 1 { "y" } else { "ies" });
    Ok(())
}
