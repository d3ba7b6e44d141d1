//! tidepool capacity controller
//!
//! Runs the task dispatcher (scale-up path) and the node reaper (scale-down
//! path) against a cluster gateway, or against the in-process simulated
//! backend.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tidepool_controller::{
    capacity::CapacityController,
    cluster::{ClusterApi, ClusterStateView},
    config::{Backend, Config},
    dispatcher::TaskDispatcher,
    gateway::{GatewayClient, GatewaySettings},
    lease::{InMemoryLease, SweepLease},
    model::TaskRequest,
    pool::NodePoolClient,
    queue::{DeadLetterStore, TaskQueue},
    reaper::{LeaseSettings, NodeReaper},
    sim::{InMemoryTaskQueue, QueueSettings, SimulatedCluster, SimulationSettings},
    workers::{DispatchWorker, DispatchWorkerConfig, ReaperWorker, ReaperWorkerConfig},
};
use tidepool_id::MessageId;
use tidepool_reconcile::SweepPolicy;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// How long to wait for each background task after shutdown is signaled.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

const DEAD_LETTER_PRUNE_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Parser, Debug)]
#[command(name = "tidepool", version, about = "Elastic capacity controller for batch clusters")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the dispatcher and the reaper until interrupted.
    Run,
    /// Run only the dispatcher loop.
    Dispatch,
    /// Run only the reaper loop.
    Reap,
    /// Run one reaper sweep and print its report as JSON.
    Sweep,
    /// Enqueue a task request from a JSON file.
    Submit {
        /// Path to the task request document.
        file: PathBuf,
    },
    /// List dead-lettered task requests as JSON.
    DeadLetters,
    /// Move a dead-lettered task request back to the task queue.
    Redrive {
        /// Message id as shown by `dead-letters`.
        message_id: MessageId,
    },
}

/// Collaborators for the configured backend.
struct Collaborators {
    cluster: Arc<dyn ClusterApi>,
    pool: Arc<dyn NodePoolClient>,
    queue: Option<Arc<dyn TaskQueue>>,
    dead_letters: Option<Arc<dyn DeadLetterStore>>,
    lease: Arc<dyn SweepLease>,
    simulation: Option<(Arc<SimulatedCluster>, Arc<InMemoryTaskQueue>)>,
}

impl Collaborators {
    fn connect(config: &Config) -> Result<Self> {
        match config.backend {
            Backend::Gateway => {
                let base_url = config
                    .gateway_url
                    .clone()
                    .context("Missing gateway URL. Set TIDEPOOL_GATEWAY_URL.")?;
                let gateway = Arc::new(
                    GatewayClient::new(GatewaySettings {
                        base_url,
                        cluster: config.cluster_id.clone(),
                        pool: config.pool_id.clone(),
                        queue: config.queue.clone(),
                        call_timeout: config.call_timeout,
                        max_receive_count: config.max_receive_count,
                    })
                    .context("Failed to create gateway client")?,
                );

                let queue = config
                    .queue
                    .as_ref()
                    .map(|_| gateway.clone() as Arc<dyn TaskQueue>);
                let dead_letters = config
                    .queue
                    .as_ref()
                    .map(|_| gateway.clone() as Arc<dyn DeadLetterStore>);

                Ok(Self {
                    cluster: gateway.clone(),
                    pool: gateway.clone(),
                    queue,
                    dead_letters,
                    lease: gateway,
                    simulation: None,
                })
            }
            Backend::Simulated => {
                let sim = Arc::new(SimulatedCluster::new(config.cluster_id.clone()));
                let queue = Arc::new(InMemoryTaskQueue::new(QueueSettings {
                    visibility_timeout: config.visibility_timeout,
                    max_receive_count: config.max_receive_count,
                    dead_letter_retention: config.dead_letter_retention,
                }));

                Ok(Self {
                    cluster: sim.clone(),
                    pool: sim.clone(),
                    queue: Some(queue.clone() as Arc<dyn TaskQueue>),
                    dead_letters: Some(queue.clone() as Arc<dyn DeadLetterStore>),
                    lease: Arc::new(InMemoryLease::new()),
                    simulation: Some((sim, queue)),
                })
            }
        }
    }

    fn queue(&self) -> Result<Arc<dyn TaskQueue>> {
        self.queue
            .clone()
            .context("Missing task queue. Set TIDEPOOL_QUEUE_URL or TIDEPOOL_QUEUE_NAME.")
    }

    fn dead_letters(&self) -> Result<Arc<dyn DeadLetterStore>> {
        self.dead_letters
            .clone()
            .context("Missing task queue. Set TIDEPOOL_QUEUE_URL or TIDEPOOL_QUEUE_NAME.")
    }

    fn view(&self, config: &Config) -> ClusterStateView {
        ClusterStateView::new(self.cluster.clone(), self.pool.clone(), config.call_timeout)
    }

    fn dispatch_worker(&self, config: &Config) -> Result<DispatchWorker> {
        let capacity = CapacityController::new(self.view(config), self.pool.clone());
        let dispatcher = TaskDispatcher::new(
            self.cluster.clone(),
            capacity,
            config.cluster_id.clone(),
            config.call_timeout,
        );
        let worker_config = DispatchWorkerConfig {
            concurrency: config.dispatch_concurrency,
            receive_batch: config.receive_batch,
            receive_wait: config.receive_wait,
            ..DispatchWorkerConfig::default()
        };

        Ok(DispatchWorker::new(
            dispatcher,
            self.queue()?,
            worker_config,
            config.call_timeout,
        ))
    }

    fn reaper(&self, config: &Config) -> Result<NodeReaper> {
        let policy = SweepPolicy::new(config.idle_timeout, config.registration_timeout, None)
            .context("Invalid reaper timeouts")?;
        let reaper = NodeReaper::new(
            self.cluster.clone(),
            self.pool.clone(),
            self.view(config),
            policy,
        );

        if !config.reaper_lease {
            return Ok(reaper);
        }
        Ok(reaper.with_lease(LeaseSettings {
            lease: self.lease.clone(),
            ttl: config.sweep_budget + config.call_timeout,
        }))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to TIDEPOOL_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        cluster = %config.cluster_id,
        pool = %config.pool_id,
        backend = ?config.backend,
        "Configuration loaded"
    );

    let collaborators = Collaborators::connect(&config)?;

    match cli.command {
        Command::Run => run_loops(&config, &collaborators, true, true).await,
        Command::Dispatch => run_loops(&config, &collaborators, true, false).await,
        Command::Reap => run_loops(&config, &collaborators, false, true).await,
        Command::Sweep => sweep_once(&config, &collaborators).await,
        Command::Submit { file } => submit(&config, &collaborators, &file).await,
        Command::DeadLetters => list_dead_letters(&config, &collaborators).await,
        Command::Redrive { message_id } => redrive(&config, &collaborators, &message_id).await,
    }
}

/// Run the selected background loops until Ctrl-C.
async fn run_loops(
    config: &Config,
    collaborators: &Collaborators,
    dispatch: bool,
    reap: bool,
) -> Result<()> {
    info!(
        max_dispatch_latency_secs = config.max_dispatch_latency().as_secs(),
        "Starting tidepool controller"
    );

    // Create shutdown channel for graceful shutdown
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut handles: Vec<(&'static str, JoinHandle<()>)> = Vec::new();

    if let Some((sim, queue)) = &collaborators.simulation {
        let sim = sim.clone();
        let sim_shutdown = shutdown_rx.clone();
        handles.push((
            "simulation",
            tokio::spawn(async move {
                sim.run(SimulationSettings::default(), sim_shutdown).await;
            }),
        ));

        let queue = queue.clone();
        let retention_shutdown = shutdown_rx.clone();
        handles.push((
            "dead-letter-retention",
            tokio::spawn(prune_dead_letters(queue, retention_shutdown)),
        ));
    }

    if dispatch {
        let worker = collaborators.dispatch_worker(config)?;
        let shutdown_rx = shutdown_rx.clone();
        handles.push((
            "dispatch",
            tokio::spawn(async move {
                worker.run(shutdown_rx).await;
            }),
        ));
    }

    if reap {
        let worker = ReaperWorker::new(
            Arc::new(collaborators.reaper(config)?),
            ReaperWorkerConfig {
                interval: config.sweep_interval,
                budget: config.sweep_budget,
            },
        );
        let shutdown_rx = shutdown_rx.clone();
        handles.push((
            "reaper",
            tokio::spawn(async move {
                worker.run(shutdown_rx).await;
            }),
        ));
    }

    // Wait for shutdown signal (Ctrl+C)
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
    }
    info!("Received shutdown signal");

    // Signal shutdown to all workers
    let _ = shutdown_tx.send(true);

    info!("Waiting for workers to shut down...");
    for (name, handle) in handles {
        match tokio::time::timeout(SHUTDOWN_TIMEOUT, handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(worker = name, error = %e, "Worker task panicked"),
            Err(_) => warn!(worker = name, "Worker did not shut down in time"),
        }
    }

    info!("Controller shutdown complete");
    Ok(())
}

/// Drop dead letters past retention until shutdown.
async fn prune_dead_letters(queue: Arc<InMemoryTaskQueue>, mut shutdown: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(DEAD_LETTER_PRUNE_INTERVAL);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let pruned = queue.prune_dead_letters().await;
                if pruned > 0 {
                    info!(pruned, "Pruned expired dead letters");
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

/// Run one budgeted sweep and print the report.
async fn sweep_once(config: &Config, collaborators: &Collaborators) -> Result<()> {
    let reaper = collaborators.reaper(config)?;

    let report = tokio::time::timeout(config.sweep_budget, reaper.sweep())
        .await
        .context("Sweep exceeded its budget")?
        .context("Sweep failed")?;

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

/// Validate a task request document and enqueue it.
async fn submit(config: &Config, collaborators: &Collaborators, file: &Path) -> Result<()> {
    require_durable_queue(config, "submit")?;

    let body = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let task = TaskRequest::from_message_body(&body)
        .with_context(|| format!("{} is not a valid task request", file.display()))?;

    let queue = collaborators.queue()?;
    let message_id = tokio::time::timeout(config.call_timeout, queue.send(body))
        .await
        .context("Timed out enqueueing task request")?
        .context("Failed to enqueue task request")?;

    info!(message_id = %message_id, job_name = %task.job_name, "Task request enqueued");
    println!("{message_id}");
    Ok(())
}

/// Print the dead-letter store as JSON.
async fn list_dead_letters(config: &Config, collaborators: &Collaborators) -> Result<()> {
    require_durable_queue(config, "dead-letters")?;

    let store = collaborators.dead_letters()?;
    let dead_letters = tokio::time::timeout(config.call_timeout, store.list_dead_letters())
        .await
        .context("Timed out listing dead letters")?
        .context("Failed to list dead letters")?;

    println!("{}", serde_json::to_string_pretty(&dead_letters)?);
    Ok(())
}

/// Return one dead letter to the task queue.
async fn redrive(
    config: &Config,
    collaborators: &Collaborators,
    message_id: &MessageId,
) -> Result<()> {
    require_durable_queue(config, "redrive")?;

    let store = collaborators.dead_letters()?;
    tokio::time::timeout(config.call_timeout, store.redrive_dead_letter(message_id))
        .await
        .context("Timed out redriving dead letter")?
        .with_context(|| format!("Failed to redrive {message_id}"))?;

    info!(message_id = %message_id, "Dead letter redriven");
    Ok(())
}

/// One-shot queue commands need a queue that outlives this process.
fn require_durable_queue(config: &Config, command: &str) -> Result<()> {
    if config.backend == Backend::Simulated {
        bail!(
            "{command} needs a durable queue; the simulated queue lives only inside `tidepool run`"
        );
    }
    Ok(())
}
