//! kenneld — the Kennel daemon.
//!
//! Single binary that assembles the scheduler:
//! - State store (redb)
//! - Cluster client (in-process simulation)
//! - Job queue + worker
//! - Control loop (reconcile, dispatch, autoscale)
//! - REST API
//!
//! # Usage
//!
//! ```text
//! kenneld --config /etc/kennel/kennel.toml standalone --port 3000
//! kenneld config
//! ```

mod config;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

use kennel_autoscale::{Autoscaler, Provisioner};
use kennel_cluster::{ClusterClient, SimulatedCluster};
use kennel_queue::JobQueue;
use kennel_scheduler::{AdmissionController, ControlLoop, Dispatcher, Reconciler, Submitter};
use kennel_state::{StateStore, epoch_millis};

use crate::config::{KennelConfig, parse_duration};

#[derive(Parser)]
#[command(name = "kenneld", about = "Kennel task scheduler daemon")]
struct Cli {
    /// Path to a kennel.toml file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scheduler, queue worker and API in one process.
    Standalone {
        /// Port to listen on.
        #[arg(long)]
        port: Option<u16>,

        /// Data directory for persistent state.
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Cluster that tasks are launched into.
        #[arg(long)]
        cluster_name: Option<String>,

        /// Control loop interval, e.g. "30s".
        #[arg(long)]
        interval: Option<String>,

        /// Idle instances to keep running.
        #[arg(long)]
        warm_instances: Option<usize>,

        /// Keep state in memory only.
        #[arg(long)]
        in_memory: bool,
    },
    /// Print the effective configuration as TOML.
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,kenneld=debug,kennel=debug"));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    if cli.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    let mut config = match &cli.config {
        Some(path) => KennelConfig::from_file(path)?,
        None => KennelConfig::default(),
    };

    match cli.command {
        Command::Standalone {
            port,
            data_dir,
            cluster_name,
            interval,
            warm_instances,
            in_memory,
        } => {
            if let Some(port) = port {
                config.api_port = port;
            }
            if let Some(dir) = data_dir {
                config.data_dir = dir;
            }
            if let Some(name) = cluster_name {
                config.cluster_name = name;
            }
            if let Some(interval) = interval {
                parse_duration(&interval)?;
                config.daemon_interval = interval;
            }
            if let Some(n) = warm_instances {
                config.autoscale.warm_instances = n;
            }
            config.validate()?;
            run_standalone(config, in_memory).await
        }
        Command::Config => {
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
    }
}

async fn run_standalone(config: KennelConfig, in_memory: bool) -> anyhow::Result<()> {
    info!(cluster = %config.cluster_name, "Kennel daemon starting in standalone mode");

    // ── Initialize subsystems ──────────────────────────────────

    // State store.
    let state = if in_memory {
        info!("state store in memory");
        StateStore::open_in_memory()?
    } else {
        std::fs::create_dir_all(&config.data_dir)?;
        let db_path = config.data_dir.join("kennel.redb");
        let state = StateStore::open(&db_path)?;
        info!(path = ?db_path, "state store opened");
        state
    };

    // Cluster.
    let simulated = Arc::new(SimulatedCluster::new(config.simulation_config()));
    for definition in &config.simulation.task_definitions {
        simulated
            .register_task_definition(&definition.reference, definition.containers.clone())
            .await;
    }
    info!(
        task_definitions = config.simulation.task_definitions.len(),
        "simulated cluster initialized"
    );
    let cluster: Arc<dyn ClusterClient> = simulated;

    // Scheduler.
    let provisioner = Provisioner::new(state.clone(), cluster.clone());
    let admission = AdmissionController::new(state.clone(), cluster.clone());
    let autoscale = config.autoscale_config()?;
    info!(
        warm_instances = autoscale.warm_instances,
        idle_timeout_secs = autoscale.idle_timeout.as_secs(),
        "autoscaler initialized"
    );
    let control = Arc::new(ControlLoop::new(
        Reconciler::new(state.clone(), cluster.clone()),
        Dispatcher::new(state.clone(), cluster.clone(), admission, provisioner.clone()),
        Autoscaler::new(state.clone(), cluster, provisioner, autoscale),
    ));

    // Queue.
    let queue = JobQueue::new();
    let submitter = Submitter::new(
        state.clone(),
        queue.clone(),
        config.cluster_name.clone(),
        config.lead()?,
    );
    submitter.requeue_deferred(epoch_millis()).await?;

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let control_shutdown = shutdown_rx.clone();
    let worker_shutdown = shutdown_rx;

    // ── Start background tasks ─────────────────────────────────

    // Control loop.
    let interval = config.interval()?;
    let control_loop = control.clone();
    let control_handle = tokio::spawn(async move {
        control_loop.run(interval, control_shutdown).await;
    });

    // Job worker.
    let worker_queue = queue.clone();
    let worker_handle = tokio::spawn(async move {
        worker_queue
            .process(
                move |job| {
                    let control = control.clone();
                    async move { control.handle_job(job).await.map_err(anyhow::Error::from) }
                },
                worker_shutdown,
            )
            .await;
    });

    // ── Start API server ───────────────────────────────────────

    let router = kennel_api::build_router(state, queue.clone(), submitter);
    let addr = SocketAddr::from(([0, 0, 0, 0], config.api_port));

    info!(%addr, "API server starting");

    let listener = tokio::net::TcpListener::bind(addr).await?;

    // Graceful shutdown on Ctrl-C.
    let server = axum::serve(listener, router).with_graceful_shutdown(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install CTRL+C handler");
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    server.await?;

    queue.close().await;
    let _ = control_handle.await;
    let _ = worker_handle.await;

    info!("Kennel daemon stopped");
    Ok(())
}
