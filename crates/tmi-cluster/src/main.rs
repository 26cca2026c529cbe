// ABOUTME: tmi-cluster CLI entry point.
// ABOUTME: Operator commands plus the long-running supervisor sweep.

use anyhow::Result;
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use tmi_cluster::{load_config, Cluster, ProcessId, ProcessState};
use tmi_cluster_core::{CommandQueue, ProcessRegistry};

#[derive(Parser)]
#[command(name = "tmi-cluster")]
#[command(about = "Distribute chat channels across supervisor processes")]
struct Cli {
    /// Path to configuration file
    #[arg(long, global = true, env = "TMI_CLUSTER_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a worker process for this host and print its id
    Register {
        /// Initial state
        #[arg(long, default_value = "initializing")]
        state: ProcessState,
    },
    /// Record a heartbeat for a worker process
    Heartbeat {
        id: ProcessId,
        #[arg(long, default_value = "connected")]
        state: ProcessState,
    },
    /// Park channels for the next distribution batch
    Join {
        #[arg(required = true)]
        channels: Vec<String>,
    },
    /// Distribute channels now and print the assignment
    JoinNow {
        #[arg(required = true)]
        channels: Vec<String>,
        /// Process to leave out of this batch (repeatable)
        #[arg(long = "exclude")]
        excluded: Vec<ProcessId>,
    },
    /// Move the channels of dead processes to healthy ones
    FlushStale {
        /// Dead process (repeatable)
        #[arg(long = "dead", required = true)]
        dead: Vec<ProcessId>,
        /// Extra channel to re-home (repeatable)
        #[arg(long = "channel")]
        channels: Vec<String>,
    },
    /// Release channels from their owners
    Part {
        #[arg(required = true)]
        channels: Vec<String>,
    },
    /// Drain and print a worker's pending commands
    Pending { id: ProcessId },
    /// List processes with their health and channels
    Processes,
    /// Run the supervisor sweep
    Sweep {
        /// Run a single sweep and exit
        #[arg(long)]
        once: bool,
    },
}

#[derive(Serialize)]
struct ProcessLine {
    id: ProcessId,
    supervisor: String,
    state: ProcessState,
    healthy: bool,
    channels: usize,
    last_heartbeat_at: chrono::DateTime<chrono::Utc>,
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (ignore errors if not found)
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    if matches!(cli.command, Commands::Sweep { .. }) {
        tmi_cluster_log::init_for(&["tmi_cluster", "tmi_cluster_core"]);
    } else {
        tmi_cluster_log::init();
    }

    let config = load_config(cli.config)?;
    let cluster = Cluster::open(config).await?;

    match cli.command {
        Commands::Register { state } => {
            let process = cluster.register(state).await?;
            println!("{}", process.id);
        }
        Commands::Heartbeat { id, state } => {
            cluster
                .store
                .heartbeat(id, state, chrono::Utc::now())
                .await?;
        }
        Commands::Join { channels } => {
            cluster.distributor.join(&channels).await?;
        }
        Commands::JoinNow { channels, excluded } => {
            let result = cluster.distributor.join_now(&channels, &excluded).await?;
            print_json(&result)?;
        }
        Commands::FlushStale { dead, channels } => {
            let result = cluster.distributor.flush_stale(&channels, &dead).await?;
            print_json(&result)?;
        }
        Commands::Part { channels } => {
            let released = cluster.distributor.part(&channels).await?;
            print_json(&released)?;
        }
        Commands::Pending { id } => {
            for command in cluster.store.pending(id).await? {
                println!("{}", serde_json::to_string(&command)?);
            }
        }
        Commands::Processes => {
            let now = chrono::Utc::now();
            let stale_after = cluster.config.stale_after();
            let lines: Vec<ProcessLine> = cluster
                .store
                .list()
                .await?
                .into_iter()
                .map(|p| ProcessLine {
                    healthy: p.is_healthy(now, stale_after),
                    id: p.id,
                    supervisor: p.supervisor,
                    state: p.state,
                    channels: p.channels.len(),
                    last_heartbeat_at: p.last_heartbeat_at,
                })
                .collect();
            print_json(&lines)?;
        }
        Commands::Sweep { once } => {
            let sweeper = cluster.sweeper();
            if once {
                let report = sweeper.tick().await?;
                print_json(&report)?;
            } else {
                tracing::info!(
                    interval_secs = cluster.config.sweep_interval_secs,
                    "Starting supervisor sweep"
                );
                sweeper.run(cluster.config.sweep_interval()).await?;
            }
        }
    }

    Ok(())
}
