// ABOUTME: tmi-cluster library wiring the SQLite store, distributor and sweep together.
// ABOUTME: Re-exports for programmatic use by the CLI and by embedding supervisors.

pub mod sweep;

pub use sweep::{SweepReport, Sweeper};
pub use tmi_cluster_core::{ClusterConfig, Distribution, ProcessId, ProcessState};

use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;
use tmi_cluster_core::{ChannelDistributor, ProcessRegistry, SqliteStore, SupervisorProcess};

/// Load config from an explicit path, or the default path if it exists
pub fn load_config(path: Option<PathBuf>) -> Result<ClusterConfig> {
    match path {
        Some(path) => ClusterConfig::load(&path),
        None => ClusterConfig::load_or_default(&ClusterConfig::default_path()),
    }
}

/// Supervisor name for processes spawned from this host, e.g. "worker-1-3f9a"
pub fn supervisor_name() -> String {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".to_string());
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", host, &suffix[..4])
}

/// An opened cluster: durable store plus the distributor working against it
pub struct Cluster {
    pub config: ClusterConfig,
    pub store: Arc<SqliteStore>,
    pub distributor: Arc<ChannelDistributor>,
}

impl Cluster {
    pub async fn open(config: ClusterConfig) -> Result<Self> {
        let store = Arc::new(SqliteStore::open(&config.database_path).await?);
        let distributor = Arc::new(ChannelDistributor::new(
            store.clone(),
            store.clone(),
            store.clone(),
            config.distributor(),
        ));
        tracing::debug!(database = %config.database_path.display(), "Opened cluster store");
        Ok(Self {
            config,
            store,
            distributor,
        })
    }

    /// Record a new worker process for this host
    pub async fn register(&self, state: ProcessState) -> Result<SupervisorProcess> {
        let process = SupervisorProcess::new(supervisor_name()).with_state(state);
        self.store.register(process.clone()).await?;
        tracing::info!(process_id = %process.id, supervisor = %process.supervisor, "Registered process");
        Ok(process)
    }

    pub fn sweeper(&self) -> Sweeper {
        Sweeper::new(
            self.distributor.clone(),
            self.store.clone(),
            self.config.stale_after(),
            self.config.prune_after(),
        )
    }
}
