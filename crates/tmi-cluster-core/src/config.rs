// ABOUTME: Configuration for the tmi-cluster distributor and supervisor sweep.
// ABOUTME: Loaded from a TOML file; every field has a default.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClusterConfig {
    /// SQLite database holding processes, ownership, commands and backlog
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,

    /// A heartbeat older than this makes a process ineligible
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,

    /// Bounded wait for the per-batch exclusion scope
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,

    /// Attempts per batch before reporting contention to the caller
    #[serde(default = "default_max_batch_attempts")]
    pub max_batch_attempts: u32,

    /// Attempts per command enqueue after ownership is committed
    #[serde(default = "default_enqueue_attempts")]
    pub enqueue_attempts: u32,

    /// Period of the supervisor sweep
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// Dead processes owning nothing are deleted after this long
    #[serde(default = "default_prune_after_secs")]
    pub prune_after_secs: u64,
}

fn default_database_path() -> PathBuf {
    config_dir().join("cluster.db")
}

fn default_stale_after_secs() -> u64 {
    3
}

fn default_lock_timeout_ms() -> u64 {
    500
}

fn default_max_batch_attempts() -> u32 {
    3
}

fn default_enqueue_attempts() -> u32 {
    3
}

fn default_sweep_interval_secs() -> u64 {
    5
}

fn default_prune_after_secs() -> u64 {
    60
}

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .map(|h| h.join(".config"))
                .unwrap_or_else(|| PathBuf::from("."))
        })
        .join("tmi-cluster")
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            stale_after_secs: default_stale_after_secs(),
            lock_timeout_ms: default_lock_timeout_ms(),
            max_batch_attempts: default_max_batch_attempts(),
            enqueue_attempts: default_enqueue_attempts(),
            sweep_interval_secs: default_sweep_interval_secs(),
            prune_after_secs: default_prune_after_secs(),
        }
    }
}

impl ClusterConfig {
    /// Load config from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;
        let config: ClusterConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))?;
        Ok(config)
    }

    /// Load config from a TOML file, or defaults if the file does not exist
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            tracing::debug!(path = %path.display(), "No config file, using defaults");
            Ok(Self::default())
        }
    }

    /// Save config to a TOML file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory {}", parent.display())
            })?;
        }
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config to {}", path.display()))?;
        Ok(())
    }

    /// Get the default config file path (~/.config/tmi-cluster/cluster.toml)
    pub fn default_path() -> PathBuf {
        config_dir().join("cluster.toml")
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn prune_after(&self) -> Duration {
        Duration::from_secs(self.prune_after_secs)
    }

    /// Settings the channel distributor needs, as typed durations
    pub fn distributor(&self) -> DistributorConfig {
        DistributorConfig {
            stale_after: self.stale_after(),
            lock_timeout: Duration::from_millis(self.lock_timeout_ms),
            max_batch_attempts: self.max_batch_attempts.max(1),
            enqueue_attempts: self.enqueue_attempts.max(1),
        }
    }
}

/// Tuning passed explicitly into [`crate::ChannelDistributor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DistributorConfig {
    pub stale_after: Duration,
    pub lock_timeout: Duration,
    pub max_batch_attempts: u32,
    pub enqueue_attempts: u32,
}

impl Default for DistributorConfig {
    fn default() -> Self {
        ClusterConfig::default().distributor()
    }
}
