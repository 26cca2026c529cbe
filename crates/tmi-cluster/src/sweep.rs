// ABOUTME: Periodic supervisor sweep: stale detection, recovery, backlog, pruning.
// ABOUTME: Feeds dead-process lists into flushStale and drains parked joins.

use chrono::{TimeDelta, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tmi_cluster_core::{
    ChannelDistributor, Distribution, DistributorError, ProcessId, ProcessRegistry,
    SupervisorProcess,
};

/// What one sweep did.
#[derive(Debug, Default, Serialize)]
pub struct SweepReport {
    /// Non-eligible processes that still owned channels.
    pub dead: Vec<ProcessId>,
    pub recovered: Distribution,
    pub backlog: Distribution,
    pub pruned: Vec<ProcessId>,
}

pub struct Sweeper {
    distributor: Arc<ChannelDistributor>,
    registry: Arc<dyn ProcessRegistry>,
    stale_after: Duration,
    prune_after: Duration,
}

impl Sweeper {
    pub fn new(
        distributor: Arc<ChannelDistributor>,
        registry: Arc<dyn ProcessRegistry>,
        stale_after: Duration,
        prune_after: Duration,
    ) -> Self {
        Self {
            distributor,
            registry,
            stale_after,
            prune_after,
        }
    }

    /// A worker that can no longer be trusted with its channels. An
    /// initializing worker with a fresh heartbeat is still coming up.
    fn is_dead(&self, process: &SupervisorProcess, now: chrono::DateTime<Utc>) -> bool {
        if process.is_healthy(now, self.stale_after) {
            return false;
        }
        process.state.is_terminal() || process.is_stale(now, self.stale_after)
    }

    pub async fn tick(&self) -> Result<SweepReport, DistributorError> {
        let now = Utc::now();

        let dead: Vec<ProcessId> = self
            .registry
            .list()
            .await?
            .iter()
            .filter(|p| !p.channels.is_empty() && self.is_dead(p, now))
            .map(|p| p.id)
            .collect();

        let recovered = if dead.is_empty() {
            Distribution::default()
        } else {
            tracing::info!(count = dead.len(), "Flushing channels of dead processes");
            self.distributor.flush_stale::<&str>(&[], &dead).await?
        };

        let backlog = self.distributor.sweep_backlog().await?;

        let prune_after = TimeDelta::from_std(self.prune_after).unwrap_or(TimeDelta::MAX);
        let mut pruned = Vec::new();
        for process in self.registry.list().await? {
            let dead_for = now.signed_duration_since(process.last_heartbeat_at);
            if process.channels.is_empty() && self.is_dead(&process, now) && dead_for > prune_after
            {
                if self.registry.remove(process.id).await? {
                    tracing::info!(process_id = %process.id, "Pruned dead process");
                    pruned.push(process.id);
                }
            }
        }

        Ok(SweepReport {
            dead,
            recovered,
            backlog,
            pruned,
        })
    }

    /// Sweep on an interval until Ctrl-C. Failed sweeps are logged and retried
    /// on the next tick.
    pub async fn run(&self, interval: Duration) -> anyhow::Result<()> {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.tick().await {
                        Ok(report) => tracing::debug!(
                            dead = report.dead.len(),
                            recovered = report.recovered.resolved.len(),
                            backlog = report.backlog.resolved.len(),
                            pruned = report.pruned.len(),
                            "Sweep finished"
                        ),
                        Err(e) if e.is_retryable() => {
                            tracing::warn!(error = %e, "Sweep contended, retrying next tick");
                        }
                        Err(e) => tracing::error!(error = %e, "Sweep failed"),
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("Shutting down sweep");
                    return Ok(());
                }
            }
        }
    }
}
