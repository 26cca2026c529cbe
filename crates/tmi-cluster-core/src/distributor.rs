// ABOUTME: Channel distributor - decides which worker process owns each channel.
// ABOUTME: Greedy least-loaded assignment, duplicate suppression, and dead-process recovery.

use chrono::Utc;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::backlog::ChannelBacklog;
use crate::channel::Channel;
use crate::command::Command;
use crate::config::DistributorConfig;
use crate::error::{DistributorError, RegistryError};
use crate::process::ProcessId;
use crate::queue::CommandQueue;
use crate::registry::{Assignment, ProcessRegistry};

/// Outcome of one distribution batch. Every requested channel lands in
/// exactly one of the three partitions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Distribution {
    /// Newly assigned by this batch.
    pub resolved: BTreeMap<Channel, ProcessId>,
    /// Already owned by an eligible process; left untouched.
    pub ignored: BTreeMap<Channel, ProcessId>,
    /// No eligible process was available.
    pub rejected: BTreeSet<Channel>,
}

impl Distribution {
    pub fn len(&self) -> usize {
        self.resolved.len() + self.ignored.len() + self.rejected.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Owner after this batch, if the channel was resolved or ignored.
    pub fn owner(&self, channel: &Channel) -> Option<ProcessId> {
        self.resolved
            .get(channel)
            .or_else(|| self.ignored.get(channel))
            .copied()
    }
}

/// One batch's input, fixed before the first attempt.
struct BatchRequest<'a> {
    channels: &'a [Channel],
    excluded: &'a HashSet<ProcessId>,
    /// Processes whose whole channel set is added to the batch (flushStale).
    orphaned_from: &'a [ProcessId],
}

enum BatchFailure {
    Retry(String),
    Fatal(DistributorError),
}

impl From<RegistryError> for BatchFailure {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::Conflict(reason) => BatchFailure::Retry(reason),
            other => BatchFailure::Fatal(other.into()),
        }
    }
}

/// Assigns channels to worker processes.
///
/// Holds the registry, dispatch queue and backlog it works against; batches
/// are serialized through one exclusion scope so that two concurrent calls
/// never hand the same channel to different processes.
pub struct ChannelDistributor {
    registry: Arc<dyn ProcessRegistry>,
    queue: Arc<dyn CommandQueue>,
    backlog: Arc<dyn ChannelBacklog>,
    config: DistributorConfig,
    batch_lock: Mutex<()>,
}

impl ChannelDistributor {
    pub fn new(
        registry: Arc<dyn ProcessRegistry>,
        queue: Arc<dyn CommandQueue>,
        backlog: Arc<dyn ChannelBacklog>,
        config: DistributorConfig,
    ) -> Self {
        Self {
            registry,
            queue,
            backlog,
            config,
            batch_lock: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &DistributorConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<dyn ProcessRegistry> {
        &self.registry
    }

    /// Resolve channels to owners, skipping the processes in `excluded`.
    pub async fn resolve<S: AsRef<str>>(
        &self,
        channels: &[S],
        excluded: &[ProcessId],
    ) -> Result<Distribution, DistributorError> {
        let channels = Channel::parse_all(channels)?;
        let excluded: HashSet<ProcessId> = excluded.iter().copied().collect();
        self.distribute(BatchRequest {
            channels: &channels,
            excluded: &excluded,
            orphaned_from: &[],
        })
        .await
    }

    /// Synchronous join: everything parked by [`Self::join`] is resolved in the
    /// same batch, ahead of the caller's channels. Parked channels that are
    /// rejected go back to the backlog, even if the caller asked for them too;
    /// the caller's other rejections are only reported.
    pub async fn join_now<S: AsRef<str>>(
        &self,
        channels: &[S],
        excluded: &[ProcessId],
    ) -> Result<Distribution, DistributorError> {
        let requested = Channel::parse_all(channels)?;
        let parked = self.backlog.take_all().await?;

        let mut batch = parked.clone();
        for channel in &requested {
            if !batch.contains(channel) {
                batch.push(channel.clone());
            }
        }

        let excluded: HashSet<ProcessId> = excluded.iter().copied().collect();
        let result = self
            .distribute(BatchRequest {
                channels: &batch,
                excluded: &excluded,
                orphaned_from: &[],
            })
            .await;

        match result {
            Ok(distribution) => {
                let repark: Vec<Channel> = parked
                    .into_iter()
                    .filter(|c| distribution.rejected.contains(c))
                    .collect();
                self.repark(&repark).await?;
                Ok(distribution)
            }
            Err(err) => Err(self.repark_after_failure(&parked, err).await),
        }
    }

    /// Asynchronous join: park the channels for a later batch.
    pub async fn join<S: AsRef<str>>(&self, channels: &[S]) -> Result<(), DistributorError> {
        let channels = Channel::parse_all(channels)?;
        self.backlog.push(&channels).await?;
        tracing::debug!(count = channels.len(), "Parked channels for later distribution");
        Ok(())
    }

    /// Drain the backlog through one batch. Rejected channels are parked again.
    pub async fn sweep_backlog(&self) -> Result<Distribution, DistributorError> {
        let parked = self.backlog.take_all().await?;
        if parked.is_empty() {
            return Ok(Distribution::default());
        }

        let excluded = HashSet::new();
        let result = self
            .distribute(BatchRequest {
                channels: &parked,
                excluded: &excluded,
                orphaned_from: &[],
            })
            .await;

        match result {
            Ok(distribution) => {
                let repark: Vec<Channel> = distribution.rejected.iter().cloned().collect();
                self.repark(&repark).await?;
                Ok(distribution)
            }
            Err(err) => Err(self.repark_after_failure(&parked, err).await),
        }
    }

    /// Move channels away from dead processes.
    ///
    /// The batch covers `explicit` plus every channel currently held by a
    /// process in `dead`. Dead processes are excluded from the eligible pool,
    /// so their channels are reassigned; explicit channels held by a healthy
    /// process stay where they are. Dead records are left in place, and any
    /// channel that cannot be placed stays attributed to its dead owner.
    pub async fn flush_stale<S: AsRef<str>>(
        &self,
        explicit: &[S],
        dead: &[ProcessId],
    ) -> Result<Distribution, DistributorError> {
        let channels = Channel::parse_all(explicit)?;
        let excluded: HashSet<ProcessId> = dead.iter().copied().collect();
        let distribution = self
            .distribute(BatchRequest {
                channels: &channels,
                excluded: &excluded,
                orphaned_from: dead,
            })
            .await?;

        if !distribution.rejected.is_empty() {
            tracing::warn!(
                rejected = distribution.rejected.len(),
                "Orphaned channels could not be placed; no eligible process"
            );
        }
        Ok(distribution)
    }

    /// Release channels from whichever process owns them and tell that
    /// process to leave. Returns the previous owner of each released channel.
    pub async fn part<S: AsRef<str>>(
        &self,
        channels: &[S],
    ) -> Result<BTreeMap<Channel, ProcessId>, DistributorError> {
        let channels = Channel::parse_all(channels)?;
        let released = {
            let _guard = self.acquire_batch_scope().await?;
            let owners = self.registry.owners(&channels).await?;
            let mut released = BTreeMap::new();
            for channel in &channels {
                if let Some(&owner) = owners.get(channel) {
                    if self.registry.remove_channel(owner, channel).await? {
                        released.insert(channel.clone(), owner);
                    }
                }
            }
            released
        };

        for (channel, owner) in &released {
            self.dispatch(*owner, Command::part(channel.clone())).await;
        }
        tracing::info!(count = released.len(), "Parted channels");
        Ok(released)
    }

    async fn repark(&self, channels: &[Channel]) -> Result<(), DistributorError> {
        if channels.is_empty() {
            return Ok(());
        }
        self.backlog.push(channels).await?;
        tracing::debug!(count = channels.len(), "Returned channels to backlog");
        Ok(())
    }

    /// Put drained channels back after a failed batch. The batch error is
    /// what the caller sees; a backlog failure here is only logged.
    async fn repark_after_failure(
        &self,
        parked: &[Channel],
        err: DistributorError,
    ) -> DistributorError {
        if let Err(backlog_err) = self.repark(parked).await {
            let channels: Vec<&str> = parked.iter().map(Channel::as_str).collect();
            tracing::error!(
                error = %backlog_err,
                batch_error = %err,
                channels = ?channels,
                "Parked channels lost: backlog rejected them after a failed batch"
            );
        }
        err
    }

    /// Wait for the batch scope with the configured bound and retry budget.
    async fn acquire_batch_scope(&self) -> Result<tokio::sync::MutexGuard<'_, ()>, DistributorError> {
        let attempts = self.config.max_batch_attempts;
        for attempt in 1..=attempts {
            match tokio::time::timeout(self.config.lock_timeout, self.batch_lock.lock()).await {
                Ok(guard) => return Ok(guard),
                Err(_) => {
                    tracing::warn!(attempt, "Timed out waiting for distribution batch scope");
                }
            }
        }
        Err(DistributorError::Contended { attempts })
    }

    async fn distribute(&self, request: BatchRequest<'_>) -> Result<Distribution, DistributorError> {
        let attempts = self.config.max_batch_attempts;
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.try_batch(&request).await {
                Ok((distribution, assignments)) => {
                    tracing::info!(
                        resolved = distribution.resolved.len(),
                        ignored = distribution.ignored.len(),
                        rejected = distribution.rejected.len(),
                        attempt,
                        "Distributed channels"
                    );
                    // Request order, so each worker joins in the order asked.
                    for assignment in assignments {
                        self.dispatch(assignment.process_id, Command::join(assignment.channel))
                            .await;
                    }
                    return Ok(distribution);
                }
                Err(BatchFailure::Retry(reason)) if attempt < attempts => {
                    tracing::warn!(attempt, reason = %reason, "Distribution batch contended, retrying");
                    tokio::time::sleep(std::time::Duration::from_millis(10 * u64::from(attempt)))
                        .await;
                }
                Err(BatchFailure::Retry(reason)) => {
                    tracing::warn!(attempt, reason = %reason, "Distribution batch gave up");
                    return Err(DistributorError::Contended { attempts });
                }
                Err(BatchFailure::Fatal(err)) => return Err(err),
            }
        }
    }

    /// Compute and commit one batch inside the exclusion scope. Returns the
    /// committed assignments in request order alongside the result.
    async fn try_batch(
        &self,
        request: &BatchRequest<'_>,
    ) -> Result<(Distribution, Vec<Assignment>), BatchFailure> {
        let _guard =
            match tokio::time::timeout(self.config.lock_timeout, self.batch_lock.lock()).await {
                Ok(guard) => guard,
                Err(_) => return Err(BatchFailure::Retry("batch scope wait timed out".into())),
            };

        let now = Utc::now();
        let healthy: Vec<_> = self
            .registry
            .list_healthy(now, self.config.stale_after)
            .await?
            .into_iter()
            .filter(|p| !request.excluded.contains(&p.id))
            .collect();
        let eligible: HashSet<ProcessId> = healthy.iter().map(|p| p.id).collect();

        let mut channels: Vec<Channel> = request.channels.to_vec();
        for id in request.orphaned_from {
            if let Some(process) = self.registry.get(*id).await? {
                for channel in process.channels {
                    if !channels.contains(&channel) {
                        channels.push(channel);
                    }
                }
            }
        }

        let owners = self.registry.owners(&channels).await?;

        // Registration order is the tie-break: position in this table.
        let mut load: Vec<(ProcessId, usize)> =
            healthy.iter().map(|p| (p.id, p.channels.len())).collect();
        // Loads as read; the commit refuses them if another node moved first.
        let observed: HashMap<ProcessId, usize> = load.iter().copied().collect();

        let mut distribution = Distribution::default();
        let mut assignments = Vec::new();

        for channel in channels {
            let current = owners.get(&channel).copied();

            if let Some(owner) = current.filter(|o| eligible.contains(o)) {
                tracing::debug!(channel = %channel, process_id = %owner, "Already owned");
                distribution.ignored.insert(channel, owner);
                continue;
            }

            let Some(slot) = load
                .iter_mut()
                .enumerate()
                .min_by_key(|(position, (_, count))| (*count, *position))
                .map(|(_, slot)| slot)
            else {
                tracing::debug!(channel = %channel, "No eligible process");
                distribution.rejected.insert(channel);
                continue;
            };

            slot.1 += 1;
            let process_id = slot.0;
            tracing::debug!(
                channel = %channel,
                process_id = %process_id,
                previous_owner = ?current,
                "Assigning channel"
            );
            assignments.push(Assignment {
                channel: channel.clone(),
                process_id,
                previous_owner: current,
                expected_load: observed.get(&process_id).copied(),
            });
            distribution.resolved.insert(channel, process_id);
        }

        if !assignments.is_empty() {
            self.registry.commit(&assignments).await?;
        }
        Ok((distribution, assignments))
    }

    /// Enqueue with independent retries. Ownership is already committed, so a
    /// failure here is logged rather than unwinding the batch.
    async fn dispatch(&self, process_id: ProcessId, command: Command) {
        let attempts = self.config.enqueue_attempts;
        for attempt in 1..=attempts {
            match self.queue.enqueue(process_id, command.clone()).await {
                Ok(()) => return,
                Err(e) if attempt < attempts => {
                    tracing::warn!(
                        process_id = %process_id,
                        channel = %command.channel(),
                        attempt,
                        error = %e,
                        "Enqueue failed, retrying"
                    );
                    tokio::time::sleep(std::time::Duration::from_millis(10 * u64::from(attempt)))
                        .await;
                }
                Err(e) => {
                    tracing::error!(
                        process_id = %process_id,
                        channel = %command.channel(),
                        error = %e,
                        "Command could not be enqueued"
                    );
                }
            }
        }
    }
}
