// ABOUTME: Process registry contract: durable records of every worker and its channels.
// ABOUTME: Health queries, ownership lookups, and atomic ownership commits.

mod memory;

pub use memory::MemoryRegistry;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;

use crate::channel::Channel;
use crate::error::RegistryError;
use crate::process::{ProcessId, ProcessState, SupervisorProcess};

/// One ownership change computed by a distribution batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub channel: Channel,
    pub process_id: ProcessId,
    /// Owner observed when the batch was computed. The commit fails with
    /// [`RegistryError::Conflict`] if the channel's owner has changed since,
    /// and otherwise removes the channel from this process.
    pub previous_owner: Option<ProcessId>,
    /// Channel count of `process_id` in the batch snapshot, before this
    /// batch. When set, the commit fails with [`RegistryError::Conflict`]
    /// if the process has gained or lost channels since.
    pub expected_load: Option<usize>,
}

/// Storage for [`SupervisorProcess`] records.
///
/// Implementations keep ownership in the processes' channel sets; the owner of
/// a channel is whichever process lists it.
#[async_trait]
pub trait ProcessRegistry: Send + Sync {
    /// Store a new process record.
    async fn register(&self, process: SupervisorProcess) -> Result<(), RegistryError>;

    /// Record a liveness signal from the worker.
    async fn heartbeat(
        &self,
        id: ProcessId,
        state: ProcessState,
        at: DateTime<Utc>,
    ) -> Result<(), RegistryError>;

    async fn get(&self, id: ProcessId) -> Result<Option<SupervisorProcess>, RegistryError>;

    /// Every process, in registration order (created_at, then id).
    async fn list(&self) -> Result<Vec<SupervisorProcess>, RegistryError>;

    /// Delete a process record and everything it owns.
    async fn remove(&self, id: ProcessId) -> Result<bool, RegistryError>;

    /// Current owner of each requested channel that has one. If a channel is
    /// listed by several processes, the earliest-registered one is reported.
    async fn owners(
        &self,
        channels: &[Channel],
    ) -> Result<HashMap<Channel, ProcessId>, RegistryError>;

    /// Apply a batch of ownership changes all-or-nothing.
    async fn commit(&self, assignments: &[Assignment]) -> Result<(), RegistryError>;

    /// Drop a channel from a process. Returns whether it was owned.
    async fn remove_channel(
        &self,
        id: ProcessId,
        channel: &Channel,
    ) -> Result<bool, RegistryError>;

    /// Processes eligible for new channels, in registration order.
    async fn list_healthy(
        &self,
        now: DateTime<Utc>,
        stale_after: Duration,
    ) -> Result<Vec<SupervisorProcess>, RegistryError> {
        let processes = self.list().await?;
        Ok(processes
            .into_iter()
            .filter(|p| p.is_healthy(now, stale_after))
            .collect())
    }

    async fn channel_count(&self, id: ProcessId) -> Result<usize, RegistryError> {
        self.get(id)
            .await?
            .map(|p| p.channels.len())
            .ok_or(RegistryError::NotFound(id))
    }

    /// Give an unowned channel to a process.
    async fn add_channel(&self, id: ProcessId, channel: &Channel) -> Result<(), RegistryError> {
        self.commit(&[Assignment {
            channel: channel.clone(),
            process_id: id,
            previous_owner: None,
            expected_load: None,
        }])
        .await
    }
}

/// Shared commit validation: the owner seen now must match the batch snapshot.
pub(crate) fn check_owner(
    assignment: &Assignment,
    current: Option<ProcessId>,
) -> Result<(), RegistryError> {
    if current == assignment.previous_owner || current == Some(assignment.process_id) {
        return Ok(());
    }
    Err(RegistryError::Conflict(format!(
        "{} is owned by {} (expected {})",
        assignment.channel,
        current.map(|id| id.to_string()).unwrap_or_else(|| "nobody".into()),
        assignment
            .previous_owner
            .map(|id| id.to_string())
            .unwrap_or_else(|| "nobody".into()),
    )))
}

/// Shared commit validation: the target's load must still be the one the
/// batch was computed from.
pub(crate) fn check_load(assignment: &Assignment, current: usize) -> Result<(), RegistryError> {
    match assignment.expected_load {
        Some(expected) if expected != current => Err(RegistryError::Conflict(format!(
            "{} holds {current} channels (expected {expected})",
            assignment.process_id
        ))),
        _ => Ok(()),
    }
}
