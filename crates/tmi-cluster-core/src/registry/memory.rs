// ABOUTME: In-memory process registry for tests and single-node embedding.
// ABOUTME: Same contract as the SQLite store, guarded by one async RwLock.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;

use super::{check_load, check_owner, Assignment, ProcessRegistry};
use crate::channel::Channel;
use crate::error::RegistryError;
use crate::process::{sort_by_registration, ProcessId, ProcessState, SupervisorProcess};

#[derive(Debug, Default)]
pub struct MemoryRegistry {
    processes: RwLock<HashMap<ProcessId, SupervisorProcess>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

fn owner_in(
    processes: &HashMap<ProcessId, SupervisorProcess>,
    channel: &Channel,
) -> Option<ProcessId> {
    processes
        .values()
        .filter(|p| p.channels.contains(channel))
        .min_by_key(|p| p.order_key())
        .map(|p| p.id)
}

#[async_trait]
impl ProcessRegistry for MemoryRegistry {
    async fn register(&self, process: SupervisorProcess) -> Result<(), RegistryError> {
        let mut processes = self.processes.write().await;
        if processes.contains_key(&process.id) {
            return Err(RegistryError::AlreadyExists(process.id));
        }
        for channel in &process.channels {
            if let Some(owner) = owner_in(&processes, channel) {
                return Err(RegistryError::Conflict(format!(
                    "{channel} is already owned by {owner}"
                )));
            }
        }
        processes.insert(process.id, process);
        Ok(())
    }

    async fn heartbeat(
        &self,
        id: ProcessId,
        state: ProcessState,
        at: DateTime<Utc>,
    ) -> Result<(), RegistryError> {
        let mut processes = self.processes.write().await;
        let process = processes.get_mut(&id).ok_or(RegistryError::NotFound(id))?;
        process.state = state;
        process.last_heartbeat_at = at;
        Ok(())
    }

    async fn get(&self, id: ProcessId) -> Result<Option<SupervisorProcess>, RegistryError> {
        Ok(self.processes.read().await.get(&id).cloned())
    }

    async fn list(&self) -> Result<Vec<SupervisorProcess>, RegistryError> {
        let mut list: Vec<SupervisorProcess> =
            self.processes.read().await.values().cloned().collect();
        sort_by_registration(&mut list);
        Ok(list)
    }

    async fn remove(&self, id: ProcessId) -> Result<bool, RegistryError> {
        Ok(self.processes.write().await.remove(&id).is_some())
    }

    async fn owners(
        &self,
        channels: &[Channel],
    ) -> Result<HashMap<Channel, ProcessId>, RegistryError> {
        let processes = self.processes.read().await;
        Ok(channels
            .iter()
            .filter_map(|c| owner_in(&processes, c).map(|owner| (c.clone(), owner)))
            .collect())
    }

    async fn commit(&self, assignments: &[Assignment]) -> Result<(), RegistryError> {
        let mut processes = self.processes.write().await;

        // Validate everything before touching anything.
        for assignment in assignments {
            let target = processes
                .get(&assignment.process_id)
                .ok_or(RegistryError::NotFound(assignment.process_id))?;
            check_load(assignment, target.channels.len())?;
            check_owner(assignment, owner_in(&processes, &assignment.channel))?;
        }

        for assignment in assignments {
            if let Some(previous) = assignment.previous_owner {
                if previous != assignment.process_id {
                    if let Some(p) = processes.get_mut(&previous) {
                        p.channels.remove(&assignment.channel);
                    }
                }
            }
            if let Some(p) = processes.get_mut(&assignment.process_id) {
                p.channels.insert(assignment.channel.clone());
            }
        }
        Ok(())
    }

    async fn remove_channel(
        &self,
        id: ProcessId,
        channel: &Channel,
    ) -> Result<bool, RegistryError> {
        let mut processes = self.processes.write().await;
        let process = processes.get_mut(&id).ok_or(RegistryError::NotFound(id))?;
        Ok(process.channels.remove(channel))
    }
}
