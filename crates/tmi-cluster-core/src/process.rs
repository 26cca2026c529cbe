// ABOUTME: Supervisor process records and the health predicate used for eligibility.
// ABOUTME: A process owns a set of channels; only fresh CONNECTED processes take new ones.

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

use crate::channel::Channel;

/// Opaque identity of a worker process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProcessId(Uuid);

impl ProcessId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ProcessId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for ProcessId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for ProcessId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

/// Lifecycle state reported by the worker itself.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessState {
    #[default]
    Initializing,
    Connected,
    Disconnected,
    Exited,
}

impl ProcessState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessState::Initializing => "initializing",
            ProcessState::Connected => "connected",
            ProcessState::Disconnected => "disconnected",
            ProcessState::Exited => "exited",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ProcessState::Disconnected | ProcessState::Exited)
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProcessState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "initializing" | "initialize" => Ok(ProcessState::Initializing),
            "connected" => Ok(ProcessState::Connected),
            "disconnected" => Ok(ProcessState::Disconnected),
            "exited" => Ok(ProcessState::Exited),
            other => Err(format!("unknown process state: {other}")),
        }
    }
}

/// A worker unit holding live connections to a set of channels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupervisorProcess {
    pub id: ProcessId,
    /// Name of the supervisor (host) that spawned this worker.
    pub supervisor: String,
    pub state: ProcessState,
    /// Registration time; first component of the tie-break order.
    pub created_at: DateTime<Utc>,
    pub last_heartbeat_at: DateTime<Utc>,
    pub channels: BTreeSet<Channel>,
}

impl SupervisorProcess {
    /// A freshly spawned worker that has not connected yet.
    pub fn new(supervisor: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: ProcessId::new(),
            supervisor: supervisor.into(),
            state: ProcessState::Initializing,
            created_at: now,
            last_heartbeat_at: now,
            channels: BTreeSet::new(),
        }
    }

    pub fn with_state(mut self, state: ProcessState) -> Self {
        self.state = state;
        self
    }

    pub fn with_heartbeat(mut self, at: DateTime<Utc>) -> Self {
        self.last_heartbeat_at = at;
        self
    }

    pub fn with_created_at(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = at;
        self
    }

    pub fn with_channels<I: IntoIterator<Item = Channel>>(mut self, channels: I) -> Self {
        self.channels.extend(channels);
        self
    }

    /// Eligibility for new channels: CONNECTED and heartbeat no older than
    /// `stale_after` at `now`. Depends on nothing else.
    pub fn is_healthy(&self, now: DateTime<Utc>, stale_after: Duration) -> bool {
        self.state == ProcessState::Connected && !self.is_stale(now, stale_after)
    }

    /// Heartbeat older than `stale_after` at `now`.
    pub fn is_stale(&self, now: DateTime<Utc>, stale_after: Duration) -> bool {
        let threshold = TimeDelta::from_std(stale_after).unwrap_or(TimeDelta::MAX);
        now.signed_duration_since(self.last_heartbeat_at) > threshold
    }

    /// Total order used to break load ties: registration time, then id.
    pub fn order_key(&self) -> (DateTime<Utc>, ProcessId) {
        (self.created_at, self.id)
    }
}

/// Sort processes into the registry's tie-break order.
pub fn sort_by_registration(processes: &mut [SupervisorProcess]) {
    processes.sort_by_key(SupervisorProcess::order_key);
}

#[cfg(test)]
mod tests {
    use super::*;

    const STALE: Duration = Duration::from_secs(3);

    #[test]
    fn test_connected_fresh_is_healthy() {
        let now = Utc::now();
        let p = SupervisorProcess::new("host")
            .with_state(ProcessState::Connected)
            .with_heartbeat(now - TimeDelta::seconds(2));
        assert!(p.is_healthy(now, STALE));
    }

    #[test]
    fn test_threshold_is_inclusive() {
        let now = Utc::now();
        let p = SupervisorProcess::new("host")
            .with_state(ProcessState::Connected)
            .with_heartbeat(now - TimeDelta::seconds(3));
        assert!(p.is_healthy(now, STALE));
    }

    #[test]
    fn test_stale_heartbeat_is_unhealthy() {
        let now = Utc::now();
        let p = SupervisorProcess::new("host")
            .with_state(ProcessState::Connected)
            .with_heartbeat(now - TimeDelta::seconds(5));
        assert!(p.is_stale(now, STALE));
        assert!(!p.is_healthy(now, STALE));
    }

    #[test]
    fn test_non_connected_states_are_unhealthy() {
        let now = Utc::now();
        for state in [
            ProcessState::Initializing,
            ProcessState::Disconnected,
            ProcessState::Exited,
        ] {
            let p = SupervisorProcess::new("host")
                .with_state(state)
                .with_heartbeat(now);
            assert!(!p.is_healthy(now, STALE), "{state} should not be eligible");
        }
    }

    #[test]
    fn test_state_round_trips_through_str() {
        for state in [
            ProcessState::Initializing,
            ProcessState::Connected,
            ProcessState::Disconnected,
            ProcessState::Exited,
        ] {
            assert_eq!(state.as_str().parse::<ProcessState>().unwrap(), state);
        }
        assert!("zombie".parse::<ProcessState>().is_err());
    }

    #[test]
    fn test_sort_by_registration_breaks_ties_by_id() {
        let at = Utc::now();
        let a = SupervisorProcess::new("a").with_created_at(at);
        let b = SupervisorProcess::new("b").with_created_at(at);
        let early = SupervisorProcess::new("c").with_created_at(at - TimeDelta::seconds(1));

        let mut processes = vec![a.clone(), b.clone(), early.clone()];
        sort_by_registration(&mut processes);

        assert_eq!(processes[0].id, early.id);
        let (first, second) = if a.id < b.id { (a.id, b.id) } else { (b.id, a.id) };
        assert_eq!(processes[1].id, first);
        assert_eq!(processes[2].id, second);
    }

    #[test]
    fn test_process_id_parse() {
        let id = ProcessId::new();
        let parsed: ProcessId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
        assert!("not-a-uuid".parse::<ProcessId>().is_err());
    }
}
