// ABOUTME: Core library for tmi-cluster - channels, processes, registry, queue, distributor
// ABOUTME: Shared between the tmi-cluster CLI and the supervisor sweep

pub mod backlog;
pub mod channel;
pub mod command;
pub mod config;
pub mod distributor;
pub mod error;
pub mod process;
pub mod queue;
pub mod registry;
pub mod store;

pub use backlog::{ChannelBacklog, MemoryBacklog};
pub use channel::Channel;
pub use command::{Command, CommandKind};
pub use config::{ClusterConfig, DistributorConfig};
pub use distributor::{ChannelDistributor, Distribution};
pub use error::{ChannelError, DistributorError, QueueError, RegistryError};
pub use process::{ProcessId, ProcessState, SupervisorProcess};
pub use queue::{CommandQueue, MemoryCommandQueue};
pub use registry::{Assignment, MemoryRegistry, ProcessRegistry};
pub use store::SqliteStore;
