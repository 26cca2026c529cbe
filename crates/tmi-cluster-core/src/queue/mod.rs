// ABOUTME: Per-process command dispatch queue contract.
// ABOUTME: Append-only and FIFO per process; the distributor only ever enqueues.

mod memory;

pub use memory::MemoryCommandQueue;

use async_trait::async_trait;

use crate::command::Command;
use crate::error::QueueError;
use crate::process::ProcessId;

/// Outbound command channel to each worker process.
///
/// Delivery is at-least-once. There is no ordering between different
/// processes, only FIFO within one.
#[async_trait]
pub trait CommandQueue: Send + Sync {
    /// Append a command to the process's queue.
    async fn enqueue(&self, process_id: ProcessId, command: Command) -> Result<(), QueueError>;

    /// Drain and return the process's pending commands, oldest first.
    async fn pending(&self, process_id: ProcessId) -> Result<Vec<Command>, QueueError>;
}
