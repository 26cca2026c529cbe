// ABOUTME: In-memory command queue keyed by process id.
// ABOUTME: Commands drain FIFO per worker; used by tests and single-node embedding.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use tokio::sync::Mutex;

use super::CommandQueue;
use crate::command::Command;
use crate::error::QueueError;
use crate::process::ProcessId;

#[derive(Debug, Default)]
pub struct MemoryCommandQueue {
    queues: Mutex<HashMap<ProcessId, VecDeque<Command>>>,
}

impl MemoryCommandQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of undrained commands for a process.
    pub async fn len(&self, process_id: ProcessId) -> usize {
        self.queues
            .lock()
            .await
            .get(&process_id)
            .map_or(0, VecDeque::len)
    }
}

#[async_trait]
impl CommandQueue for MemoryCommandQueue {
    async fn enqueue(&self, process_id: ProcessId, command: Command) -> Result<(), QueueError> {
        self.queues
            .lock()
            .await
            .entry(process_id)
            .or_default()
            .push_back(command);
        Ok(())
    }

    async fn pending(&self, process_id: ProcessId) -> Result<Vec<Command>, QueueError> {
        let mut queues = self.queues.lock().await;
        Ok(queues
            .remove(&process_id)
            .map(Vec::from)
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Channel;

    #[tokio::test]
    async fn test_fifo_per_process_and_drain() {
        let queue = MemoryCommandQueue::new();
        let a = ProcessId::new();
        let b = ProcessId::new();

        for name in ["one", "two", "three"] {
            queue
                .enqueue(a, Command::join(Channel::parse(name).unwrap()))
                .await
                .unwrap();
        }
        queue
            .enqueue(b, Command::join(Channel::parse("other").unwrap()))
            .await
            .unwrap();
        assert_eq!(queue.len(a).await, 3);

        let drained: Vec<String> = queue
            .pending(a)
            .await
            .unwrap()
            .iter()
            .map(|c| c.channel().to_string())
            .collect();
        assert_eq!(drained, vec!["#one", "#two", "#three"]);
        assert!(queue.pending(a).await.unwrap().is_empty());
        assert_eq!(queue.len(b).await, 1);
    }
}
