// ABOUTME: Backlog of channels submitted with the asynchronous join.
// ABOUTME: Drained in batches by joinNow and by the periodic sweep.

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::channel::Channel;
use crate::error::QueueError;

/// Set of channels waiting for a distribution batch.
#[async_trait]
pub trait ChannelBacklog: Send + Sync {
    /// Park channels; ones already parked are not duplicated.
    async fn push(&self, channels: &[Channel]) -> Result<(), QueueError>;

    /// Remove and return everything parked, oldest first.
    async fn take_all(&self) -> Result<Vec<Channel>, QueueError>;
}

#[derive(Debug, Default)]
pub struct MemoryBacklog {
    channels: Mutex<Vec<Channel>>,
}

impl MemoryBacklog {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ChannelBacklog for MemoryBacklog {
    async fn push(&self, channels: &[Channel]) -> Result<(), QueueError> {
        let mut parked = self.channels.lock().await;
        for channel in channels {
            if !parked.contains(channel) {
                parked.push(channel.clone());
            }
        }
        Ok(())
    }

    async fn take_all(&self) -> Result<Vec<Channel>, QueueError> {
        Ok(std::mem::take(&mut *self.channels.lock().await))
    }
}
