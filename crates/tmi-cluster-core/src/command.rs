// ABOUTME: Commands placed on a worker's dispatch queue.
// ABOUTME: Immutable once enqueued; serialized as JSON for durable queues.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::channel::Channel;

/// What the worker is asked to do.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CommandKind {
    JoinChannel { channel: Channel },
    PartChannel { channel: Channel },
}

/// A unit of work for one worker process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub id: Uuid,
    pub issued_at: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: CommandKind,
}

impl Command {
    pub fn new(kind: CommandKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            issued_at: Utc::now(),
            kind,
        }
    }

    pub fn join(channel: Channel) -> Self {
        Self::new(CommandKind::JoinChannel { channel })
    }

    pub fn part(channel: Channel) -> Self {
        Self::new(CommandKind::PartChannel { channel })
    }

    pub fn channel(&self) -> &Channel {
        match &self.kind {
            CommandKind::JoinChannel { channel } | CommandKind::PartChannel { channel } => channel,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_shape() {
        let cmd = Command::join(Channel::parse("ghostzero").unwrap());
        let value = serde_json::to_value(&cmd).unwrap();
        assert_eq!(value["type"], "join_channel");
        assert_eq!(value["channel"], "#ghostzero");
        assert!(value["id"].is_string());

        let back: Command = serde_json::from_value(value).unwrap();
        assert_eq!(back, cmd);
    }

    #[test]
    fn test_channel_accessor() {
        let channel = Channel::parse("test").unwrap();
        assert_eq!(Command::part(channel.clone()).channel(), &channel);
    }
}
