// ABOUTME: Error types for the tmi-cluster core crate.
// ABOUTME: Separates invalid input, ownership conflicts, and storage unavailability.

use crate::process::ProcessId;
use thiserror::Error;

/// A channel name that cannot be normalized.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    #[error("channel name is empty: {input:?}")]
    Empty { input: String },

    #[error("channel name {input:?} contains invalid character {character:?}")]
    Malformed { input: String, character: char },
}

/// Errors raised by a process registry backend.
#[derive(Error, Debug)]
pub enum RegistryError {
    /// Ownership changed between reading the batch snapshot and committing it.
    #[error("ownership conflict: {0}")]
    Conflict(String),

    #[error("process not found: {0}")]
    NotFound(ProcessId),

    #[error("process already registered: {0}")]
    AlreadyExists(ProcessId),

    #[error("registry storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("corrupt registry record: {0}")]
    Corrupt(String),
}

/// Errors raised by a command queue or backlog backend.
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("queue storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("command serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors surfaced to callers of the channel distributor.
///
/// Capacity exhaustion and already-owned channels are never errors; they are
/// the `rejected` and `ignored` partitions of a [`crate::Distribution`].
#[derive(Error, Debug)]
pub enum DistributorError {
    /// Input rejected before touching the registry.
    #[error("invalid channel: {0}")]
    InvalidChannel(#[from] ChannelError),

    /// The batch could not be applied within the retry budget. Nothing was
    /// committed; the whole batch may be submitted again.
    #[error("distribution batch still contended after {attempts} attempts")]
    Contended { attempts: u32 },

    #[error("registry unavailable: {0}")]
    Registry(#[from] RegistryError),

    #[error("backlog unavailable: {0}")]
    Backlog(#[from] QueueError),
}

impl DistributorError {
    /// Whether re-submitting the same batch can succeed without operator action.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DistributorError::Contended { .. }
                | DistributorError::Registry(RegistryError::Conflict(_))
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ChannelError::Empty {
            input: " ".to_string(),
        };
        assert_eq!(err.to_string(), "channel name is empty: \" \"");

        let err = DistributorError::Contended { attempts: 3 };
        assert_eq!(
            err.to_string(),
            "distribution batch still contended after 3 attempts"
        );
    }

    #[test]
    fn test_channel_error_converts() {
        let err: DistributorError = ChannelError::Malformed {
            input: "a b".to_string(),
            character: ' ',
        }
        .into();
        assert!(matches!(err, DistributorError::InvalidChannel(_)));
        assert!(err.to_string().contains("invalid character ' '"));
    }

    #[test]
    fn test_retryable_classification() {
        assert!(DistributorError::Contended { attempts: 1 }.is_retryable());
        assert!(DistributorError::Registry(RegistryError::Conflict("x".into())).is_retryable());
        assert!(!DistributorError::Registry(RegistryError::Corrupt("x".into())).is_retryable());
        assert!(!DistributorError::InvalidChannel(ChannelError::Empty {
            input: String::new()
        })
        .is_retryable());
    }
}
