// ABOUTME: Normalized chat channel names used as ownership keys.
// ABOUTME: Trims, lower-cases, and enforces the canonical '#'-prefixed form.

use crate::error::ChannelError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A normalized channel name such as `#ghostzero`.
///
/// Construction always goes through [`Channel::parse`], so two values compare
/// equal exactly when they name the same channel on the network.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Channel(String);

impl Channel {
    /// Normalize a user-supplied channel name.
    ///
    /// Leading/trailing whitespace is dropped, the name is lower-cased and a
    /// single `#` prefix is ensured. Empty names and names containing
    /// whitespace, control characters or IRC list separators are rejected.
    pub fn parse(input: &str) -> Result<Self, ChannelError> {
        let trimmed = input.trim();
        let bare = trimmed.strip_prefix('#').unwrap_or(trimmed);

        if bare.is_empty() {
            return Err(ChannelError::Empty {
                input: input.to_string(),
            });
        }

        if let Some(bad) = bare
            .chars()
            .find(|c| c.is_whitespace() || c.is_control() || matches!(c, ',' | '#' | ':'))
        {
            return Err(ChannelError::Malformed {
                input: input.to_string(),
                character: bad,
            });
        }

        Ok(Self(format!("#{}", bare.to_lowercase())))
    }

    /// Normalize a batch of names, collapsing duplicates while keeping the
    /// first-seen order. Any invalid name fails the whole batch.
    pub fn parse_all<I, S>(inputs: I) -> Result<Vec<Self>, ChannelError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut out: Vec<Self> = Vec::new();
        for input in inputs {
            let channel = Self::parse(input.as_ref())?;
            if !out.contains(&channel) {
                out.push(channel);
            }
        }
        Ok(out)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Name without the `#` prefix, as used by the chat protocol's JOIN.
    pub fn login(&self) -> &str {
        &self.0[1..]
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Channel {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Channel {
    type Error = ChannelError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Channel> for String {
    fn from(channel: Channel) -> Self {
        channel.0
    }
}

impl std::str::FromStr for Channel {
    type Err = ChannelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adds_prefix_and_lowercases() {
        assert_eq!(Channel::parse("GhostZero").unwrap().as_str(), "#ghostzero");
        assert_eq!(Channel::parse("#Test1").unwrap().as_str(), "#test1");
    }

    #[test]
    fn test_trims_whitespace() {
        assert_eq!(Channel::parse("  test2\n").unwrap().as_str(), "#test2");
        assert_eq!(Channel::parse(" #test2 ").unwrap().as_str(), "#test2");
    }

    #[test]
    fn test_rejects_empty() {
        assert!(matches!(Channel::parse(""), Err(ChannelError::Empty { .. })));
        assert!(matches!(Channel::parse("   "), Err(ChannelError::Empty { .. })));
        assert!(matches!(Channel::parse("#"), Err(ChannelError::Empty { .. })));
    }

    #[test]
    fn test_rejects_malformed() {
        assert!(matches!(
            Channel::parse("two words"),
            Err(ChannelError::Malformed { character: ' ', .. })
        ));
        assert!(matches!(
            Channel::parse("a,b"),
            Err(ChannelError::Malformed { character: ',', .. })
        ));
        assert!(matches!(
            Channel::parse("##double"),
            Err(ChannelError::Malformed { character: '#', .. })
        ));
    }

    #[test]
    fn test_parse_all_collapses_duplicates_in_order() {
        let channels = Channel::parse_all(["b", "#A", "a", "B", "c"]).unwrap();
        let names: Vec<&str> = channels.iter().map(Channel::as_str).collect();
        assert_eq!(names, vec!["#b", "#a", "#c"]);
    }

    #[test]
    fn test_parse_all_fails_whole_batch() {
        let err = Channel::parse_all(["ok", "", "fine"]).unwrap_err();
        assert!(matches!(err, ChannelError::Empty { .. }));
    }

    #[test]
    fn test_login_strips_prefix() {
        assert_eq!(Channel::parse("#GhostZero").unwrap().login(), "ghostzero");
    }

    #[test]
    fn test_serde_normalizes() {
        let channel: Channel = serde_json::from_str("\"Foo\"").unwrap();
        assert_eq!(channel.as_str(), "#foo");
        assert_eq!(serde_json::to_string(&channel).unwrap(), "\"#foo\"");
        assert!(serde_json::from_str::<Channel>("\"\"").is_err());
    }
}
