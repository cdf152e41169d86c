//! Node, ACL and event types shared by drivers and the registry.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Session identifier.
pub type SessionId = Uuid;

/// How a node is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreateMode {
    /// Survives the session that created it.
    Persistent,
    /// Deleted when the creating session ends.
    Ephemeral,
    /// Persistent, with a server assigned 10 digit suffix.
    PersistentSequential,
    /// Ephemeral, with a server assigned 10 digit suffix.
    EphemeralSequential,
}

impl CreateMode {
    #[must_use]
    pub const fn is_ephemeral(self) -> bool {
        matches!(self, Self::Ephemeral | Self::EphemeralSequential)
    }

    #[must_use]
    pub const fn is_sequential(self) -> bool {
        matches!(self, Self::PersistentSequential | Self::EphemeralSequential)
    }
}

/// Access control entry requested at creation time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Acl {
    /// Anyone may do anything.
    AnyoneAll,
    /// Only identities the creating session authenticated as.
    CreatorAll,
}

/// Node metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stat {
    /// Transaction that created the node.
    pub czxid: i64,
    /// Transaction that last modified the node data.
    pub mzxid: i64,
    /// Number of data changes.
    pub version: i32,
    /// Number of child changes.
    pub cversion: i32,
    /// Owning session for ephemeral nodes.
    pub ephemeral_owner: Option<SessionId>,
    /// Payload length.
    pub data_length: usize,
    pub num_children: usize,
}

/// Node path, payload and metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildData {
    pub path: String,
    pub data: Vec<u8>,
    pub stat: Stat,
}

impl ChildData {
    /// Payload as text, if it is valid UTF-8.
    #[must_use]
    pub fn data_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.data).ok()
    }
}

/// Kind of change delivered by a subtree watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchEventKind {
    NodeCreated,
    NodeDataChanged,
    NodeDeleted,
}

/// A change notification for one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchEvent {
    pub kind: WatchEventKind,
    pub path: String,
}

/// Connection state of a driver session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Started, not yet connected.
    Connecting,
    Connected,
    /// Closed; the session cannot be reused.
    Closed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_mode_flags() {
        assert!(!CreateMode::Persistent.is_ephemeral());
        assert!(CreateMode::Ephemeral.is_ephemeral());
        assert!(CreateMode::EphemeralSequential.is_ephemeral());
        assert!(CreateMode::EphemeralSequential.is_sequential());
        assert!(CreateMode::PersistentSequential.is_sequential());
        assert!(!CreateMode::Ephemeral.is_sequential());
    }

    #[test]
    fn test_child_data_str() {
        let data = ChildData {
            path: "/a".to_string(),
            data: b"value".to_vec(),
            stat: Stat::default(),
        };
        assert_eq!(data.data_str(), Some("value"));
    }
}
