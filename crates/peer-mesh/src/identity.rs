use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identity of a mesh member. Ordering is byte-wise over the UTF-8 string,
/// which is what every peer computes for the same pair.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for PeerId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Token minted by the initiator for one connection attempt. Every handshake
/// message of the attempt carries it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(String);

impl ConnectionId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConnectionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Initiator,
    Acceptor,
}

/// Role `local` plays towards `remote`: the lower identity initiates.
/// Returns `None` for the degenerate self pair.
pub fn role_towards(local: &PeerId, remote: &PeerId) -> Option<Role> {
    match local.cmp(remote) {
        std::cmp::Ordering::Less => Some(Role::Initiator),
        std::cmp::Ordering::Greater => Some(Role::Acceptor),
        std::cmp::Ordering::Equal => None,
    }
}
