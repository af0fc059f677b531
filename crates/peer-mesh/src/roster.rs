use std::collections::BTreeSet;

use crate::identity::PeerId;

/// Current view of group membership, excluding the local peer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Roster {
    members: BTreeSet<PeerId>,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct RosterDiff {
    pub joined: Vec<PeerId>,
    pub left: Vec<PeerId>,
}

impl RosterDiff {
    pub fn is_empty(&self) -> bool {
        self.joined.is_empty() && self.left.is_empty()
    }
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, peer: &PeerId) -> bool {
        self.members.contains(peer)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PeerId> {
        self.members.iter()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Replace the membership with `snapshot` and report what changed.
    /// The local identity is never a member.
    pub fn replace(&mut self, local: &PeerId, snapshot: &BTreeSet<PeerId>) -> RosterDiff {
        let next: BTreeSet<PeerId> = snapshot.iter().filter(|p| *p != local).cloned().collect();
        let diff = RosterDiff {
            joined: next.difference(&self.members).cloned().collect(),
            left: self.members.difference(&next).cloned().collect(),
        };
        self.members = next;
        diff
    }
}
