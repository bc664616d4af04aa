//! Per-peer relationship status, consulted by protocol factories before
//! accepting a conversation.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::identity::PeerId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum RelationshipStatus {
    Favorite,
    Blocked,
    Regular,
    #[default]
    Unknown,
}

impl RelationshipStatus {
    pub fn is_blocked(self) -> bool {
        self == RelationshipStatus::Blocked
    }
}

/// Process-wide relationship table. Peers never recorded report `Unknown`.
#[derive(Default)]
pub struct Relationships {
    statuses: RwLock<HashMap<PeerId, RelationshipStatus>>,
}

impl Relationships {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self, peer: &PeerId) -> RelationshipStatus {
        self.statuses.read().get(peer).copied().unwrap_or_default()
    }

    /// Returns the previous status.
    pub fn set(&self, peer: PeerId, status: RelationshipStatus) -> RelationshipStatus {
        let prev = if status == RelationshipStatus::Unknown {
            self.statuses.write().remove(&peer)
        } else {
            self.statuses.write().insert(peer, status)
        };
        let prev = prev.unwrap_or_default();
        if prev != status {
            tracing::info!(peer = %peer.short(), ?prev, ?status, "relationship changed");
        }
        prev
    }

    pub fn peers_with(&self, status: RelationshipStatus) -> Vec<PeerId> {
        let mut out: Vec<PeerId> = self
            .statuses
            .read()
            .iter()
            .filter(|(_, s)| **s == status)
            .map(|(p, _)| *p)
            .collect();
        out.sort();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;

    #[test]
    fn unknown_by_default() {
        let rel = Relationships::new();
        let p = Keypair::generate().peer_id();
        assert_eq!(rel.status(&p), RelationshipStatus::Unknown);
    }

    #[test]
    fn set_and_reset() {
        let rel = Relationships::new();
        let p = Keypair::generate().peer_id();
        assert_eq!(rel.set(p, RelationshipStatus::Blocked), RelationshipStatus::Unknown);
        assert!(rel.status(&p).is_blocked());
        assert_eq!(rel.peers_with(RelationshipStatus::Blocked), vec![p]);
        assert_eq!(rel.set(p, RelationshipStatus::Unknown), RelationshipStatus::Blocked);
        assert!(rel.peers_with(RelationshipStatus::Blocked).is_empty());
    }
}
