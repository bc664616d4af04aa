//! Integrity: per-chunk SHA-256, verify on receive, peer trust tracking.

use std::collections::HashMap;

use sha2::{Digest, Sha256};

use crate::identity::PeerId;

/// Default number of corrupt chunks after which a provider is no longer used.
pub const DEFAULT_MAX_INTEGRITY_FAILURES: u32 = 3;

/// Hash a chunk payload. Returns 32-byte digest.
pub fn hash_chunk(payload: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(payload);
    hasher.finalize().into()
}

pub fn verify_chunk(payload: &[u8], expected_hash: &[u8; 32]) -> bool {
    hash_chunk(payload) == *expected_hash
}

/// Counts integrity failures per provider for one download.
#[derive(Debug)]
pub struct PeerTrustTracker {
    max_failures: u32,
    failures: HashMap<PeerId, u32>,
}

impl PeerTrustTracker {
    pub fn new(max_failures: u32) -> Self {
        Self {
            max_failures,
            failures: HashMap::new(),
        }
    }

    /// Record a failure. Returns true if the peer just crossed the threshold.
    pub fn record_failure(&mut self, peer: PeerId) -> bool {
        let n = self.failures.entry(peer).or_insert(0);
        *n += 1;
        *n == self.max_failures
    }

    pub fn is_isolated(&self, peer: &PeerId) -> bool {
        self.failure_count(peer) >= self.max_failures
    }

    pub fn failure_count(&self, peer: &PeerId) -> u32 {
        self.failures.get(peer).copied().unwrap_or(0)
    }
}

impl Default for PeerTrustTracker {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_INTEGRITY_FAILURES)
    }
}
