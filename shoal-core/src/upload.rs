//! Upload coordinator: per-peer slot limits with a FIFO wait queue, and an
//! optional token bucket shared by every upload.
//!
//! Tickets are opaque to the coordinator (the node uses the channel id of the
//! serving conversation). Peers never share slots: one peer's queue or
//! disconnect leaves every other peer untouched.

use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};

use crate::identity::PeerId;

/// Default concurrent uploads per peer.
pub const DEFAULT_SLOTS_PER_PEER: usize = 2;

/// Result of submitting an upload request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// A slot was free; start sending.
    Start,
    /// Waiting; `position` is 0 for the next in line.
    Queued { position: usize },
}

#[derive(Debug)]
struct PeerUploads<T> {
    active: Vec<T>,
    pending: VecDeque<T>,
}

impl<T> Default for PeerUploads<T> {
    fn default() -> Self {
        Self {
            active: Vec::new(),
            pending: VecDeque::new(),
        }
    }
}

#[derive(Debug)]
pub struct UploadCoordinator<T> {
    slots_per_peer: usize,
    peers: BTreeMap<PeerId, PeerUploads<T>>,
}

impl<T: PartialEq + Clone> UploadCoordinator<T> {
    pub fn new(slots_per_peer: usize) -> Self {
        Self {
            slots_per_peer: slots_per_peer.max(1),
            peers: BTreeMap::new(),
        }
    }

    pub fn slots_per_peer(&self) -> usize {
        self.slots_per_peer
    }

    pub fn submit(&mut self, peer: PeerId, ticket: T) -> Admission {
        let uploads = self.peers.entry(peer).or_default();
        if uploads.active.len() < self.slots_per_peer {
            uploads.active.push(ticket);
            return Admission::Start;
        }
        uploads.pending.push_back(ticket);
        let position = uploads.pending.len() - 1;
        tracing::debug!(peer = %peer.short(), position, "upload queued");
        Admission::Queued { position }
    }

    /// The upload `ticket` ended (done, failed or cancelled). Returns the
    /// queued ticket that now gets the freed slot, if any.
    pub fn finish(&mut self, peer: PeerId, ticket: &T) -> Option<T> {
        let uploads = self.peers.get_mut(&peer)?;
        let mut promoted = None;
        if let Some(pos) = uploads.active.iter().position(|t| t == ticket) {
            uploads.active.remove(pos);
            if let Some(next) = uploads.pending.pop_front() {
                uploads.active.push(next.clone());
                promoted = Some(next);
            }
        } else if let Some(pos) = uploads.pending.iter().position(|t| t == ticket) {
            uploads.pending.remove(pos);
        }
        if uploads.active.is_empty() && uploads.pending.is_empty() {
            self.peers.remove(&peer);
        }
        promoted
    }

    /// Drop everything belonging to `peer`. Returns how many uploads were dropped.
    pub fn disconnect(&mut self, peer: PeerId) -> usize {
        match self.peers.remove(&peer) {
            Some(u) => {
                let n = u.active.len() + u.pending.len();
                if n > 0 {
                    tracing::debug!(peer = %peer.short(), dropped = n, "uploads dropped on disconnect");
                }
                n
            }
            None => 0,
        }
    }

    pub fn active(&self, peer: &PeerId) -> usize {
        self.peers.get(peer).map_or(0, |u| u.active.len())
    }

    pub fn queued(&self, peer: &PeerId) -> usize {
        self.peers.get(peer).map_or(0, |u| u.pending.len())
    }

    pub fn total_active(&self) -> usize {
        self.peers.values().map(|u| u.active.len()).sum()
    }
}

/// Token bucket over bytes, refilled continuously at `rate` bytes/s up to
/// `capacity`. Reservations may overdraw it; the caller waits for the
/// returned delay before sending.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    capacity: f64,
    tokens: f64,
    rate: f64,
    last_refill: Instant,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TokenBucketError {
    #[error("token bucket rate must be greater than zero")]
    ZeroRate,
}

impl TokenBucket {
    /// Starts full. A zero `capacity` is raised to one second's worth of `rate`.
    pub fn new(rate: u64, capacity: u64, now: Instant) -> Result<Self, TokenBucketError> {
        if rate == 0 {
            return Err(TokenBucketError::ZeroRate);
        }
        let capacity = if capacity == 0 { rate } else { capacity };
        let capacity = capacity as f64;
        Ok(Self {
            capacity,
            tokens: capacity,
            rate: rate as f64,
            last_refill: now,
        })
    }

    pub fn rate(&self) -> u64 {
        self.rate as u64
    }

    pub fn capacity(&self) -> u64 {
        self.capacity as u64
    }

    /// Take `bytes` and return how long to wait before using them.
    pub fn reserve(&mut self, bytes: u64, now: Instant) -> Duration {
        self.refill(now);
        self.tokens -= bytes as f64;
        if self.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-self.tokens / self.rate)
        }
    }

    /// Whole tokens available at `now` (zero while overdrawn).
    pub fn available(&mut self, now: Instant) -> u64 {
        self.refill(now);
        self.tokens.max(0.0) as u64
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        if elapsed.is_zero() {
            return;
        }
        self.tokens = (self.tokens + elapsed.as_secs_f64() * self.rate).min(self.capacity);
        self.last_refill = now;
    }
}
