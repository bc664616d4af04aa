//! Resource keys and the local store that answers range requests.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::interval::{Interval, IntervalSet};

/// Identifies a resource across peers (content hash or other stable key).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKey(String);

impl ResourceKey {
    pub fn new(key: impl Into<String>) -> Self {
        ResourceKey(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ResourceKey {
    fn from(s: &str) -> Self {
        ResourceKey(s.to_string())
    }
}

/// Local bytes this peer can serve to others.
pub trait ResourceStore: Send + Sync {
    /// Total size, if the resource is known locally.
    fn total_size(&self, resource: &ResourceKey) -> Option<u64>;

    /// Ranges held locally. Empty when unknown.
    fn available(&self, resource: &ResourceKey) -> IntervalSet;

    /// Read exactly the bytes of `range`.
    fn read(&self, resource: &ResourceKey, range: Interval) -> std::io::Result<Vec<u8>>;
}
