//! Local resources: every regular file in the share directory (file name is
//! the key) plus downloads completed while running.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use shoal_core::{Interval, IntervalSet, ResourceKey, ResourceStore};

pub struct ShareStore {
    share_dir: PathBuf,
    completed: RwLock<HashMap<ResourceKey, PathBuf>>,
}

/// Keys name files directly, so anything that could escape the directory is refused.
pub(crate) fn valid_key(key: &ResourceKey) -> bool {
    let s = key.as_str();
    !s.is_empty() && s != "." && s != ".." && !s.contains(['/', '\\', '\0'])
}

impl ShareStore {
    pub fn new(share_dir: impl Into<PathBuf>) -> Self {
        Self {
            share_dir: share_dir.into(),
            completed: RwLock::new(HashMap::new()),
        }
    }

    /// Serve a finished download from `path`.
    pub fn add_completed(&self, key: ResourceKey, path: PathBuf) {
        tracing::debug!(resource = %key, path = %path.display(), "sharing completed download");
        self.completed.write().insert(key, path);
    }

    fn path_of(&self, key: &ResourceKey) -> Option<PathBuf> {
        if let Some(p) = self.completed.read().get(key) {
            return Some(p.clone());
        }
        if !valid_key(key) {
            return None;
        }
        let p = self.share_dir.join(key.as_str());
        p.is_file().then_some(p)
    }

    /// All keys currently served, sorted.
    pub fn keys(&self) -> Vec<ResourceKey> {
        let mut out: Vec<ResourceKey> = self.completed.read().keys().cloned().collect();
        match std::fs::read_dir(&self.share_dir) {
            Ok(entries) => {
                for entry in entries.flatten() {
                    let is_file = entry.file_type().map(|t| t.is_file()).unwrap_or(false);
                    if !is_file {
                        continue;
                    }
                    if let Some(name) = entry.file_name().to_str() {
                        out.push(ResourceKey::new(name));
                    }
                }
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(dir = %self.share_dir.display(), error = %e, "cannot list share directory");
            }
        }
        out.sort();
        out.dedup();
        out
    }

    pub fn share_dir(&self) -> &Path {
        &self.share_dir
    }
}

impl ResourceStore for ShareStore {
    fn total_size(&self, resource: &ResourceKey) -> Option<u64> {
        let path = self.path_of(resource)?;
        std::fs::metadata(path).ok().map(|m| m.len())
    }

    fn available(&self, resource: &ResourceKey) -> IntervalSet {
        match self.total_size(resource).map(|len| Interval::with_len(0, len)) {
            Some(Ok(all)) => IntervalSet::from_interval(all),
            _ => IntervalSet::new(),
        }
    }

    fn read(&self, resource: &ResourceKey, range: Interval) -> io::Result<Vec<u8>> {
        let path = self
            .path_of(resource)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("no resource {resource}")))?;
        let mut file = File::open(path)?;
        file.seek(SeekFrom::Start(range.min()))?;
        let mut buf = vec![0u8; range.len() as usize];
        file.read_exact(&mut buf)?;
        Ok(buf)
    }
}
