//! Persisted partial-file index: which byte ranges of a pending resource have
//! been written to its local `.part` file, plus caller metadata.
//!
//! The on-disk form is JSON, replaced atomically (temp file + rename) with the
//! previous version kept as `.bak`. All mutations of one index path go through
//! a single writer task ([`IndexHandle`]); each one is a full
//! read → mutate → persist cycle, so concurrent callers never lose an update.

use std::collections::{BTreeMap, HashMap};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, Mutex};

use crate::interval::{Interval, IntervalSet};

/// Format marker stored in every index file.
pub const INDEX_FORMAT: u32 = 1;

const INDEX_SUFFIX: &str = "part.idx";
const DATA_SUFFIX: &str = "part";

pub type Result<T> = std::result::Result<T, IndexError>;

#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("index '{}' not found", path.display())]
    NotFound { path: PathBuf },
    #[error("index '{}' is corrupt: {source}", path.display())]
    Corrupt {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("write of {len} bytes at {offset} exceeds total size {total}")]
    RangeViolation { offset: u64, len: u64, total: u64 },
    #[error("total size {requested} conflicts with fixed size {existing:?} / written end {written_end:?}")]
    SizeConflict {
        requested: u64,
        existing: Option<u64>,
        written_end: Option<u64>,
    },
    #[error("metadata {group}/{key}: {source}")]
    Metadata {
        group: String,
        key: String,
        source: serde_json::Error,
    },
    #[error("io on '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("index writer for '{}' has stopped", path.display())]
    WriterGone { path: PathBuf },
}

impl IndexError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        IndexError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    fn is_retryable(&self) -> bool {
        matches!(self, IndexError::Io { .. })
    }
}

/// Durable state of one partial download.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartialIndex {
    format: u32,
    total_size: Option<u64>,
    written: IntervalSet,
    #[serde(default)]
    metadata: BTreeMap<String, BTreeMap<String, serde_json::Value>>,
}

impl Default for PartialIndex {
    fn default() -> Self {
        Self {
            format: INDEX_FORMAT,
            total_size: None,
            written: IntervalSet::new(),
            metadata: BTreeMap::new(),
        }
    }
}

impl PartialIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn total_size(&self) -> Option<u64> {
        self.total_size
    }

    /// Snapshot of the written ranges.
    pub fn written(&self) -> IntervalSet {
        self.written.clone()
    }

    /// Ranges still missing; empty while the total size is unknown.
    pub fn missing(&self) -> IntervalSet {
        match self.total_size {
            Some(total) => self.written.complement_within(total),
            None => IntervalSet::new(),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.total_size.is_some() && self.missing().is_empty()
    }

    /// Record `len` bytes written at `offset`. Zero-length writes are no-ops.
    pub fn apply_write(&mut self, offset: u64, len: u64) -> Result<()> {
        if len == 0 {
            return Ok(());
        }
        let end = offset.checked_add(len);
        if let Some(total) = self.total_size {
            if end.map_or(true, |end| end > total) {
                return Err(IndexError::RangeViolation { offset, len, total });
            }
        }
        let iv = Interval::with_len(offset, len).map_err(|_| IndexError::RangeViolation {
            offset,
            len,
            total: self.total_size.unwrap_or(u64::MAX),
        })?;
        self.written.add(iv);
        Ok(())
    }

    /// Fix the total size. Once fixed it cannot change, and it must cover
    /// everything already written.
    pub fn set_total_size(&mut self, size: u64) -> Result<()> {
        let written_end = self.written.last().map(|iv| iv.max());
        let conflict = match self.total_size {
            Some(existing) => existing != size,
            None => written_end.is_some_and(|end| end >= size),
        };
        if conflict {
            return Err(IndexError::SizeConflict {
                requested: size,
                existing: self.total_size,
                written_end,
            });
        }
        self.total_size = Some(size);
        Ok(())
    }

    pub fn set_metadata<T: Serialize>(&mut self, group: &str, key: &str, value: &T) -> Result<()> {
        let value = serde_json::to_value(value).map_err(|source| IndexError::Metadata {
            group: group.to_string(),
            key: key.to_string(),
            source,
        })?;
        self.metadata
            .entry(group.to_string())
            .or_default()
            .insert(key.to_string(), value);
        Ok(())
    }

    /// Typed metadata lookup. `Ok(None)` when absent.
    pub fn metadata<T: DeserializeOwned>(&self, group: &str, key: &str) -> Result<Option<T>> {
        let Some(value) = self.metadata.get(group).and_then(|g| g.get(key)) else {
            return Ok(None);
        };
        serde_json::from_value(value.clone())
            .map(Some)
            .map_err(|source| IndexError::Metadata {
                group: group.to_string(),
                key: key.to_string(),
                source,
            })
    }

    /// Remove one key; empty groups are dropped. Returns whether the key existed.
    pub fn remove_metadata(&mut self, group: &str, key: &str) -> bool {
        let Some(g) = self.metadata.get_mut(group) else {
            return false;
        };
        let existed = g.remove(key).is_some();
        if g.is_empty() {
            self.metadata.remove(group);
        }
        existed
    }

    pub fn metadata_groups(&self) -> Vec<String> {
        self.metadata.keys().cloned().collect()
    }
}

fn sibling(path: &Path, extra: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(extra);
    PathBuf::from(name)
}

fn backup_path(path: &Path) -> PathBuf {
    sibling(path, ".bak")
}

fn tmp_path(path: &Path) -> PathBuf {
    sibling(path, ".tmp")
}

/// Fresh `(index, data)` path pair for a new download in `dir`.
pub fn allocate_paths(dir: &Path) -> (PathBuf, PathBuf) {
    let id = uuid::Uuid::new_v4().simple().to_string();
    (
        dir.join(format!("{id}.{INDEX_SUFFIX}")),
        dir.join(format!("{id}.{DATA_SUFFIX}")),
    )
}

/// Data file belonging to an index path (`x.part.idx` → `x.part`).
pub fn data_path_for(index_path: &Path) -> PathBuf {
    let name = index_path
        .file_name()
        .and_then(|n| n.to_str())
        .and_then(|n| n.strip_suffix(".idx"))
        .map(str::to_string);
    match name {
        Some(n) => index_path.with_file_name(n),
        None => sibling(index_path, ".data"),
    }
}

async fn decode_file(path: &Path) -> Result<PartialIndex> {
    let bytes = match tokio::fs::read(path).await {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(IndexError::NotFound {
                path: path.to_path_buf(),
            })
        }
        Err(e) => return Err(IndexError::io(path, e)),
    };
    serde_json::from_slice(&bytes).map_err(|source| IndexError::Corrupt {
        path: path.to_path_buf(),
        source,
    })
}

/// Read an index. A corrupt primary falls back to the `.bak` copy; if that
/// fails too the primary's error is returned.
pub async fn read_index(path: &Path) -> Result<PartialIndex> {
    match decode_file(path).await {
        Ok(index) => Ok(index),
        Err(primary @ IndexError::Corrupt { .. }) => match decode_file(&backup_path(path)).await {
            Ok(index) => {
                tracing::warn!(path = %path.display(), error = %primary, "index corrupt, using backup");
                Ok(index)
            }
            Err(_) => Err(primary),
        },
        Err(e) => Err(e),
    }
}

/// Persist an index: write + fsync a temp file, keep the old version as
/// `.bak`, then atomically rename over the primary.
pub async fn save_index(path: &Path, index: &PartialIndex) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(index).map_err(|source| IndexError::Corrupt {
        path: path.to_path_buf(),
        source,
    })?;

    let tmp = tmp_path(path);
    let mut file = tokio::fs::File::create(&tmp)
        .await
        .map_err(|e| IndexError::io(&tmp, e))?;
    file.write_all(&bytes)
        .await
        .map_err(|e| IndexError::io(&tmp, e))?;
    file.sync_all().await.map_err(|e| IndexError::io(&tmp, e))?;
    drop(file);

    if tokio::fs::try_exists(path).await.unwrap_or(false) {
        let bak = backup_path(path);
        tokio::fs::copy(path, &bak)
            .await
            .map_err(|e| IndexError::io(&bak, e))?;
    }
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| IndexError::io(path, e))?;
    Ok(())
}

/// Every readable index in `dir`, sorted by path. Unreadable ones are logged and skipped.
pub async fn scan_indexes(dir: &Path) -> Result<Vec<(PathBuf, PartialIndex)>> {
    let mut out = Vec::new();
    let mut rd = tokio::fs::read_dir(dir)
        .await
        .map_err(|e| IndexError::io(dir, e))?;
    while let Some(entry) = rd.next_entry().await.map_err(|e| IndexError::io(dir, e))? {
        let path = entry.path();
        let is_index = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.ends_with(INDEX_SUFFIX));
        if !is_index {
            continue;
        }
        match read_index(&path).await {
            Ok(index) => out.push((path, index)),
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "skipping unreadable index");
            }
        }
    }
    out.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(out)
}

#[derive(Debug, Clone)]
pub struct IndexConfig {
    /// Extra attempts after a failed storage write.
    pub write_retries: u32,
    pub retry_delay: Duration,
    /// Bound of each writer's command queue.
    pub queue_depth: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            write_retries: 3,
            retry_delay: Duration::from_millis(50),
            queue_depth: 64,
        }
    }
}

type Reply<T> = oneshot::Sender<Result<T>>;

enum IndexCommand {
    Write {
        offset: u64,
        data: Vec<u8>,
        reply: Reply<IntervalSet>,
    },
    SetTotalSize {
        size: u64,
        reply: Reply<()>,
    },
    SetMetadata {
        group: String,
        key: String,
        value: serde_json::Value,
        reply: Reply<()>,
    },
    RemoveMetadata {
        group: String,
        key: String,
        reply: Reply<bool>,
    },
    Snapshot {
        reply: Reply<PartialIndex>,
    },
    Destroy {
        promote_to: Option<PathBuf>,
        reply: Reply<()>,
    },
}

/// Handle to the single writer task of one index path. Cheap to clone.
#[derive(Clone)]
pub struct IndexHandle {
    path: PathBuf,
    tx: mpsc::Sender<IndexCommand>,
}

impl std::fmt::Debug for IndexHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexHandle").field("path", &self.path).finish()
    }
}

impl IndexHandle {
    /// Create an empty index at `index_path` (unless one exists) and start its writer.
    pub async fn create(index_path: &Path, data_path: &Path, cfg: IndexConfig) -> Result<Self> {
        if !tokio::fs::try_exists(index_path).await.unwrap_or(false) {
            save_index(index_path, &PartialIndex::new()).await?;
        }
        Self::open(index_path, data_path, cfg).await
    }

    /// Start the writer for an existing index. Fails if it cannot be read.
    pub async fn open(index_path: &Path, data_path: &Path, cfg: IndexConfig) -> Result<Self> {
        read_index(index_path).await?;
        let (tx, rx) = mpsc::channel(cfg.queue_depth.max(1));
        let writer = Writer {
            index_path: index_path.to_path_buf(),
            data_path: data_path.to_path_buf(),
            cfg,
        };
        tokio::spawn(writer.run(rx));
        Ok(Self {
            path: index_path.to_path_buf(),
            tx,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_alive(&self) -> bool {
        !self.tx.is_closed()
    }

    async fn call<T>(&self, make: impl FnOnce(Reply<T>) -> IndexCommand) -> Result<T> {
        let gone = || IndexError::WriterGone {
            path: self.path.clone(),
        };
        let (reply, rx) = oneshot::channel();
        self.tx.send(make(reply)).await.map_err(|_| gone())?;
        rx.await.map_err(|_| gone())?
    }

    /// Write `data` at `offset` into the data file, then record the range.
    /// Returns the written ranges after the update.
    pub async fn write(&self, offset: u64, data: Vec<u8>) -> Result<IntervalSet> {
        self.call(|reply| IndexCommand::Write {
            offset,
            data,
            reply,
        })
        .await
    }

    pub async fn set_total_size(&self, size: u64) -> Result<()> {
        self.call(|reply| IndexCommand::SetTotalSize { size, reply })
            .await
    }

    pub async fn set_metadata<T: Serialize>(&self, group: &str, key: &str, value: &T) -> Result<()> {
        let value = serde_json::to_value(value).map_err(|source| IndexError::Metadata {
            group: group.to_string(),
            key: key.to_string(),
            source,
        })?;
        self.call(|reply| IndexCommand::SetMetadata {
            group: group.to_string(),
            key: key.to_string(),
            value,
            reply,
        })
        .await
    }

    pub async fn remove_metadata(&self, group: &str, key: &str) -> Result<bool> {
        self.call(|reply| IndexCommand::RemoveMetadata {
            group: group.to_string(),
            key: key.to_string(),
            reply,
        })
        .await
    }

    /// Current durable state, read in queue order.
    pub async fn snapshot(&self) -> Result<PartialIndex> {
        self.call(|reply| IndexCommand::Snapshot { reply }).await
    }

    /// Delete the index. With `promote_to`, the data file is moved there;
    /// otherwise it is deleted. The writer stops afterwards.
    pub async fn destroy(&self, promote_to: Option<PathBuf>) -> Result<()> {
        self.call(|reply| IndexCommand::Destroy { promote_to, reply })
            .await
    }
}

struct Writer {
    index_path: PathBuf,
    data_path: PathBuf,
    cfg: IndexConfig,
}

impl Writer {
    async fn run(self, mut rx: mpsc::Receiver<IndexCommand>) {
        while let Some(cmd) = rx.recv().await {
            match cmd {
                IndexCommand::Write {
                    offset,
                    data,
                    reply,
                } => {
                    let _ = reply.send(self.write(offset, &data).await);
                }
                IndexCommand::SetTotalSize { size, reply } => {
                    let r = self.mutate(|index| index.set_total_size(size)).await;
                    let _ = reply.send(r);
                }
                IndexCommand::SetMetadata {
                    group,
                    key,
                    value,
                    reply,
                } => {
                    let r = self
                        .mutate(|index| index.set_metadata(&group, &key, &value))
                        .await;
                    let _ = reply.send(r);
                }
                IndexCommand::RemoveMetadata { group, key, reply } => {
                    let r = self
                        .mutate(|index| Ok(index.remove_metadata(&group, &key)))
                        .await;
                    let _ = reply.send(r);
                }
                IndexCommand::Snapshot { reply } => {
                    let _ = reply.send(read_index(&self.index_path).await);
                }
                IndexCommand::Destroy { promote_to, reply } => {
                    let r = self.destroy(promote_to).await;
                    let stop = r.is_ok();
                    let _ = reply.send(r);
                    if stop {
                        break;
                    }
                }
            }
        }
        tracing::debug!(path = %self.index_path.display(), "index writer stopped");
    }

    /// One read → mutate → persist cycle.
    async fn mutate<T>(&self, f: impl FnOnce(&mut PartialIndex) -> Result<T>) -> Result<T> {
        let mut index = read_index(&self.index_path).await?;
        let out = f(&mut index)?;
        self.persist(&index).await?;
        Ok(out)
    }

    async fn persist(&self, index: &PartialIndex) -> Result<()> {
        self.with_retries(|| save_index(&self.index_path, index)).await
    }

    async fn write(&self, offset: u64, data: &[u8]) -> Result<IntervalSet> {
        let mut index = read_index(&self.index_path).await?;
        index.apply_write(offset, data.len() as u64)?;
        if !data.is_empty() {
            self.with_retries(|| write_at(&self.data_path, offset, data))
                .await?;
            self.persist(&index).await?;
        }
        Ok(index.written())
    }

    async fn destroy(&self, promote_to: Option<PathBuf>) -> Result<()> {
        match promote_to {
            Some(dest) => tokio::fs::rename(&self.data_path, &dest)
                .await
                .map_err(|e| IndexError::io(&dest, e))?,
            None => remove_if_exists(&self.data_path).await?,
        }
        remove_if_exists(&backup_path(&self.index_path)).await?;
        remove_if_exists(&self.index_path).await?;
        Ok(())
    }

    async fn with_retries<T, F, Fut>(&self, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut attempt = 0u32;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) if e.is_retryable() && attempt < self.cfg.write_retries => {
                    attempt += 1;
                    tracing::warn!(
                        path = %self.index_path.display(),
                        attempt,
                        error = %e,
                        "index storage write failed, retrying"
                    );
                    tokio::time::sleep(self.cfg.retry_delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

async fn write_at(path: &Path, offset: u64, data: &[u8]) -> Result<()> {
    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .await
        .map_err(|e| IndexError::io(path, e))?;
    file.seek(SeekFrom::Start(offset))
        .await
        .map_err(|e| IndexError::io(path, e))?;
    file.write_all(data)
        .await
        .map_err(|e| IndexError::io(path, e))?;
    file.sync_data().await.map_err(|e| IndexError::io(path, e))?;
    Ok(())
}

async fn remove_if_exists(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(IndexError::io(path, e)),
    }
}

/// Process-wide map from index path to its writer, so every path has exactly
/// one writer sequence.
#[derive(Default)]
pub struct IndexRegistry {
    cfg: IndexConfig,
    handles: Mutex<HashMap<PathBuf, IndexHandle>>,
}

impl IndexRegistry {
    pub fn new(cfg: IndexConfig) -> Self {
        Self {
            cfg,
            handles: Mutex::new(HashMap::new()),
        }
    }

    /// Writer for `index_path`, creating the index if needed. The data file
    /// path is derived from the index path.
    pub async fn open(&self, index_path: &Path) -> Result<IndexHandle> {
        let mut handles = self.handles.lock().await;
        if let Some(h) = handles.get(index_path) {
            if h.is_alive() {
                return Ok(h.clone());
            }
        }
        let data_path = data_path_for(index_path);
        let handle = IndexHandle::create(index_path, &data_path, self.cfg.clone()).await?;
        handles.insert(index_path.to_path_buf(), handle.clone());
        Ok(handle)
    }

    /// Forget a path (after `destroy`).
    pub async fn release(&self, index_path: &Path) {
        self.handles.lock().await.remove(index_path);
    }

    pub async fn open_count(&self) -> usize {
        self.handles
            .lock()
            .await
            .values()
            .filter(|h| h.is_alive())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn iv(min: u64, max: u64) -> Interval {
        Interval::new(min, max).unwrap()
    }

    #[test]
    fn write_beyond_total_size_is_range_violation() {
        let mut index = PartialIndex::new();
        index.set_total_size(100).unwrap();
        index.apply_write(90, 10).unwrap();
        assert!(matches!(
            index.apply_write(95, 10),
            Err(IndexError::RangeViolation {
                offset: 95,
                len: 10,
                total: 100
            })
        ));
        assert_eq!(index.written().to_vec(), vec![iv(90, 99)]);
    }

    #[test]
    fn total_size_is_fixed_once() {
        let mut index = PartialIndex::new();
        index.apply_write(0, 50).unwrap();
        assert!(matches!(
            index.set_total_size(40),
            Err(IndexError::SizeConflict { .. })
        ));
        index.set_total_size(100).unwrap();
        index.set_total_size(100).unwrap();
        assert!(matches!(
            index.set_total_size(200),
            Err(IndexError::SizeConflict {
                existing: Some(100),
                ..
            })
        ));
        assert_eq!(index.missing().to_vec(), vec![iv(50, 99)]);
        assert!(!index.is_complete());
    }

    #[test]
    fn metadata_roundtrip_and_removal() {
        let mut index = PartialIndex::new();
        index.set_metadata("resume", "peer_hint", &vec![1u8, 2, 3]).unwrap();
        index.set_metadata("resource", "key", &"movie.mkv").unwrap();
        let hint: Option<Vec<u8>> = index.metadata("resume", "peer_hint").unwrap();
        assert_eq!(hint, Some(vec![1, 2, 3]));
        let missing: Option<String> = index.metadata("resume", "nope").unwrap();
        assert!(missing.is_none());
        assert!(index.metadata::<u64>("resource", "key").is_err());
        assert!(index.remove_metadata("resume", "peer_hint"));
        assert!(!index.remove_metadata("resume", "peer_hint"));
        assert_eq!(index.metadata_groups(), vec!["resource".to_string()]);
    }

    #[test]
    fn data_path_derivation() {
        let p = Path::new("/tmp/abc.part.idx");
        assert_eq!(data_path_for(p), PathBuf::from("/tmp/abc.part"));
        let (idx, data) = allocate_paths(Path::new("/d"));
        assert_eq!(data_path_for(&idx), data);
    }

    #[tokio::test]
    async fn read_missing_index_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = read_index(&dir.path().join("nope.part.idx")).await.unwrap_err();
        assert!(matches!(err, IndexError::NotFound { .. }));
    }

    #[tokio::test]
    async fn corrupt_index_without_backup_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.part.idx");
        tokio::fs::write(&path, b"{not json").await.unwrap();
        let err = read_index(&path).await.unwrap_err();
        assert!(matches!(err, IndexError::Corrupt { .. }));
    }

    #[tokio::test]
    async fn corrupt_index_falls_back_to_backup() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.part.idx");
        let mut first = PartialIndex::new();
        first.set_total_size(10).unwrap();
        save_index(&path, &first).await.unwrap();
        let mut second = first.clone();
        second.apply_write(0, 5).unwrap();
        save_index(&path, &second).await.unwrap();

        tokio::fs::write(&path, b"garbage").await.unwrap();
        let recovered = read_index(&path).await.unwrap();
        assert_eq!(recovered, first);
    }

    #[tokio::test]
    async fn save_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.part.idx");
        save_index(&path, &PartialIndex::new()).await.unwrap();
        assert!(path.exists());
        assert!(!tmp_path(&path).exists());
    }

    #[tokio::test]
    async fn handle_writes_data_and_ranges() {
        let dir = tempfile::tempdir().unwrap();
        let (idx, data) = allocate_paths(dir.path());
        let h = IndexHandle::create(&idx, &data, IndexConfig::default())
            .await
            .unwrap();
        h.set_total_size(8).await.unwrap();
        h.write(4, b"5678".to_vec()).await.unwrap();
        let written = h.write(0, b"1234".to_vec()).await.unwrap();
        assert_eq!(written.to_vec(), vec![iv(0, 7)]);
        assert_eq!(tokio::fs::read(&data).await.unwrap(), b"12345678");

        let err = h.write(6, b"xyz".to_vec()).await.unwrap_err();
        assert!(matches!(err, IndexError::RangeViolation { .. }));

        let snap = h.snapshot().await.unwrap();
        assert!(snap.is_complete());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_disjoint_writes_are_never_lost() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(IndexRegistry::new(IndexConfig::default()));
        let (idx, _) = allocate_paths(dir.path());
        registry.open(&idx).await.unwrap().set_total_size(320).await.unwrap();

        let mut tasks = Vec::new();
        for i in 0..32u64 {
            let registry = registry.clone();
            let idx = idx.clone();
            tasks.push(tokio::spawn(async move {
                let h = registry.open(&idx).await.unwrap();
                h.write(i * 10, vec![i as u8; 10]).await.unwrap();
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }

        assert_eq!(registry.open_count().await, 1);
        let snap = read_index(&idx).await.unwrap();
        assert_eq!(snap.written().to_vec(), vec![iv(0, 319)]);
        assert!(snap.is_complete());
    }

    #[tokio::test]
    async fn destroy_promotes_data_and_removes_index() {
        let dir = tempfile::tempdir().unwrap();
        let registry = IndexRegistry::new(IndexConfig::default());
        let (idx, data) = allocate_paths(dir.path());
        let h = registry.open(&idx).await.unwrap();
        h.set_total_size(3).await.unwrap();
        h.write(0, b"abc".to_vec()).await.unwrap();
        let dest = dir.path().join("final.bin");
        h.destroy(Some(dest.clone())).await.unwrap();
        registry.release(&idx).await;

        assert!(!idx.exists());
        assert!(!data.exists());
        assert_eq!(tokio::fs::read(&dest).await.unwrap(), b"abc");
        assert!(matches!(
            h.snapshot().await,
            Err(IndexError::WriterGone { .. })
        ));
    }

    #[tokio::test]
    async fn scan_finds_indexes_and_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let registry = IndexRegistry::new(IndexConfig::default());
        let (idx, _) = allocate_paths(dir.path());
        let h = registry.open(&idx).await.unwrap();
        h.set_metadata("resource", "key", &"song.ogg").await.unwrap();
        tokio::fs::write(dir.path().join("junk.part.idx"), b"??")
            .await
            .unwrap();

        let found = scan_indexes(dir.path()).await.unwrap();
        assert_eq!(found.len(), 1);
        let key: Option<String> = found[0].1.metadata("resource", "key").unwrap();
        assert_eq!(key.as_deref(), Some("song.ogg"));
    }
}
