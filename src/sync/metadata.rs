use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use super::queue::{QueueReason, SyncQueue};
use crate::encryption::crypto::sha256;
use crate::fs::{file_name, normalize_path, write_atomic, FileSystemError, FsAuthority, Result};

const FILES_DIR: &str = "files";
const RECORDS_DIR: &str = "records";
const QUEUE_FILE: &str = "queue.json";

/// Last-known-synced state of one cached file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRecord {
    /// Backend-native identifier
    pub uid: String,
    pub path: String,
    pub name: String,
    /// SHA-256 of the content at the last successful pass
    #[serde(skip_serializing_if = "Option::is_none")]
    pub synced_local_hash: Option<String>,
    /// Remote revision (etag, rev, blob id) at the last successful pass
    #[serde(skip_serializing_if = "Option::is_none")]
    pub synced_remote_revision: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_modified: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_synced: Option<DateTime<Utc>>,
    /// Time of the last write into the cache
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_modified: Option<DateTime<Utc>>,
}

impl SyncRecord {
    pub fn new(path: &str, uid: &str) -> Self {
        let path = normalize_path(path);
        Self {
            uid: uid.to_string(),
            name: file_name(&path).to_string(),
            path,
            synced_local_hash: None,
            synced_remote_revision: None,
            remote_modified: None,
            last_synced: None,
            local_modified: None,
        }
    }

    /// Record a completed pass for `content` at `revision`
    pub fn mark_synced(&mut self, content: &[u8], revision: Option<String>, remote_modified: Option<DateTime<Utc>>) {
        self.synced_local_hash = Some(content_hash(content));
        self.synced_remote_revision = revision;
        self.remote_modified = remote_modified;
        self.last_synced = Some(Utc::now());
    }

    /// Whether `content` differs from what was last synced
    pub fn is_locally_modified(&self, content: &[u8]) -> bool {
        match &self.synced_local_hash {
            Some(hash) => *hash != content_hash(content),
            None => true,
        }
    }
}

pub fn content_hash(content: &[u8]) -> String {
    hex::encode(sha256(content))
}

/// On-disk cache of one authority's files.
///
/// Layout under the authority directory:
/// `files/<id>` cached content, `records/<id>.json` sync records and
/// `queue.json` pending work. Every write goes through a temp file and a
/// rename so a crash never leaves a half-written file behind.
///
/// Only one `LocalCache` may be live per directory; [`DirectoryShare`]
/// hands out the existing one.
pub struct LocalCache {
    root: PathBuf,
    queue: Mutex<Option<SyncQueue>>,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl LocalCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            queue: Mutex::new(None),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn file_id(path: &str) -> String {
        hex::encode(sha256(normalize_path(path).as_bytes()))[..32].to_string()
    }

    fn content_path(&self, path: &str) -> PathBuf {
        self.root.join(FILES_DIR).join(Self::file_id(path))
    }

    fn record_path(&self, path: &str) -> PathBuf {
        self.root
            .join(RECORDS_DIR)
            .join(format!("{}.json", Self::file_id(path)))
    }

    /// Run `f` while holding the lock of one file. Sync passes and cached
    /// writes of the same file never interleave.
    pub fn with_file_lock<T>(&self, path: &str, f: impl FnOnce() -> T) -> T {
        let path = normalize_path(path);
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(locks.entry(path.clone()).or_default())
        };

        let result = {
            let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
            f()
        };

        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        // Ours and the map's: nobody else is waiting
        if Arc::strong_count(&lock) == 2 {
            locks.remove(&path);
        }
        result
    }

    #[cfg(test)]
    pub(crate) fn held_locks(&self) -> usize {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn has_content(&self, path: &str) -> bool {
        self.content_path(path).exists()
    }

    pub fn read_content(&self, path: &str) -> Result<Option<Vec<u8>>> {
        match std::fs::read(self.content_path(path)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(FileSystemError::from_io(e, path)),
        }
    }

    /// Store content written locally. The sync record keeps its synced
    /// hash, so the write shows up as a local change.
    pub fn write_local(&self, path: &str, uid: &str, content: &[u8]) -> Result<SyncRecord> {
        write_atomic_in(&self.content_path(path), content)?;

        let mut record = self
            .load_record(path)?
            .unwrap_or_else(|| SyncRecord::new(path, uid));
        record.local_modified = Some(Utc::now());
        self.save_record(&record)?;
        Ok(record)
    }

    /// Store content that now matches the remote, followed by its record.
    ///
    /// Content goes first: if the process dies in between, the stale record
    /// makes the next pass report the file as changed rather than synced.
    pub fn write_synced(&self, content: &[u8], record: &SyncRecord) -> Result<()> {
        write_atomic_in(&self.content_path(&record.path), content)?;
        self.save_record(record)
    }

    pub fn load_record(&self, path: &str) -> Result<Option<SyncRecord>> {
        let record_path = self.record_path(path);
        match std::fs::read_to_string(&record_path) {
            Ok(data) => Ok(Some(serde_json::from_str(&data)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(FileSystemError::from_io(e, path)),
        }
    }

    pub fn save_record(&self, record: &SyncRecord) -> Result<()> {
        let data = serde_json::to_vec_pretty(record)?;
        write_atomic_in(&self.record_path(&record.path), &data)
    }

    pub fn records(&self) -> Result<Vec<SyncRecord>> {
        let dir = self.root.join(RECORDS_DIR);
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut records = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let data = std::fs::read_to_string(&path)?;
            match serde_json::from_str::<SyncRecord>(&data) {
                Ok(record) => records.push(record),
                Err(e) => log::warn!("Skipping unreadable sync record {:?}: {}", path, e),
            }
        }
        records.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(records)
    }

    /// Drop the cached content and record of a file
    pub fn remove(&self, path: &str) -> Result<()> {
        for file in [self.content_path(path), self.record_path(path)] {
            match std::fs::remove_file(&file) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(FileSystemError::from_io(e, path)),
            }
        }
        self.complete(path)
    }

    fn with_queue<T>(&self, f: impl FnOnce(&mut SyncQueue) -> T, persist: bool) -> Result<T> {
        let mut guard = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        let queue_path = self.root.join(QUEUE_FILE);
        if guard.is_none() {
            *guard = Some(SyncQueue::load(&queue_path)?);
        }
        let queue = match guard.as_mut() {
            Some(queue) => queue,
            None => return Err(FileSystemError::InvalidData("sync queue unavailable".to_string())),
        };
        let result = f(queue);
        if persist {
            queue.save(&queue_path)?;
        }
        Ok(result)
    }

    pub fn enqueue(&self, path: &str, reason: QueueReason) -> Result<()> {
        let path = normalize_path(path);
        self.with_queue(|q| q.enqueue(&path, reason), true)
    }

    pub fn complete(&self, path: &str) -> Result<()> {
        let path = normalize_path(path);
        let removed = self.with_queue(|q| q.complete(&path), false)?;
        if removed {
            self.with_queue(|_| (), true)?;
        }
        Ok(())
    }

    pub fn fail(&self, path: &str, error: &str) -> Result<()> {
        let path = normalize_path(path);
        self.with_queue(|q| q.fail(&path, error.to_string()), true)
    }

    pub fn queue(&self) -> Result<SyncQueue> {
        self.with_queue(|q| q.clone(), false)
    }
}

fn write_atomic_in(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    write_atomic(path, data)?;
    Ok(())
}

/// One live value per directory.
///
/// Authorities that differ only in their secrets share a cache directory
/// and a git working copy, so the providers built for them must also share
/// the in-memory state guarding those directories.
pub struct DirectoryShare<T> {
    entries: Mutex<HashMap<PathBuf, Weak<T>>>,
}

impl<T> Default for DirectoryShare<T> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl<T> DirectoryShare<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// The live value for `dir`, or a new one from `create`
    pub fn get_or_create(&self, dir: &Path, create: impl FnOnce() -> T) -> Arc<T> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = entries.get(dir).and_then(Weak::upgrade) {
            return existing;
        }
        entries.retain(|_, weak| weak.strong_count() > 0);
        let value = Arc::new(create());
        entries.insert(dir.to_path_buf(), Arc::downgrade(&value));
        value
    }
}

impl DirectoryShare<LocalCache> {
    /// Cache of `authority` below `cache_root`
    pub fn cache_for(&self, cache_root: &Path, authority: &FsAuthority) -> Arc<LocalCache> {
        let root = cache_root.join(authority.key());
        self.get_or_create(&root, || LocalCache::new(root.clone()))
    }
}
