use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use uuid::Uuid;

/// Queue of files with pending sync work
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SyncQueue {
    pub items: Vec<QueueItem>,
}

/// A single queued file
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueItem {
    pub id: Uuid,
    /// Backend path of the file
    pub path: String,
    pub reason: QueueReason,
    pub created_at: DateTime<Utc>,
    /// Number of failed passes since the item was queued
    pub retries: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum QueueReason {
    /// Content written to the cache and not pushed yet
    LocalWrite,
    /// A pass was requested with the deferred strategy
    Deferred,
}

impl SyncQueue {
    pub fn new() -> Self {
        Self { items: Vec::new() }
    }

    /// Add a file to the queue. A file is queued at most once; re-queuing
    /// keeps the retry count and refreshes the reason.
    pub fn enqueue(&mut self, path: &str, reason: QueueReason) {
        if let Some(item) = self.items.iter_mut().find(|i| i.path == path) {
            item.reason = reason;
            return;
        }

        self.items.push(QueueItem {
            id: Uuid::new_v4(),
            path: path.to_string(),
            reason,
            created_at: Utc::now(),
            retries: 0,
            last_error: None,
        });
    }

    pub fn get(&self, path: &str) -> Option<&QueueItem> {
        self.items.iter().find(|item| item.path == path)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.get(path).is_some()
    }

    pub fn pending_count(&self) -> usize {
        self.items.len()
    }

    /// Remove the file after a successful pass
    pub fn complete(&mut self, path: &str) -> bool {
        let before = self.items.len();
        self.items.retain(|item| item.path != path);
        before != self.items.len()
    }

    /// Mark the file as failed with error; no-op when not queued
    pub fn fail(&mut self, path: &str, error: String) {
        if let Some(item) = self.items.iter_mut().find(|i| i.path == path) {
            item.retries += 1;
            item.last_error = Some(error);
        }
    }

    /// Load queue from file
    pub fn load(path: &Path) -> Result<Self, std::io::Error> {
        if !path.exists() {
            return Ok(Self::new());
        }
        let data = std::fs::read_to_string(path)?;
        serde_json::from_str(&data).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// Save queue to file
    pub fn save(&self, path: &Path) -> Result<(), std::io::Error> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let data = serde_json::to_string_pretty(self)?;
        crate::fs::write_atomic(path, data.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_queue_deduplication() {
        let mut queue = SyncQueue::new();
        queue.enqueue("/db.kdbx", QueueReason::LocalWrite);
        queue.fail("/db.kdbx", "offline".to_string());
        queue.enqueue("/db.kdbx", QueueReason::Deferred);

        assert_eq!(queue.pending_count(), 1);
        let item = queue.get("/db.kdbx").unwrap();
        assert_eq!(item.retries, 1);
        assert_eq!(item.reason, QueueReason::Deferred);
    }

    #[test]
    fn test_queue_different_files() {
        let mut queue = SyncQueue::new();
        queue.enqueue("/a.kdbx", QueueReason::LocalWrite);
        queue.enqueue("/b.kdbx", QueueReason::LocalWrite);
        assert_eq!(queue.pending_count(), 2);

        assert!(queue.complete("/a.kdbx"));
        assert!(!queue.complete("/a.kdbx"));
        assert_eq!(queue.pending_count(), 1);
    }

    #[test]
    fn test_queue_persistence() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("queue.json");

        assert_eq!(SyncQueue::load(&path).unwrap().pending_count(), 0);

        let mut queue = SyncQueue::new();
        queue.enqueue("/db.kdbx", QueueReason::Deferred);
        queue.save(&path).unwrap();

        let loaded = SyncQueue::load(&path).unwrap();
        assert!(loaded.contains("/db.kdbx"));
    }
}
