pub mod config;
pub mod metadata;
pub mod processor;
pub mod queue;
pub mod service;

pub use config::{
    ConflictResolutionStrategy, SyncAction, SyncConflictInfo, SyncReport, SyncStatus, SyncStrategy,
};
pub use metadata::{content_hash, DirectoryShare, LocalCache, SyncRecord};
pub use processor::{FileSystemSyncProcessor, RemoteSyncProcessor};
pub use queue::{QueueItem, QueueReason, SyncQueue};
pub use service::{SyncService, SyncServiceError};
