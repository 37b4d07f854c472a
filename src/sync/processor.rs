use std::sync::Arc;

use super::config::{ConflictResolutionStrategy, SyncAction, SyncConflictInfo, SyncReport, SyncStatus, SyncStrategy};
use super::metadata::{LocalCache, SyncRecord};
use super::queue::QueueReason;
use crate::fs::remote::{RemoteClient, RemoteMetadata, RemoteSession, UploadOutcome, WriteMode};
use crate::fs::{check_authority, normalize_path, FileDescriptor, FileSystemError, Result};

/// Reconciles single files between the local cache and the remote copy.
///
/// A processor never retries on its own; a failed pass is reported to the
/// caller and leaves the file queued.
pub trait FileSystemSyncProcessor: Send + Sync {
    /// Cached files with writes not pushed yet
    fn get_locally_modified_files(&self) -> Result<Vec<FileDescriptor>>;

    /// Classify without writing anything. Unreachable network and other
    /// transport failures are reported as statuses, not errors.
    fn get_sync_status(&self, file: &FileDescriptor) -> Result<SyncStatus>;

    /// One reconciliation pass. An unresolved conflict is returned as
    /// [`FileSystemError::SyncConflict`].
    fn process(
        &self,
        file: &FileDescriptor,
        strategy: SyncStrategy,
        on_conflict: Option<ConflictResolutionStrategy>,
    ) -> Result<SyncReport>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Divergence {
    None,
    Local,
    Remote,
    Both,
}

impl Divergence {
    fn status(self) -> SyncStatus {
        match self {
            Divergence::None => SyncStatus::NoChanges,
            Divergence::Local => SyncStatus::LocalChanges,
            Divergence::Remote => SyncStatus::RemoteChanges,
            Divergence::Both => SyncStatus::Conflict,
        }
    }
}

/// Local half of a classification; needs no network
struct LocalState {
    record: Option<SyncRecord>,
    content: Option<Vec<u8>>,
    changed: bool,
}

struct Snapshot {
    local: LocalState,
    remote: Option<RemoteMetadata>,
    remote_changed: bool,
}

impl Snapshot {
    fn divergence(&self) -> Divergence {
        match (self.local.changed, self.remote_changed) {
            (false, false) => Divergence::None,
            (true, false) => Divergence::Local,
            (false, true) => Divergence::Remote,
            (true, true) => Divergence::Both,
        }
    }

    fn synced_revision(&self) -> Option<&str> {
        self.local
            .record
            .as_ref()
            .and_then(|r| r.synced_remote_revision.as_deref())
    }
}

/// Passes hold the cache's lock for the file, which cached writes take too.
pub struct RemoteSyncProcessor<C: RemoteClient> {
    session: Arc<RemoteSession<C>>,
    cache: Arc<LocalCache>,
}

impl<C: RemoteClient> RemoteSyncProcessor<C> {
    pub fn new(session: Arc<RemoteSession<C>>, cache: Arc<LocalCache>) -> Self {
        Self { session, cache }
    }

    fn local_state(&self, path: &str) -> Result<LocalState> {
        let record = self.cache.load_record(path)?;
        let content = self.cache.read_content(path)?;
        let changed = match (&content, &record) {
            (Some(bytes), Some(record)) => record.is_locally_modified(bytes),
            (Some(_), None) => true,
            (None, _) => false,
        };
        Ok(LocalState {
            record,
            content,
            changed,
        })
    }

    fn snapshot(&self, path: &str) -> Result<Snapshot> {
        let local = self.local_state(path)?;
        let remote = self.session.call(|c| c.metadata(path))?;

        let synced = local.record.as_ref().and_then(|r| r.synced_remote_revision.clone());
        let remote_changed = match (&remote, &synced) {
            (Some(meta), Some(revision)) => meta.revision.as_ref() != Some(revision),
            (Some(_), None) => true,
            // Deleted remotely since the last pass
            (None, Some(_)) => true,
            (None, None) => false,
        };

        if local.content.is_none() && remote.is_none() {
            return Err(FileSystemError::NotFound(path.to_string()));
        }

        Ok(Snapshot {
            local,
            remote,
            remote_changed,
        })
    }

    fn push(&self, file: &FileDescriptor, path: &str, content: &[u8], mode: WriteMode) -> Result<Option<FileDescriptor>> {
        match self.session.call(|c| c.upload(path, content, &mode))? {
            UploadOutcome::Uploaded(meta) => {
                let mut record = self
                    .cache
                    .load_record(path)?
                    .unwrap_or_else(|| SyncRecord::new(path, &meta.uid));
                record.uid = meta.uid.clone();
                record.mark_synced(content, meta.revision.clone(), meta.modified);
                self.cache.save_record(&record)?;
                log::info!("Pushed {} ({} bytes)", path, content.len());
                Ok(Some(
                    meta.to_descriptor(&file.fs_authority)
                        .with_modified(meta.modified.or(record.local_modified)),
                ))
            }
            UploadOutcome::RevisionMismatch => {
                log::warn!("Remote copy of {} changed during push", path);
                Ok(None)
            }
        }
    }

    /// Replace the cached copy with the remote one. With `expected`, the
    /// cached copy must still be the one the pass classified.
    fn pull(&self, file: &FileDescriptor, path: &str, expected: Option<&Snapshot>) -> Result<FileDescriptor> {
        let (content, meta) = self.session.call(|c| c.download(path))?;
        if let Some(snapshot) = expected {
            if self.cache.read_content(path)? != snapshot.local.content {
                log::warn!("{} changed locally while being pulled", path);
                return Err(self.conflict(file, snapshot));
            }
        }
        let mut record = self
            .cache
            .load_record(path)?
            .unwrap_or_else(|| SyncRecord::new(path, &meta.uid));
        record.uid = meta.uid.clone();
        record.local_modified = meta.modified;
        record.mark_synced(&content, meta.revision.clone(), meta.modified);
        self.cache.write_synced(&content, &record)?;
        log::info!("Pulled {} ({} bytes)", path, content.len());
        Ok(meta.to_descriptor(&file.fs_authority))
    }

    fn conflict(&self, file: &FileDescriptor, snapshot: &Snapshot) -> FileSystemError {
        let local_modified = snapshot.local.record.as_ref().and_then(|r| r.local_modified);
        let remote = match &snapshot.remote {
            Some(meta) => meta.to_descriptor(&file.fs_authority),
            None => file.clone().with_modified(None),
        };
        FileSystemError::SyncConflict(Box::new(SyncConflictInfo {
            local: file.clone().with_modified(local_modified),
            remote_modified: remote.modified,
            remote,
            local_modified,
        }))
    }

    fn resolve_conflict(
        &self,
        file: &FileDescriptor,
        path: &str,
        snapshot: &Snapshot,
        on_conflict: Option<ConflictResolutionStrategy>,
    ) -> Result<(FileDescriptor, SyncAction)> {
        match on_conflict {
            Some(ConflictResolutionStrategy::KeepLocal) => {
                let content = snapshot
                    .local
                    .content
                    .as_deref()
                    .ok_or_else(|| FileSystemError::NotFound(path.to_string()))?;
                match self.push(file, path, content, WriteMode::Overwrite)? {
                    Some(pushed) => Ok((pushed, SyncAction::ResolvedKeepLocal)),
                    None => Err(self.conflict(file, snapshot)),
                }
            }
            Some(ConflictResolutionStrategy::KeepRemote) => {
                let pulled = self.pull(file, path, None)?;
                Ok((pulled, SyncAction::ResolvedKeepRemote))
            }
            None => Err(self.conflict(file, snapshot)),
        }
    }

    fn run_pass(
        &self,
        file: &FileDescriptor,
        path: &str,
        on_conflict: Option<ConflictResolutionStrategy>,
    ) -> Result<SyncReport> {
        let snapshot = self.snapshot(path)?;
        let divergence = snapshot.divergence();
        let status = divergence.status();
        log::info!("Sync {}: {}", path, status);

        let (synced, action) = match divergence {
            Divergence::None => {
                let modified = snapshot.remote.as_ref().and_then(|m| m.modified).or(file.modified);
                (file.clone().with_modified(modified), SyncAction::None)
            }
            Divergence::Local => {
                let content = snapshot
                    .local
                    .content
                    .as_deref()
                    .ok_or_else(|| FileSystemError::NotFound(path.to_string()))?;
                let mode = match snapshot.synced_revision() {
                    Some(revision) => WriteMode::Update(revision.to_string()),
                    None => WriteMode::Create,
                };
                match self.push(file, path, content, mode)? {
                    Some(pushed) => (pushed, SyncAction::Pushed),
                    None => {
                        // Lost a race with another writer: re-read and treat as a conflict
                        let fresh = self.snapshot(path)?;
                        self.resolve_conflict(file, path, &fresh, on_conflict)?
                    }
                }
            }
            Divergence::Remote => (self.pull(file, path, Some(&snapshot))?, SyncAction::Pulled),
            Divergence::Both => self.resolve_conflict(file, path, &snapshot, on_conflict)?,
        };

        if action != SyncAction::None {
            log::info!("Sync {}: {:?}", path, action);
        }
        Ok(SyncReport {
            file: synced,
            status,
            action,
        })
    }
}

impl<C: RemoteClient + 'static> FileSystemSyncProcessor for RemoteSyncProcessor<C> {
    fn get_locally_modified_files(&self) -> Result<Vec<FileDescriptor>> {
        let authority = self.session.authority();
        let mut files = Vec::new();
        for record in self.cache.records()? {
            let Some(content) = self.cache.read_content(&record.path)? else {
                continue;
            };
            if record.is_locally_modified(&content) {
                files.push(
                    FileDescriptor::file(authority.clone(), record.path.clone(), record.uid.clone())
                        .with_modified(record.local_modified),
                );
            }
        }
        Ok(files)
    }

    fn get_sync_status(&self, file: &FileDescriptor) -> Result<SyncStatus> {
        check_authority(self.session.authority(), file);
        let path = normalize_path(&file.path);
        self.cache.with_file_lock(&path, || self.classify(&path))
    }

    fn process(
        &self,
        file: &FileDescriptor,
        strategy: SyncStrategy,
        on_conflict: Option<ConflictResolutionStrategy>,
    ) -> Result<SyncReport> {
        check_authority(self.session.authority(), file);
        let path = normalize_path(&file.path);
        self.cache
            .with_file_lock(&path, || self.process_locked(file, &path, strategy, on_conflict))
    }
}

impl<C: RemoteClient> RemoteSyncProcessor<C> {
    fn classify(&self, path: &str) -> Result<SyncStatus> {
        match self.snapshot(path) {
            Ok(snapshot) => Ok(snapshot.divergence().status()),
            Err(e) if e.is_network() => {
                let local = self.local_state(path)?;
                Ok(if local.changed {
                    SyncStatus::LocalChangesNoNetwork
                } else {
                    SyncStatus::NoNetwork
                })
            }
            Err(FileSystemError::NotFound(p)) => Err(FileSystemError::NotFound(p)),
            Err(e) => {
                log::warn!("Sync status of {} unavailable: {}", path, e);
                Ok(SyncStatus::Error)
            }
        }
    }

    fn process_locked(
        &self,
        file: &FileDescriptor,
        path: &str,
        strategy: SyncStrategy,
        on_conflict: Option<ConflictResolutionStrategy>,
    ) -> Result<SyncReport> {
        if strategy == SyncStrategy::Defer {
            let local = self.local_state(path)?;
            self.cache.enqueue(path, QueueReason::Deferred)?;
            log::debug!("Sync of {} deferred", path);
            return Ok(SyncReport {
                file: file.clone(),
                status: if local.changed {
                    SyncStatus::LocalChanges
                } else {
                    SyncStatus::NoChanges
                },
                action: SyncAction::Deferred,
            });
        }

        match self.run_pass(file, path, on_conflict) {
            Ok(report) => {
                self.cache.complete(path)?;
                Ok(report)
            }
            Err(e) => {
                if e.is_network() {
                    log::warn!("Sync of {} failed, network unavailable: {}", path, e);
                } else {
                    log::error!("Sync of {} failed: {}", path, e);
                }
                self.cache.fail(path, &e.to_string())?;
                Err(e)
            }
        }
    }
}
