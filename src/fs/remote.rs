//! Provider shared by every backend that keeps the authoritative copy remotely.
//!
//! A backend only implements [`RemoteClient`]; listing, cached reads,
//! write-through and offline fallbacks live here once.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use super::auth::FileSystemAuthenticator;
use super::errors::{FileSystemError, Result};
use super::model::{join_path, normalize_path, parent_path, FileDescriptor, FsAuthority, FsOptions};
use super::provider::{check_authority, FileSystemProvider};
use crate::sync::metadata::{LocalCache, SyncRecord};
use crate::sync::queue::QueueReason;
use crate::sync::{FileSystemSyncProcessor, RemoteSyncProcessor, SyncStrategy};

/// Remote view of one file or directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteMetadata {
    pub path: String,
    pub uid: String,
    pub is_directory: bool,
    /// Opaque version marker: etag, Dropbox rev, git blob id
    pub revision: Option<String>,
    pub modified: Option<DateTime<Utc>>,
    pub size: Option<u64>,
}

impl RemoteMetadata {
    pub fn to_descriptor(&self, authority: &FsAuthority) -> FileDescriptor {
        let descriptor = if self.is_directory {
            FileDescriptor::directory(authority.clone(), self.path.clone(), self.uid.clone())
        } else {
            FileDescriptor::file(authority.clone(), self.path.clone(), self.uid.clone())
        };
        descriptor.with_modified(self.modified)
    }
}

/// Precondition of an upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteMode {
    /// The file must not exist yet
    Create,
    /// The remote must still be at this revision
    Update(String),
    Overwrite,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    Uploaded(RemoteMetadata),
    /// The remote moved on (or appeared) since the expected revision
    RevisionMismatch,
}

/// Wire protocol of a remote backend. Paths are normalized `/a/b` paths
/// relative to the backend root.
pub trait RemoteClient: Send + Sync {
    /// Make the root reachable and return its path
    fn prepare(&self) -> Result<String> {
        Ok("/".to_string())
    }

    /// `None` when nothing exists at `path`
    fn metadata(&self, path: &str) -> Result<Option<RemoteMetadata>>;

    fn list(&self, path: &str) -> Result<Vec<RemoteMetadata>>;

    fn download(&self, path: &str) -> Result<(Vec<u8>, RemoteMetadata)>;

    fn upload(&self, path: &str, content: &[u8], mode: &WriteMode) -> Result<UploadOutcome>;

    fn create_directory(&self, path: &str) -> Result<RemoteMetadata>;

    fn delete(&self, path: &str) -> Result<()>;
}

/// A client bound to its authority and authenticator.
///
/// Every call is gated on the authenticator and feeds the outcome back into
/// its state machine.
pub struct RemoteSession<C: RemoteClient> {
    authority: FsAuthority,
    client: Arc<C>,
    authenticator: Arc<dyn FileSystemAuthenticator>,
}

impl<C: RemoteClient> RemoteSession<C> {
    pub fn new(authority: FsAuthority, client: Arc<C>, authenticator: Arc<dyn FileSystemAuthenticator>) -> Self {
        Self {
            authority,
            client,
            authenticator,
        }
    }

    pub fn authority(&self) -> &FsAuthority {
        &self.authority
    }

    pub fn client(&self) -> &Arc<C> {
        &self.client
    }

    pub fn authenticator(&self) -> &Arc<dyn FileSystemAuthenticator> {
        &self.authenticator
    }

    pub fn call<T>(&self, f: impl FnOnce(&C) -> Result<T>) -> Result<T> {
        if self.authenticator.is_authentication_required() {
            return Err(FileSystemError::Authentication(format!(
                "{} requires authentication",
                self.authority.fs_type
            )));
        }

        let result = f(&self.client);
        match &result {
            Ok(_) => self.authenticator.on_authenticated(),
            Err(FileSystemError::Authentication(_)) => self.authenticator.on_credentials_rejected(),
            Err(_) => {}
        }
        result
    }
}

pub struct RemoteFileSystemProvider<C: RemoteClient> {
    session: Arc<RemoteSession<C>>,
    cache: Arc<LocalCache>,
    processor: Arc<RemoteSyncProcessor<C>>,
}

impl<C: RemoteClient + 'static> RemoteFileSystemProvider<C> {
    pub fn new(session: RemoteSession<C>, cache: Arc<LocalCache>) -> Self {
        let session = Arc::new(session);
        let processor = Arc::new(RemoteSyncProcessor::new(Arc::clone(&session), Arc::clone(&cache)));
        Self {
            session,
            cache,
            processor,
        }
    }

    pub fn client(&self) -> &Arc<C> {
        self.session.client()
    }

    pub fn cache(&self) -> &Arc<LocalCache> {
        &self.cache
    }

    pub fn processor(&self) -> &Arc<RemoteSyncProcessor<C>> {
        &self.processor
    }

    fn authority(&self) -> &FsAuthority {
        self.session.authority()
    }

    fn descriptor_from_record(&self, record: &SyncRecord) -> FileDescriptor {
        FileDescriptor::file(self.authority().clone(), record.path.clone(), record.uid.clone())
            .with_modified(record.local_modified.or(record.remote_modified))
    }

    fn cached_children(&self, dir: &str) -> Result<Vec<FileDescriptor>> {
        Ok(self
            .cache
            .records()?
            .iter()
            .filter(|record| parent_path(&record.path) == dir)
            .map(|record| self.descriptor_from_record(record))
            .collect())
    }
}

impl<C: RemoteClient + 'static> FileSystemProvider for RemoteFileSystemProvider<C> {
    fn fs_authority(&self) -> &FsAuthority {
        self.authority()
    }

    fn root_file(&self) -> Result<FileDescriptor> {
        let root = self.session.call(|c| c.prepare())?;
        Ok(FileDescriptor::root(self.authority().clone(), root.clone(), root))
    }

    fn list_files(&self, dir: &FileDescriptor) -> Result<Vec<FileDescriptor>> {
        check_authority(self.authority(), dir);
        if !dir.is_directory {
            return Err(FileSystemError::InvalidData(format!("{} is not a directory", dir.path)));
        }

        let path = normalize_path(&dir.path);
        match self.session.call(|c| c.list(&path)) {
            Ok(entries) => {
                let mut files: Vec<FileDescriptor> = entries
                    .iter()
                    .map(|meta| meta.to_descriptor(self.authority()))
                    .collect();
                files.sort_by(|a, b| (!a.is_directory, &a.name).cmp(&(!b.is_directory, &b.name)));
                Ok(files)
            }
            Err(e) if e.is_network() => {
                let cached = self.cached_children(&path)?;
                if cached.is_empty() {
                    return Err(e);
                }
                log::warn!("Listing {} from cache: {}", path, e);
                Ok(cached)
            }
            Err(e) => Err(e),
        }
    }

    fn get_parent(&self, file: &FileDescriptor) -> Result<FileDescriptor> {
        check_authority(self.authority(), file);
        if file.is_root {
            return Ok(file.clone());
        }

        let parent = parent_path(&file.path);
        if parent == "/" {
            return Ok(FileDescriptor::root(self.authority().clone(), "/", "/"));
        }
        Ok(FileDescriptor::directory(self.authority().clone(), parent.clone(), parent))
    }

    fn exists(&self, file: &FileDescriptor) -> Result<bool> {
        check_authority(self.authority(), file);
        let path = normalize_path(&file.path);
        match self.session.call(|c| c.metadata(&path)) {
            Ok(meta) => Ok(meta.is_some()),
            Err(e) if e.is_network() && self.cache.has_content(&path) => Ok(true),
            Err(e) => Err(e),
        }
    }

    fn get_file(&self, path: &str, options: FsOptions) -> Result<FileDescriptor> {
        let path = normalize_path(path);
        match self.session.call(|c| c.metadata(&path)) {
            Ok(Some(meta)) => Ok(meta.to_descriptor(self.authority())),
            Ok(None) => Err(FileSystemError::NotFound(path)),
            Err(e) if e.is_network() && options.cache_enabled => match self.cache.load_record(&path)? {
                Some(record) => Ok(self.descriptor_from_record(&record)),
                None => Err(e),
            },
            Err(e) => Err(e),
        }
    }

    fn read_file(&self, file: &FileDescriptor, options: FsOptions) -> Result<Vec<u8>> {
        check_authority(self.authority(), file);
        if file.is_directory {
            return Err(FileSystemError::InvalidData(format!("{} is a directory", file.path)));
        }
        let path = normalize_path(&file.path);

        if !options.cache_enabled {
            let (content, _) = self.session.call(|c| c.download(&path))?;
            return Ok(content);
        }

        if let Some(content) = self.cache.read_content(&path)? {
            return Ok(content);
        }

        self.cache.with_file_lock(&path, || -> Result<Vec<u8>> {
            // A concurrent write may have filled the cache meanwhile
            if let Some(content) = self.cache.read_content(&path)? {
                return Ok(content);
            }
            let (content, meta) = self.session.call(|c| c.download(&path))?;
            let mut record = SyncRecord::new(&path, &meta.uid);
            record.mark_synced(&content, meta.revision.clone(), meta.modified);
            self.cache.write_synced(&content, &record)?;
            log::debug!("Cached {} ({} bytes)", path, content.len());
            Ok(content)
        })
    }

    fn write_file(&self, file: &FileDescriptor, content: &[u8], options: FsOptions) -> Result<FileDescriptor> {
        check_authority(self.authority(), file);
        if !options.write_enabled {
            return Err(FileSystemError::Permission(format!("{} is opened read-only", file.path)));
        }
        let path = normalize_path(&file.path);

        if !options.cache_enabled {
            return match self
                .session
                .call(|c| c.upload(&path, content, &WriteMode::Overwrite))?
            {
                UploadOutcome::Uploaded(meta) => Ok(meta.to_descriptor(self.authority())),
                UploadOutcome::RevisionMismatch => Err(FileSystemError::InvalidData(format!(
                    "unconditional upload of {} was refused",
                    path
                ))),
            };
        }

        let record = self.cache.with_file_lock(&path, || {
            let record = self.cache.write_local(&path, &file.uid, content)?;
            self.cache.enqueue(&path, QueueReason::LocalWrite)?;
            Ok::<_, FileSystemError>(record)
        })?;
        let written = file.clone().with_modified(record.local_modified);

        if options.postponed_sync_enabled {
            log::debug!("Write to {} queued for later sync", path);
            return Ok(written);
        }

        match self.processor.process(&written, SyncStrategy::SyncAutomatically, None) {
            Ok(report) => Ok(report.file),
            Err(e) if e.is_network() => {
                log::warn!("Write to {} kept locally, remote unreachable: {}", path, e);
                Ok(written)
            }
            Err(e) => Err(e),
        }
    }

    fn create_file(&self, parent: &FileDescriptor, name: &str, options: FsOptions) -> Result<FileDescriptor> {
        check_authority(self.authority(), parent);
        let path = join_path(&parent.path, name);
        if self.cache.has_content(&path) {
            return Err(FileSystemError::AlreadyExists(path));
        }

        match self.session.call(|c| c.metadata(&path)) {
            Ok(Some(_)) => return Err(FileSystemError::AlreadyExists(path)),
            Ok(None) => {}
            Err(e) if e.is_network() && options.cache_enabled => {
                log::warn!("Creating {} offline: {}", path, e);
            }
            Err(e) => return Err(e),
        }

        let file = FileDescriptor::file(self.authority().clone(), path.clone(), path);
        self.write_file(&file, &[], options)
    }

    fn authenticator(&self) -> Arc<dyn FileSystemAuthenticator> {
        Arc::clone(self.session.authenticator())
    }

    fn sync_processor(&self) -> Arc<dyn FileSystemSyncProcessor> {
        self.processor.clone()
    }
}
