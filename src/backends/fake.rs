//! In-memory backend.
//!
//! The remote store lives in process and can be edited, taken offline or
//! told to reject credentials, which makes it the harness for exercising
//! reconciliation end to end.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};

use crate::fs::remote::{RemoteClient, RemoteFileSystemProvider, RemoteMetadata, RemoteSession, UploadOutcome, WriteMode};
use crate::fs::{
    normalize_path, parent_path, CredentialsAuthenticator, FileSystemAuthenticator, FileSystemError, FsAuthority,
    NoAuthAuthenticator, Result,
};
use crate::sync::LocalCache;

pub type FakeFileSystemProvider = RemoteFileSystemProvider<FakeRemote>;

#[derive(Debug, Clone)]
struct FakeFile {
    content: Vec<u8>,
    revision: String,
    modified: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct FakeState {
    files: BTreeMap<String, FakeFile>,
    directories: BTreeSet<String>,
    next_revision: u64,
    uploads: usize,
}

impl FakeState {
    fn bump(&mut self) -> String {
        self.next_revision += 1;
        format!("rev-{}", self.next_revision)
    }

    fn store(&mut self, path: &str, content: Vec<u8>) -> RemoteMetadata {
        let revision = self.bump();
        let file = FakeFile {
            content,
            revision,
            modified: Utc::now(),
        };
        let meta = file_metadata(path, &file);
        self.files.insert(path.to_string(), file);
        meta
    }

    fn is_directory(&self, path: &str) -> bool {
        path == "/"
            || self.directories.contains(path)
            || self.files.keys().any(|f| f.starts_with(&format!("{}/", path)))
    }
}

fn file_metadata(path: &str, file: &FakeFile) -> RemoteMetadata {
    RemoteMetadata {
        path: path.to_string(),
        uid: path.to_string(),
        is_directory: false,
        revision: Some(file.revision.clone()),
        modified: Some(file.modified),
        size: Some(file.content.len() as u64),
    }
}

fn directory_metadata(path: &str) -> RemoteMetadata {
    RemoteMetadata {
        path: path.to_string(),
        uid: path.to_string(),
        is_directory: true,
        revision: None,
        modified: None,
        size: None,
    }
}

/// Shared in-memory remote. Cloning the `Arc` shares the store, so a test
/// can play "another device" while a provider works against it.
#[derive(Debug, Default)]
pub struct FakeRemote {
    state: Mutex<FakeState>,
    offline: AtomicBool,
    reject: AtomicBool,
}

impl FakeRemote {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(FileSystemError::NetworkIo("fake remote is offline".to_string()));
        }
        if self.reject.load(Ordering::SeqCst) {
            return Err(FileSystemError::Authentication("fake remote rejected credentials".to_string()));
        }
        Ok(())
    }

    /// Write `content` as another client would, creating a new revision
    pub fn put(&self, path: &str, content: &[u8]) {
        let path = normalize_path(path);
        self.state().store(&path, content.to_vec());
    }

    /// Bump the revision and modification time without changing content
    pub fn touch(&self, path: &str) -> bool {
        let path = normalize_path(path);
        let mut state = self.state();
        let revision = state.bump();
        match state.files.get_mut(&path) {
            Some(file) => {
                file.revision = revision;
                file.modified = Utc::now();
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, path: &str) -> bool {
        let path = normalize_path(path);
        self.state().files.remove(&path).is_some()
    }

    pub fn content(&self, path: &str) -> Option<Vec<u8>> {
        self.state().files.get(&normalize_path(path)).map(|f| f.content.clone())
    }

    pub fn revision(&self, path: &str) -> Option<String> {
        self.state()
            .files
            .get(&normalize_path(path))
            .map(|f| f.revision.clone())
    }

    /// Number of accepted uploads so far
    pub fn upload_count(&self) -> usize {
        self.state().uploads
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn reject_credentials(&self, reject: bool) {
        self.reject.store(reject, Ordering::SeqCst);
    }
}

impl RemoteClient for FakeRemote {
    fn metadata(&self, path: &str) -> Result<Option<RemoteMetadata>> {
        self.check()?;
        let state = self.state();
        if let Some(file) = state.files.get(path) {
            return Ok(Some(file_metadata(path, file)));
        }
        Ok(state.is_directory(path).then(|| directory_metadata(path)))
    }

    fn list(&self, path: &str) -> Result<Vec<RemoteMetadata>> {
        self.check()?;
        let state = self.state();
        if !state.is_directory(path) {
            return Err(FileSystemError::NotFound(path.to_string()));
        }

        let mut children = BTreeMap::new();
        for (file_path, file) in &state.files {
            if parent_path(file_path) == path {
                children.insert(file_path.clone(), file_metadata(file_path, file));
            }
        }
        // Directories, including those implied by deeper files
        let implied = state.files.keys().flat_map(|f| ancestors(f));
        for dir in state.directories.iter().cloned().chain(implied) {
            if dir != "/" && dir != path && parent_path(&dir) == path {
                children.entry(dir.clone()).or_insert_with(|| directory_metadata(&dir));
            }
        }
        Ok(children.into_values().collect())
    }

    fn download(&self, path: &str) -> Result<(Vec<u8>, RemoteMetadata)> {
        self.check()?;
        let state = self.state();
        match state.files.get(path) {
            Some(file) => Ok((file.content.clone(), file_metadata(path, file))),
            None => Err(FileSystemError::NotFound(path.to_string())),
        }
    }

    fn upload(&self, path: &str, content: &[u8], mode: &WriteMode) -> Result<UploadOutcome> {
        self.check()?;
        let mut state = self.state();
        let current = state.files.get(path).map(|f| f.revision.clone());
        let accepted = match (mode, &current) {
            (WriteMode::Overwrite, _) => true,
            (WriteMode::Create, existing) => existing.is_none(),
            (WriteMode::Update(expected), Some(actual)) => expected == actual,
            (WriteMode::Update(_), None) => false,
        };
        if !accepted {
            return Ok(UploadOutcome::RevisionMismatch);
        }

        state.uploads += 1;
        Ok(UploadOutcome::Uploaded(state.store(path, content.to_vec())))
    }

    fn create_directory(&self, path: &str) -> Result<RemoteMetadata> {
        self.check()?;
        let mut state = self.state();
        if state.files.contains_key(path) || state.is_directory(path) {
            return Err(FileSystemError::AlreadyExists(path.to_string()));
        }
        state.directories.insert(path.to_string());
        Ok(directory_metadata(path))
    }

    fn delete(&self, path: &str) -> Result<()> {
        self.check()?;
        let mut state = self.state();
        if state.files.remove(path).is_some() || state.directories.remove(path) {
            return Ok(());
        }
        Err(FileSystemError::NotFound(path.to_string()))
    }
}

fn ancestors(path: &str) -> Vec<String> {
    let mut dirs = Vec::new();
    let mut current = parent_path(path);
    while current != "/" {
        let next = parent_path(&current);
        dirs.push(current);
        current = next;
    }
    dirs
}

/// Provider for `authority` on top of a shared fake remote. Authorities
/// carrying credentials get a credentials authenticator so rejection can be
/// exercised.
pub fn fake_provider(authority: FsAuthority, remote: Arc<FakeRemote>, cache: Arc<LocalCache>) -> FakeFileSystemProvider {
    let authenticator: Arc<dyn FileSystemAuthenticator> = match &authority.credentials {
        Some(credentials) => Arc::new(CredentialsAuthenticator::new(Some(credentials.clone()))),
        None => Arc::new(NoAuthAuthenticator::new()),
    };
    RemoteFileSystemProvider::new(RemoteSession::new(authority, remote, authenticator), cache)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::{AuthState, FileDescriptor, FileSystemProvider, FsOptions, FsType, ServerCredentials};
    use crate::sync::{ConflictResolutionStrategy, FileSystemSyncProcessor, SyncAction, SyncStatus, SyncStrategy};
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        remote: Arc<FakeRemote>,
        provider: FakeFileSystemProvider,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let remote = Arc::new(FakeRemote::new());
        let provider = fake_provider(
            FsAuthority::new(FsType::Fake, None),
            Arc::clone(&remote),
            Arc::new(LocalCache::new(dir.path())),
        );
        Fixture {
            _dir: dir,
            remote,
            provider,
        }
    }

    fn file(path: &str) -> FileDescriptor {
        FileDescriptor::file(FsAuthority::new(FsType::Fake, None), path, path)
    }

    fn process(fx: &Fixture, path: &str, on_conflict: Option<ConflictResolutionStrategy>) -> crate::fs::Result<crate::sync::SyncReport> {
        fx.provider
            .sync_processor()
            .process(&file(path), SyncStrategy::SyncAutomatically, on_conflict)
    }

    fn status(fx: &Fixture, path: &str) -> SyncStatus {
        fx.provider.sync_processor().get_sync_status(&file(path)).unwrap()
    }

    /// Remote file already cached and in sync
    fn synced(fx: &Fixture, path: &str, content: &[u8]) {
        fx.remote.put(path, content);
        fx.provider.read_file(&file(path), FsOptions::default()).unwrap();
    }

    #[test]
    fn test_write_through_pushes() {
        let fx = fixture();
        let written = fx
            .provider
            .write_file(&file("/vault.kdbx"), b"v1", FsOptions::default())
            .unwrap();
        assert_eq!(written.path, "/vault.kdbx");
        assert_eq!(fx.remote.content("/vault.kdbx").as_deref(), Some(&b"v1"[..]));
        assert_eq!(status(&fx, "/vault.kdbx"), SyncStatus::NoChanges);
        assert_eq!(fx.provider.cache().queue().unwrap().pending_count(), 0);
    }

    #[test]
    fn test_no_changes_writes_nothing() {
        let fx = fixture();
        synced(&fx, "/vault.kdbx", b"v1");
        let uploads = fx.remote.upload_count();
        let revision = fx.remote.revision("/vault.kdbx");

        for _ in 0..2 {
            let report = process(&fx, "/vault.kdbx", None).unwrap();
            assert_eq!(report.status, SyncStatus::NoChanges);
            assert_eq!(report.action, SyncAction::None);
            assert!(!report.wrote_anything());
        }
        assert_eq!(fx.remote.upload_count(), uploads);
        assert_eq!(fx.remote.revision("/vault.kdbx"), revision);
    }

    #[test]
    fn test_local_change_is_pushed_once() {
        let fx = fixture();
        synced(&fx, "/vault.kdbx", b"v1");
        fx.provider
            .write_file(&file("/vault.kdbx"), b"v2", FsOptions::postponed())
            .unwrap();
        assert_eq!(status(&fx, "/vault.kdbx"), SyncStatus::LocalChanges);
        assert_eq!(fx.provider.sync_processor().get_locally_modified_files().unwrap().len(), 1);

        let report = process(&fx, "/vault.kdbx", None).unwrap();
        assert_eq!(report.status, SyncStatus::LocalChanges);
        assert_eq!(report.action, SyncAction::Pushed);
        assert_eq!(fx.remote.content("/vault.kdbx").as_deref(), Some(&b"v2"[..]));

        let again = process(&fx, "/vault.kdbx", None).unwrap();
        assert_eq!(again.action, SyncAction::None);
        assert!(fx.provider.sync_processor().get_locally_modified_files().unwrap().is_empty());
    }

    #[test]
    fn test_remote_touch_is_pulled() {
        let fx = fixture();
        synced(&fx, "/vault.kdbx", b"v1");
        assert!(fx.remote.touch("/vault.kdbx"));
        assert_eq!(status(&fx, "/vault.kdbx"), SyncStatus::RemoteChanges);

        let report = process(&fx, "/vault.kdbx", None).unwrap();
        assert_eq!(report.status, SyncStatus::RemoteChanges);
        assert_eq!(report.action, SyncAction::Pulled);
        assert_eq!(status(&fx, "/vault.kdbx"), SyncStatus::NoChanges);
    }

    #[test]
    fn test_remote_content_change_is_pulled() {
        let fx = fixture();
        synced(&fx, "/vault.kdbx", b"v1");
        fx.remote.put("/vault.kdbx", b"from elsewhere");

        process(&fx, "/vault.kdbx", None).unwrap();
        let content = fx.provider.read_file(&file("/vault.kdbx"), FsOptions::default()).unwrap();
        assert_eq!(content, b"from elsewhere");
    }

    #[test]
    fn test_conflict_requires_resolution() {
        let fx = fixture();
        synced(&fx, "/vault.kdbx", b"v1");
        fx.provider
            .write_file(&file("/vault.kdbx"), b"local", FsOptions::postponed())
            .unwrap();
        fx.remote.put("/vault.kdbx", b"remote");
        assert_eq!(status(&fx, "/vault.kdbx"), SyncStatus::Conflict);

        match process(&fx, "/vault.kdbx", None) {
            Err(FileSystemError::SyncConflict(info)) => {
                assert_eq!(info.local.path, "/vault.kdbx");
                assert!(info.remote_modified.is_some());
            }
            other => panic!("expected conflict, got {:?}", other.map(|r| r.action)),
        }
        // nothing was written either way
        assert_eq!(fx.remote.content("/vault.kdbx").as_deref(), Some(&b"remote"[..]));
        let queue = fx.provider.cache().queue().unwrap();
        assert_eq!(queue.get("/vault.kdbx").map(|i| i.retries), Some(1));
    }

    #[test]
    fn test_conflict_keep_local() {
        let fx = fixture();
        synced(&fx, "/vault.kdbx", b"v1");
        fx.provider
            .write_file(&file("/vault.kdbx"), b"local", FsOptions::postponed())
            .unwrap();
        fx.remote.put("/vault.kdbx", b"remote");

        let report = process(&fx, "/vault.kdbx", Some(ConflictResolutionStrategy::KeepLocal)).unwrap();
        assert_eq!(report.status, SyncStatus::Conflict);
        assert_eq!(report.action, SyncAction::ResolvedKeepLocal);
        assert_eq!(fx.remote.content("/vault.kdbx").as_deref(), Some(&b"local"[..]));
        assert_eq!(status(&fx, "/vault.kdbx"), SyncStatus::NoChanges);
    }

    #[test]
    fn test_conflict_keep_remote() {
        let fx = fixture();
        synced(&fx, "/vault.kdbx", b"v1");
        fx.provider
            .write_file(&file("/vault.kdbx"), b"local", FsOptions::postponed())
            .unwrap();
        fx.remote.put("/vault.kdbx", b"remote");

        let report = process(&fx, "/vault.kdbx", Some(ConflictResolutionStrategy::KeepRemote)).unwrap();
        assert_eq!(report.action, SyncAction::ResolvedKeepRemote);
        let content = fx.provider.read_file(&file("/vault.kdbx"), FsOptions::default()).unwrap();
        assert_eq!(content, b"remote");
        assert_eq!(status(&fx, "/vault.kdbx"), SyncStatus::NoChanges);
    }

    #[test]
    fn test_defer_only_queues() {
        let fx = fixture();
        synced(&fx, "/vault.kdbx", b"v1");
        fx.provider
            .write_file(&file("/vault.kdbx"), b"v2", FsOptions::postponed())
            .unwrap();
        fx.remote.set_offline(true);

        let report = fx
            .provider
            .sync_processor()
            .process(&file("/vault.kdbx"), SyncStrategy::Defer, None)
            .unwrap();
        assert_eq!(report.action, SyncAction::Deferred);
        assert_eq!(report.status, SyncStatus::LocalChanges);
        assert!(fx.provider.cache().queue().unwrap().contains("/vault.kdbx"));
        assert_eq!(fx.remote.content("/vault.kdbx").as_deref(), Some(&b"v1"[..]));
    }

    #[test]
    fn test_offline_write_is_kept_locally() {
        let fx = fixture();
        synced(&fx, "/vault.kdbx", b"v1");
        fx.remote.set_offline(true);

        fx.provider
            .write_file(&file("/vault.kdbx"), b"offline", FsOptions::default())
            .unwrap();
        assert_eq!(status(&fx, "/vault.kdbx"), SyncStatus::LocalChangesNoNetwork);
        let content = fx.provider.read_file(&file("/vault.kdbx"), FsOptions::default()).unwrap();
        assert_eq!(content, b"offline");

        let err = process(&fx, "/vault.kdbx", None).unwrap_err();
        assert!(err.is_network());

        fx.remote.set_offline(false);
        let report = process(&fx, "/vault.kdbx", None).unwrap();
        assert_eq!(report.action, SyncAction::Pushed);
        assert_eq!(fx.remote.content("/vault.kdbx").as_deref(), Some(&b"offline"[..]));
    }

    #[test]
    fn test_offline_without_local_changes() {
        let fx = fixture();
        synced(&fx, "/vault.kdbx", b"v1");
        fx.remote.set_offline(true);
        assert_eq!(status(&fx, "/vault.kdbx"), SyncStatus::NoNetwork);

        // listing and lookup fall back to the cache
        let root = FileDescriptor::root(FsAuthority::new(FsType::Fake, None), "/", "/");
        let listed = fx.provider.list_files(&root).unwrap();
        assert_eq!(listed.len(), 1);
        assert!(fx.provider.exists(&file("/vault.kdbx")).unwrap());
        assert_eq!(
            fx.provider.get_file("/vault.kdbx", FsOptions::default()).unwrap().path,
            "/vault.kdbx"
        );
    }

    #[test]
    fn test_missing_everywhere_is_not_found() {
        let fx = fixture();
        let result = fx.provider.sync_processor().get_sync_status(&file("/nothing.kdbx"));
        assert!(matches!(result, Err(FileSystemError::NotFound(_))));
    }

    #[test]
    fn test_list_and_create() {
        let fx = fixture();
        fx.remote.put("/a.kdbx", b"a");
        fx.remote.put("/dir/b.kdbx", b"b");
        let root = fx.provider.root_file().unwrap();
        assert!(root.is_root);

        let listed = fx.provider.list_files(&root).unwrap();
        let names: Vec<&str> = listed.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["dir", "a.kdbx"]);

        let created = fx.provider.create_file(&root, "new.kdbx", FsOptions::default()).unwrap();
        assert_eq!(created.path, "/new.kdbx");
        assert!(matches!(
            fx.provider.create_file(&root, "a.kdbx", FsOptions::default()),
            Err(FileSystemError::AlreadyExists(_))
        ));
    }

    #[test]
    fn test_read_only_write_rejected() {
        let fx = fixture();
        let result = fx.provider.write_file(&file("/x.kdbx"), b"x", FsOptions::read_only());
        assert!(matches!(result, Err(FileSystemError::Permission(_))));
    }

    #[test]
    fn test_rejected_credentials_block_further_calls() {
        let dir = TempDir::new().unwrap();
        let remote = Arc::new(FakeRemote::new());
        let authority = FsAuthority::new(
            FsType::Fake,
            Some(ServerCredentials::basic("https://fake.example.com", "alice", "pw")),
        );
        let provider = fake_provider(authority.clone(), Arc::clone(&remote), Arc::new(LocalCache::new(dir.path())));
        let target = FileDescriptor::file(authority, "/vault.kdbx", "/vault.kdbx");
        remote.put("/vault.kdbx", b"v1");

        provider.read_file(&target, FsOptions::no_cache()).unwrap();
        assert_eq!(provider.authenticator().state(), AuthState::Authenticated);

        remote.reject_credentials(true);
        let err = provider.read_file(&target, FsOptions::no_cache()).unwrap_err();
        assert!(err.is_authentication());
        assert_eq!(provider.authenticator().state(), AuthState::CredentialsRejected);
        assert!(provider.authenticator().is_authentication_required());

        // refused without reaching the remote until new credentials arrive
        remote.reject_credentials(false);
        assert!(provider.read_file(&target, FsOptions::no_cache()).is_err());
        provider
            .authenticator()
            .set_credentials(ServerCredentials::basic("https://fake.example.com", "alice", "new"));
        provider.read_file(&target, FsOptions::no_cache()).unwrap();
    }

    #[test]
    #[should_panic(expected = "incorrect use")]
    fn test_foreign_descriptor_panics() {
        let fx = fixture();
        let local = FileDescriptor::file(FsAuthority::local(), "/etc/hosts", "/etc/hosts");
        let _ = fx.provider.read_file(&local, FsOptions::default());
    }

    /// Delegates to a fake remote; an armed download parks until released
    struct GatedRemote {
        inner: Arc<FakeRemote>,
        armed: AtomicBool,
        entered: Mutex<std::sync::mpsc::Sender<()>>,
        release: Mutex<std::sync::mpsc::Receiver<()>>,
    }

    impl RemoteClient for GatedRemote {
        fn metadata(&self, path: &str) -> Result<Option<RemoteMetadata>> {
            self.inner.metadata(path)
        }

        fn list(&self, path: &str) -> Result<Vec<RemoteMetadata>> {
            self.inner.list(path)
        }

        fn download(&self, path: &str) -> Result<(Vec<u8>, RemoteMetadata)> {
            if self.armed.swap(false, Ordering::SeqCst) {
                self.entered.lock().unwrap().send(()).unwrap();
                self.release
                    .lock()
                    .unwrap()
                    .recv_timeout(std::time::Duration::from_secs(10))
                    .unwrap();
            }
            self.inner.download(path)
        }

        fn upload(&self, path: &str, content: &[u8], mode: &WriteMode) -> Result<UploadOutcome> {
            self.inner.upload(path, content, mode)
        }

        fn create_directory(&self, path: &str) -> Result<RemoteMetadata> {
            self.inner.create_directory(path)
        }

        fn delete(&self, path: &str) -> Result<()> {
            self.inner.delete(path)
        }
    }

    struct Gate {
        _dir: TempDir,
        remote: Arc<FakeRemote>,
        client: Arc<GatedRemote>,
        provider: RemoteFileSystemProvider<GatedRemote>,
        entered: std::sync::mpsc::Receiver<()>,
        release: std::sync::mpsc::Sender<()>,
    }

    fn gated() -> Gate {
        let dir = TempDir::new().unwrap();
        let remote = Arc::new(FakeRemote::new());
        let (entered_tx, entered) = std::sync::mpsc::channel();
        let (release, release_rx) = std::sync::mpsc::channel();
        let client = Arc::new(GatedRemote {
            inner: Arc::clone(&remote),
            armed: AtomicBool::new(false),
            entered: Mutex::new(entered_tx),
            release: Mutex::new(release_rx),
        });
        let authority = FsAuthority::new(FsType::Fake, None);
        let session = RemoteSession::new(authority, Arc::clone(&client), Arc::new(NoAuthAuthenticator::new()));
        let provider = RemoteFileSystemProvider::new(session, Arc::new(LocalCache::new(dir.path())));
        Gate {
            _dir: dir,
            remote,
            client,
            provider,
            entered,
            release,
        }
    }

    #[test]
    fn test_write_during_pull_is_kept() {
        let gate = gated();
        let target = file("/vault.kdbx");
        gate.remote.put("/vault.kdbx", b"v1");
        gate.provider.read_file(&target, FsOptions::default()).unwrap();
        gate.remote.put("/vault.kdbx", b"v2");

        gate.client.armed.store(true, Ordering::SeqCst);
        std::thread::scope(|scope| {
            let pull = scope.spawn(|| {
                gate.provider
                    .sync_processor()
                    .process(&target, SyncStrategy::SyncAutomatically, None)
            });
            gate.entered.recv().unwrap();

            let write = scope.spawn(|| gate.provider.write_file(&target, b"edit", FsOptions::postponed()));
            std::thread::sleep(std::time::Duration::from_millis(50));
            gate.release.send(()).unwrap();

            assert_eq!(pull.join().unwrap().unwrap().action, SyncAction::Pulled);
            write.join().unwrap().unwrap();
        });

        assert_eq!(gate.provider.read_file(&target, FsOptions::default()).unwrap(), b"edit");
        let processor = gate.provider.sync_processor();
        assert_eq!(processor.get_locally_modified_files().unwrap().len(), 1);
        assert_eq!(processor.get_sync_status(&target).unwrap(), SyncStatus::LocalChanges);
        assert_eq!(gate.remote.content("/vault.kdbx").as_deref(), Some(&b"v2"[..]));
    }

    #[test]
    fn test_concurrent_passes_pull_once() {
        let gate = gated();
        let target = file("/vault.kdbx");
        gate.remote.put("/vault.kdbx", b"v1");
        gate.provider.read_file(&target, FsOptions::default()).unwrap();
        gate.remote.put("/vault.kdbx", b"v2");
        let uploads = gate.remote.upload_count();

        gate.client.armed.store(true, Ordering::SeqCst);
        let mut actions = std::thread::scope(|scope| {
            let pass = || {
                gate.provider
                    .sync_processor()
                    .process(&target, SyncStrategy::SyncAutomatically, None)
                    .unwrap()
                    .action
            };
            let first = scope.spawn(pass);
            gate.entered.recv().unwrap();
            let second = scope.spawn(pass);
            std::thread::sleep(std::time::Duration::from_millis(50));
            gate.release.send(()).unwrap();
            vec![first.join().unwrap(), second.join().unwrap()]
        });

        actions.sort_by_key(|action| *action == SyncAction::Pulled);
        assert_eq!(actions, vec![SyncAction::None, SyncAction::Pulled]);
        assert_eq!(gate.remote.upload_count(), uploads);
        assert_eq!(gate.provider.read_file(&target, FsOptions::default()).unwrap(), b"v2");
        assert_eq!(gate.provider.cache().held_locks(), 0);
    }
}
