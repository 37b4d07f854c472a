//! Git backend: a working copy per authority, blob ids as revisions, and
//! commit-and-push as the upload primitive.

mod repository;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

pub use repository::{GitOperationError, TreeEntryInfo, WorkingCopy, DEFAULT_BRANCH};

use crate::fs::remote::{RemoteClient, RemoteFileSystemProvider, RemoteMetadata, RemoteSession, UploadOutcome, WriteMode};
use crate::fs::{
    file_name, CredentialsAuthenticator, FileSystemAuthenticator, FileSystemError, FsAuthority, GitAuth,
    GitCredentials, Result, ServerCredentials,
};
use crate::sync::{DirectoryShare, LocalCache};

pub type GitFileSystemProvider = RemoteFileSystemProvider<GitClient>;

/// Lazily opened working copy; clients of the same directory share one
pub type CopySlot = Mutex<Option<WorkingCopy>>;

const KEEP_FILE: &str = ".keep";

/// Serves remote paths from a working copy of the repository at `url`
pub struct GitClient {
    url: String,
    work_dir: PathBuf,
    authenticator: Arc<dyn FileSystemAuthenticator>,
    copy: Arc<CopySlot>,
}

fn git_auth(credentials: Option<ServerCredentials>) -> Option<GitAuth> {
    match credentials? {
        ServerCredentials::Git(git) => git.auth,
        ServerCredentials::Basic(basic) => Some(GitAuth::Password {
            username: basic.username,
            password: basic.password,
        }),
    }
}

impl GitClient {
    pub fn new(url: impl Into<String>, work_dir: impl Into<PathBuf>, authenticator: Arc<dyn FileSystemAuthenticator>) -> Self {
        Self::with_slot(url, work_dir, authenticator, Arc::new(Mutex::new(None)))
    }

    /// Client working through `copy`, which other clients may hold too
    pub fn with_slot(
        url: impl Into<String>,
        work_dir: impl Into<PathBuf>,
        authenticator: Arc<dyn FileSystemAuthenticator>,
        copy: Arc<CopySlot>,
    ) -> Self {
        Self {
            url: url.into(),
            work_dir: work_dir.into(),
            authenticator,
            copy,
        }
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    /// Run `f` on an up-to-date working copy, cloning it on first use
    fn with_copy<T>(&self, f: impl FnOnce(&WorkingCopy) -> Result<T>) -> Result<T> {
        let mut guard: MutexGuard<'_, Option<WorkingCopy>> = self.copy.lock().unwrap_or_else(PoisonError::into_inner);
        let auth = git_auth(self.authenticator.credentials());

        match guard.as_mut() {
            Some(copy) => {
                copy.set_auth(auth);
                copy.pull()?;
            }
            None => {
                log::info!("Git: preparing working copy of {}", self.url);
                *guard = Some(WorkingCopy::open_or_clone(&self.url, &self.work_dir, auth)?);
            }
        }

        match guard.as_ref() {
            Some(copy) => f(copy),
            None => Err(FileSystemError::InvalidData("git working copy unavailable".to_string())),
        }
    }
}

fn to_metadata(info: &TreeEntryInfo, modified: Option<chrono::DateTime<chrono::Utc>>) -> RemoteMetadata {
    RemoteMetadata {
        path: info.path.clone(),
        uid: info.path.clone(),
        is_directory: info.is_directory,
        revision: info.oid.map(|oid| oid.to_string()),
        modified: if info.is_directory { None } else { modified },
        size: info.size,
    }
}

impl RemoteClient for GitClient {
    fn prepare(&self) -> Result<String> {
        self.with_copy(|_| Ok("/".to_string()))
    }

    fn metadata(&self, path: &str) -> Result<Option<RemoteMetadata>> {
        self.with_copy(|copy| {
            let modified = copy.head_time();
            Ok(copy.entry(path)?.map(|info| to_metadata(&info, modified)))
        })
    }

    fn list(&self, path: &str) -> Result<Vec<RemoteMetadata>> {
        self.with_copy(|copy| {
            let modified = copy.head_time();
            Ok(copy
                .list(path)?
                .iter()
                .filter(|info| file_name(&info.path) != KEEP_FILE)
                .map(|info| to_metadata(info, modified))
                .collect())
        })
    }

    fn download(&self, path: &str) -> Result<(Vec<u8>, RemoteMetadata)> {
        self.with_copy(|copy| {
            let (content, info) = copy.read(path)?;
            Ok((content, to_metadata(&info, copy.head_time())))
        })
    }

    fn upload(&self, path: &str, content: &[u8], mode: &WriteMode) -> Result<UploadOutcome> {
        self.with_copy(|copy| {
            let current = copy.entry(path)?;
            let current_revision = current.as_ref().and_then(|info| info.oid.map(|oid| oid.to_string()));
            let allowed = match mode {
                WriteMode::Create => current.is_none(),
                WriteMode::Update(expected) => current_revision.as_deref() == Some(expected.as_str()),
                WriteMode::Overwrite => true,
            };
            if !allowed {
                log::info!("Git: {} moved on remotely (at {:?})", path, current_revision);
                return Ok(UploadOutcome::RevisionMismatch);
            }

            match copy.commit_and_push(path, Some(content), &format!("Update {}", file_name(path))) {
                Ok(_) => {}
                Err(GitOperationError::Rejected(message)) => {
                    log::info!("Git: push of {} rejected: {}", path, message);
                    return Ok(UploadOutcome::RevisionMismatch);
                }
                Err(e) => return Err(e.into()),
            }

            let info = copy
                .entry(path)?
                .ok_or_else(|| FileSystemError::InvalidData(format!("{} missing after commit", path)))?;
            Ok(UploadOutcome::Uploaded(to_metadata(&info, copy.head_time())))
        })
    }

    fn create_directory(&self, path: &str) -> Result<RemoteMetadata> {
        self.with_copy(|copy| {
            if copy.entry(path)?.is_some() {
                return Err(FileSystemError::AlreadyExists(path.to_string()));
            }
            let keep = crate::fs::join_path(path, KEEP_FILE);
            copy.commit_and_push(&keep, Some(&[]), &format!("Create {}", file_name(path)))?;
            let info = copy
                .entry(path)?
                .ok_or_else(|| FileSystemError::InvalidData(format!("{} missing after commit", path)))?;
            Ok(to_metadata(&info, None))
        })
    }

    fn delete(&self, path: &str) -> Result<()> {
        self.with_copy(|copy| {
            match copy.entry(path)? {
                Some(info) if !info.is_directory => {}
                Some(_) => {
                    return Err(FileSystemError::Permission(format!("{} is a directory", path)));
                }
                None => return Err(FileSystemError::NotFound(path.to_string())),
            }
            copy.commit_and_push(path, None, &format!("Delete {}", file_name(path)))?;
            Ok(())
        })
    }
}

/// Provider for a Git authority; the working copy lives under `work_root`
/// and is shared with every other provider of the same authority key
pub fn git_provider(
    authority: &FsAuthority,
    work_root: &Path,
    copies: &DirectoryShare<CopySlot>,
    cache: Arc<LocalCache>,
) -> Result<GitFileSystemProvider> {
    let credentials = authority
        .credentials
        .clone()
        .ok_or_else(|| FileSystemError::Authentication("Git requires a repository URL".to_string()))?;
    let url = match &credentials {
        ServerCredentials::Git(GitCredentials { url, .. }) => url.clone(),
        ServerCredentials::Basic(basic) => basic.server_url.clone(),
    };

    let authenticator: Arc<dyn FileSystemAuthenticator> = Arc::new(CredentialsAuthenticator::new(Some(credentials)));
    let work_dir = work_root.join(authority.key());
    let copy = copies.get_or_create(&work_dir, || Mutex::new(None));
    let client = GitClient::with_slot(url, work_dir, Arc::clone(&authenticator), copy);
    let session = RemoteSession::new(authority.clone(), Arc::new(client), authenticator);
    Ok(RemoteFileSystemProvider::new(session, cache))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::{FileSystemProvider, FsOptions, FsType};
    use crate::sync::{FileSystemSyncProcessor, SyncAction, SyncStatus, SyncStrategy};
    use git2::{Repository, RepositoryInitOptions};
    use tempfile::TempDir;

    fn bare_remote(dir: &Path) -> String {
        let mut opts = RepositoryInitOptions::new();
        opts.bare(true).initial_head(DEFAULT_BRANCH);
        Repository::init_opts(dir, &opts).unwrap();
        dir.to_string_lossy().to_string()
    }

    fn authority(url: &str) -> FsAuthority {
        FsAuthority::new(
            FsType::Git,
            Some(ServerCredentials::Git(GitCredentials {
                url: url.to_string(),
                auth: None,
            })),
        )
    }

    fn client(url: &str, work_dir: &Path) -> GitClient {
        GitClient::new(
            url,
            work_dir,
            Arc::new(CredentialsAuthenticator::new(Some(ServerCredentials::Git(GitCredentials {
                url: url.to_string(),
                auth: None,
            })))),
        )
    }

    #[test]
    fn test_upload_preconditions() {
        let dir = TempDir::new().unwrap();
        let url = bare_remote(&dir.path().join("remote.git"));
        let a = client(&url, &dir.path().join("a"));
        let b = client(&url, &dir.path().join("b"));

        let UploadOutcome::Uploaded(first) = a.upload("/vault.kdbx", b"v1", &WriteMode::Create).unwrap() else {
            panic!("create rejected");
        };
        let rev1 = first.revision.clone().unwrap();
        assert_eq!(a.upload("/vault.kdbx", b"x", &WriteMode::Create).unwrap(), UploadOutcome::RevisionMismatch);

        let (content, meta) = b.download("/vault.kdbx").unwrap();
        assert_eq!(content, b"v1");
        assert_eq!(meta.revision.as_deref(), Some(rev1.as_str()));

        assert!(matches!(
            b.upload("/vault.kdbx", b"v2", &WriteMode::Update(rev1.clone())).unwrap(),
            UploadOutcome::Uploaded(_)
        ));
        assert_eq!(
            a.upload("/vault.kdbx", b"v2-a", &WriteMode::Update(rev1)).unwrap(),
            UploadOutcome::RevisionMismatch
        );
        assert!(matches!(
            a.upload("/vault.kdbx", b"v3", &WriteMode::Overwrite).unwrap(),
            UploadOutcome::Uploaded(_)
        ));
        assert_eq!(b.download("/vault.kdbx").unwrap().0, b"v3");
    }

    #[test]
    fn test_directories_and_delete() {
        let dir = TempDir::new().unwrap();
        let url = bare_remote(&dir.path().join("remote.git"));
        let client = client(&url, &dir.path().join("work"));

        let created = client.create_directory("/backups").unwrap();
        assert!(created.is_directory);
        assert!(matches!(
            client.create_directory("/backups"),
            Err(FileSystemError::AlreadyExists(_))
        ));
        assert!(client.list("/backups").unwrap().is_empty());

        client.upload("/backups/old.kdbx", b"old", &WriteMode::Create).unwrap();
        assert_eq!(client.list("/backups").unwrap().len(), 1);
        client.delete("/backups/old.kdbx").unwrap();
        assert!(client.metadata("/backups/old.kdbx").unwrap().is_none());
        assert!(matches!(
            client.delete("/backups/old.kdbx"),
            Err(FileSystemError::NotFound(_))
        ));
    }

    #[test]
    fn test_same_key_shares_working_copy() {
        let dir = TempDir::new().unwrap();
        let url = bare_remote(&dir.path().join("remote.git"));
        let copies = DirectoryShare::new();
        let cache = Arc::new(LocalCache::new(dir.path().join("cache")));
        let with_password = |password: &str| {
            FsAuthority::new(FsType::Git, Some(ServerCredentials::basic(url.as_str(), "alice", password)))
        };

        let a = git_provider(&with_password("old"), &dir.path().join("work"), &copies, Arc::clone(&cache)).unwrap();
        let b = git_provider(&with_password("new"), &dir.path().join("work"), &copies, Arc::clone(&cache)).unwrap();
        assert!(Arc::ptr_eq(&a.client().copy, &b.client().copy));
        assert_eq!(a.client().work_dir(), b.client().work_dir());

        let other = git_provider(&authority(&url), &dir.path().join("work"), &copies, cache).unwrap();
        assert!(!Arc::ptr_eq(&a.client().copy, &other.client().copy));
    }

    #[test]
    fn test_provider_round_trip_through_sync() {
        let dir = TempDir::new().unwrap();
        let url = bare_remote(&dir.path().join("remote.git"));
        let authority = authority(&url);
        let copies = DirectoryShare::new();
        let cache = Arc::new(LocalCache::new(dir.path().join("cache")));
        let provider = git_provider(&authority, &dir.path().join("work"), &copies, cache).unwrap();

        let root = provider.root_file().unwrap();
        assert!(root.is_root);
        let file = provider.create_file(&root, "vault.kdbx", FsOptions::default()).unwrap();
        provider.write_file(&file, b"secret", FsOptions::default()).unwrap();

        let processor = provider.sync_processor();
        assert_eq!(processor.get_sync_status(&file).unwrap(), SyncStatus::NoChanges);

        // A second working copy commits behind our back
        let other = client(&url, &dir.path().join("other"));
        other.upload("/vault.kdbx", b"changed", &WriteMode::Overwrite).unwrap();

        assert_eq!(processor.get_sync_status(&file).unwrap(), SyncStatus::RemoteChanges);
        let report = processor.process(&file, SyncStrategy::SyncAutomatically, None).unwrap();
        assert_eq!(report.action, SyncAction::Pulled);
        assert_eq!(provider.read_file(&file, FsOptions::default()).unwrap(), b"changed");
    }
}
