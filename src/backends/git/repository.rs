//! Git working-copy operations
//!
//! The working copy mirrors one remote branch. Every operation first aligns
//! the local branch with the fetched remote head, so nothing ever diverges
//! locally for longer than a single commit-and-push.

use std::cell::{Cell, RefCell};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use git2::build::CheckoutBuilder;
use git2::{
    Commit, Cred, CredentialType, ErrorClass, ErrorCode, FetchOptions, ObjectType, Oid, PushOptions,
    RemoteCallbacks, Repository, Signature, Tree,
};

use crate::fs::{FileSystemError, GitAuth};

pub const DEFAULT_BRANCH: &str = "main";
const ORIGIN: &str = "origin";

/// Git operation errors
#[derive(Debug, thiserror::Error)]
pub enum GitOperationError {
    #[error("Git error: {0}")]
    Git(#[from] git2::Error),
    #[error("Authentication failed: {0}")]
    AuthFailed(String),
    #[error("Push rejected: {0}")]
    Rejected(String),
    #[error("Invalid path: {0}")]
    InvalidPath(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<GitOperationError> for FileSystemError {
    fn from(err: GitOperationError) -> Self {
        match err {
            GitOperationError::AuthFailed(msg) => FileSystemError::Authentication(msg),
            GitOperationError::Git(e) => match (e.class(), e.code()) {
                (_, ErrorCode::Auth) => FileSystemError::Authentication(e.message().to_string()),
                (_, ErrorCode::NotFound) => FileSystemError::NotFound(e.message().to_string()),
                (ErrorClass::Net | ErrorClass::Http | ErrorClass::Ssh | ErrorClass::Ssl, _) => {
                    FileSystemError::NetworkIo(e.message().to_string())
                }
                _ => FileSystemError::InvalidData(e.message().to_string()),
            },
            GitOperationError::Rejected(msg) => FileSystemError::NetworkIo(msg),
            GitOperationError::InvalidPath(path) => FileSystemError::NotFound(path),
            GitOperationError::Io(e) => FileSystemError::Io(e),
        }
    }
}

pub type Result<T> = std::result::Result<T, GitOperationError>;

/// Entry of the committed tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntryInfo {
    pub path: String,
    pub is_directory: bool,
    /// Blob id for files
    pub oid: Option<Oid>,
    pub size: Option<u64>,
}

/// A working copy bound to one remote and branch
pub struct WorkingCopy {
    repo: Repository,
    branch: String,
    auth: Option<GitAuth>,
}

/// Build callbacks answering credential requests once. A second request for
/// the same operation means the remote rejected what we sent.
fn remote_callbacks<'a>(auth: &'a Option<GitAuth>, attempts: &'a Cell<u32>) -> RemoteCallbacks<'a> {
    let mut callbacks = RemoteCallbacks::new();
    callbacks.credentials(move |_url, username_from_url, allowed| {
        attempts.set(attempts.get() + 1);
        if attempts.get() > 1 {
            return Err(git2::Error::from_str("credentials rejected by remote"));
        }
        match auth {
            Some(GitAuth::Password { username, password }) => Cred::userpass_plaintext(username, password),
            Some(GitAuth::SshKey { key_path, passphrase }) => Cred::ssh_key(
                username_from_url.unwrap_or("git"),
                None,
                Path::new(key_path),
                passphrase.as_deref(),
            ),
            None if allowed.contains(CredentialType::DEFAULT) => Cred::default(),
            None => Err(git2::Error::from_str("remote requires credentials")),
        }
    });
    callbacks
}

fn auth_failure(err: git2::Error, attempts: &Cell<u32>) -> GitOperationError {
    if attempts.get() > 1 || err.code() == ErrorCode::Auth {
        GitOperationError::AuthFailed(err.message().to_string())
    } else {
        GitOperationError::Git(err)
    }
}

/// Get or create a signature for commits
fn get_signature(repo: &Repository) -> Result<Signature<'static>> {
    if let Ok(sig) = repo.signature() {
        return Ok(Signature::now(
            sig.name().unwrap_or("keepsync"),
            sig.email().unwrap_or("keepsync@localhost"),
        )?);
    }
    Ok(Signature::now("keepsync", "keepsync@localhost")?)
}

fn relative(path: &str) -> Result<&str> {
    let rel = path.trim_start_matches('/');
    if rel.split('/').any(|part| part == ".." || part == ".git") {
        return Err(GitOperationError::InvalidPath(path.to_string()));
    }
    Ok(rel)
}

impl WorkingCopy {
    /// Open the working copy at `work_dir`, cloning `url` into it first when
    /// it does not exist yet. The working copy is brought up to date either way.
    pub fn open_or_clone(url: &str, work_dir: &Path, auth: Option<GitAuth>) -> Result<Self> {
        let repo = match Repository::open(work_dir) {
            Ok(repo) => repo,
            Err(e) if e.code() == ErrorCode::NotFound => {
                std::fs::create_dir_all(work_dir)?;
                let repo = Repository::init(work_dir)?;
                repo.remote(ORIGIN, url)?;
                log::info!("Git: initialized working copy for {} at {:?}", url, work_dir);
                repo
            }
            Err(e) => return Err(e.into()),
        };

        let mut copy = Self {
            repo,
            branch: DEFAULT_BRANCH.to_string(),
            auth,
        };
        copy.fetch()?;
        copy.branch = copy.pick_branch();
        copy.repo.set_head(&format!("refs/heads/{}", copy.branch))?;
        copy.align()?;
        Ok(copy)
    }

    pub fn set_auth(&mut self, auth: Option<GitAuth>) {
        self.auth = auth;
    }

    pub fn branch(&self) -> &str {
        &self.branch
    }

    pub fn workdir(&self) -> Result<PathBuf> {
        self.repo
            .workdir()
            .map(Path::to_path_buf)
            .ok_or_else(|| GitOperationError::InvalidPath("bare repository".to_string()))
    }

    /// Keep the current branch if the remote has it, else prefer main, then
    /// master, then any remote branch
    fn pick_branch(&self) -> String {
        let has = |name: &str| {
            self.repo
                .find_reference(&format!("refs/remotes/{}/{}", ORIGIN, name))
                .is_ok()
        };
        if let Some(current) = self
            .repo
            .find_reference("HEAD")
            .ok()
            .and_then(|h| h.symbolic_target().map(String::from))
            .and_then(|t| t.strip_prefix("refs/heads/").map(String::from))
        {
            if has(&current) {
                return current;
            }
        }
        for candidate in [DEFAULT_BRANCH, "master"] {
            if has(candidate) {
                return candidate.to_string();
            }
        }
        let prefix = format!("refs/remotes/{}/", ORIGIN);
        self.repo
            .references_glob(&format!("{}*", prefix))
            .ok()
            .and_then(|mut refs| {
                refs.find_map(|r| r.ok().and_then(|r| r.name().map(String::from)))
            })
            .and_then(|name| name.strip_prefix(&prefix).map(String::from))
            .filter(|name| name != "HEAD")
            .unwrap_or_else(|| DEFAULT_BRANCH.to_string())
    }

    fn remote_head(&self) -> Option<Oid> {
        self.repo
            .find_reference(&format!("refs/remotes/{}/{}", ORIGIN, self.branch))
            .ok()
            .and_then(|r| r.target())
    }

    /// Fetch from remote
    pub fn fetch(&self) -> Result<()> {
        let mut remote = self.repo.find_remote(ORIGIN)?;
        let attempts = Cell::new(0);
        let mut fetch_opts = FetchOptions::new();
        fetch_opts.remote_callbacks(remote_callbacks(&self.auth, &attempts));

        remote
            .fetch(
                &[format!("+refs/heads/*:refs/remotes/{}/*", ORIGIN)],
                Some(&mut fetch_opts),
                None,
            )
            .map_err(|e| auth_failure(e, &attempts))?;
        log::debug!("Git: fetched {}", remote.url().unwrap_or(ORIGIN));
        Ok(())
    }

    /// Point the local branch, index and working tree at the fetched remote head
    pub fn align(&self) -> Result<()> {
        let branch_ref = format!("refs/heads/{}", self.branch);
        match self.remote_head() {
            Some(oid) => {
                self.repo.reference(&branch_ref, oid, true, "keepsync: align with remote")?;
                self.repo.checkout_head(Some(CheckoutBuilder::new().force()))?;
            }
            None => {
                if let Ok(mut reference) = self.repo.find_reference(&branch_ref) {
                    reference.delete()?;
                }
                let mut index = self.repo.index()?;
                index.clear()?;
                index.write()?;
            }
        }
        Ok(())
    }

    /// Fetch and align
    pub fn pull(&self) -> Result<()> {
        self.fetch()?;
        self.align()
    }

    fn head_commit(&self) -> Option<Commit<'_>> {
        self.repo.head().ok().and_then(|h| h.peel_to_commit().ok())
    }

    /// Time of the last commit on the branch
    pub fn head_time(&self) -> Option<DateTime<Utc>> {
        self.head_commit()
            .and_then(|c| DateTime::from_timestamp(c.time().seconds(), 0))
    }

    fn head_tree(&self) -> Result<Option<Tree<'_>>> {
        match self.head_commit() {
            Some(commit) => Ok(Some(commit.tree()?)),
            None => Ok(None),
        }
    }

    fn entry_info(&self, path: &str, kind: Option<ObjectType>, oid: Oid) -> Result<TreeEntryInfo> {
        if kind == Some(ObjectType::Tree) {
            return Ok(TreeEntryInfo {
                path: path.to_string(),
                is_directory: true,
                oid: None,
                size: None,
            });
        }
        let blob = self.repo.find_blob(oid)?;
        Ok(TreeEntryInfo {
            path: path.to_string(),
            is_directory: false,
            oid: Some(oid),
            size: Some(blob.size() as u64),
        })
    }

    /// Look up a committed path; `None` if absent
    pub fn entry(&self, path: &str) -> Result<Option<TreeEntryInfo>> {
        let rel = relative(path)?;
        if rel.is_empty() {
            return Ok(Some(TreeEntryInfo {
                path: "/".to_string(),
                is_directory: true,
                oid: None,
                size: None,
            }));
        }
        let Some(tree) = self.head_tree()? else {
            return Ok(None);
        };
        match tree.get_path(Path::new(rel)) {
            Ok(entry) => Ok(Some(self.entry_info(path, entry.kind(), entry.id())?)),
            Err(e) if e.code() == ErrorCode::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Children of a committed directory
    pub fn list(&self, dir: &str) -> Result<Vec<TreeEntryInfo>> {
        let rel = relative(dir)?;
        let Some(root) = self.head_tree()? else {
            return if rel.is_empty() {
                Ok(Vec::new())
            } else {
                Err(GitOperationError::InvalidPath(dir.to_string()))
            };
        };

        let tree = if rel.is_empty() {
            root
        } else {
            let entry = root
                .get_path(Path::new(rel))
                .map_err(|_| GitOperationError::InvalidPath(dir.to_string()))?;
            entry
                .to_object(&self.repo)?
                .peel_to_tree()
                .map_err(|_| GitOperationError::InvalidPath(dir.to_string()))?
        };

        let base = format!("/{}", rel);
        let mut entries = Vec::new();
        for entry in tree.iter() {
            let Some(name) = entry.name() else { continue };
            let path = crate::fs::join_path(&base, name);
            entries.push(self.entry_info(&path, entry.kind(), entry.id())?);
        }
        Ok(entries)
    }

    /// Content of a committed file
    pub fn read(&self, path: &str) -> Result<(Vec<u8>, TreeEntryInfo)> {
        match self.entry(path)? {
            Some(info) if !info.is_directory => {
                let oid = info.oid.ok_or_else(|| GitOperationError::InvalidPath(path.to_string()))?;
                let blob = self.repo.find_blob(oid)?;
                Ok((blob.content().to_vec(), info))
            }
            _ => Err(GitOperationError::InvalidPath(path.to_string())),
        }
    }

    /// Write `content` at `path`, commit and push. On any failure the
    /// working copy is aligned back to the remote.
    pub fn commit_and_push(&self, path: &str, content: Option<&[u8]>, message: &str) -> Result<Oid> {
        let result = self.commit(path, content, message).and_then(|oid| {
            self.push()?;
            Ok(oid)
        });
        if result.is_err() {
            if let Err(e) = self.align() {
                log::warn!("Git: failed to roll back working copy: {}", e);
            }
        }
        result
    }

    /// Stage and commit a single file; `None` deletes it
    fn commit(&self, path: &str, content: Option<&[u8]>, message: &str) -> Result<Oid> {
        let rel = relative(path)?;
        let workdir = self.workdir()?;
        let target = workdir.join(rel);

        let mut index = self.repo.index()?;
        match content {
            Some(bytes) => {
                if let Some(parent) = target.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(&target, bytes)?;
                index.add_path(Path::new(rel))?;
            }
            None => {
                if target.exists() {
                    std::fs::remove_file(&target)?;
                }
                index.remove_path(Path::new(rel))?;
            }
        }
        index.write()?;

        let tree_id = index.write_tree()?;
        let tree = self.repo.find_tree(tree_id)?;
        let parent_commit = self.head_commit();
        let sig = get_signature(&self.repo)?;

        let commit_id = if let Some(parent) = parent_commit {
            self.repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &[&parent])?
        } else {
            self.repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &[])?
        };

        log::info!("Git: created commit {} - {}", &commit_id.to_string()[..7], message);
        Ok(commit_id)
    }

    /// Push the branch. A non-fast-forward rejection means the remote moved.
    fn push(&self) -> Result<()> {
        let mut remote = self.repo.find_remote(ORIGIN)?;
        let refspec = format!("refs/heads/{0}:refs/heads/{0}", self.branch);

        let attempts = Cell::new(0);
        let rejected: RefCell<Option<String>> = RefCell::new(None);
        let mut callbacks = remote_callbacks(&self.auth, &attempts);
        callbacks.push_update_reference(|refname, status| {
            if let Some(message) = status {
                *rejected.borrow_mut() = Some(format!("{}: {}", refname, message));
            }
            Ok(())
        });

        let mut push_opts = PushOptions::new();
        push_opts.remote_callbacks(callbacks);

        match remote.push(&[&refspec], Some(&mut push_opts)) {
            Ok(()) => {}
            Err(e) if e.code() == ErrorCode::NotFastForward => {
                return Err(GitOperationError::Rejected(e.message().to_string()))
            }
            Err(e) => return Err(auth_failure(e, &attempts)),
        }
        drop(push_opts);

        if let Some(message) = rejected.into_inner() {
            return Err(GitOperationError::Rejected(message));
        }
        log::info!("Git: pushed {}", self.branch);
        Ok(())
    }
}
