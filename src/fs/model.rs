//! Backend-agnostic file system value types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Storage backend kinds. The set is closed and known at compile time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FsType {
    RegularFs,
    Dropbox,
    Webdav,
    Git,
    Fake,
}

impl FsType {
    pub const ALL: [FsType; 5] = [
        FsType::RegularFs,
        FsType::Dropbox,
        FsType::Webdav,
        FsType::Git,
        FsType::Fake,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FsType::RegularFs => "REGULAR_FS",
            FsType::Dropbox => "DROPBOX",
            FsType::Webdav => "WEBDAV",
            FsType::Git => "GIT",
            FsType::Fake => "FAKE",
        }
    }

    /// Whether the backend keeps an authoritative copy somewhere other than local disk
    pub fn is_remote(&self) -> bool {
        !matches!(self, FsType::RegularFs)
    }
}

impl std::fmt::Display for FsType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for FsType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FsType::ALL
            .iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s))
            .copied()
            .ok_or_else(|| format!("Unknown file system type: {}", s))
    }
}

/// Username/password login against an HTTP server (WebDAV, fake)
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct BasicCredentials {
    pub server_url: String,
    pub username: String,
    pub password: String,
}

/// How the Git backend authenticates against its remote
#[derive(Clone, PartialEq, Eq, Hash)]
pub enum GitAuth {
    Password { username: String, password: String },
    SshKey { key_path: String, passphrase: Option<String> },
}

#[derive(Clone, PartialEq, Eq, Hash)]
pub struct GitCredentials {
    pub url: String,
    /// `None` for anonymous remotes (local paths, public https)
    pub auth: Option<GitAuth>,
}

/// Backend-specific credentials owned by an authenticator
#[derive(Clone, PartialEq, Eq, Hash)]
pub enum ServerCredentials {
    Basic(BasicCredentials),
    Git(GitCredentials),
}

impl ServerCredentials {
    pub fn basic(server_url: impl Into<String>, username: impl Into<String>, password: impl Into<String>) -> Self {
        ServerCredentials::Basic(BasicCredentials {
            server_url: server_url.into(),
            username: username.into(),
            password: password.into(),
        })
    }

    pub fn server_url(&self) -> &str {
        match self {
            ServerCredentials::Basic(basic) => &basic.server_url,
            ServerCredentials::Git(git) => &git.url,
        }
    }

    pub fn username(&self) -> Option<&str> {
        match self {
            ServerCredentials::Basic(basic) => Some(&basic.username),
            ServerCredentials::Git(GitCredentials {
                auth: Some(GitAuth::Password { username, .. }),
                ..
            }) => Some(username),
            ServerCredentials::Git(_) => None,
        }
    }
}

impl std::fmt::Debug for BasicCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BasicCredentials")
            .field("server_url", &self.server_url)
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

impl std::fmt::Debug for GitAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GitAuth::Password { username, .. } => f
                .debug_struct("Password")
                .field("username", username)
                .field("password", &"[REDACTED]")
                .finish(),
            GitAuth::SshKey { key_path, passphrase } => f
                .debug_struct("SshKey")
                .field("key_path", key_path)
                .field("passphrase", &passphrase.as_ref().map(|_| "[REDACTED]"))
                .finish(),
        }
    }
}

impl std::fmt::Debug for GitCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GitCredentials")
            .field("url", &self.url)
            .field("auth", &self.auth)
            .finish()
    }
}

impl std::fmt::Debug for ServerCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerCredentials::Basic(basic) => basic.fmt(f),
            ServerCredentials::Git(git) => git.fmt(f),
        }
    }
}

/// Identifies where a file lives: the backend plus the credentials that own it.
///
/// Compared structurally; two equal authorities resolve to the same provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FsAuthority {
    pub fs_type: FsType,
    pub credentials: Option<ServerCredentials>,
}

impl FsAuthority {
    pub fn new(fs_type: FsType, credentials: Option<ServerCredentials>) -> Self {
        Self { fs_type, credentials }
    }

    /// Authority for the local disk
    pub fn local() -> Self {
        Self::new(FsType::RegularFs, None)
    }

    /// Stable identifier used for on-disk cache directories.
    ///
    /// Derived from the backend type, server URL and username only, so
    /// changing a password keeps the cache.
    pub fn key(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.fs_type.as_str().as_bytes());
        if let Some(credentials) = &self.credentials {
            hasher.update(b"|");
            hasher.update(credentials.server_url().as_bytes());
            hasher.update(b"|");
            hasher.update(credentials.username().unwrap_or("").as_bytes());
        }
        let digest = hasher.finalize();
        format!("{}-{}", self.fs_type.as_str().to_lowercase(), &hex::encode(digest)[..16])
    }
}

/// Backend-agnostic handle to a file or directory.
///
/// Providers create a fresh descriptor on every list/stat/open call; a
/// descriptor is never mutated in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDescriptor {
    pub fs_authority: FsAuthority,
    pub path: String,
    /// Backend-native identifier (Dropbox file id, git path, absolute path)
    pub uid: String,
    pub name: String,
    pub is_directory: bool,
    pub is_root: bool,
    pub modified: Option<DateTime<Utc>>,
}

impl FileDescriptor {
    pub fn file(fs_authority: FsAuthority, path: impl Into<String>, uid: impl Into<String>) -> Self {
        let path = path.into();
        Self {
            fs_authority,
            name: file_name(&path).to_string(),
            uid: uid.into(),
            path,
            is_directory: false,
            is_root: false,
            modified: None,
        }
    }

    pub fn directory(fs_authority: FsAuthority, path: impl Into<String>, uid: impl Into<String>) -> Self {
        let mut descriptor = Self::file(fs_authority, path, uid);
        descriptor.is_directory = true;
        descriptor
    }

    pub fn root(fs_authority: FsAuthority, path: impl Into<String>, uid: impl Into<String>) -> Self {
        let mut descriptor = Self::directory(fs_authority, path, uid);
        descriptor.is_root = true;
        descriptor
    }

    pub fn with_modified(mut self, modified: Option<DateTime<Utc>>) -> Self {
        self.modified = modified;
        self
    }

    pub fn fs_type(&self) -> FsType {
        self.fs_authority.fs_type
    }
}

/// Per-call behaviour switches for provider operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsOptions {
    /// Serve reads from, and write through, the local cache
    pub cache_enabled: bool,
    pub write_enabled: bool,
    /// Queue cached writes instead of pushing them right away
    pub postponed_sync_enabled: bool,
}

impl Default for FsOptions {
    fn default() -> Self {
        Self {
            cache_enabled: true,
            write_enabled: true,
            postponed_sync_enabled: false,
        }
    }
}

impl FsOptions {
    pub fn read_only() -> Self {
        Self {
            write_enabled: false,
            ..Self::default()
        }
    }

    pub fn no_cache() -> Self {
        Self {
            cache_enabled: false,
            ..Self::default()
        }
    }

    pub fn postponed() -> Self {
        Self {
            postponed_sync_enabled: true,
            ..Self::default()
        }
    }
}

/// Normalize a backend path to `/a/b` form
pub fn normalize_path(path: &str) -> String {
    let parts: Vec<&str> = path.split('/').filter(|p| !p.is_empty() && *p != ".").collect();
    format!("/{}", parts.join("/"))
}

/// Last component of a path, empty for the root
pub fn file_name(path: &str) -> &str {
    path.trim_end_matches('/').rsplit('/').next().unwrap_or("")
}

/// Parent of a normalized path; the root is its own parent
pub fn parent_path(path: &str) -> String {
    let normalized = normalize_path(path);
    match normalized.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(idx) => normalized[..idx].to_string(),
    }
}

pub fn join_path(dir: &str, name: &str) -> String {
    normalize_path(&format!("{}/{}", dir, name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_helpers() {
        assert_eq!(normalize_path("a//b/"), "/a/b");
        assert_eq!(normalize_path(""), "/");
        assert_eq!(file_name("/a/b.kdbx"), "b.kdbx");
        assert_eq!(file_name("/"), "");
        assert_eq!(parent_path("/a/b.kdbx"), "/a");
        assert_eq!(parent_path("/b.kdbx"), "/");
        assert_eq!(parent_path("/"), "/");
        assert_eq!(join_path("/a", "b.kdbx"), "/a/b.kdbx");
        assert_eq!(join_path("/", "b.kdbx"), "/b.kdbx");
    }

    #[test]
    fn test_fs_type_parse() {
        assert_eq!("webdav".parse::<FsType>().unwrap(), FsType::Webdav);
        assert_eq!("REGULAR_FS".parse::<FsType>().unwrap(), FsType::RegularFs);
        assert!("ftp".parse::<FsType>().is_err());
    }

    #[test]
    fn test_authority_key_ignores_password() {
        let a = FsAuthority::new(
            FsType::Webdav,
            Some(ServerCredentials::basic("https://dav.example.com", "alice", "one")),
        );
        let b = FsAuthority::new(
            FsType::Webdav,
            Some(ServerCredentials::basic("https://dav.example.com", "alice", "two")),
        );
        assert_ne!(a, b);
        assert_eq!(a.key(), b.key());
        assert!(a.key().starts_with("webdav-"));
    }

    #[test]
    fn test_credentials_debug_redacts() {
        let creds = ServerCredentials::basic("https://dav.example.com", "alice", "hunter22");
        let output = format!("{:?}", creds);
        assert!(output.contains("REDACTED"));
        assert!(!output.contains("hunter22"));
    }

    #[test]
    fn test_descriptor_constructors() {
        let root = FileDescriptor::root(FsAuthority::local(), "/", "/");
        assert!(root.is_root && root.is_directory);
        let file = FileDescriptor::file(FsAuthority::local(), "/vault/db.kdbx", "/vault/db.kdbx");
        assert_eq!(file.name, "db.kdbx");
        assert!(!file.is_directory);
    }
}
