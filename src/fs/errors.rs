//! File system error types

use thiserror::Error;

use crate::sync::SyncConflictInfo;

/// Errors surfaced by providers, authenticators and sync processors.
///
/// Every expected failure mode of a backend maps onto one of these variants.
/// Caller bugs do not: they go through [`incorrect_use`].
#[derive(Debug, Error)]
pub enum FileSystemError {
    #[error("Network error: {0}")]
    NetworkIo(String),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Permission denied: {0}")]
    Permission(String),

    #[error("File not found: {0}")]
    NotFound(String),

    #[error("File already exists: {0}")]
    AlreadyExists(String),

    #[error("Sync conflict: {} was modified both locally and remotely", .0.local.path)]
    SyncConflict(Box<SyncConflictInfo>),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Cipher error: {0}")]
    Cipher(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),
}

impl FileSystemError {
    /// Map an I/O error on `path` onto the taxonomy, keeping not-found and
    /// permission failures distinguishable.
    pub fn from_io(err: std::io::Error, path: &str) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound(path.to_string()),
            std::io::ErrorKind::PermissionDenied => Self::Permission(path.to_string()),
            std::io::ErrorKind::AlreadyExists => Self::AlreadyExists(path.to_string()),
            _ => Self::Io(err),
        }
    }

    pub fn is_network(&self) -> bool {
        matches!(self, Self::NetworkIo(_))
    }

    pub fn is_authentication(&self) -> bool {
        matches!(self, Self::Authentication(_))
    }
}

impl From<FileSystemError> for String {
    fn from(err: FileSystemError) -> Self {
        err.to_string()
    }
}

pub type Result<T> = std::result::Result<T, FileSystemError>;

/// Abort on a programmer contract violation.
///
/// Used when a caller asks a backend for something structurally impossible,
/// e.g. passing credentials to an OAuth authenticator or handing a Dropbox
/// descriptor to the WebDAV provider. These are never recoverable.
#[track_caller]
pub fn incorrect_use(message: impl std::fmt::Display) -> ! {
    panic!("incorrect use: {}", message)
}
