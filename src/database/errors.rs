use thiserror::Error;

use crate::dispatch::DispatchError;
use crate::encryption::{EncryptionError, KeyError};
use crate::fs::FileSystemError;
use crate::registry::RegistryError;

#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Another database is open or being opened
    #[error("A database is already open")]
    AlreadyOpen,

    #[error("No database is open")]
    NotOpen,

    #[error(transparent)]
    FileSystem(#[from] FileSystemError),

    #[error(transparent)]
    Key(#[from] KeyError),

    #[error("Database file is damaged: {0}")]
    Encryption(#[from] EncryptionError),

    #[error("Database content is damaged: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

pub type DatabaseResult<T> = Result<T, DatabaseError>;
