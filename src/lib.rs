//! Keeps an encrypted password database consistent between a local cache and
//! one of several storage backends, and manages the keys that unlock it.

pub mod backends;
pub mod config;
pub mod database;
pub mod dispatch;
pub mod encryption;
pub mod fs;
pub mod registry;
pub mod settings;
pub mod sync;

pub use backends::BackendContext;
pub use config::AppConfig;
pub use database::{EncryptedDatabaseRepository, ObserverBus, ObserverEvent};
pub use fs::{FileDescriptor, FileSystemError, FileSystemProvider, FileSystemResolver, FsAuthority, FsType};
pub use sync::{SyncService, SyncStatus, SyncStrategy};
