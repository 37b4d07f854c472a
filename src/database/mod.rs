pub mod encrypted;
pub mod errors;
pub mod models;
pub mod repository;
pub mod watcher;

pub use encrypted::EncryptedDatabase;
pub use errors::{DatabaseError, DatabaseResult};
pub use models::{DatabaseContent, Group, Note, MAX_HISTORY};
pub use repository::{DatabaseHandle, EncryptedDatabaseRepository};
pub use watcher::{
    ContentEvent, ContentWatcher, DatabaseEvent, DatabaseWatcher, ObserverBus, ObserverEvent, SubscriptionId,
    Watcher,
};
