use std::sync::{Arc, Mutex, PoisonError, RwLock};

use uuid::Uuid;

use super::encrypted::EncryptedDatabase;
use super::errors::{DatabaseError, DatabaseResult};
use super::models::{DatabaseContent, Group, Note};
use super::watcher::{ContentEvent, ContentWatcher, DatabaseEvent, DatabaseWatcher, ObserverBus, ObserverEvent};
use crate::dispatch::Dispatchers;
use crate::encryption::{Argon2Params, EncryptedDatabaseKey};
use crate::fs::{file_name, FileDescriptor, FileSystemError, FileSystemProvider, FileSystemResolver, FsOptions};
use crate::registry::UsedFileRepository;

type SharedDatabase = Arc<RwLock<EncryptedDatabase>>;

/// Title of a new database: the file name without its extension
fn database_name(file: &FileDescriptor) -> String {
    let name = file_name(&file.path);
    name.rsplit_once('.').map(|(stem, _)| stem).unwrap_or(name).to_string()
}

fn ensure_absent(provider: &dyn FileSystemProvider, file: &FileDescriptor) -> DatabaseResult<()> {
    if provider.exists(file)? {
        return Err(FileSystemError::AlreadyExists(file.path.clone()).into());
    }
    Ok(())
}

enum Slot {
    Closed,
    /// Reserved by an open/create in progress
    Opening,
    Open(SharedDatabase),
}

/// Read access to the open database
#[derive(Clone)]
pub struct DatabaseHandle {
    database: SharedDatabase,
}

impl DatabaseHandle {
    pub fn read<R>(&self, f: impl FnOnce(&EncryptedDatabase) -> R) -> R {
        let db = self.database.read().unwrap_or_else(PoisonError::into_inner);
        f(&db)
    }

    pub fn file(&self) -> FileDescriptor {
        self.read(|db| db.file().clone())
    }
}

/// Returns the slot to `Closed` unless the open completed
struct Reservation<'a> {
    slot: &'a Mutex<Slot>,
    completed: bool,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if !self.completed {
            *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = Slot::Closed;
        }
    }
}

/// Owner of the single open database.
///
/// At most one database is open or being opened at a time. Every structural
/// mutation goes through here, is serialized by the database write lock and
/// announced on the watchers once the lock is released.
pub struct EncryptedDatabaseRepository {
    resolver: Arc<FileSystemResolver>,
    registry: Option<Arc<UsedFileRepository>>,
    database_watcher: Arc<DatabaseWatcher>,
    content_watcher: Arc<ContentWatcher>,
    observer_bus: Arc<ObserverBus>,
    kdf_params: Argon2Params,
    slot: Mutex<Slot>,
}

impl EncryptedDatabaseRepository {
    pub fn new(resolver: Arc<FileSystemResolver>) -> Self {
        Self {
            resolver,
            registry: None,
            database_watcher: Arc::new(DatabaseWatcher::new()),
            content_watcher: Arc::new(ContentWatcher::new()),
            observer_bus: Arc::new(ObserverBus::new()),
            kdf_params: Argon2Params::default(),
            slot: Mutex::new(Slot::Closed),
        }
    }

    pub fn with_registry(mut self, registry: Arc<UsedFileRepository>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_observer_bus(mut self, bus: Arc<ObserverBus>) -> Self {
        self.observer_bus = bus;
        self
    }

    /// KDF parameters for newly created databases
    pub fn with_kdf_params(mut self, params: Argon2Params) -> Self {
        self.kdf_params = params;
        self
    }

    pub fn database_watcher(&self) -> &Arc<DatabaseWatcher> {
        &self.database_watcher
    }

    pub fn content_watcher(&self) -> &Arc<ContentWatcher> {
        &self.content_watcher
    }

    pub fn observer_bus(&self) -> &Arc<ObserverBus> {
        &self.observer_bus
    }

    pub fn is_open(&self) -> bool {
        matches!(*self.slot.lock().unwrap_or_else(PoisonError::into_inner), Slot::Open(_))
    }

    pub fn current(&self) -> Option<DatabaseHandle> {
        match &*self.slot.lock().unwrap_or_else(PoisonError::into_inner) {
            Slot::Open(database) => Some(DatabaseHandle {
                database: Arc::clone(database),
            }),
            _ => None,
        }
    }

    fn reserve(&self) -> DatabaseResult<Reservation<'_>> {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        match *slot {
            Slot::Closed => {
                *slot = Slot::Opening;
                Ok(Reservation {
                    slot: &self.slot,
                    completed: false,
                })
            }
            Slot::Opening | Slot::Open(_) => Err(DatabaseError::AlreadyOpen),
        }
    }

    fn open_database(&self) -> DatabaseResult<SharedDatabase> {
        match &*self.slot.lock().unwrap_or_else(PoisonError::into_inner) {
            Slot::Open(database) => Ok(Arc::clone(database)),
            _ => Err(DatabaseError::NotOpen),
        }
    }

    fn finish_open(&self, mut reservation: Reservation<'_>, database: EncryptedDatabase) -> DatabaseHandle {
        let file = database.file().clone();
        if let Some(registry) = &self.registry {
            if let Err(e) = registry.touch(&file) {
                log::warn!("Failed to record {} as used: {}", file.path, e);
            }
        }

        let shared = Arc::new(RwLock::new(database));
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = Slot::Open(Arc::clone(&shared));
        reservation.completed = true;

        log::info!("Opened database {}", file.path);
        self.database_watcher.notify(&DatabaseEvent::Opened { file });
        self.observer_bus
            .notify(&ObserverEvent::DatabaseStatusChanged { open: true });
        DatabaseHandle { database: shared }
    }

    /// Create a new database at `file` and keep it open. Refuses to replace
    /// an existing file.
    pub fn create(
        &self,
        key: &dyn EncryptedDatabaseKey,
        file: &FileDescriptor,
        options: FsOptions,
    ) -> DatabaseResult<DatabaseHandle> {
        let reservation = self.reserve()?;
        let provider = self.resolver.resolve_provider(&file.fs_authority)?;
        ensure_absent(provider.as_ref(), file)?;

        let composite = key.key()?;
        let mut database =
            EncryptedDatabase::create(file.clone(), options, &database_name(file), &composite, self.kdf_params.clone())?;
        let bytes = database.encrypt()?;
        let written = provider.write_file(file, &bytes, options)?;
        database.mark_committed(written);

        log::info!("Created database {}", file.path);
        Ok(self.finish_open(reservation, database))
    }

    /// Read and decrypt `file`. Fails with `AlreadyOpen` while another
    /// database is open or being opened.
    pub fn open(
        &self,
        key: &dyn EncryptedDatabaseKey,
        file: &FileDescriptor,
        options: FsOptions,
    ) -> DatabaseResult<DatabaseHandle> {
        let reservation = self.reserve()?;
        let composite = key.key()?;

        let provider = self.resolver.resolve_provider(&file.fs_authority)?;
        let bytes = provider.read_file(file, options)?;
        let database = EncryptedDatabase::decrypt(file.clone(), options, &bytes, &composite)?;

        Ok(self.finish_open(reservation, database))
    }

    /// [`Self::create`] for async callers: file access runs on the io
    /// context and key derivation on the cpu context.
    pub async fn create_async(
        &self,
        dispatchers: &Dispatchers,
        key: Arc<dyn EncryptedDatabaseKey>,
        file: FileDescriptor,
        options: FsOptions,
    ) -> DatabaseResult<DatabaseHandle> {
        let reservation = self.reserve()?;
        let provider = self.resolver.resolve_provider(&file.fs_authority)?;
        {
            let (provider, file) = (Arc::clone(&provider), file.clone());
            dispatchers.io(move || ensure_absent(provider.as_ref(), &file)).await??;
        }

        let name = database_name(&file);
        let params = self.kdf_params.clone();
        let target = file.clone();
        let (mut database, bytes) = dispatchers
            .cpu(move || -> DatabaseResult<(EncryptedDatabase, Vec<u8>)> {
                let composite = key.key()?;
                let database = EncryptedDatabase::create(target, options, &name, &composite, params)?;
                let bytes = database.encrypt()?;
                Ok((database, bytes))
            })
            .await??;

        let written = dispatchers
            .io(move || provider.write_file(&file, &bytes, options))
            .await??;
        database.mark_committed(written);

        log::info!("Created database {}", database.file().path);
        Ok(self.finish_open(reservation, database))
    }

    /// [`Self::open`] for async callers
    pub async fn open_async(
        &self,
        dispatchers: &Dispatchers,
        key: Arc<dyn EncryptedDatabaseKey>,
        file: FileDescriptor,
        options: FsOptions,
    ) -> DatabaseResult<DatabaseHandle> {
        let reservation = self.reserve()?;
        let provider = self.resolver.resolve_provider(&file.fs_authority)?;

        let source = file.clone();
        let bytes = dispatchers
            .io(move || provider.read_file(&source, options))
            .await??;
        let database = dispatchers
            .cpu(move || -> DatabaseResult<EncryptedDatabase> {
                let composite = key.key()?;
                EncryptedDatabase::decrypt(file, options, &bytes, &composite)
            })
            .await??;

        Ok(self.finish_open(reservation, database))
    }

    pub fn read<R>(&self, f: impl FnOnce(&EncryptedDatabase) -> R) -> DatabaseResult<R> {
        let database = self.open_database()?;
        let db = database.read().unwrap_or_else(PoisonError::into_inner);
        Ok(f(&db))
    }

    fn mutate<R>(
        &self,
        f: impl FnOnce(&mut DatabaseContent) -> DatabaseResult<R>,
    ) -> DatabaseResult<R> {
        let database = self.open_database()?;
        let mut db = database.write().unwrap_or_else(PoisonError::into_inner);
        if !db.options().write_enabled {
            return Err(DatabaseError::InvalidOperation("database is opened read-only".to_string()));
        }
        db.apply(f)
    }

    fn announce(&self, events: &[ContentEvent], groups: bool, notes: bool) {
        for event in events {
            self.content_watcher.notify(event);
        }
        if groups {
            self.observer_bus.notify(&ObserverEvent::GroupDataSetChanged);
        }
        if notes {
            self.observer_bus.notify(&ObserverEvent::NoteDataSetChanged);
        }
    }

    pub fn insert_group(&self, group: Group) -> DatabaseResult<Uuid> {
        let uid = group.uid;
        self.mutate(|content| content.insert_group(group))?;
        self.announce(&[ContentEvent::GroupInserted(uid)], true, false);
        Ok(uid)
    }

    pub fn update_group(&self, group: Group) -> DatabaseResult<()> {
        let uid = group.uid;
        self.mutate(|content| content.update_group(group))?;
        self.announce(&[ContentEvent::GroupUpdated(uid)], true, false);
        Ok(())
    }

    /// Remove a group together with everything below it
    pub fn remove_group(&self, uid: Uuid) -> DatabaseResult<()> {
        let (groups, notes) = self.mutate(|content| content.remove_group(uid))?;
        let events: Vec<ContentEvent> = groups
            .iter()
            .map(|g| ContentEvent::GroupRemoved(*g))
            .chain(notes.iter().map(|n| ContentEvent::NoteRemoved(*n)))
            .collect();
        self.announce(&events, true, !notes.is_empty());
        Ok(())
    }

    pub fn insert_note(&self, note: Note) -> DatabaseResult<Uuid> {
        let uid = note.uid;
        self.mutate(|content| content.insert_note(note))?;
        self.announce(&[ContentEvent::NoteInserted(uid)], false, true);
        Ok(uid)
    }

    pub fn update_note(&self, note: Note) -> DatabaseResult<()> {
        let uid = note.uid;
        self.mutate(|content| content.update_note(note))?;
        self.announce(&[ContentEvent::NoteUpdated(uid)], false, true);
        Ok(())
    }

    pub fn remove_note(&self, uid: Uuid) -> DatabaseResult<Note> {
        let note = self.mutate(|content| content.remove_note(uid))?;
        self.announce(&[ContentEvent::NoteRemoved(uid)], false, true);
        Ok(note)
    }

    fn commit_locked(&self, db: &mut EncryptedDatabase) -> DatabaseResult<FileDescriptor> {
        let provider = self.resolver.resolve_provider(&db.file().fs_authority)?;
        let bytes = db.encrypt()?;
        let written = provider.write_file(db.file(), &bytes, db.options())?;
        db.mark_committed(written.clone());
        log::info!("Committed database {} ({} bytes)", written.path, bytes.len());
        Ok(written)
    }

    /// Encrypt and write the current tree through the file's provider
    pub fn commit(&self) -> DatabaseResult<FileDescriptor> {
        let database = self.open_database()?;
        let file = {
            let mut db = database.write().unwrap_or_else(PoisonError::into_inner);
            self.commit_locked(&mut db)?
        };
        self.database_watcher
            .notify(&DatabaseEvent::Committed { file: file.clone() });
        Ok(file)
    }

    /// Flush pending changes and release the database. When the flush fails
    /// the database stays open.
    pub fn close(&self) -> DatabaseResult<()> {
        let database = self.open_database()?;
        let (file, committed) = {
            let mut db = database.write().unwrap_or_else(PoisonError::into_inner);
            let committed = if db.is_dirty() {
                Some(self.commit_locked(&mut db)?)
            } else {
                None
            };
            *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = Slot::Closed;
            (db.file().clone(), committed)
        };

        if let Some(file) = committed {
            self.database_watcher.notify(&DatabaseEvent::Committed { file });
        }
        log::info!("Closed database {}", file.path);
        self.database_watcher.notify(&DatabaseEvent::Closed { file });
        self.observer_bus
            .notify(&ObserverEvent::DatabaseStatusChanged { open: false });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::{self, BackendContext};
    use crate::dispatch::DispatchError;
    use crate::encryption::{KeyError, PasswordKey};
    use crate::fs::{FsAuthority, FsAuthorityConverter};
    use crate::encryption::PlainDataCipher;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct Fixture {
        dir: TempDir,
        repository: EncryptedDatabaseRepository,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let context = BackendContext::for_tests(dir.path());
            let resolver = Arc::new(backends::resolver(&context).unwrap());
            let registry = Arc::new(
                UsedFileRepository::in_memory(FsAuthorityConverter::new(Arc::new(PlainDataCipher))).unwrap(),
            );
            let repository = EncryptedDatabaseRepository::new(resolver)
                .with_registry(registry)
                .with_kdf_params(Argon2Params::interactive());
            Self { dir, repository }
        }

        fn file(&self, name: &str) -> FileDescriptor {
            let path = self.dir.path().join(name).to_string_lossy().to_string();
            FileDescriptor::file(FsAuthority::local(), path.clone(), path)
        }
    }

    #[test]
    fn test_create_close_reopen() {
        let fx = Fixture::new();
        let file = fx.file("vault.kdbx");
        let key = PasswordKey::new("pw");

        let handle = fx.repository.create(&key, &file, FsOptions::default()).unwrap();
        assert_eq!(handle.read(|db| db.content().name.clone()), "vault");
        let root = handle.read(|db| db.content().root_group_uid);
        let note_uid = fx.repository.insert_note(Note::new(root, "bank")).unwrap();
        fx.repository.close().unwrap();
        assert!(!fx.repository.is_open());

        fx.repository.open(&key, &file, FsOptions::default()).unwrap();
        let title = fx
            .repository
            .read(|db| db.content().note(note_uid).map(|n| n.title.clone()))
            .unwrap();
        assert_eq!(title.as_deref(), Some("bank"));
        assert_eq!(fx.repository.registry.as_ref().unwrap().get_all().unwrap().len(), 1);
    }

    #[test]
    fn test_second_open_rejected() {
        let fx = Fixture::new();
        let key = PasswordKey::new("pw");
        let first = fx.file("a.kdbx");
        let second = fx.file("b.kdbx");
        fx.repository.create(&key, &first, FsOptions::default()).unwrap();

        assert!(matches!(
            fx.repository.open(&key, &first, FsOptions::default()),
            Err(DatabaseError::AlreadyOpen)
        ));
        assert!(matches!(
            fx.repository.create(&key, &second, FsOptions::default()),
            Err(DatabaseError::AlreadyOpen)
        ));
        // the original database is untouched
        assert_eq!(fx.repository.current().unwrap().file().path, first.path);
    }

    #[test]
    fn test_failed_open_releases_slot() {
        let fx = Fixture::new();
        let file = fx.file("vault.kdbx");
        fx.repository.create(&PasswordKey::new("pw"), &file, FsOptions::default()).unwrap();
        fx.repository.close().unwrap();

        let result = fx.repository.open(&PasswordKey::new("wrong"), &file, FsOptions::default());
        assert!(matches!(result, Err(DatabaseError::Key(KeyError::WrongPassword))));
        assert!(!fx.repository.is_open());

        fx.repository.open(&PasswordKey::new("pw"), &file, FsOptions::default()).unwrap();
    }

    #[test]
    fn test_mutations_are_announced() {
        let fx = Fixture::new();
        let file = fx.file("vault.kdbx");
        let handle = fx.repository.create(&PasswordKey::new("pw"), &file, FsOptions::default()).unwrap();
        let root = handle.read(|db| db.content().root_group_uid);

        let content_events = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&content_events);
        fx.repository.content_watcher().subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let (_, mut db_events) = fx.repository.database_watcher().subscribe_channel();

        let group = Group::new(root, "Email");
        let group_uid = fx.repository.insert_group(group).unwrap();
        fx.repository.insert_note(Note::new(group_uid, "mail")).unwrap();
        fx.repository.remove_group(group_uid).unwrap();
        // insert group, insert note, remove group, remove note
        assert_eq!(content_events.load(Ordering::SeqCst), 4);

        fx.repository.commit().unwrap();
        fx.repository.close().unwrap();
        assert!(matches!(db_events.try_recv(), Ok(DatabaseEvent::Committed { .. })));
        assert!(matches!(db_events.try_recv(), Ok(DatabaseEvent::Closed { .. })));
    }

    #[test]
    fn test_read_only_rejects_mutation() {
        let fx = Fixture::new();
        let file = fx.file("vault.kdbx");
        let key = PasswordKey::new("pw");
        fx.repository.create(&key, &file, FsOptions::default()).unwrap();
        fx.repository.close().unwrap();

        let handle = fx.repository.open(&key, &file, FsOptions::read_only()).unwrap();
        let root = handle.read(|db| db.content().root_group_uid);
        assert!(matches!(
            fx.repository.insert_note(Note::new(root, "x")),
            Err(DatabaseError::InvalidOperation(_))
        ));
        fx.repository.close().unwrap();
    }

    #[test]
    fn test_create_refuses_existing_file() {
        let fx = Fixture::new();
        let file = fx.file("vault.kdbx");
        fx.repository.create(&PasswordKey::new("pw"), &file, FsOptions::default()).unwrap();
        fx.repository.close().unwrap();
        let before = std::fs::read(&file.path).unwrap();

        let result = fx.repository.create(&PasswordKey::new("other"), &file, FsOptions::default());
        assert!(matches!(
            result,
            Err(DatabaseError::FileSystem(FileSystemError::AlreadyExists(_)))
        ));
        assert!(!fx.repository.is_open());
        assert_eq!(std::fs::read(&file.path).unwrap(), before);

        fx.repository.open(&PasswordKey::new("pw"), &file, FsOptions::default()).unwrap();
    }

    #[tokio::test]
    async fn test_async_create_and_open() {
        let fx = Fixture::new();
        let dispatchers = Dispatchers::new(2, 1);
        let file = fx.file("vault.kdbx");
        let key: Arc<dyn EncryptedDatabaseKey> = Arc::new(PasswordKey::new("pw"));

        let handle = fx
            .repository
            .create_async(&dispatchers, Arc::clone(&key), file.clone(), FsOptions::default())
            .await
            .unwrap();
        assert_eq!(handle.read(|db| db.content().name.clone()), "vault");
        assert!(!handle.read(|db| db.is_dirty()));
        fx.repository.close().unwrap();

        let again = fx
            .repository
            .create_async(&dispatchers, Arc::clone(&key), file.clone(), FsOptions::default())
            .await;
        assert!(matches!(
            again,
            Err(DatabaseError::FileSystem(FileSystemError::AlreadyExists(_)))
        ));

        let wrong: Arc<dyn EncryptedDatabaseKey> = Arc::new(PasswordKey::new("wrong"));
        let result = fx
            .repository
            .open_async(&dispatchers, wrong, file.clone(), FsOptions::default())
            .await;
        assert!(matches!(result, Err(DatabaseError::Key(KeyError::WrongPassword))));
        assert!(!fx.repository.is_open());

        fx.repository
            .open_async(&dispatchers, key, file, FsOptions::default())
            .await
            .unwrap();
        assert!(fx.repository.is_open());
    }

    #[tokio::test]
    async fn test_async_open_after_shutdown_releases_slot() {
        let fx = Fixture::new();
        let file = fx.file("vault.kdbx");
        fx.repository.create(&PasswordKey::new("pw"), &file, FsOptions::default()).unwrap();
        fx.repository.close().unwrap();

        let dispatchers = Dispatchers::default();
        dispatchers.shutdown();
        let result = fx
            .repository
            .open_async(&dispatchers, Arc::new(PasswordKey::new("pw")), file, FsOptions::default())
            .await;
        assert!(matches!(result, Err(DatabaseError::Dispatch(DispatchError::Closed))));
        assert!(!fx.repository.is_open());
    }

    #[test]
    fn test_operations_require_open_database() {
        let fx = Fixture::new();
        assert!(matches!(fx.repository.close(), Err(DatabaseError::NotOpen)));
        assert!(matches!(fx.repository.commit(), Err(DatabaseError::NotOpen)));
        assert!(matches!(fx.repository.read(|_| ()), Err(DatabaseError::NotOpen)));
    }
}
