//! Durable registry of known database files, independent of whether their
//! backend is reachable.

use std::path::Path;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;

use crate::fs::{FileDescriptor, FileSystemError, FsAuthority, FsAuthorityConverter};

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Stored authority unreadable: {0}")]
    Authority(#[from] FileSystemError),

    #[error("Invalid timestamp: {0}")]
    Timestamp(#[from] chrono::ParseError),

    #[error("File already registered: {0}")]
    AlreadyExists(String),
}

pub type Result<T> = std::result::Result<T, RegistryError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsedFile {
    pub fs_authority: FsAuthority,
    pub file_path: String,
    pub file_uid: String,
    pub file_name: String,
    pub added_time: DateTime<Utc>,
    pub last_access_time: DateTime<Utc>,
}

impl UsedFile {
    pub fn from_descriptor(file: &FileDescriptor) -> Self {
        let now = Utc::now();
        Self {
            fs_authority: file.fs_authority.clone(),
            file_path: file.path.clone(),
            file_uid: file.uid.clone(),
            file_name: file.name.clone(),
            added_time: now,
            last_access_time: now,
        }
    }

    pub fn descriptor(&self) -> FileDescriptor {
        FileDescriptor::file(self.fs_authority.clone(), self.file_path.clone(), self.file_uid.clone())
    }
}

/// SQLite table `used_files` keyed by authority and file uid.
///
/// The authority is stored twice: its stable key (for lookups) and the
/// converter's database value (credentials encrypted).
pub struct UsedFileRepository {
    conn: Mutex<Connection>,
    converter: FsAuthorityConverter,
}

impl UsedFileRepository {
    pub fn open(db_path: &Path, converter: FsAuthorityConverter) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Self::with_connection(Connection::open(db_path)?, converter)
    }

    pub fn in_memory(converter: FsAuthorityConverter) -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?, converter)
    }

    fn with_connection(conn: Connection, converter: FsAuthorityConverter) -> Result<Self> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS used_files (
                authority_key TEXT NOT NULL,
                file_uid TEXT NOT NULL,
                fs_authority TEXT NOT NULL,
                file_path TEXT NOT NULL,
                file_name TEXT NOT NULL,
                added_time TEXT NOT NULL,
                last_access_time TEXT NOT NULL,
                PRIMARY KEY (authority_key, file_uid)
            );

            CREATE INDEX IF NOT EXISTS idx_used_files_access ON used_files(last_access_time);
            "#,
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
            converter,
        })
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn insert(&self, file: &UsedFile) -> Result<()> {
        let authority = self.converter.to_database_value(&file.fs_authority)?;
        let inserted = self.conn().execute(
            "INSERT OR IGNORE INTO used_files
             (authority_key, file_uid, fs_authority, file_path, file_name, added_time, last_access_time)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                file.fs_authority.key(),
                file.file_uid,
                authority,
                file.file_path,
                file.file_name,
                format_time(&file.added_time),
                format_time(&file.last_access_time),
            ],
        )?;
        if inserted == 0 {
            return Err(RegistryError::AlreadyExists(file.file_path.clone()));
        }
        Ok(())
    }

    /// Overwrite everything but the added time; returns false if unknown
    pub fn update(&self, file: &UsedFile) -> Result<bool> {
        let authority = self.converter.to_database_value(&file.fs_authority)?;
        let updated = self.conn().execute(
            "UPDATE used_files
             SET fs_authority = ?3, file_path = ?4, file_name = ?5, last_access_time = ?6
             WHERE authority_key = ?1 AND file_uid = ?2",
            params![
                file.fs_authority.key(),
                file.file_uid,
                authority,
                file.file_path,
                file.file_name,
                format_time(&file.last_access_time),
            ],
        )?;
        Ok(updated > 0)
    }

    /// Record an access to `file`, registering it on first use
    pub fn touch(&self, file: &FileDescriptor) -> Result<UsedFile> {
        let mut used = match self.find(&file.fs_authority, &file.uid)? {
            Some(existing) => existing,
            None => {
                let used = UsedFile::from_descriptor(file);
                self.insert(&used)?;
                log::info!("Registered used file {}", file.path);
                return Ok(used);
            }
        };

        used.fs_authority = file.fs_authority.clone();
        used.file_path = file.path.clone();
        used.file_name = file.name.clone();
        used.last_access_time = Utc::now();
        self.update(&used)?;
        Ok(used)
    }

    pub fn find(&self, authority: &FsAuthority, file_uid: &str) -> Result<Option<UsedFile>> {
        let row = self
            .conn()
            .query_row(
                "SELECT fs_authority, file_path, file_uid, file_name, added_time, last_access_time
                 FROM used_files WHERE authority_key = ?1 AND file_uid = ?2",
                params![authority.key(), file_uid],
                read_row,
            )
            .optional()?;

        row.map(|raw| self.decode(raw)).transpose()
    }

    /// All registered files, most recently accessed first. Rows whose
    /// credentials can no longer be decrypted are skipped.
    pub fn get_all(&self) -> Result<Vec<UsedFile>> {
        let rows = {
            let conn = self.conn();
            let mut stmt = conn.prepare(
                "SELECT fs_authority, file_path, file_uid, file_name, added_time, last_access_time
                 FROM used_files ORDER BY last_access_time DESC",
            )?;
            let rows = stmt.query_map([], read_row)?;
            let collected = rows.collect::<std::result::Result<Vec<_>, _>>()?;
            collected
        };

        let mut files = Vec::with_capacity(rows.len());
        for raw in rows {
            let path = raw.file_path.clone();
            match self.decode(raw) {
                Ok(file) => files.push(file),
                Err(e) => log::warn!("Skipping used file {}: {}", path, e),
            }
        }
        Ok(files)
    }

    pub fn remove(&self, authority: &FsAuthority, file_uid: &str) -> Result<bool> {
        let removed = self.conn().execute(
            "DELETE FROM used_files WHERE authority_key = ?1 AND file_uid = ?2",
            params![authority.key(), file_uid],
        )?;
        Ok(removed > 0)
    }

    fn decode(&self, raw: RawRow) -> Result<UsedFile> {
        Ok(UsedFile {
            fs_authority: self.converter.from_database_value(&raw.fs_authority)?,
            file_path: raw.file_path,
            file_uid: raw.file_uid,
            file_name: raw.file_name,
            added_time: parse_time(&raw.added_time)?,
            last_access_time: parse_time(&raw.last_access_time)?,
        })
    }
}

struct RawRow {
    fs_authority: String,
    file_path: String,
    file_uid: String,
    file_name: String,
    added_time: String,
    last_access_time: String,
}

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRow> {
    Ok(RawRow {
        fs_authority: row.get(0)?,
        file_path: row.get(1)?,
        file_uid: row.get(2)?,
        file_name: row.get(3)?,
        added_time: row.get(4)?,
        last_access_time: row.get(5)?,
    })
}

/// Fixed-width so text ordering matches time ordering
fn format_time(time: &DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_time(value: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(value)?.with_timezone(&Utc))
}
