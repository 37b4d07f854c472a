//! Local disk backend. Paths and uids are absolute OS paths.

use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::fs::{
    check_authority, incorrect_use, write_atomic, FileDescriptor, FileSystemAuthenticator, FileSystemError,
    FileSystemProvider, FsAuthority, FsOptions, NoAuthAuthenticator, Result,
};
use crate::sync::{ConflictResolutionStrategy, FileSystemSyncProcessor, SyncReport, SyncStatus, SyncStrategy};

pub struct RegularFileSystemProvider {
    authority: FsAuthority,
    root: PathBuf,
    authenticator: Arc<NoAuthAuthenticator>,
    processor: Arc<RegularSyncProcessor>,
}

impl RegularFileSystemProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            authority: FsAuthority::local(),
            root: root.into(),
            authenticator: Arc::new(NoAuthAuthenticator::new()),
            processor: Arc::new(RegularSyncProcessor),
        }
    }

    /// Provider rooted at the user's home directory
    pub fn home() -> Self {
        Self::new(dirs::home_dir().unwrap_or_else(|| PathBuf::from("/")))
    }

    fn descriptor(&self, path: &Path, meta: &fs::Metadata) -> FileDescriptor {
        let path_str = path.to_string_lossy().to_string();
        let descriptor = if meta.is_dir() {
            if path == self.root {
                FileDescriptor::root(self.authority.clone(), path_str.clone(), path_str)
            } else {
                FileDescriptor::directory(self.authority.clone(), path_str.clone(), path_str)
            }
        } else {
            FileDescriptor::file(self.authority.clone(), path_str.clone(), path_str)
        };
        descriptor.with_modified(modified(meta))
    }

    fn stat(&self, path: &Path) -> Result<FileDescriptor> {
        let meta = fs::metadata(path).map_err(|e| FileSystemError::from_io(e, &path.to_string_lossy()))?;
        Ok(self.descriptor(path, &meta))
    }
}

fn modified(meta: &fs::Metadata) -> Option<DateTime<Utc>> {
    meta.modified().ok().map(DateTime::<Utc>::from)
}

impl FileSystemProvider for RegularFileSystemProvider {
    fn fs_authority(&self) -> &FsAuthority {
        &self.authority
    }

    fn root_file(&self) -> Result<FileDescriptor> {
        self.stat(&self.root)
    }

    fn list_files(&self, dir: &FileDescriptor) -> Result<Vec<FileDescriptor>> {
        check_authority(&self.authority, dir);
        let entries = fs::read_dir(&dir.path).map_err(|e| FileSystemError::from_io(e, &dir.path))?;

        let mut files = Vec::new();
        for entry in entries {
            let entry = entry?;
            match entry.metadata() {
                Ok(meta) => files.push(self.descriptor(&entry.path(), &meta)),
                Err(e) => log::debug!("Skipping {:?}: {}", entry.path(), e),
            }
        }
        files.sort_by(|a, b| (!a.is_directory, &a.name).cmp(&(!b.is_directory, &b.name)));
        Ok(files)
    }

    fn get_parent(&self, file: &FileDescriptor) -> Result<FileDescriptor> {
        check_authority(&self.authority, file);
        match Path::new(&file.path).parent() {
            Some(parent) if !file.is_root => self.stat(parent),
            _ => Ok(file.clone()),
        }
    }

    fn exists(&self, file: &FileDescriptor) -> Result<bool> {
        check_authority(&self.authority, file);
        Ok(Path::new(&file.path).exists())
    }

    fn get_file(&self, path: &str, _options: FsOptions) -> Result<FileDescriptor> {
        self.stat(Path::new(path))
    }

    fn read_file(&self, file: &FileDescriptor, _options: FsOptions) -> Result<Vec<u8>> {
        check_authority(&self.authority, file);
        fs::read(&file.path).map_err(|e| FileSystemError::from_io(e, &file.path))
    }

    fn write_file(&self, file: &FileDescriptor, content: &[u8], options: FsOptions) -> Result<FileDescriptor> {
        check_authority(&self.authority, file);
        if !options.write_enabled {
            return Err(FileSystemError::Permission(format!("{} is opened read-only", file.path)));
        }

        let path = Path::new(&file.path);
        write_atomic(path, content).map_err(|e| FileSystemError::from_io(e, &file.path))?;
        log::debug!("Wrote {} ({} bytes)", file.path, content.len());
        self.stat(path)
    }

    fn create_file(&self, parent: &FileDescriptor, name: &str, options: FsOptions) -> Result<FileDescriptor> {
        check_authority(&self.authority, parent);
        if !options.write_enabled {
            return Err(FileSystemError::Permission(format!("{} is opened read-only", parent.path)));
        }

        let path = Path::new(&parent.path).join(name);
        let path_str = path.to_string_lossy().to_string();
        OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| FileSystemError::from_io(e, &path_str))?;
        self.stat(&path)
    }

    fn authenticator(&self) -> Arc<dyn FileSystemAuthenticator> {
        self.authenticator.clone()
    }

    fn sync_processor(&self) -> Arc<dyn FileSystemSyncProcessor> {
        self.processor.clone()
    }
}

/// Local files have no remote copy; only the pending-file query is meaningful
#[derive(Debug, Default)]
pub struct RegularSyncProcessor;

impl FileSystemSyncProcessor for RegularSyncProcessor {
    fn get_locally_modified_files(&self) -> Result<Vec<FileDescriptor>> {
        Ok(Vec::new())
    }

    fn get_sync_status(&self, file: &FileDescriptor) -> Result<SyncStatus> {
        incorrect_use(format!("{} is a local file and is never synchronized", file.path))
    }

    fn process(
        &self,
        file: &FileDescriptor,
        _strategy: SyncStrategy,
        _on_conflict: Option<ConflictResolutionStrategy>,
    ) -> Result<SyncReport> {
        incorrect_use(format!("{} is a local file and is never synchronized", file.path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::FsType;
    use tempfile::TempDir;

    fn provider(dir: &TempDir) -> RegularFileSystemProvider {
        RegularFileSystemProvider::new(dir.path())
    }

    #[test]
    fn test_write_read_list() {
        let dir = TempDir::new().unwrap();
        let provider = provider(&dir);
        let root = provider.root_file().unwrap();
        assert!(root.is_root);

        fs::create_dir(dir.path().join("sub")).unwrap();
        let file = provider.create_file(&root, "vault.kdbx", FsOptions::default()).unwrap();
        let written = provider.write_file(&file, b"secret", FsOptions::default()).unwrap();
        assert!(written.modified.is_some());
        assert_eq!(provider.read_file(&file, FsOptions::default()).unwrap(), b"secret");

        let names: Vec<String> = provider
            .list_files(&root)
            .unwrap()
            .into_iter()
            .map(|f| f.name)
            .collect();
        assert_eq!(names, vec!["sub", "vault.kdbx"]);

        let parent = provider.get_parent(&file).unwrap();
        assert_eq!(parent.path, root.path);
        assert!(provider.exists(&file).unwrap());
    }

    #[test]
    fn test_error_mapping() {
        let dir = TempDir::new().unwrap();
        let provider = provider(&dir);
        let missing = dir.path().join("missing.kdbx").to_string_lossy().to_string();
        assert!(matches!(
            provider.get_file(&missing, FsOptions::default()),
            Err(FileSystemError::NotFound(_))
        ));

        let root = provider.root_file().unwrap();
        provider.create_file(&root, "a.kdbx", FsOptions::default()).unwrap();
        assert!(matches!(
            provider.create_file(&root, "a.kdbx", FsOptions::default()),
            Err(FileSystemError::AlreadyExists(_))
        ));

        let file = provider.get_file(&dir.path().join("a.kdbx").to_string_lossy(), FsOptions::default()).unwrap();
        assert!(matches!(
            provider.write_file(&file, b"x", FsOptions::read_only()),
            Err(FileSystemError::Permission(_))
        ));
    }

    #[test]
    fn test_write_keeps_same_stem_siblings() {
        let dir = TempDir::new().unwrap();
        let provider = provider(&dir);
        let root = provider.root_file().unwrap();
        fs::write(dir.path().join("vault.tmp"), b"notes").unwrap();
        let vault = provider.create_file(&root, "vault.kdbx", FsOptions::default()).unwrap();
        let backup = provider.create_file(&root, "vault.bak", FsOptions::default()).unwrap();

        provider.write_file(&vault, b"db", FsOptions::default()).unwrap();
        provider.write_file(&backup, b"old db", FsOptions::default()).unwrap();

        assert_eq!(fs::read(dir.path().join("vault.tmp")).unwrap(), b"notes");
        assert_eq!(provider.read_file(&vault, FsOptions::default()).unwrap(), b"db");
        assert_eq!(provider.read_file(&backup, FsOptions::default()).unwrap(), b"old db");
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 3);
    }

    #[test]
    fn test_no_pending_files() {
        let dir = TempDir::new().unwrap();
        assert!(provider(&dir).sync_processor().get_locally_modified_files().unwrap().is_empty());
    }

    #[test]
    #[should_panic(expected = "incorrect use")]
    fn test_sync_is_incorrect_use() {
        let dir = TempDir::new().unwrap();
        let provider = provider(&dir);
        let root = provider.root_file().unwrap();
        let file = provider.create_file(&root, "a.kdbx", FsOptions::default()).unwrap();
        let _ = provider
            .sync_processor()
            .process(&file, SyncStrategy::SyncAutomatically, None);
    }

    #[test]
    #[should_panic(expected = "incorrect use")]
    fn test_foreign_descriptor_panics() {
        let dir = TempDir::new().unwrap();
        let file = FileDescriptor::file(FsAuthority::new(FsType::Dropbox, None), "/a", "id:a");
        let _ = provider(&dir).read_file(&file, FsOptions::default());
    }
}
