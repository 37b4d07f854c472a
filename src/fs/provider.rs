use std::sync::Arc;

use super::auth::FileSystemAuthenticator;
use super::errors::{incorrect_use, Result};
use super::model::{FileDescriptor, FsAuthority, FsOptions};
use crate::sync::FileSystemSyncProcessor;

/// File operations against one backend instance.
///
/// All methods block on disk or network I/O and belong on the I/O context.
/// Descriptors passed in must have been produced by a provider of the same
/// backend type; anything else is a caller bug and panics.
pub trait FileSystemProvider: Send + Sync {
    fn fs_authority(&self) -> &FsAuthority;

    /// Backend root. For Git this clones or pulls the working copy.
    fn root_file(&self) -> Result<FileDescriptor>;

    fn list_files(&self, dir: &FileDescriptor) -> Result<Vec<FileDescriptor>>;

    fn get_parent(&self, file: &FileDescriptor) -> Result<FileDescriptor>;

    fn exists(&self, file: &FileDescriptor) -> Result<bool>;

    fn get_file(&self, path: &str, options: FsOptions) -> Result<FileDescriptor>;

    fn read_file(&self, file: &FileDescriptor, options: FsOptions) -> Result<Vec<u8>>;

    /// Write the whole content of `file`, returning its refreshed descriptor
    fn write_file(&self, file: &FileDescriptor, content: &[u8], options: FsOptions) -> Result<FileDescriptor>;

    /// Create an empty file named `name` inside `parent`
    fn create_file(&self, parent: &FileDescriptor, name: &str, options: FsOptions) -> Result<FileDescriptor>;

    fn authenticator(&self) -> Arc<dyn FileSystemAuthenticator>;

    fn sync_processor(&self) -> Arc<dyn FileSystemSyncProcessor>;
}

/// Panic unless `file` belongs to the same backend type as `authority`
#[track_caller]
pub fn check_authority(authority: &FsAuthority, file: &FileDescriptor) {
    if file.fs_authority.fs_type != authority.fs_type {
        incorrect_use(format!(
            "{} descriptor {} passed to {} provider",
            file.fs_authority.fs_type, file.path, authority.fs_type
        ));
    }
}
