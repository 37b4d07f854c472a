use crate::encryption::{
    derive_key, new_kdf_header, parse_container, seal, unseal, Argon2Params, EncryptionError, EncryptionKey,
    KdfHeader, KeyError, KeyMaterial,
};
use crate::fs::{FileDescriptor, FsOptions};

use super::errors::DatabaseResult;
use super::models::DatabaseContent;

/// The open, decrypted database.
///
/// Keeps the stretched key and KDF header so commits re-encrypt without
/// running the KDF again.
pub struct EncryptedDatabase {
    file: FileDescriptor,
    options: FsOptions,
    content: DatabaseContent,
    kdf: KdfHeader,
    key: EncryptionKey,
    dirty: bool,
}

impl EncryptedDatabase {
    /// New database protected by `composite`
    pub fn create(
        file: FileDescriptor,
        options: FsOptions,
        name: &str,
        composite: &KeyMaterial,
        params: Argon2Params,
    ) -> DatabaseResult<Self> {
        let kdf = new_kdf_header(params);
        let key = derive_key(composite.as_bytes(), &kdf)?;
        Ok(Self {
            file,
            options,
            content: DatabaseContent::new(name),
            kdf,
            key,
            dirty: true,
        })
    }

    /// Decrypt file bytes. An authentication failure means the key is wrong.
    pub fn decrypt(
        file: FileDescriptor,
        options: FsOptions,
        bytes: &[u8],
        composite: &KeyMaterial,
    ) -> DatabaseResult<Self> {
        let container = parse_container(bytes)?;
        let key = derive_key(composite.as_bytes(), &container.kdf)?;
        let plaintext = match unseal(&container, &key) {
            Ok(plaintext) => plaintext,
            Err(EncryptionError::DecryptionFailed) => return Err(KeyError::WrongPassword.into()),
            Err(e) => return Err(e.into()),
        };
        let content: DatabaseContent = serde_json::from_slice(&plaintext)?;

        Ok(Self {
            file,
            options,
            content,
            kdf: container.kdf,
            key,
            dirty: false,
        })
    }

    pub fn encrypt(&self) -> DatabaseResult<Vec<u8>> {
        let plaintext = serde_json::to_vec(&self.content)?;
        let container = seal(&plaintext, &self.key, &self.kdf)?;
        Ok(container.to_bytes()?)
    }

    pub fn file(&self) -> &FileDescriptor {
        &self.file
    }

    pub fn options(&self) -> FsOptions {
        self.options
    }

    pub fn content(&self) -> &DatabaseContent {
        &self.content
    }

    /// Run a mutation; the database only becomes dirty if it succeeds
    pub(crate) fn apply<R>(&mut self, f: impl FnOnce(&mut DatabaseContent) -> DatabaseResult<R>) -> DatabaseResult<R> {
        let result = f(&mut self.content)?;
        self.dirty = true;
        Ok(result)
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub(crate) fn mark_committed(&mut self, file: FileDescriptor) {
        self.file = file;
        self.dirty = false;
    }
}

impl std::fmt::Debug for EncryptedDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptedDatabase")
            .field("file", &self.file.path)
            .field("groups", &self.content.groups.len())
            .field("notes", &self.content.notes.len())
            .field("dirty", &self.dirty)
            .finish()
    }
}
