//! Database key material producers

use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use super::crypto::sha256;
use super::errors::{KeyError, KeyResult};

/// Raw composite key bytes handed to the database container.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct KeyMaterial(Vec<u8>);

impl KeyMaterial {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("KeyMaterial").field(&"[REDACTED]").finish()
    }
}

/// Produces the key for one unlock attempt.
///
/// Never panics; each failure kind is a distinct [`KeyError`] so the caller
/// can tell a wrong password from unavailable hardware.
pub trait EncryptedDatabaseKey: Send + Sync {
    fn key(&self) -> KeyResult<KeyMaterial>;
}

/// Master password key
pub struct PasswordKey {
    password: Zeroizing<String>,
}

impl PasswordKey {
    pub fn new(password: impl Into<String>) -> Self {
        Self {
            password: Zeroizing::new(password.into()),
        }
    }
}

impl std::fmt::Debug for PasswordKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PasswordKey")
            .field("password", &"[REDACTED]")
            .finish()
    }
}

impl EncryptedDatabaseKey for PasswordKey {
    fn key(&self) -> KeyResult<KeyMaterial> {
        if self.password.is_empty() {
            return Err(KeyError::InvalidInput("password is empty".to_string()));
        }

        // Composite key: SHA-256 over the SHA-256 of each component
        let mut component = sha256(self.password.as_bytes());
        let composite = sha256(&component);
        component.zeroize();

        Ok(KeyMaterial::new(composite.to_vec()))
    }
}
