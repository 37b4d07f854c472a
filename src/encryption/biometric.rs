//! Biometric-protected key storage.
//!
//! The composite key is encrypted by a [`KeyCipher`] whose wrapping key lives
//! outside the process (the OS keyring on desktop). The resulting blob is kept
//! in settings as `base64(iv)|base64(data)`.

use std::sync::{Arc, Mutex, PoisonError};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use thiserror::Error;

use super::crypto::{decrypt, encrypt, generate_key, NONCE_SIZE};
use super::errors::{KeyError, KeyResult};
use super::key::{EncryptedDatabaseKey, KeyMaterial};
use super::models::EncryptionKey;
use crate::settings::Settings;

const SEPARATOR: char = '|';

/// Encrypted key blob with its initialisation vector
#[derive(Clone, PartialEq, Eq)]
pub struct BiometricData {
    pub init_vector: Vec<u8>,
    pub encrypted_data: Vec<u8>,
}

impl BiometricData {
    pub fn encode(&self) -> String {
        format!(
            "{}{}{}",
            BASE64.encode(&self.init_vector),
            SEPARATOR,
            BASE64.encode(&self.encrypted_data)
        )
    }

    pub fn decode(value: &str) -> KeyResult<Self> {
        let (iv, data) = value
            .split_once(SEPARATOR)
            .ok_or_else(|| KeyError::BiometricDataCorrupt("missing separator".to_string()))?;

        let init_vector = BASE64
            .decode(iv)
            .map_err(|e| KeyError::BiometricDataCorrupt(e.to_string()))?;
        let encrypted_data = BASE64
            .decode(data)
            .map_err(|e| KeyError::BiometricDataCorrupt(e.to_string()))?;

        if init_vector.is_empty() || encrypted_data.is_empty() {
            return Err(KeyError::BiometricDataCorrupt("empty component".to_string()));
        }

        Ok(Self {
            init_vector,
            encrypted_data,
        })
    }
}

impl std::fmt::Debug for BiometricData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BiometricData")
            .field("init_vector_len", &self.init_vector.len())
            .field("encrypted_data_len", &self.encrypted_data.len())
            .finish()
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CipherError {
    #[error("cipher unavailable: {0}")]
    Unavailable(String),

    /// The wrapping key no longer exists or was replaced
    #[error("key permanently invalidated")]
    Invalidated,

    #[error("cipher operation failed: {0}")]
    Failed(String),
}

impl From<CipherError> for KeyError {
    fn from(err: CipherError) -> Self {
        match err {
            CipherError::Unavailable(msg) => KeyError::CipherUnavailable(msg),
            CipherError::Invalidated => KeyError::BiometricInvalidated,
            CipherError::Failed(msg) => KeyError::BiometricDataCorrupt(msg),
        }
    }
}

/// Hardware or OS backed cipher guarding the biometric blob
pub trait KeyCipher: Send + Sync {
    fn encrypt(&self, plaintext: &[u8]) -> Result<BiometricData, CipherError>;
    fn decrypt(&self, data: &BiometricData) -> Result<Vec<u8>, CipherError>;
}

fn seal_with(key: &EncryptionKey, plaintext: &[u8]) -> Result<BiometricData, CipherError> {
    let (ciphertext, nonce) =
        encrypt(plaintext, key).map_err(|e| CipherError::Failed(e.to_string()))?;
    Ok(BiometricData {
        init_vector: nonce.to_vec(),
        encrypted_data: ciphertext,
    })
}

fn open_with(key: &EncryptionKey, data: &BiometricData) -> Result<Vec<u8>, CipherError> {
    if data.init_vector.len() != NONCE_SIZE {
        return Err(CipherError::Failed(format!(
            "unexpected iv length {}",
            data.init_vector.len()
        )));
    }
    decrypt(&data.encrypted_data, key, &data.init_vector)
        .map_err(|e| CipherError::Failed(e.to_string()))
}

/// Wrapping key held in the OS keyring.
///
/// Deleting the keyring entry (or replacing it) makes existing blobs
/// unreadable; this is reported as [`CipherError::Invalidated`].
pub struct KeyringKeyCipher {
    service: String,
    account: String,
}

impl KeyringKeyCipher {
    pub fn new(service: impl Into<String>, account: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            account: account.into(),
        }
    }

    fn entry(&self) -> Result<keyring::Entry, CipherError> {
        keyring::Entry::new(&self.service, &self.account)
            .map_err(|e| CipherError::Unavailable(e.to_string()))
    }

    fn load_key(&self) -> Result<EncryptionKey, CipherError> {
        let encoded = match self.entry()?.get_password() {
            Ok(value) => value,
            Err(keyring::Error::NoEntry) => return Err(CipherError::Invalidated),
            Err(e) => return Err(CipherError::Unavailable(e.to_string())),
        };
        let bytes = BASE64
            .decode(encoded)
            .map_err(|_| CipherError::Invalidated)?;
        let key: [u8; 32] = bytes.try_into().map_err(|_| CipherError::Invalidated)?;
        Ok(EncryptionKey::new(key))
    }

    fn load_or_create_key(&self) -> Result<EncryptionKey, CipherError> {
        match self.load_key() {
            Ok(key) => Ok(key),
            Err(CipherError::Invalidated) => {
                log::info!("Creating new biometric wrapping key in keyring ({})", self.service);
                let key = generate_key();
                self.entry()?
                    .set_password(&BASE64.encode(key.as_bytes()))
                    .map_err(|e| CipherError::Unavailable(e.to_string()))?;
                Ok(key)
            }
            Err(e) => Err(e),
        }
    }
}

impl KeyCipher for KeyringKeyCipher {
    fn encrypt(&self, plaintext: &[u8]) -> Result<BiometricData, CipherError> {
        let key = self.load_or_create_key()?;
        seal_with(&key, plaintext)
    }

    fn decrypt(&self, data: &BiometricData) -> Result<Vec<u8>, CipherError> {
        let key = self.load_key()?;
        // A replaced wrapping key fails authentication the same way a
        // re-enrolled biometric does
        open_with(&key, data).map_err(|_| CipherError::Invalidated)
    }
}

struct SoftwareState {
    key: EncryptionKey,
    invalidated: bool,
    available: bool,
}

/// In-process cipher with a volatile wrapping key
pub struct SoftwareKeyCipher {
    state: Mutex<SoftwareState>,
}

impl Default for SoftwareKeyCipher {
    fn default() -> Self {
        Self::new()
    }
}

impl SoftwareKeyCipher {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SoftwareState {
                key: generate_key(),
                invalidated: false,
                available: true,
            }),
        }
    }

    /// Simulate an enrollment change: existing blobs can no longer be opened
    pub fn invalidate(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.invalidated = true;
    }

    pub fn set_available(&self, available: bool) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.available = available;
    }
}

impl KeyCipher for SoftwareKeyCipher {
    fn encrypt(&self, plaintext: &[u8]) -> Result<BiometricData, CipherError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if !state.available {
            return Err(CipherError::Unavailable("software cipher disabled".to_string()));
        }
        if state.invalidated {
            // Re-enrollment creates a fresh key
            state.key = generate_key();
            state.invalidated = false;
        }
        seal_with(&state.key, plaintext)
    }

    fn decrypt(&self, data: &BiometricData) -> Result<Vec<u8>, CipherError> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if !state.available {
            return Err(CipherError::Unavailable("software cipher disabled".to_string()));
        }
        if state.invalidated {
            return Err(CipherError::Invalidated);
        }
        open_with(&state.key, data)
    }
}

/// Key recovered from the biometric blob stored in settings
pub struct BiometricKey {
    settings: Arc<dyn Settings>,
    cipher: Arc<dyn KeyCipher>,
}

impl BiometricKey {
    pub fn new(settings: Arc<dyn Settings>, cipher: Arc<dyn KeyCipher>) -> Self {
        Self { settings, cipher }
    }

    /// Encrypt `key` with the cipher and persist the blob
    pub fn enroll(settings: &dyn Settings, cipher: &dyn KeyCipher, key: &KeyMaterial) -> KeyResult<()> {
        let data = cipher.encrypt(key.as_bytes())?;
        settings
            .set_biometric_data(Some(&data.encode()))
            .map_err(|e| KeyError::Storage(e.to_string()))?;
        log::info!("Biometric key enrolled");
        Ok(())
    }

    pub fn clear(settings: &dyn Settings) -> KeyResult<()> {
        settings
            .set_biometric_data(None)
            .map_err(|e| KeyError::Storage(e.to_string()))
    }
}

impl EncryptedDatabaseKey for BiometricKey {
    fn key(&self) -> KeyResult<KeyMaterial> {
        let encoded = self
            .settings
            .biometric_data()
            .ok_or(KeyError::BiometricDataMissing)?;
        let data = BiometricData::decode(&encoded)?;

        let bytes = self.cipher.decrypt(&data).map_err(|e| {
            log::warn!("Biometric key unavailable: {}", e);
            KeyError::from(e)
        })?;
        Ok(KeyMaterial::new(bytes))
    }
}
