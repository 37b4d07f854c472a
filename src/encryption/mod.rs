//! Encryption module for database containers and key material
//!
//! This module provides:
//! - ChaCha20-Poly1305 authenticated encryption
//! - Argon2id key stretching of the composite key
//! - Password and biometric key producers
//! - At-rest cipher for stored credentials

pub mod biometric;
pub mod crypto;
pub mod data_cipher;
pub mod errors;
pub mod key;
pub mod models;

// Re-export commonly used types
pub use biometric::{BiometricData, BiometricKey, CipherError, KeyCipher, KeyringKeyCipher, SoftwareKeyCipher};
pub use crypto::{derive_key, new_kdf_header, parse_container, seal, unseal};
pub use data_cipher::{ChaChaDataCipher, DataCipher, PlainDataCipher};
pub use errors::{EncryptionError, EncryptionResult, KeyError, KeyResult};
pub use key::{EncryptedDatabaseKey, KeyMaterial, PasswordKey};
pub use models::{Argon2Params, EncryptedContainer, EncryptionKey, KdfHeader, ALGORITHM_VERSION, ENCRYPTED_MAGIC};
