//! Encryption data models

use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Magic identifier of an encrypted database container
pub const ENCRYPTED_MAGIC: &str = "KEEPSYNC_DB";

/// Current container format version
pub const ALGORITHM_VERSION: u32 = 1;

/// Argon2id parameters for key derivation, stored in each container header
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Argon2Params {
    /// Memory cost in KiB (65536 = 64MB)
    pub memory_cost: u32,
    /// Number of iterations
    pub time_cost: u32,
    /// Parallelism factor
    pub parallelism: u32,
}

impl Default for Argon2Params {
    fn default() -> Self {
        Self {
            memory_cost: 65536, // 64 MB
            time_cost: 3,
            parallelism: 4,
        }
    }
}

impl Argon2Params {
    /// Cheap parameters for tests and throwaway databases
    pub fn interactive() -> Self {
        Self {
            memory_cost: 1024,
            time_cost: 1,
            parallelism: 1,
        }
    }
}

/// Key derivation header of a container
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KdfHeader {
    /// Salt for key derivation (base64-encoded)
    pub salt: String,
    #[serde(flatten)]
    pub params: Argon2Params,
}

/// Container format for an encrypted database file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptedContainer {
    pub magic: String,
    pub version: u32,
    pub kdf: KdfHeader,
    /// Nonce used for this encryption (base64-encoded)
    pub nonce: String,
    /// Encrypted payload with the Poly1305 tag appended (base64-encoded)
    pub ciphertext: String,
}

impl EncryptedContainer {
    pub fn new(kdf: KdfHeader, nonce: String, ciphertext: String) -> Self {
        Self {
            magic: ENCRYPTED_MAGIC.to_string(),
            version: ALGORITHM_VERSION,
            kdf,
            nonce,
            ciphertext,
        }
    }

    pub fn is_valid_magic(&self) -> bool {
        self.magic == ENCRYPTED_MAGIC
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec_pretty(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Encryption key with secure memory handling
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EncryptionKey {
    /// The 256-bit key
    key: [u8; 32],
}

impl EncryptionKey {
    pub fn new(key: [u8; 32]) -> Self {
        Self { key }
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.key
    }
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionKey")
            .field("key", &"[REDACTED]")
            .finish()
    }
}
