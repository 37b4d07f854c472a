//! At-rest cipher for small secrets stored in the registry (server credentials)

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};

use super::crypto::{decrypt, encrypt, generate_key, NONCE_SIZE};
use super::errors::{EncryptionError, EncryptionResult};
use super::models::EncryptionKey;

/// Encodes/decodes strings for storage. Swappable so tests can run without
/// a keyring.
pub trait DataCipher: Send + Sync {
    fn encode(&self, plaintext: &str) -> EncryptionResult<String>;
    fn decode(&self, ciphertext: &str) -> EncryptionResult<String>;
}

/// ChaCha20-Poly1305 with a fixed key; output is `base64(nonce || ciphertext)`
pub struct ChaChaDataCipher {
    key: EncryptionKey,
}

impl ChaChaDataCipher {
    pub fn new(key: EncryptionKey) -> Self {
        Self { key }
    }

    /// Use the key stored under `service` in the OS keyring, creating it on first use
    pub fn from_keyring(service: &str) -> EncryptionResult<Self> {
        let entry = keyring::Entry::new(service, "data-cipher")
            .map_err(|e| EncryptionError::KeyDerivationFailed(e.to_string()))?;

        match entry.get_password() {
            Ok(encoded) => {
                let bytes = BASE64.decode(encoded)?;
                let key: [u8; 32] = bytes
                    .try_into()
                    .map_err(|_| EncryptionError::InvalidFormat("stored key has wrong length".to_string()))?;
                Ok(Self::new(EncryptionKey::new(key)))
            }
            Err(keyring::Error::NoEntry) => {
                let key = generate_key();
                entry
                    .set_password(&BASE64.encode(key.as_bytes()))
                    .map_err(|e| EncryptionError::KeyDerivationFailed(e.to_string()))?;
                log::info!("Created data cipher key in keyring ({})", service);
                Ok(Self::new(key))
            }
            Err(e) => Err(EncryptionError::KeyDerivationFailed(e.to_string())),
        }
    }
}

impl DataCipher for ChaChaDataCipher {
    fn encode(&self, plaintext: &str) -> EncryptionResult<String> {
        let (ciphertext, nonce) = encrypt(plaintext.as_bytes(), &self.key)?;
        let mut combined = nonce.to_vec();
        combined.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(combined))
    }

    fn decode(&self, ciphertext: &str) -> EncryptionResult<String> {
        let combined = BASE64.decode(ciphertext)?;
        if combined.len() < NONCE_SIZE {
            return Err(EncryptionError::InvalidFormat("ciphertext too short".to_string()));
        }
        let (nonce, data) = combined.split_at(NONCE_SIZE);
        let plaintext = decrypt(data, &self.key, nonce)?;
        String::from_utf8(plaintext).map_err(|e| EncryptionError::InvalidFormat(e.to_string()))
    }
}

/// Identity cipher for tests
#[derive(Debug, Default, Clone, Copy)]
pub struct PlainDataCipher;

impl DataCipher for PlainDataCipher {
    fn encode(&self, plaintext: &str) -> EncryptionResult<String> {
        Ok(plaintext.to_string())
    }

    fn decode(&self, ciphertext: &str) -> EncryptionResult<String> {
        Ok(ciphertext.to_string())
    }
}
