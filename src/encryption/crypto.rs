//! Cryptographic operations for encryption/decryption

use argon2::{Algorithm, Argon2, Params, Version};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use rand::RngCore;
use sha2::{Digest, Sha256};

use super::errors::{EncryptionError, EncryptionResult};
use super::models::{
    Argon2Params, EncryptedContainer, EncryptionKey, KdfHeader, ALGORITHM_VERSION,
};

/// Salt size in bytes
const SALT_SIZE: usize = 16;

/// Nonce size in bytes for ChaCha20-Poly1305
pub const NONCE_SIZE: usize = 12;

/// Generate a random salt for key derivation
pub fn generate_salt() -> String {
    let mut salt = [0u8; SALT_SIZE];
    rand::thread_rng().fill_bytes(&mut salt);
    BASE64.encode(salt)
}

/// Generate a random nonce for encryption
pub fn generate_nonce() -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce);
    nonce
}

/// Generate a random 256-bit key
pub fn generate_key() -> EncryptionKey {
    let mut key = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut key);
    EncryptionKey::new(key)
}

pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Fresh KDF header with a random salt
pub fn new_kdf_header(params: Argon2Params) -> KdfHeader {
    KdfHeader {
        salt: generate_salt(),
        params,
    }
}

/// Stretch composite key material into the container key using Argon2id
pub fn derive_key(secret: &[u8], kdf: &KdfHeader) -> EncryptionResult<EncryptionKey> {
    let salt_bytes = BASE64.decode(&kdf.salt)?;

    let argon2_params = Params::new(
        kdf.params.memory_cost,
        kdf.params.time_cost,
        kdf.params.parallelism,
        Some(32), // Output 256-bit key
    )
    .map_err(|e| EncryptionError::KeyDerivationFailed(e.to_string()))?;

    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, argon2_params);

    let mut key = [0u8; 32];
    argon2
        .hash_password_into(secret, &salt_bytes, &mut key)
        .map_err(|e| EncryptionError::KeyDerivationFailed(e.to_string()))?;

    Ok(EncryptionKey::new(key))
}

/// Encrypt data using ChaCha20-Poly1305
pub fn encrypt(plaintext: &[u8], key: &EncryptionKey) -> EncryptionResult<(Vec<u8>, [u8; NONCE_SIZE])> {
    let cipher = ChaCha20Poly1305::new_from_slice(key.as_bytes())
        .map_err(|e| EncryptionError::EncryptionFailed(e.to_string()))?;

    let nonce_bytes = generate_nonce();
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|e| EncryptionError::EncryptionFailed(e.to_string()))?;

    Ok((ciphertext, nonce_bytes))
}

/// Decrypt data using ChaCha20-Poly1305
pub fn decrypt(ciphertext: &[u8], key: &EncryptionKey, nonce_bytes: &[u8]) -> EncryptionResult<Vec<u8>> {
    if nonce_bytes.len() != NONCE_SIZE {
        return Err(EncryptionError::InvalidFormat(format!(
            "Invalid nonce size: expected {}, got {}",
            NONCE_SIZE,
            nonce_bytes.len()
        )));
    }

    let cipher = ChaCha20Poly1305::new_from_slice(key.as_bytes())
        .map_err(|e| EncryptionError::InvalidFormat(e.to_string()))?;

    let nonce = Nonce::from_slice(nonce_bytes);

    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| EncryptionError::DecryptionFailed)
}

/// Encrypt a payload into a container carrying the given KDF header
pub fn seal(plaintext: &[u8], key: &EncryptionKey, kdf: &KdfHeader) -> EncryptionResult<EncryptedContainer> {
    let (ciphertext, nonce) = encrypt(plaintext, key)?;
    Ok(EncryptedContainer::new(
        kdf.clone(),
        BASE64.encode(nonce),
        BASE64.encode(ciphertext),
    ))
}

/// Decrypt a container's payload
pub fn unseal(container: &EncryptedContainer, key: &EncryptionKey) -> EncryptionResult<Vec<u8>> {
    if !container.is_valid_magic() {
        return Err(EncryptionError::InvalidMagic);
    }
    if container.version != ALGORITHM_VERSION {
        return Err(EncryptionError::UnsupportedVersion(container.version));
    }

    let nonce = BASE64.decode(&container.nonce)?;
    let ciphertext = BASE64.decode(&container.ciphertext)?;
    decrypt(&ciphertext, key, &nonce)
}

/// Parse raw file bytes as a container
pub fn parse_container(bytes: &[u8]) -> EncryptionResult<EncryptedContainer> {
    let container = EncryptedContainer::from_bytes(bytes)
        .map_err(|e| EncryptionError::InvalidFormat(e.to_string()))?;
    if !container.is_valid_magic() {
        return Err(EncryptionError::InvalidMagic);
    }
    Ok(container)
}
