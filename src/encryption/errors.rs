//! Encryption and key error types

use thiserror::Error;

/// Errors that can occur while sealing or opening an encrypted container
#[derive(Debug, Error)]
pub enum EncryptionError {
    #[error("Key derivation failed: {0}")]
    KeyDerivationFailed(String),

    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    /// AEAD authentication failed: wrong key or tampered data
    #[error("Decryption failed")]
    DecryptionFailed,

    #[error("Invalid encrypted data format: {0}")]
    InvalidFormat(String),

    #[error("Invalid magic bytes - not an encrypted database")]
    InvalidMagic,

    #[error("Unsupported encryption version: {0}")]
    UnsupportedVersion(u32),

    #[error("Base64 decode error: {0}")]
    Base64Error(#[from] base64::DecodeError),

    #[error("JSON serialization error: {0}")]
    JsonError(#[from] serde_json::Error),
}

/// Result type alias for encryption operations
pub type EncryptionResult<T> = Result<T, EncryptionError>;

/// Typed failures of producing database key material.
///
/// Kept distinct so the unlock screen can tell a wrong password apart from
/// missing hardware or a changed biometric enrollment.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KeyError {
    #[error("Invalid key input: {0}")]
    InvalidInput(String),

    #[error("Wrong password or key")]
    WrongPassword,

    #[error("Key cipher unavailable: {0}")]
    CipherUnavailable(String),

    #[error("Biometric key was invalidated, re-enrollment required")]
    BiometricInvalidated,

    #[error("No biometric data enrolled")]
    BiometricDataMissing,

    #[error("Biometric data is corrupt: {0}")]
    BiometricDataCorrupt(String),

    #[error("Failed to store key data: {0}")]
    Storage(String),
}

pub type KeyResult<T> = Result<T, KeyError>;
