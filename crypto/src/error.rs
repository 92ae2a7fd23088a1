use thiserror::Error;

/// Errors produced by the payload encryption layer.
#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Encryption failed")]
    EncryptionFailed,

    #[error("Decryption failed: wrong key or tampered data")]
    DecryptionFailed,

    #[error("Invalid key material")]
    InvalidKey,

    #[error("Invalid key length: expected {expected} bytes, got {got}")]
    InvalidKeyLength { expected: usize, got: usize },

    #[error("Unsupported key version {version}, this device holds version {supported}")]
    UnsupportedKeyVersion { version: u32, supported: u32 },

    #[error("Malformed ciphertext envelope")]
    InvalidFormat,

    #[error("Invalid nonce length")]
    InvalidNonce,

    #[error("Decrypted payload is not valid UTF-8")]
    InvalidUtf8,
}

pub type CryptoResult<T> = Result<T, CryptoError>;
