//! Error types for the sync engine

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Transmission error: {0}")]
    Transmission(String),

    #[error("Encryption error: {0}")]
    Encryption(#[from] crypto::CryptoError),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Sync already in progress")]
    SyncInProgress,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Serialization(err.to_string())
    }
}

pub type SyncResult<T> = Result<T, SyncError>;
