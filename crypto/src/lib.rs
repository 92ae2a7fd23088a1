//! Payload encryption for ReliefLine field devices.
//!
//! Devices in the field carry queued assessment and response data in
//! SQLite, and a lost or seized device must not leak it. This crate
//! provides the at-rest encryption the local store uses:
//!
//! - AES-256-GCM with a fresh 96-bit nonce per payload
//! - Versioned stored form (`v1:<nonce>:<ciphertext>`) for key rotation
//! - Key material zeroized on drop
//! - A pass-through implementation for unprovisioned devices and tests

pub mod aes_gcm;
pub mod encryption;
pub mod error;

pub use aes_gcm::PayloadEncryptor;
pub use encryption::{Encryptor, NoOpEncryptor};
pub use error::{CryptoError, CryptoResult};
