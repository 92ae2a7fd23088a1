use crate::error::CryptoResult;

/// Trait for payload encryption at rest.
///
/// Queue payloads in this system are JSON documents, so the seam speaks
/// text: `encrypt` produces the string that lands in the database and
/// `decrypt` recovers the original document from it.
pub trait Encryptor: Send + Sync {
    /// Encrypt a payload for storage.
    fn encrypt(&self, plaintext: &str) -> CryptoResult<String>;

    /// Recover a payload from its stored form.
    fn decrypt(&self, stored: &str) -> CryptoResult<String>;

    /// Get the encryption algorithm name
    fn algorithm(&self) -> &'static str;
}

/// Pass-through encryptor for tests and devices without a provisioned key
pub struct NoOpEncryptor;

impl NoOpEncryptor {
    pub fn new() -> Self {
        Self
    }
}

impl Default for NoOpEncryptor {
    fn default() -> Self {
        Self::new()
    }
}

impl Encryptor for NoOpEncryptor {
    fn encrypt(&self, plaintext: &str) -> CryptoResult<String> {
        Ok(plaintext.to_owned())
    }

    fn decrypt(&self, stored: &str) -> CryptoResult<String> {
        Ok(stored.to_owned())
    }

    fn algorithm(&self) -> &'static str {
        "none"
    }
}
