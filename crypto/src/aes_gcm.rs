use crate::encryption::Encryptor;
use crate::error::{CryptoError, CryptoResult};
use aes_gcm::{
    aead::{Aead, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::RngCore;
use zeroize::ZeroizeOnDrop;

/// AES-256-GCM payload encryptor with memory security
///
/// Stored form is `v{version}:{nonce_b64}:{ciphertext_b64}`:
/// - AES-256 in Galois/Counter Mode (NIST approved)
/// - Fresh 96-bit nonce per payload
/// - Authentication tag folded into the ciphertext
/// - Key zeroized when the encryptor is dropped
#[derive(ZeroizeOnDrop)]
pub struct PayloadEncryptor {
    #[zeroize(skip)]
    cipher: Aes256Gcm,
    /// Device key - automatically zeroized on drop
    key: [u8; 32],
    /// Key version embedded in the stored form, for rotation support
    key_version: u32,
}

impl PayloadEncryptor {
    /// Create a new encryptor with a 32-byte key
    pub fn new(key: [u8; 32]) -> CryptoResult<Self> {
        let cipher = Aes256Gcm::new_from_slice(&key).map_err(|_| CryptoError::InvalidKey)?;

        Ok(Self {
            cipher,
            key,
            key_version: 1,
        })
    }

    /// Create from a base64-encoded key, as provisioned on field devices
    pub fn from_base64(key_b64: &str) -> CryptoResult<Self> {
        let key_bytes = BASE64.decode(key_b64).map_err(|_| CryptoError::InvalidKey)?;

        if key_bytes.len() != 32 {
            return Err(CryptoError::InvalidKeyLength {
                expected: 32,
                got: key_bytes.len(),
            });
        }

        let mut key = [0u8; 32];
        key.copy_from_slice(&key_bytes);

        Self::new(key)
    }

    /// Create with a specific key version
    pub fn with_version(mut self, version: u32) -> Self {
        self.key_version = version;
        self
    }

    /// Generate a new random key (cryptographically secure)
    pub fn generate_key() -> [u8; 32] {
        let mut key = [0u8; 32];
        OsRng.fill_bytes(&mut key);
        key
    }

    /// Generate a key and encode it as base64 for device provisioning
    pub fn generate_key_base64() -> String {
        BASE64.encode(Self::generate_key())
    }

    /// Get the current key version
    pub fn version(&self) -> u32 {
        self.key_version
    }

    /// Seal plaintext into the versioned stored form
    fn seal(&self, plaintext: &[u8]) -> CryptoResult<String> {
        // 96-bit nonce, the recommended size for GCM
        let mut nonce_bytes = [0u8; 12];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| CryptoError::EncryptionFailed)?;

        Ok(format!(
            "v{}:{}:{}",
            self.key_version,
            BASE64.encode(nonce_bytes),
            BASE64.encode(&ciphertext)
        ))
    }

    /// Open the versioned stored form back into plaintext bytes
    fn open(&self, stored: &str) -> CryptoResult<Vec<u8>> {
        let parts: Vec<&str> = stored.split(':').collect();
        if parts.len() != 3 {
            return Err(CryptoError::InvalidFormat);
        }

        let version = parts[0]
            .strip_prefix('v')
            .and_then(|v| v.parse::<u32>().ok())
            .ok_or(CryptoError::InvalidFormat)?;

        // Single active key per device; rotation would look the key up here
        if version != self.key_version {
            return Err(CryptoError::UnsupportedKeyVersion {
                version,
                supported: self.key_version,
            });
        }

        let nonce_bytes = BASE64
            .decode(parts[1])
            .map_err(|_| CryptoError::InvalidFormat)?;

        if nonce_bytes.len() != 12 {
            return Err(CryptoError::InvalidNonce);
        }

        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = BASE64
            .decode(parts[2])
            .map_err(|_| CryptoError::InvalidFormat)?;

        // Decrypt and verify the authentication tag
        self.cipher
            .decrypt(nonce, ciphertext.as_ref())
            .map_err(|_| CryptoError::DecryptionFailed)
    }
}

impl Encryptor for PayloadEncryptor {
    fn encrypt(&self, plaintext: &str) -> CryptoResult<String> {
        self.seal(plaintext.as_bytes())
    }

    fn decrypt(&self, stored: &str) -> CryptoResult<String> {
        let plaintext = self.open(stored)?;
        String::from_utf8(plaintext).map_err(|_| CryptoError::InvalidUtf8)
    }

    fn algorithm(&self) -> &'static str {
        "AES-256-GCM"
    }
}
