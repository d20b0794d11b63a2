use crate::encryption::{EncryptionResult, Encryptor};
use crate::error::CryptoError;
use aes_gcm::{
    aead::{Aead, KeyInit, OsRng, Payload},
    Aes256Gcm, Nonce,
};
use rand::RngCore;
use sha2::{Digest, Sha256};
use zeroize::ZeroizeOnDrop;

const NONCE_LEN: usize = 12;
const HEADER_LEN: usize = 1 + NONCE_LEN;

/// AES-256-GCM encryptor with memory security
///
/// Sealed layout: `[key_version: u8][nonce: 12 bytes][ciphertext || tag]`.
///
/// - 96-bit random nonces (recommended for GCM)
/// - Authentication tags cover the ciphertext and the associated data
/// - Key material is zeroized on drop
#[derive(ZeroizeOnDrop)]
pub struct Aes256GcmEncryptor {
    #[zeroize(skip)]
    cipher: Aes256Gcm,
    key: [u8; 32],
    /// Key version for rotation support
    key_version: u8,
}

impl Aes256GcmEncryptor {
    /// Create a new encryptor with a 32-byte key
    pub fn new(key: [u8; 32]) -> EncryptionResult<Self> {
        let cipher = Aes256Gcm::new_from_slice(&key).map_err(|_| CryptoError::InvalidKey)?;

        Ok(Self {
            cipher,
            key,
            key_version: 1,
        })
    }

    /// Create from an arbitrary slice, checking its length
    pub fn from_slice(key: &[u8]) -> EncryptionResult<Self> {
        let key: [u8; 32] = key.try_into().map_err(|_| CryptoError::InvalidKeyLength {
            expected: 32,
            got: key.len(),
        })?;
        Self::new(key)
    }

    /// Create with specific key version
    pub fn with_version(mut self, version: u8) -> Self {
        self.key_version = version;
        self
    }

    /// Generate a new random key (cryptographically secure)
    pub fn generate_key() -> [u8; 32] {
        let mut key = [0u8; 32];
        OsRng.fill_bytes(&mut key);
        key
    }

    /// Get the current key version
    pub fn version(&self) -> u8 {
        self.key_version
    }

    /// Short non-reversible identifier of the key, safe to log
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.key);
        digest
            .iter()
            .take(8)
            .map(|byte| format!("{byte:02x}"))
            .collect()
    }
}

impl Encryptor for Aes256GcmEncryptor {
    fn seal(&self, plaintext: &[u8], aad: &[u8]) -> EncryptionResult<Vec<u8>> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, Payload { msg: plaintext, aad })
            .map_err(|_| CryptoError::EncryptionFailed)?;

        let mut sealed = Vec::with_capacity(HEADER_LEN + ciphertext.len());
        sealed.push(self.key_version);
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    fn open(&self, sealed: &[u8], aad: &[u8]) -> EncryptionResult<Vec<u8>> {
        if sealed.len() < HEADER_LEN {
            return Err(CryptoError::InvalidFormat(format!(
                "sealed data too short: {} bytes",
                sealed.len()
            )));
        }
        let (header, ciphertext) = sealed.split_at(HEADER_LEN);
        let (version, nonce_bytes) = header.split_at(1);

        let version = version.first().copied().unwrap_or_default();
        // With key rotation the matching key would be looked up here
        if version != self.key_version {
            return Err(CryptoError::UnsupportedKeyVersion {
                version,
                supported: self.key_version,
            });
        }

        self.cipher
            .decrypt(
                Nonce::from_slice(nonce_bytes),
                Payload {
                    msg: ciphertext,
                    aad,
                },
            )
            .map_err(|_| CryptoError::DecryptionFailed)
    }

    fn algorithm(&self) -> &str {
        "AES-256-GCM"
    }
}
