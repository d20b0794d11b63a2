use crate::error::CryptoError;

/// Result type for encryption operations
pub type EncryptionResult<T> = Result<T, CryptoError>;

/// Authenticated encryption with associated data.
///
/// The associated data is not stored in the output; the same bytes must be
/// supplied again to `open`, which binds a ciphertext to its context (for
/// example the storage key it was written under).
pub trait Encryptor: Send + Sync {
    /// Encrypt `plaintext`, authenticating `aad` alongside it
    fn seal(&self, plaintext: &[u8], aad: &[u8]) -> EncryptionResult<Vec<u8>>;

    /// Decrypt data produced by `seal` with the same `aad`
    fn open(&self, sealed: &[u8], aad: &[u8]) -> EncryptionResult<Vec<u8>>;

    /// Get the encryption algorithm name
    fn algorithm(&self) -> &str;
}
