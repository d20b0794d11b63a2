use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Encryption failed")]
    EncryptionFailed,

    #[error("Decryption failed: authentication tag mismatch or corrupted data")]
    DecryptionFailed,

    #[error("Invalid key")]
    InvalidKey,

    #[error("Invalid key length: expected {expected}, got {got}")]
    InvalidKeyLength { expected: usize, got: usize },

    #[error("Unsupported key version {version}, only version {supported} is supported")]
    UnsupportedKeyVersion { version: u8, supported: u8 },

    #[error("Invalid encrypted data format: {0}")]
    InvalidFormat(String),

    #[error("Key derivation failed: {0}")]
    KeyDerivationFailed(String),
}

pub type CryptoResult<T> = Result<T, CryptoError>;
