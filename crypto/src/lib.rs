//! Cryptographic primitives for Innkeep
//!
//! Provides the pieces the offline store needs to keep snapshots encrypted at rest:
//! - AES-256-GCM authenticated encryption with associated data
//! - PBKDF2-HMAC-SHA256 key derivation from a device identifier
//! - Key material zeroized on drop
//!
//! # Example
//!
//! ```rust
//! use crypto::{Aes256GcmEncryptor, Encryptor, Kdf, Pbkdf2Params};
//!
//! let params = Pbkdf2Params { iterations: 1_000 };
//! let key = Kdf::derive_aes256_key(b"device-token", b"app-salt", &params).unwrap();
//! let encryptor = Aes256GcmEncryptor::new(*key).unwrap();
//!
//! let sealed = encryptor.seal(b"snapshot bytes", b"main").unwrap();
//! assert_eq!(encryptor.open(&sealed, b"main").unwrap(), b"snapshot bytes");
//! ```

pub mod aes_gcm;
pub mod encryption;
pub mod error;
pub mod kdf;

pub use aes_gcm::Aes256GcmEncryptor;
pub use encryption::{EncryptionResult, Encryptor};
pub use error::*;
pub use kdf::{Kdf, Pbkdf2Params};
