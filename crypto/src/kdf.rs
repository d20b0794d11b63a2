use crate::error::CryptoError;
use pbkdf2::pbkdf2_hmac;
use sha2::Sha256;
use zeroize::Zeroizing;

/// Key derivation result
pub type KdfResult<T> = Result<T, CryptoError>;

/// Lowest iteration count accepted outside of tests
pub const MIN_PBKDF2_ITERATIONS: u32 = 1_000;

/// PBKDF2 parameters for key derivation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pbkdf2Params {
    /// Number of iterations
    pub iterations: u32,
}

impl Default for Pbkdf2Params {
    fn default() -> Self {
        Self {
            iterations: 100_000,
        }
    }
}

/// Key Derivation Function utilities
pub struct Kdf;

impl Kdf {
    /// Derive a key using PBKDF2-HMAC-SHA256
    ///
    /// # Arguments
    /// * `password` - The secret input (for snapshots: the device identifier)
    /// * `salt` - Salt for key derivation
    /// * `iterations` - Number of iterations (higher = more secure but slower)
    /// * `key_length` - Length of derived key in bytes
    ///
    /// # Example
    /// ```
    /// use crypto::kdf::Kdf;
    ///
    /// let key = Kdf::pbkdf2(b"device-token", b"innkeep", 1_000, 32).unwrap();
    /// assert_eq!(key.len(), 32);
    /// ```
    pub fn pbkdf2(
        password: &[u8],
        salt: &[u8],
        iterations: u32,
        key_length: usize,
    ) -> KdfResult<Zeroizing<Vec<u8>>> {
        if password.is_empty() {
            return Err(CryptoError::KeyDerivationFailed(
                "password must not be empty".to_string(),
            ));
        }
        if salt.is_empty() {
            return Err(CryptoError::KeyDerivationFailed(
                "salt must not be empty".to_string(),
            ));
        }
        if iterations < MIN_PBKDF2_ITERATIONS {
            return Err(CryptoError::KeyDerivationFailed(format!(
                "iterations must be at least {MIN_PBKDF2_ITERATIONS}, got {iterations}"
            )));
        }

        let mut derived_key = Zeroizing::new(vec![0u8; key_length]);
        pbkdf2_hmac::<Sha256>(password, salt, iterations, &mut derived_key);

        Ok(derived_key)
    }

    /// Derive a 32-byte AES-256 key using PBKDF2
    pub fn derive_aes256_key(
        password: &[u8],
        salt: &[u8],
        params: &Pbkdf2Params,
    ) -> KdfResult<Zeroizing<[u8; 32]>> {
        let derived = Self::pbkdf2(password, salt, params.iterations, 32)?;
        let mut key = Zeroizing::new([0u8; 32]);
        key.copy_from_slice(&derived);
        Ok(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_params() -> Pbkdf2Params {
        Pbkdf2Params {
            iterations: MIN_PBKDF2_ITERATIONS,
        }
    }

    #[test]
    fn test_pbkdf2_is_deterministic() {
        let key1 = Kdf::derive_aes256_key(b"device-1", b"innkeep-salt", &fast_params()).unwrap();
        let key2 = Kdf::derive_aes256_key(b"device-1", b"innkeep-salt", &fast_params()).unwrap();

        assert_eq!(*key1, *key2);
    }

    #[test]
    fn test_pbkdf2_different_devices() {
        let key1 = Kdf::derive_aes256_key(b"device-1", b"innkeep-salt", &fast_params()).unwrap();
        let key2 = Kdf::derive_aes256_key(b"device-2", b"innkeep-salt", &fast_params()).unwrap();

        assert_ne!(*key1, *key2);
    }

    #[test]
    fn test_pbkdf2_different_salts() {
        let key1 = Kdf::derive_aes256_key(b"device-1", b"salt-a", &fast_params()).unwrap();
        let key2 = Kdf::derive_aes256_key(b"device-1", b"salt-b", &fast_params()).unwrap();

        assert_ne!(*key1, *key2);
    }

    #[test]
    fn test_rejects_weak_parameters() {
        assert!(Kdf::pbkdf2(b"device", b"salt", 10, 32).is_err());
        assert!(Kdf::pbkdf2(b"", b"salt", MIN_PBKDF2_ITERATIONS, 32).is_err());
        assert!(Kdf::pbkdf2(b"device", b"", MIN_PBKDF2_ITERATIONS, 32).is_err());
    }
}
