//! Key derivation using Argon2id.
//!
//! Vault keys are either random per instance or derived from a passphrase.
//! Derivation is memory-hard; the iteration count and memory cost come from
//! [`VaultConfig`](noteum_core::VaultConfig).

use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::aead::OsRng;
use argon2::Argon2;
use noteum_core::VaultError;
use secrecy::{ExposeSecret, SecretString};
use zeroize::ZeroizeOnDrop;

/// Length of a vault key in bytes (AES-256).
pub const KEY_LENGTH: usize = 32;

/// Length of a freshly generated salt.
pub const SALT_LENGTH: usize = 16;

const ARGON2_PARALLELISM: u32 = 1;

/// Key material for the token cipher, zeroized on drop.
#[derive(Clone, ZeroizeOnDrop)]
pub struct DerivedKey {
    key: [u8; KEY_LENGTH],
}

impl DerivedKey {
    pub(crate) fn from_bytes(bytes: [u8; KEY_LENGTH]) -> Self {
        Self { key: bytes }
    }

    /// A random key from the OS generator.
    pub fn random() -> Self {
        let mut bytes = [0u8; KEY_LENGTH];
        OsRng.fill_bytes(&mut bytes);
        Self::from_bytes(bytes)
    }

    /// Raw key bytes. Use only for immediate cipher construction.
    pub fn as_bytes(&self) -> &[u8; KEY_LENGTH] {
        &self.key
    }
}

impl std::fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DerivedKey")
            .field("key", &"[REDACTED]")
            .finish()
    }
}

/// Argon2id cost parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KdfParams {
    pub iterations: u32,
    pub memory_kib: u32,
}

impl KdfParams {
    pub fn new(iterations: u32, memory_kib: u32) -> Self {
        Self {
            iterations,
            memory_kib,
        }
    }
}

impl From<&noteum_core::VaultConfig> for KdfParams {
    fn from(config: &noteum_core::VaultConfig) -> Self {
        Self::new(config.kdf_iterations, config.kdf_memory_kib)
    }
}

/// A new random salt.
pub fn generate_salt() -> [u8; SALT_LENGTH] {
    let mut salt = [0u8; SALT_LENGTH];
    OsRng.fill_bytes(&mut salt);
    salt
}

/// Derive a vault key from a passphrase.
///
/// The same passphrase, salt and parameters always give the same key.
pub fn derive_key(
    passphrase: &SecretString,
    salt: &[u8],
    params: KdfParams,
) -> Result<DerivedKey, VaultError> {
    let passphrase = passphrase.expose_secret();
    if passphrase.is_empty() {
        return Err(VaultError::KeyDerivation {
            reason: "Passphrase cannot be empty".to_string(),
        });
    }
    if salt.len() < SALT_LENGTH {
        return Err(VaultError::KeyDerivation {
            reason: format!("Salt must be at least {SALT_LENGTH} bytes"),
        });
    }

    let argon_params = argon2::Params::new(
        params.memory_kib,
        params.iterations,
        ARGON2_PARALLELISM,
        Some(KEY_LENGTH),
    )
    .map_err(|e| VaultError::KeyDerivation {
        reason: format!("Invalid Argon2 parameters: {e}"),
    })?;

    let argon2 = Argon2::new(argon2::Algorithm::Argon2id, argon2::Version::V0x13, argon_params);

    let mut key_bytes = [0u8; KEY_LENGTH];
    argon2
        .hash_password_into(passphrase.as_bytes(), salt, &mut key_bytes)
        .map_err(|e| VaultError::KeyDerivation {
            reason: e.to_string(),
        })?;

    Ok(DerivedKey::from_bytes(key_bytes))
}

/// Cheap parameters for tests; argon2 requires at least 8 KiB per lane.
#[cfg(test)]
pub(crate) const TEST_KDF_PARAMS: KdfParams = KdfParams {
    iterations: 1,
    memory_kib: 8,
};

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_PARAMS: KdfParams = TEST_KDF_PARAMS;

    fn secret(s: &str) -> SecretString {
        SecretString::from(s.to_string())
    }

    #[test]
    fn test_key_derivation_deterministic() {
        let salt = b"unique-salt-1234567890";
        let a = derive_key(&secret("pass"), salt, TEST_PARAMS).expect("derive should succeed");
        let b = derive_key(&secret("pass"), salt, TEST_PARAMS).expect("derive should succeed");
        assert_eq!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn test_different_salt_or_passphrase_different_key() {
        let a = derive_key(&secret("pass"), b"salt-one-1234567890", TEST_PARAMS)
            .expect("derive should succeed");
        let b = derive_key(&secret("pass"), b"salt-two-1234567890", TEST_PARAMS)
            .expect("derive should succeed");
        let c = derive_key(&secret("other"), b"salt-one-1234567890", TEST_PARAMS)
            .expect("derive should succeed");
        assert_ne!(a.as_bytes(), b.as_bytes());
        assert_ne!(a.as_bytes(), c.as_bytes());
    }

    #[test]
    fn test_empty_passphrase_rejected() {
        let err = derive_key(&secret(""), b"salt-1234567890123456", TEST_PARAMS)
            .expect_err("empty passphrase should fail");
        assert!(err.to_string().contains("Passphrase cannot be empty"));
    }

    #[test]
    fn test_short_salt_rejected() {
        let err = derive_key(&secret("pass"), b"short", TEST_PARAMS).expect_err("short salt should fail");
        assert!(err.to_string().contains("Salt must be at least 16 bytes"));
    }

    #[test]
    fn test_debug_redacts_key() {
        let key = DerivedKey::random();
        let printed = format!("{key:?}");
        assert!(printed.contains("REDACTED"));
    }

    #[test]
    fn test_random_keys_and_salts_differ() {
        assert_ne!(DerivedKey::random().as_bytes(), DerivedKey::random().as_bytes());
        assert_ne!(generate_salt(), generate_salt());
    }
}
