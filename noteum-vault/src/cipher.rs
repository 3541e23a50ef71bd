//! Authenticated token encryption.
//!
//! Every ciphertext is a self-describing envelope: base64 of the JSON
//!
//! ```json
//! { "data": "<base64 ciphertext+tag>", "iv": "<base64 nonce>",
//!   "algorithm": "AES-256-GCM", "salt": "<base64 salt, passphrase keys only>" }
//! ```
//!
//! The nonce is fresh for every encryption. A passphrase-derived key records
//! its salt so that any process holding the passphrase can re-derive it.
//! Keys re-derived for foreign salts are kept per salt, so each salt pays
//! the key derivation once per instance.

use std::collections::HashMap;
use std::sync::Mutex;

use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use noteum_core::VaultError;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use crate::key::{derive_key, generate_salt, DerivedKey, KdfParams, SALT_LENGTH};

/// Algorithm tag written into every envelope.
pub const ALGORITHM: &str = "AES-256-GCM";

/// AES-GCM nonce length in bytes.
pub const NONCE_LENGTH: usize = 12;

/// Foreign-salt ciphers kept before the map is reset.
const MAX_DERIVED_CIPHERS: usize = 16;

/// Wire form of an encrypted token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub data: String,
    pub iv: String,
    pub algorithm: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub salt: Option<String>,
}

impl Envelope {
    /// Parse the outer base64 and the JSON inside it.
    pub fn parse(encoded: &str) -> Result<Self, VaultError> {
        let json = STANDARD.decode(encoded).map_err(|e| decryption(format!("invalid envelope encoding: {e}")))?;
        serde_json::from_slice(&json).map_err(|e| decryption(format!("invalid envelope: {e}")))
    }

    fn encode(&self) -> Result<String, VaultError> {
        let json = serde_json::to_vec(self).map_err(|e| VaultError::Encryption {
            reason: e.to_string(),
        })?;
        Ok(STANDARD.encode(json))
    }
}

/// AES-256-GCM cipher for token values.
pub struct TokenCipher {
    cipher: Aes256Gcm,
    salt: Option<[u8; SALT_LENGTH]>,
    passphrase: Option<SecretString>,
    params: KdfParams,
    derived: Mutex<HashMap<Vec<u8>, Aes256Gcm>>,
}

impl TokenCipher {
    /// Cipher with a random key that lives as long as this instance.
    pub fn random() -> Result<Self, VaultError> {
        let key = DerivedKey::random();
        Ok(Self {
            cipher: cipher_for(&key)?,
            salt: None,
            passphrase: None,
            params: KdfParams::new(0, 0),
            derived: Mutex::new(HashMap::new()),
        })
    }

    /// Cipher with a key derived from `passphrase` and a fresh salt.
    pub fn from_passphrase(passphrase: SecretString, params: KdfParams) -> Result<Self, VaultError> {
        let salt = generate_salt();
        let key = derive_key(&passphrase, &salt, params)?;
        Ok(Self {
            cipher: cipher_for(&key)?,
            salt: Some(salt),
            passphrase: Some(passphrase),
            params,
            derived: Mutex::new(HashMap::new()),
        })
    }

    pub fn is_passphrase_derived(&self) -> bool {
        self.passphrase.is_some()
    }

    /// Encrypt a token into an envelope string.
    pub fn encrypt(&self, plaintext: &str) -> Result<String, VaultError> {
        let mut nonce_bytes = [0u8; NONCE_LENGTH];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| VaultError::Encryption {
                reason: e.to_string(),
            })?;

        Envelope {
            data: STANDARD.encode(ciphertext),
            iv: STANDARD.encode(nonce_bytes),
            algorithm: ALGORITHM.to_string(),
            salt: self.salt.map(|s| STANDARD.encode(s)),
        }
        .encode()
    }

    /// Decrypt an envelope. Tampered or foreign ciphertext is an error, never
    /// garbage plaintext.
    pub fn decrypt(&self, encoded: &str) -> Result<String, VaultError> {
        let envelope = Envelope::parse(encoded)?;
        if envelope.algorithm != ALGORITHM {
            return Err(decryption(format!("unsupported algorithm {}", envelope.algorithm)));
        }

        let nonce_bytes = STANDARD
            .decode(&envelope.iv)
            .map_err(|e| decryption(format!("invalid iv: {e}")))?;
        if nonce_bytes.len() != NONCE_LENGTH {
            return Err(decryption(format!(
                "iv must be {NONCE_LENGTH} bytes, got {}",
                nonce_bytes.len()
            )));
        }
        let ciphertext = STANDARD
            .decode(&envelope.data)
            .map_err(|e| decryption(format!("invalid data: {e}")))?;

        let nonce = Nonce::from_slice(&nonce_bytes);
        let plaintext = match self.foreign_salt(&envelope)? {
            None => self.cipher.decrypt(nonce, ciphertext.as_ref()),
            Some(cipher) => cipher.decrypt(nonce, ciphertext.as_ref()),
        }
        .map_err(|_| decryption("authentication failed"))?;

        String::from_utf8(plaintext).map_err(|e| decryption(format!("plaintext is not UTF-8: {e}")))
    }

    /// A cipher for an envelope sealed under a different salt, or `None`
    /// when this instance's key applies.
    fn foreign_salt(&self, envelope: &Envelope) -> Result<Option<Aes256Gcm>, VaultError> {
        let Some(encoded_salt) = envelope.salt.as_deref() else {
            if self.salt.is_some() {
                return Err(decryption("envelope was sealed with a random key"));
            }
            return Ok(None);
        };
        let salt = STANDARD
            .decode(encoded_salt)
            .map_err(|e| decryption(format!("invalid salt: {e}")))?;

        if self.salt.as_ref().is_some_and(|own| own.as_slice() == salt.as_slice()) {
            return Ok(None);
        }
        let Some(passphrase) = &self.passphrase else {
            return Err(decryption("envelope requires a passphrase-derived key"));
        };

        if let Some(cipher) = self.derived.lock().ok().and_then(|d| d.get(&salt).cloned()) {
            return Ok(Some(cipher));
        }

        tracing::debug!("Re-deriving key for envelope salt");
        let key = derive_key(passphrase, &salt, self.params)?;
        let cipher = cipher_for(&key)?;
        if let Ok(mut derived) = self.derived.lock() {
            if derived.len() >= MAX_DERIVED_CIPHERS {
                derived.clear();
            }
            derived.insert(salt, cipher.clone());
        }
        Ok(Some(cipher))
    }

    /// Number of foreign-salt keys currently held.
    pub fn derived_keys(&self) -> usize {
        self.derived.lock().map(|d| d.len()).unwrap_or(0)
    }
}

impl std::fmt::Debug for TokenCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCipher")
            .field("algorithm", &ALGORITHM)
            .field("passphrase_derived", &self.is_passphrase_derived())
            .finish()
    }
}

fn cipher_for(key: &DerivedKey) -> Result<Aes256Gcm, VaultError> {
    Aes256Gcm::new_from_slice(key.as_bytes()).map_err(|e| VaultError::Encryption {
        reason: format!("invalid key: {e}"),
    })
}

fn decryption(reason: impl Into<String>) -> VaultError {
    VaultError::Decryption {
        reason: reason.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::TEST_KDF_PARAMS;
    use proptest::prelude::*;

    fn passphrase_cipher(pass: &str) -> TokenCipher {
        TokenCipher::from_passphrase(SecretString::from(pass.to_string()), TEST_KDF_PARAMS)
            .expect("cipher should build")
    }

    #[test]
    fn test_round_trip_edge_strings() {
        let cipher = TokenCipher::random().expect("cipher should build");
        for token in ["", "plain-token", "jeton-\u{e9}\u{e8}-\u{1f511}-\u{4e2d}\u{6587}"] {
            let sealed = cipher.encrypt(token).expect("encrypt should succeed");
            assert_ne!(sealed, token);
            assert_eq!(cipher.decrypt(&sealed).expect("decrypt should succeed"), token);
        }
    }

    #[test]
    fn test_envelope_shape() {
        let cipher = passphrase_cipher("hunter22");
        let envelope = Envelope::parse(&cipher.encrypt("abc").expect("encrypt should succeed"))
            .expect("envelope should parse");
        assert_eq!(envelope.algorithm, ALGORITHM);
        assert_eq!(STANDARD.decode(&envelope.iv).expect("iv is base64").len(), NONCE_LENGTH);
        assert_eq!(
            STANDARD.decode(envelope.salt.expect("salt present")).expect("salt is base64").len(),
            SALT_LENGTH
        );

        let random = TokenCipher::random().expect("cipher should build");
        let envelope = Envelope::parse(&random.encrypt("abc").expect("encrypt should succeed"))
            .expect("envelope should parse");
        assert!(envelope.salt.is_none());
    }

    #[test]
    fn test_nonce_is_fresh_per_encryption() {
        let cipher = TokenCipher::random().expect("cipher should build");
        let a = cipher.encrypt("same").expect("encrypt should succeed");
        let b = cipher.encrypt("same").expect("encrypt should succeed");
        assert_ne!(a, b);
    }

    #[test]
    fn test_tampered_ciphertext_is_rejected() {
        let cipher = TokenCipher::random().expect("cipher should build");
        let mut envelope = Envelope::parse(&cipher.encrypt("secret-value").expect("encrypt should succeed"))
            .expect("envelope should parse");
        let mut data = STANDARD.decode(&envelope.data).expect("data is base64");
        data[0] ^= 0xff;
        envelope.data = STANDARD.encode(data);
        let tampered = envelope.encode().expect("encode should succeed");

        let err = cipher.decrypt(&tampered).expect_err("tampered data should fail");
        assert!(matches!(err, VaultError::Decryption { .. }));
    }

    #[test]
    fn test_foreign_random_key_is_rejected() {
        let a = TokenCipher::random().expect("cipher should build");
        let b = TokenCipher::random().expect("cipher should build");
        let sealed = a.encrypt("value").expect("encrypt should succeed");
        assert!(matches!(b.decrypt(&sealed), Err(VaultError::Decryption { .. })));
        assert!(matches!(b.decrypt("not base64 !!"), Err(VaultError::Decryption { .. })));
    }

    #[test]
    fn test_same_passphrase_decrypts_across_instances() {
        let first = passphrase_cipher("correct horse");
        let second = passphrase_cipher("correct horse");
        let sealed = first.encrypt("persisted").expect("encrypt should succeed");
        assert_eq!(second.decrypt(&sealed).expect("decrypt should succeed"), "persisted");

        let wrong = passphrase_cipher("battery staple");
        assert!(matches!(wrong.decrypt(&sealed), Err(VaultError::Decryption { .. })));
    }

    #[test]
    fn test_foreign_salt_key_is_derived_once() {
        let first = passphrase_cipher("correct horse");
        let other = passphrase_cipher("correct horse");
        let second = passphrase_cipher("correct horse");
        let reader = passphrase_cipher("correct horse");

        let sealed = first.encrypt("one").expect("encrypt should succeed");
        let resealed = first.encrypt("two").expect("encrypt should succeed");
        assert_eq!(reader.decrypt(&sealed).expect("decrypt should succeed"), "one");
        assert_eq!(reader.decrypt(&resealed).expect("decrypt should succeed"), "two");
        assert_eq!(reader.derived_keys(), 1);

        let own = reader.encrypt("own").expect("encrypt should succeed");
        assert_eq!(reader.decrypt(&own).expect("decrypt should succeed"), "own");
        assert_eq!(reader.derived_keys(), 1);

        for cipher in [&other, &second] {
            let sealed = cipher.encrypt("more").expect("encrypt should succeed");
            assert_eq!(reader.decrypt(&sealed).expect("decrypt should succeed"), "more");
        }
        assert_eq!(reader.derived_keys(), 3);
    }

    proptest! {
        #[test]
        fn prop_round_trip(token in ".{0,64}") {
            let cipher = TokenCipher::random().expect("cipher should build");
            let sealed = cipher.encrypt(&token).expect("encrypt should succeed");
            prop_assert_eq!(cipher.decrypt(&sealed).expect("decrypt should succeed"), token);
        }
    }
}
