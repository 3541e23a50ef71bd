//! Noteum Vault - Encrypted Token Storage
//!
//! Tokens are validated, sealed with AES-256-GCM and stored in the Record
//! Store's tokens table, with per-owner quotas, expiry handling and a short
//! lived in-memory read cache.
//!
//! # Example
//!
//! ```ignore
//! use noteum_vault::TokenVault;
//!
//! let vault = TokenVault::new(store, VaultConfig::default(), Some(passphrase))?;
//! vault.set_owner_token("user-1", TokenType::Access, &token, None).await?;
//! let tokens = vault.get_owner_tokens("user-1").await?;
//! ```

pub mod cipher;
pub mod key;
pub mod validator;
pub mod vault;

pub use cipher::{Envelope, TokenCipher, ALGORITHM};
pub use key::{derive_key, generate_salt, DerivedKey, KdfParams};
pub use validator::{security_score, TokenFormat, TokenValidation, TokenValidator, ValidationPolicy};
pub use vault::{owner_token_key, TokenMetadata, TokenOperation, TokenOptions, TokenVault, VaultStats};
