//! Configuration loading.
//!
//! A TOML file mirrors [`NoteumConfig`] section by section; omitted sections
//! and fields take their defaults. Without a file the `NOTEUM_*` environment
//! variables are used. Either way the result is validated before use.
//!
//! ```toml
//! [cache]
//! strategy = "adaptive"
//! max_entries = 500
//!
//! [vault]
//! max_tokens_per_owner = 10
//! ```

use std::path::Path;

use noteum_core::{ConfigError, NoteumConfig};
use secrecy::SecretString;

use crate::error::{RuntimeError, RuntimeResult};

/// Path of a TOML config file.
pub const CONFIG_PATH_ENV: &str = "NOTEUM_CONFIG";

/// Vault passphrase. Never part of the config file.
pub const PASSPHRASE_ENV: &str = "NOTEUM_VAULT_PASSPHRASE";

/// Parse and validate a TOML document.
pub fn parse_config(contents: &str) -> Result<NoteumConfig, ConfigError> {
    let config: NoteumConfig = toml::from_str(contents).map_err(|e| ConfigError::Parse {
        reason: e.to_string(),
    })?;
    config.validate()?;
    Ok(config)
}

pub fn load_config(path: impl AsRef<Path>) -> RuntimeResult<NoteumConfig> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path).map_err(|e| RuntimeError::Io {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    let config = parse_config(&contents)?;
    tracing::debug!(path = %path.display(), "Configuration loaded");
    Ok(config)
}

/// Config from the file named by `NOTEUM_CONFIG`, or from the environment.
pub fn load_from_env() -> RuntimeResult<NoteumConfig> {
    match std::env::var(CONFIG_PATH_ENV) {
        Ok(path) if !path.trim().is_empty() => load_config(path),
        _ => {
            let config = NoteumConfig::from_env();
            config.validate()?;
            Ok(config)
        }
    }
}

pub fn passphrase_from_env() -> Option<SecretString> {
    std::env::var(PASSPHRASE_ENV)
        .ok()
        .filter(|p| !p.is_empty())
        .map(SecretString::from)
}
