//! Noteum Runtime - Storage Context
//!
//! Opens every storage component in dependency order behind a single
//! [`StorageContext`], loads configuration from TOML or the environment, and
//! installs the tracing subscriber.

pub mod config;
pub mod context;
pub mod error;
pub mod telemetry;

pub use config::{
    load_config, load_from_env, parse_config, passphrase_from_env, CONFIG_PATH_ENV, PASSPHRASE_ENV,
};
pub use context::{Backend, ContextOptions, StorageContext};
pub use error::{RuntimeError, RuntimeResult};
pub use telemetry::init_tracing;
