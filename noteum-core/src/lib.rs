//! Noteum Core - Data Model
//!
//! Records, tables, errors and configuration shared by every storage crate.
//! This crate contains no I/O.

pub mod config;
pub mod constants;
pub mod error;
pub mod record;

pub use config::*;
pub use error::*;
pub use record::*;

use chrono::{DateTime, Utc};

/// Current time truncated to whole milliseconds, the resolution records are
/// persisted at. Using it for stamps keeps in-memory and stored copies equal.
pub fn now() -> Timestamp {
    let now = Utc::now();
    DateTime::from_timestamp_millis(now.timestamp_millis()).unwrap_or(now)
}
