//! Tracing subscriber setup.

use noteum_core::TelemetryConfig;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::error::{RuntimeError, RuntimeResult};

/// Install the global subscriber. `RUST_LOG` overrides the configured
/// filter. Fails if a subscriber is already installed.
pub fn init_tracing(config: &TelemetryConfig) -> RuntimeResult<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_filter))
        .map_err(|e| RuntimeError::Telemetry {
            reason: format!("invalid filter {}: {e}", config.log_filter),
        })?;

    let registry = tracing_subscriber::registry().with(filter);
    let result = if config.json {
        registry.with(fmt::layer().json()).try_init()
    } else {
        registry.with(fmt::layer()).try_init()
    };
    result.map_err(|e| RuntimeError::Telemetry { reason: e.to_string() })?;

    tracing::info!(filter = %config.log_filter, json = config.json, "Tracing initialized");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_is_an_error() {
        let config = TelemetryConfig::default();
        let _ = init_tracing(&config);
        let err = init_tracing(&config).expect_err("second init should fail");
        assert!(matches!(err, RuntimeError::Telemetry { .. }));
    }
}
