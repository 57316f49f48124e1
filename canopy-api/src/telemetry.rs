//! Tracing subscriber setup.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Filter used when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "canopy_cache=debug,canopy_api=debug,info";

#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("Failed to init subscriber: {0}")]
    SubscriberInit(String),
}

/// Install the global tracing subscriber.
///
/// Call once at startup before anything logs. `RUST_LOG` overrides
/// [`DEFAULT_FILTER`]; `json` switches the formatter to JSON lines.
pub fn init_tracing(json: bool) -> Result<(), TelemetryError> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let registry = tracing_subscriber::registry().with(env_filter);
    let result = if json {
        registry.with(tracing_subscriber::fmt::layer().json()).try_init()
    } else {
        registry.with(tracing_subscriber::fmt::layer()).try_init()
    };
    result.map_err(|e| TelemetryError::SubscriberInit(e.to_string()))?;

    tracing::info!(json, "Telemetry initialized");
    Ok(())
}
