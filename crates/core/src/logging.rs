//! Logging initialization.
//!
//! Configures `tracing-subscriber` based on the `[general]` section
//! of `NetpolConfig`. Supports JSON structured logging and
//! human-readable pretty format.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::GeneralConfig;
use crate::error::{ConfigError, NetpolError};

/// Initialize the global tracing subscriber.
///
/// Must be called at most once per process, before any tracing macros are used.
/// `RUST_LOG` takes precedence over `general.log_level` when set.
///
/// # Formats
///
/// * `"json"` - Machine-parseable JSON lines (default for production)
/// * `"pretty"` - Human-readable colored output (for development)
pub fn init_tracing(config: &GeneralConfig) -> Result<(), NetpolError> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let result = match config.log_format.as_str() {
        "json" => tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init(),
        "pretty" => tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().pretty())
            .try_init(),
        other => {
            return Err(ConfigError::InvalidValue {
                field: "general.log_format".to_owned(),
                reason: format!("unknown log format '{other}', expected 'json' or 'pretty'"),
            }
            .into());
        }
    };

    result.map_err(|e| {
        ConfigError::InvalidValue {
            field: "general.log_format".to_owned(),
            reason: format!("failed to initialize tracing subscriber: {e}"),
        }
        .into()
    })
}
