//! Tracing Subscriber Initialization
//!
//! Installs a global `tracing-subscriber` registry with an `EnvFilter` and a
//! plain or JSON formatting layer.

use thiserror::Error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Filter used when `RUST_LOG` is unset.
pub const DEFAULT_LOG_FILTER: &str = "bulwark=info";

/// Errors from subscriber installation.
#[derive(Debug, Error)]
pub enum TracingError {
    #[error("Failed to init subscriber: {0}")]
    Init(String),
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TracingConfig {
    /// Directive used when `RUST_LOG` is unset or invalid.
    pub default_filter: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
    /// Include the event target (module path).
    pub with_target: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            default_filter: DEFAULT_LOG_FILTER.to_string(),
            json: false,
            with_target: true,
        }
    }
}

impl TracingConfig {
    /// Create TracingConfig from environment variables.
    ///
    /// # Environment Variables
    /// - `BULWARK_LOG_FILTER`: fallback filter directive (default: `bulwark=info`)
    /// - `BULWARK_LOG_FORMAT`: `json` for JSON lines, anything else for plain text
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an injectable lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        Self {
            default_filter: lookup("BULWARK_LOG_FILTER").unwrap_or(defaults.default_filter),
            json: lookup("BULWARK_LOG_FORMAT")
                .map(|format| format.eq_ignore_ascii_case("json"))
                .unwrap_or(defaults.json),
            with_target: defaults.with_target,
        }
    }
}

/// Install the global tracing subscriber.
///
/// Idempotent: when a global subscriber is already installed it is left in
/// place and `Ok(())` is returned.
pub fn init_tracing(config: &TracingConfig) -> Result<(), TracingError> {
    if tracing::dispatcher::has_been_set() {
        tracing::debug!("Tracing already initialized");
        return Ok(());
    }

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.default_filter));

    let registry = tracing_subscriber::registry().with(env_filter);
    let result = if config.json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(config.with_target),
            )
            .try_init()
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(config.with_target))
            .try_init()
    };
    result.map_err(|e| TracingError::Init(e.to_string()))?;

    tracing::info!(json = config.json, filter = %config.default_filter, "Tracing initialized");
    Ok(())
}
