//! ==============================================================================
//! logging.rs - tracing subscriber setup
//! ==============================================================================
//!
//! the filter comes from `RUST_LOG` when set, otherwise from `logging.level`
//! in host.toml.
//!
//! ==============================================================================

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("Failed to initialize tracing subscriber: {0}")]
    TracingInit(String),

    #[error("Invalid log filter {filter:?}: {reason}")]
    InvalidFilter { filter: String, reason: String },
}

pub fn init(level: &str) -> Result<(), LoggingError> {
    let filter = create_env_filter(level)?;

    Registry::default()
        .with(fmt::layer().with_target(false).compact())
        .with(filter)
        .try_init()
        .map_err(|e| LoggingError::TracingInit(e.to_string()))
}

fn create_env_filter(default_level: &str) -> Result<EnvFilter, LoggingError> {
    let directive = std::env::var("RUST_LOG").unwrap_or_else(|_| default_level.to_string());
    parse_filter(&directive)
}

fn parse_filter(directive: &str) -> Result<EnvFilter, LoggingError> {
    EnvFilter::try_new(directive).map_err(|e| LoggingError::InvalidFilter {
        filter: directive.to_string(),
        reason: e.to_string(),
    })
}
