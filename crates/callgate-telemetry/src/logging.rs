//! Structured logging setup.
//!
//! Installs a `tracing-subscriber` registry with:
//! - An `EnvFilter` built from `RUST_LOG`, or the configured level plus extra directives
//! - A pretty, compact or JSON formatter

use callgate_config::{LogFormat, LoggingConfig};
use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Initialize the global subscriber from the observability config
///
/// # Errors
/// Returns error if the filter does not parse or a global subscriber is already set
pub fn init_logging(config: &LoggingConfig) -> Result<(), LoggingError> {
    let filter = build_filter(config)?;

    let layer = match config.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_target(true)
            .with_current_span(true)
            .boxed(),
        LogFormat::Pretty => fmt::layer().pretty().with_target(true).boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(false).boxed(),
    };

    tracing_subscriber::registry()
        .with(layer.with_filter(filter))
        .try_init()
        .map_err(|e| LoggingError::Init(e.to_string()))
}

/// Build the event filter.
///
/// `RUST_LOG` wins when set and no explicit directives are configured;
/// configured directives are appended to the base level otherwise.
///
/// # Errors
/// Returns error if the level or directives do not parse
pub fn build_filter(config: &LoggingConfig) -> Result<EnvFilter, LoggingError> {
    match config.filter.as_deref() {
        Some(directives) if !directives.trim().is_empty() => {
            EnvFilter::try_new(format!("{},{}", config.level, directives))
                .map_err(|e| LoggingError::FilterParse(e.to_string()))
        }
        _ => match EnvFilter::try_from_default_env() {
            Ok(filter) => Ok(filter),
            Err(_) => EnvFilter::try_new(&config.level)
                .map_err(|e| LoggingError::FilterParse(e.to_string())),
        },
    }
}

/// Map a configured level name onto a tracing level, defaulting to INFO
#[must_use]
pub fn tracing_level(level: &str) -> Level {
    match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" | "warning" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

/// Logging initialization error
#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    /// Failed to initialize logging
    #[error("Failed to initialize logging: {0}")]
    Init(String),
    /// Failed to parse filter
    #[error("Failed to parse log filter: {0}")]
    FilterParse(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracing_level() {
        assert_eq!(tracing_level("trace"), Level::TRACE);
        assert_eq!(tracing_level("DEBUG"), Level::DEBUG);
        assert_eq!(tracing_level("Warning"), Level::WARN);
        assert_eq!(tracing_level("error"), Level::ERROR);
        assert_eq!(tracing_level("verbose"), Level::INFO);
    }

    #[test]
    fn test_filter_with_directives() {
        let config = LoggingConfig {
            level: "debug".to_string(),
            format: LogFormat::Compact,
            filter: Some("rusqlite=warn".to_string()),
        };
        let filter = build_filter(&config).unwrap();
        let rendered = filter.to_string();
        assert!(rendered.contains("debug"));
        assert!(rendered.contains("rusqlite=warn"));
    }

    #[test]
    fn test_filter_rejects_garbage() {
        let config = LoggingConfig {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            filter: Some("callgate=loud".to_string()),
        };
        assert!(matches!(
            build_filter(&config),
            Err(LoggingError::FilterParse(_))
        ));
    }

    #[test]
    fn test_init_twice_fails() {
        let config = LoggingConfig {
            level: "warn".to_string(),
            format: LogFormat::Json,
            filter: Some("callgate=info".to_string()),
        };
        let _ = init_logging(&config);
        assert!(matches!(init_logging(&config), Err(LoggingError::Init(_))));
    }
}
