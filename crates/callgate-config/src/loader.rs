//! Configuration loading from files and environment.
//!
//! Sources are applied in order (later sources replace earlier ones),
//! `${VAR}` / `${VAR:-default}` references are substituted in file content,
//! and `<PREFIX>_*` environment variables override individual fields last.

use crate::schema::GateConfig;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info, warn};

/// Environment prefix used by [`load_config`]
pub const ENV_PREFIX: &str = "CALLGATE";

/// Errors raised while reading gate settings
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Named file does not exist
    #[error("gate config file {path} does not exist")]
    FileNotFound {
        /// Missing path
        path: String,
    },

    /// File could not be read
    #[error("failed to read gate config: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed YAML
    #[error("invalid YAML in gate config: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Malformed TOML
    #[error("invalid TOML in gate config: {0}")]
    Toml(#[from] toml::de::Error),

    /// Malformed JSON
    #[error("invalid JSON in gate config: {0}")]
    Json(#[from] serde_json::Error),

    /// Settings parsed but failed range or cross-field checks
    #[error("gate config rejected: {0}")]
    Validation(String),

    /// Environment override could not be parsed
    #[error("Invalid value for {name}: {value}")]
    InvalidOverride {
        /// Variable name
        name: String,
        /// Offending value
        value: String,
    },

    /// File extension is not yaml, yml, toml or json
    #[error("cannot load gate config from .{extension} files")]
    UnsupportedFormat {
        /// Offending extension
        extension: String,
    },
}

/// Configuration source
#[derive(Debug, Clone)]
pub enum ConfigSource {
    /// File path
    File(PathBuf),
    /// Raw YAML string
    Yaml(String),
    /// Raw TOML string
    Toml(String),
    /// Raw JSON string
    Json(String),
    /// Default configuration
    Default,
}

/// Configuration loader
#[derive(Debug, Default)]
pub struct ConfigLoader {
    sources: Vec<ConfigSource>,
    env_prefix: Option<String>,
}

impl ConfigLoader {
    /// Empty loader; with no sources it yields the defaults
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a source; later sources replace earlier ones
    #[must_use]
    pub fn with_source(mut self, source: ConfigSource) -> Self {
        self.sources.push(source);
        self
    }

    /// Add a file source
    #[must_use]
    pub fn with_file(self, path: impl Into<PathBuf>) -> Self {
        self.with_source(ConfigSource::File(path.into()))
    }

    /// Apply `<PREFIX>_*` variables after all sources
    #[must_use]
    pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = Some(prefix.into());
        self
    }

    /// Read every source, apply overrides and validate the result
    ///
    /// # Errors
    /// Any read, parse, override or validation failure
    pub async fn load(self) -> Result<GateConfig, ConfigError> {
        let mut config = GateConfig::default();

        for source in &self.sources {
            config = Self::load_source(source).await?;
        }

        if let Some(ref prefix) = self.env_prefix {
            Self::apply_env_overrides(&mut config, prefix)?;
        }

        config
            .validate_config()
            .map_err(|e| ConfigError::Validation(e.to_string()))?;

        info!(sources = self.sources.len(), "Configuration loaded");
        Ok(config)
    }

    async fn load_source(source: &ConfigSource) -> Result<GateConfig, ConfigError> {
        match source {
            ConfigSource::File(path) => Self::load_file(path).await,
            ConfigSource::Yaml(content) => Ok(serde_yaml::from_str(&substitute_env_vars(content))?),
            ConfigSource::Toml(content) => Ok(toml::from_str(&substitute_env_vars(content))?),
            ConfigSource::Json(content) => Ok(serde_json::from_str(&substitute_env_vars(content))?),
            ConfigSource::Default => Ok(GateConfig::default()),
        }
    }

    async fn load_file(path: &Path) -> Result<GateConfig, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.display().to_string(),
            });
        }

        let content = fs::read_to_string(path).await?;
        let content = substitute_env_vars(&content);

        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_lowercase();

        debug!(path = %path.display(), format = %extension, "Loading configuration file");

        match extension.as_str() {
            "yaml" | "yml" => Ok(serde_yaml::from_str(&content)?),
            "toml" => Ok(toml::from_str(&content)?),
            "json" => Ok(serde_json::from_str(&content)?),
            ext => Err(ConfigError::UnsupportedFormat {
                extension: ext.to_string(),
            }),
        }
    }

    fn apply_env_overrides(config: &mut GateConfig, prefix: &str) -> Result<(), ConfigError> {
        if let Some(level) = env_var(prefix, "LOG_LEVEL") {
            config.observability.logging.level = level;
        }

        if let Some(path) = env_var(prefix, "STORAGE_PATH") {
            config.storage.path = Some(PathBuf::from(path));
        }

        if let Some(quota) = env_var(prefix, "DAILY_TOKEN_QUOTA") {
            config.quota.daily_token_quota = Some(parse_override(prefix, "DAILY_TOKEN_QUOTA", &quota)?);
        }

        if let Some(budget) = env_var(prefix, "MONTHLY_BUDGET_USD") {
            config.quota.monthly_budget_usd =
                Some(parse_override(prefix, "MONTHLY_BUDGET_USD", &budget)?);
        }

        if let Some(rpm) = env_var(prefix, "REQUESTS_PER_MINUTE") {
            config.rate_limit.requests_per_minute = parse_override(prefix, "REQUESTS_PER_MINUTE", &rpm)?;
        }

        Ok(())
    }
}

fn env_var(prefix: &str, name: &str) -> Option<String> {
    std::env::var(format!("{prefix}_{name}")).ok()
}

fn parse_override<T: std::str::FromStr>(prefix: &str, name: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidOverride {
        name: format!("{prefix}_{name}"),
        value: value.to_string(),
    })
}

/// Substitute environment variables in content
///
/// Supports `${VAR}` and `${VAR:-default}`; unknown variables without a
/// default are left in place and logged.
#[allow(clippy::expect_used)]
fn substitute_env_vars(content: &str) -> String {
    let re = regex::Regex::new(r"\$\{([^}]+)\}").expect("valid regex");

    re.replace_all(content, |caps: &regex::Captures<'_>| {
        let spec = &caps[1];
        let (name, default) = match spec.split_once(":-") {
            Some((name, default)) => (name, Some(default)),
            None => (spec, None),
        };

        match (std::env::var(name), default) {
            (Ok(value), _) => value,
            (Err(_), Some(default)) => default.to_string(),
            (Err(_), None) => {
                warn!(variable = name, "Environment variable not found");
                caps[0].to_string()
            }
        }
    })
    .into_owned()
}

/// Load configuration from default locations
///
/// Looks for configuration in order:
/// 1. Path from the `CALLGATE_CONFIG` environment variable
/// 2. ./callgate.yaml
/// 3. ./config/callgate.yaml
///
/// Falls back to defaults (plus environment overrides) when none exists.
///
/// # Errors
/// Returns error if a configuration file is found but fails to parse or validate
pub async fn load_config() -> Result<GateConfig, ConfigError> {
    let search_paths: Vec<PathBuf> = match std::env::var(format!("{ENV_PREFIX}_CONFIG")) {
        Ok(path) => vec![PathBuf::from(path)],
        Err(_) => vec![
            PathBuf::from("callgate.yaml"),
            PathBuf::from("config/callgate.yaml"),
        ],
    };

    let loader = ConfigLoader::new().with_env_prefix(ENV_PREFIX);

    for path in search_paths {
        if path.exists() {
            info!(path = %path.display(), "Loading configuration");
            return loader.with_file(path).load().await;
        }
    }

    warn!("No configuration file found, using defaults");
    loader.with_source(ConfigSource::Default).load().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_env_var_substitution() {
        std::env::set_var("CALLGATE_TEST_SUBST", "0.75");

        let result = substitute_env_vars("failure_ratio: ${CALLGATE_TEST_SUBST}");
        assert_eq!(result, "failure_ratio: 0.75");

        std::env::remove_var("CALLGATE_TEST_SUBST");
    }

    #[test]
    fn test_env_var_with_default() {
        let result = substitute_env_vars("path: ${CALLGATE_TEST_NONEXISTENT:-/tmp/gate.db}");
        assert_eq!(result, "path: /tmp/gate.db");
    }

    #[test]
    fn test_missing_env_var_left_in_place() {
        let result = substitute_env_vars("path: ${CALLGATE_TEST_MISSING}");
        assert_eq!(result, "path: ${CALLGATE_TEST_MISSING}");
    }

    #[tokio::test]
    async fn test_load_yaml_content() {
        let yaml = r#"
rate_limit:
  requests_per_minute: 20
  burst_size: 5
quota:
  daily_token_quota: 100000
circuit_breaker:
  break_duration: 45s
"#;

        let config = ConfigLoader::new()
            .with_source(ConfigSource::Yaml(yaml.to_string()))
            .load()
            .await
            .expect("load config");

        assert_eq!(config.rate_limit.requests_per_minute, 20);
        assert_eq!(config.rate_limit.burst_size, 5);
        assert_eq!(config.quota.daily_token_quota, Some(100_000));
        assert_eq!(config.circuit_breaker.break_duration, Duration::from_secs(45));
    }

    #[tokio::test]
    async fn test_load_toml_content() {
        let toml = r#"
[cache]
memory_capacity = 500
default_ttl = "1h"

[quota]
monthly_budget_usd = 25.0
"#;

        let config = ConfigLoader::new()
            .with_source(ConfigSource::Toml(toml.to_string()))
            .load()
            .await
            .expect("load config");

        assert_eq!(config.cache.memory_capacity, 500);
        assert_eq!(config.cache.default_ttl, Duration::from_secs(3600));
        assert_eq!(config.quota.monthly_budget_usd, Some(25.0));
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let yaml = "circuit_breaker:\n  failure_ratio: 3.0\n";
        let result = ConfigLoader::new()
            .with_source(ConfigSource::Yaml(yaml.to_string()))
            .load()
            .await;
        assert!(matches!(result, Err(ConfigError::Validation(_))));
    }

    #[tokio::test]
    async fn test_missing_file() {
        let result = ConfigLoader::new()
            .with_file("/nonexistent/callgate.yaml")
            .load()
            .await;
        assert!(matches!(result, Err(ConfigError::FileNotFound { .. })));
    }

    #[tokio::test]
    async fn test_env_overrides() {
        std::env::set_var("CGTEST_OVR_DAILY_TOKEN_QUOTA", "5000");
        std::env::set_var("CGTEST_OVR_REQUESTS_PER_MINUTE", "12");
        std::env::set_var("CGTEST_OVR_STORAGE_PATH", "/var/lib/callgate/state.db");

        let config = ConfigLoader::new()
            .with_source(ConfigSource::Default)
            .with_env_prefix("CGTEST_OVR")
            .load()
            .await
            .expect("load config");

        assert_eq!(config.quota.daily_token_quota, Some(5000));
        assert_eq!(config.rate_limit.requests_per_minute, 12);
        assert_eq!(
            config.storage.path,
            Some(PathBuf::from("/var/lib/callgate/state.db"))
        );

        std::env::remove_var("CGTEST_OVR_DAILY_TOKEN_QUOTA");
        std::env::remove_var("CGTEST_OVR_REQUESTS_PER_MINUTE");
        std::env::remove_var("CGTEST_OVR_STORAGE_PATH");
    }

    #[tokio::test]
    async fn test_bad_env_override() {
        std::env::set_var("CGTEST_BAD_MONTHLY_BUDGET_USD", "lots");

        let result = ConfigLoader::new()
            .with_env_prefix("CGTEST_BAD")
            .load()
            .await;
        assert!(matches!(result, Err(ConfigError::InvalidOverride { .. })));

        std::env::remove_var("CGTEST_BAD_MONTHLY_BUDGET_USD");
    }
}
