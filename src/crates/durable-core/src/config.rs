//! Engine configuration
//!
//! [`EngineConfig`] is loaded from TOML. Every field has a default, so an
//! empty document is a valid configuration. String values may reference the
//! environment as `${VAR}` or `${VAR:default}`; references are expanded before
//! parsing.
//!
//! ```toml
//! [execution]
//! max_concurrency = 6
//! condition_max_attempts = 100
//! default_poll_delay_secs = 5
//!
//! [retry]
//! max_attempts = 2
//! interval_seconds = 1.0
//! backoff_rate = 2.0
//!
//! [logging]
//! level = "${DURABLE_LOG:info}"
//! format = "compact"
//! ```

use crate::error::{DurableError, Result};
use crate::retry::RetryPolicy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Top-level engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct EngineConfig {
    /// Execution limits
    #[serde(default)]
    pub execution: ExecutionConfig,

    /// Default retry policy for steps without their own
    #[serde(default)]
    pub retry: RetryConfig,

    /// Logging output
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Execution limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Maximum concurrently running fan-out branches per map/parallel call
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Iteration cap for condition waits without an explicit cap
    #[serde(default = "default_condition_max_attempts")]
    pub condition_max_attempts: u32,

    /// Delay between condition polls when the check does not supply one
    #[serde(default = "default_poll_delay_secs")]
    pub default_poll_delay_secs: u64,

    /// Timeout for callback waits called without one (absent = wait indefinitely)
    #[serde(default)]
    pub default_callback_timeout_secs: Option<u64>,
}

fn default_max_concurrency() -> usize {
    6
}

fn default_condition_max_attempts() -> u32 {
    100
}

fn default_poll_delay_secs() -> u64 {
    5
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            condition_max_attempts: default_condition_max_attempts(),
            default_poll_delay_secs: default_poll_delay_secs(),
            default_callback_timeout_secs: None,
        }
    }
}

impl ExecutionConfig {
    /// Default poll delay as a `Duration`
    pub fn default_poll_delay(&self) -> Duration {
        Duration::from_secs(self.default_poll_delay_secs)
    }

    /// Default callback timeout as a `Duration`
    pub fn default_callback_timeout(&self) -> Option<Duration> {
        self.default_callback_timeout_secs.map(Duration::from_secs)
    }
}

/// Engine-wide default retry policy.
///
/// `max_attempts = 0` (the default) disables retries for steps that do not
/// configure their own policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries after the first attempt
    #[serde(default)]
    pub max_attempts: u32,

    /// Delay before the first retry, in seconds
    #[serde(default = "default_interval_seconds")]
    pub interval_seconds: f64,

    /// Delay multiplier per retry
    #[serde(default = "default_backoff_rate")]
    pub backoff_rate: f64,

    /// Cap for a single delay, in seconds
    #[serde(default)]
    pub max_interval_seconds: Option<f64>,

    /// Randomize delays
    #[serde(default)]
    pub jitter: bool,
}

fn default_interval_seconds() -> f64 {
    1.0
}

fn default_backoff_rate() -> f64 {
    2.0
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            interval_seconds: default_interval_seconds(),
            backoff_rate: default_backoff_rate(),
            max_interval_seconds: None,
            jitter: false,
        }
    }
}

impl RetryConfig {
    /// Policy applied to steps without their own, if retries are enabled
    pub fn to_policy(&self) -> Option<RetryPolicy> {
        if self.max_attempts == 0 {
            return None;
        }

        let mut policy = RetryPolicy::new(self.max_attempts)
            .with_interval(self.interval_seconds)
            .with_backoff_rate(self.backoff_rate)
            .with_jitter(self.jitter);
        if let Some(max) = self.max_interval_seconds {
            policy = policy.with_max_interval(max);
        }
        Some(policy)
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Multi-line human readable output
    Pretty,
    /// Single-line output
    #[default]
    Compact,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter directive (`info`, `durable_core=debug`, ...); `RUST_LOG` overrides it
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format
    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

impl EngineConfig {
    /// Parse a TOML document, expanding environment references first
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content)?;
        let config: EngineConfig = toml::from_str(&expanded)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        debug!(path = %path.display(), "loading engine configuration");
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Load from `path` if given, otherwise use defaults
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => Ok(Self::default()),
        }
    }

    /// Serialize back to TOML
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| DurableError::Configuration(e.to_string()))
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<()> {
        if self.execution.max_concurrency == 0 {
            return Err(DurableError::Configuration(
                "execution.max_concurrency must be at least 1".to_string(),
            ));
        }
        if self.execution.condition_max_attempts == 0 {
            return Err(DurableError::Configuration(
                "execution.condition_max_attempts must be at least 1".to_string(),
            ));
        }
        if self.retry.interval_seconds < 0.0 {
            return Err(DurableError::Configuration(
                "retry.interval_seconds must not be negative".to_string(),
            ));
        }
        if self.retry.backoff_rate < 1.0 {
            return Err(DurableError::Configuration(
                "retry.backoff_rate must be at least 1.0".to_string(),
            ));
        }
        if let Some(max) = self.retry.max_interval_seconds {
            if max < 0.0 {
                return Err(DurableError::Configuration(
                    "retry.max_interval_seconds must not be negative".to_string(),
                ));
            }
        }
        if self.logging.level.trim().is_empty() {
            return Err(DurableError::Configuration("logging.level must not be empty".to_string()));
        }
        Ok(())
    }
}

/// Expand `${VAR}` and `${VAR:default}` references
pub fn expand_env_vars(content: &str) -> Result<String> {
    if !content.contains("${") {
        return Ok(content.to_string());
    }

    let re = Regex::new(r"\$\{([^:}]+)(?::([^}]*))?\}")
        .map_err(|e| DurableError::Configuration(e.to_string()))?;

    let expanded = re.replace_all(content, |caps: &regex::Captures<'_>| {
        let default_value = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        env::var(&caps[1]).unwrap_or_else(|_| default_value.to_string())
    });
    Ok(expanded.into_owned())
}

/// Install the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over [`LoggingConfig::level`]. Fails if a
/// subscriber is already installed.
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| DurableError::Configuration(format!("invalid log filter: {}", e)))?;

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let installed = match config.format {
        LogFormat::Pretty => builder.pretty().try_init(),
        LogFormat::Compact => builder.compact().try_init(),
    };
    installed.map_err(|e| DurableError::Configuration(format!("tracing already initialised: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = EngineConfig::from_toml_str("").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.execution.max_concurrency, 6);
        assert!(config.retry.to_policy().is_none());
    }

    #[test]
    fn test_sections_parse() {
        let config = EngineConfig::from_toml_str(
            r#"
            [execution]
            max_concurrency = 2
            condition_max_attempts = 10
            default_callback_timeout_secs = 3600

            [retry]
            max_attempts = 3
            backoff_rate = 1.5

            [logging]
            level = "debug"
            format = "pretty"
            "#,
        )
        .unwrap();

        assert_eq!(config.execution.max_concurrency, 2);
        assert_eq!(config.execution.default_poll_delay_secs, 5);
        assert_eq!(
            config.execution.default_callback_timeout(),
            Some(Duration::from_secs(3600))
        );
        let policy = config.retry.to_policy().unwrap();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.backoff_rate, 1.5);
        assert_eq!(config.logging.format, LogFormat::Pretty);
    }

    #[test]
    fn test_env_expansion_with_default() {
        env::set_var("DURABLE_TEST_CONCURRENCY", "3");
        let expanded = expand_env_vars(
            "max = ${DURABLE_TEST_CONCURRENCY}\nlevel = \"${DURABLE_TEST_MISSING_LEVEL:warn}\"",
        )
        .unwrap();
        assert_eq!(expanded, "max = 3\nlevel = \"warn\"");
        env::remove_var("DURABLE_TEST_CONCURRENCY");
    }

    #[test]
    fn test_validation_rejects_zero_concurrency() {
        let err = EngineConfig::from_toml_str("[execution]\nmax_concurrency = 0").unwrap_err();
        assert!(matches!(err, DurableError::Configuration(_)));

        let err = EngineConfig::from_toml_str("[retry]\nbackoff_rate = 0.5").unwrap_err();
        assert!(matches!(err, DurableError::Configuration(_)));
    }

    #[test]
    fn test_malformed_toml() {
        let err = EngineConfig::from_toml_str("[execution\nmax_concurrency = 1").unwrap_err();
        assert!(matches!(err, DurableError::Toml(_)));
    }

    #[test]
    fn test_load_from_file() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let mut file = NamedTempFile::new()?;
        writeln!(file, "[execution]\ncondition_max_attempts = 7")?;

        let config = EngineConfig::load(Some(file.path()))?;
        assert_eq!(config.execution.condition_max_attempts, 7);

        let round_trip = EngineConfig::from_toml_str(&config.to_toml_string()?)?;
        assert_eq!(round_trip, config);
        Ok(())
    }
}
