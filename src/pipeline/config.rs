//! Engine configuration.
//!
//! Values are layered, later layers winning: [`EngineConfig::default`], an
//! optional YAML file, `PUZZLE_FORGE_*` environment variables, and finally
//! command-line flags applied by the CLI through the builder methods.

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::retry::{duration_secs, RetryPolicy};

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable or flag has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    /// The configuration file is not valid YAML for this schema.
    #[error("Invalid configuration file: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// IO error while reading configuration.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// How pending items are dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// A fixed pool of workers, one remote call per item.
    #[default]
    Streaming,
    /// Provider-side batch jobs, submitted chunk by chunk and polled.
    Batch,
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionMode::Streaming => f.write_str("streaming"),
            ExecutionMode::Batch => f.write_str("batch"),
        }
    }
}

impl FromStr for ExecutionMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "streaming" | "stream" | "pool" => Ok(ExecutionMode::Streaming),
            "batch" => Ok(ExecutionMode::Batch),
            other => Err(ConfigError::InvalidValue {
                key: "mode".to_string(),
                message: format!("expected 'streaming' or 'batch', got '{}'", other),
            }),
        }
    }
}

/// Configuration for one engine run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Dispatch strategy; each stage has its own default.
    pub mode: Option<ExecutionMode>,
    /// Number of streaming workers.
    pub concurrency: usize,
    /// Items per provider batch job.
    pub batch_size: usize,
    /// Fixed pause before each remote call.
    #[serde(with = "duration_secs")]
    pub request_delay: Duration,
    /// Upper bound of the random extra pause before each remote call.
    #[serde(with = "duration_secs")]
    pub request_jitter: Duration,
    /// Completions between periodic checkpoint saves (streaming mode).
    pub save_interval: usize,
    /// Chunks between periodic checkpoint saves (batch mode).
    pub batch_save_every: usize,
    /// Pause between batch status polls.
    #[serde(with = "duration_secs")]
    pub poll_interval: Duration,
    /// How often the progress monitor logs.
    #[serde(with = "duration_secs")]
    pub progress_interval: Duration,
    /// Backoff for rate-limited calls.
    pub retry: RetryPolicy,
    /// Re-attempt items whose checkpoint record is a failure.
    pub retry_failed: bool,
    /// Model override; each stage has its own default.
    pub model: Option<String>,
    /// Temperature override.
    pub temperature: Option<f64>,
    /// Generation limit override.
    pub max_tokens: Option<u32>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            mode: None,
            concurrency: 5,
            batch_size: 20,
            request_delay: Duration::from_millis(500),
            request_jitter: Duration::from_millis(400),
            save_interval: 100,
            batch_save_every: 5,
            poll_interval: Duration::from_secs(8),
            progress_interval: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            retry_failed: false,
            model: None,
            temperature: None,
            max_tokens: None,
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads a YAML file. Missing keys keep their defaults.
    pub fn from_yaml_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    pub fn from_yaml_str(content: &str) -> Result<Self, ConfigError> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(content)?)
    }

    /// Creates configuration from defaults and environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable has an invalid value or the result
    /// does not validate.
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Self::default().apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Overrides fields from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `PUZZLE_FORGE_MODE`: `streaming` or `batch`
    /// - `PUZZLE_FORGE_CONCURRENCY`: Worker count (default: 5)
    /// - `PUZZLE_FORGE_BATCH_SIZE`: Items per batch job (default: 20)
    /// - `PUZZLE_FORGE_REQUEST_DELAY_SECS`: Pause before each call (default: 0.5)
    /// - `PUZZLE_FORGE_REQUEST_JITTER_SECS`: Random extra pause bound (default: 0.4)
    /// - `PUZZLE_FORGE_SAVE_INTERVAL`: Completions between saves (default: 100)
    /// - `PUZZLE_FORGE_BATCH_SAVE_EVERY`: Chunks between saves (default: 5)
    /// - `PUZZLE_FORGE_POLL_INTERVAL_SECS`: Batch poll interval (default: 8)
    /// - `PUZZLE_FORGE_MAX_RETRIES`: Attempt ceiling (default: 8)
    /// - `PUZZLE_FORGE_RETRY_BUDGET_SECS`: Retry time budget (default: 300)
    /// - `PUZZLE_FORGE_RETRY_FAILED`: Re-attempt failure records (default: false)
    /// - `PUZZLE_FORGE_MODEL`: Model override
    /// - `PUZZLE_FORGE_TEMPERATURE`: Temperature override
    /// - `PUZZLE_FORGE_MAX_TOKENS`: Generation limit override
    pub fn apply_env(self) -> Result<Self, ConfigError> {
        self.apply_vars(|key| std::env::var(key).ok())
    }

    fn apply_vars<F>(mut self, var: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(val) = var("PUZZLE_FORGE_MODE") {
            self.mode = Some(val.parse()?);
        }

        if let Some(val) = var("PUZZLE_FORGE_CONCURRENCY") {
            self.concurrency = parse_env_value(&val, "PUZZLE_FORGE_CONCURRENCY")?;
        }

        if let Some(val) = var("PUZZLE_FORGE_BATCH_SIZE") {
            self.batch_size = parse_env_value(&val, "PUZZLE_FORGE_BATCH_SIZE")?;
        }

        if let Some(val) = var("PUZZLE_FORGE_REQUEST_DELAY_SECS") {
            self.request_delay = parse_env_secs(&val, "PUZZLE_FORGE_REQUEST_DELAY_SECS")?;
        }

        if let Some(val) = var("PUZZLE_FORGE_REQUEST_JITTER_SECS") {
            self.request_jitter = parse_env_secs(&val, "PUZZLE_FORGE_REQUEST_JITTER_SECS")?;
        }

        if let Some(val) = var("PUZZLE_FORGE_SAVE_INTERVAL") {
            self.save_interval = parse_env_value(&val, "PUZZLE_FORGE_SAVE_INTERVAL")?;
        }

        if let Some(val) = var("PUZZLE_FORGE_BATCH_SAVE_EVERY") {
            self.batch_save_every = parse_env_value(&val, "PUZZLE_FORGE_BATCH_SAVE_EVERY")?;
        }

        if let Some(val) = var("PUZZLE_FORGE_POLL_INTERVAL_SECS") {
            self.poll_interval = parse_env_secs(&val, "PUZZLE_FORGE_POLL_INTERVAL_SECS")?;
        }

        if let Some(val) = var("PUZZLE_FORGE_MAX_RETRIES") {
            self.retry.max_attempts = parse_env_value(&val, "PUZZLE_FORGE_MAX_RETRIES")?;
        }

        if let Some(val) = var("PUZZLE_FORGE_RETRY_BUDGET_SECS") {
            self.retry.max_elapsed = parse_env_secs(&val, "PUZZLE_FORGE_RETRY_BUDGET_SECS")?;
        }

        if let Some(val) = var("PUZZLE_FORGE_RETRY_FAILED") {
            self.retry_failed = parse_env_bool(&val, "PUZZLE_FORGE_RETRY_FAILED")?;
        }

        if let Some(val) = var("PUZZLE_FORGE_MODEL") {
            self.model = Some(val);
        }

        if let Some(val) = var("PUZZLE_FORGE_TEMPERATURE") {
            self.temperature = Some(parse_env_value(&val, "PUZZLE_FORGE_TEMPERATURE")?);
        }

        if let Some(val) = var("PUZZLE_FORGE_MAX_TOKENS") {
            self.max_tokens = Some(parse_env_value(&val, "PUZZLE_FORGE_MAX_TOKENS")?);
        }

        Ok(self)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency == 0 {
            return Err(ConfigError::ValidationFailed(
                "concurrency must be greater than 0".to_string(),
            ));
        }

        if self.batch_size == 0 {
            return Err(ConfigError::ValidationFailed(
                "batch_size must be greater than 0".to_string(),
            ));
        }

        if self.save_interval == 0 {
            return Err(ConfigError::ValidationFailed(
                "save_interval must be greater than 0".to_string(),
            ));
        }

        if self.batch_save_every == 0 {
            return Err(ConfigError::ValidationFailed(
                "batch_save_every must be greater than 0".to_string(),
            ));
        }

        if self.retry.max_attempts == 0 {
            return Err(ConfigError::ValidationFailed(
                "retry.max_attempts must be greater than 0".to_string(),
            ));
        }

        if self.retry.base.is_nan() || self.retry.base < 1.0 {
            return Err(ConfigError::ValidationFailed(
                "retry.base must be at least 1.0".to_string(),
            ));
        }

        if let Some(temperature) = self.temperature {
            if !(0.0..=1.0).contains(&temperature) {
                return Err(ConfigError::ValidationFailed(
                    "temperature must be between 0.0 and 1.0".to_string(),
                ));
            }
        }

        if self.max_tokens == Some(0) {
            return Err(ConfigError::ValidationFailed(
                "max_tokens must be greater than 0".to_string(),
            ));
        }

        if self.model.as_deref().is_some_and(|m| m.trim().is_empty()) {
            return Err(ConfigError::ValidationFailed(
                "model cannot be empty".to_string(),
            ));
        }

        Ok(())
    }

    /// The configured mode, or `default` when none was set.
    pub fn mode_or(&self, default: ExecutionMode) -> ExecutionMode {
        self.mode.unwrap_or(default)
    }

    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    /// Sets the fixed delay and jitter bound before each call.
    pub fn with_pacing(mut self, delay: Duration, jitter: Duration) -> Self {
        self.request_delay = delay;
        self.request_jitter = jitter;
        self
    }

    pub fn with_save_interval(mut self, interval: usize) -> Self {
        self.save_interval = interval;
        self
    }

    pub fn with_batch_save_every(mut self, chunks: usize) -> Self {
        self.batch_save_every = chunks;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_retry_failed(mut self, retry_failed: bool) -> Self {
        self.retry_failed = retry_failed;
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }
}

/// Parse an environment variable value into a type.
fn parse_env_value<T: FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

/// Parse an environment variable holding (fractional) seconds.
fn parse_env_secs(value: &str, key: &str) -> Result<Duration, ConfigError> {
    let secs: f64 = parse_env_value(value, key)?;
    Duration::try_from_secs_f64(secs).map_err(|e| ConfigError::InvalidValue {
        key: key.to_string(),
        message: e.to_string(),
    })
}

/// Parse an environment variable as a boolean.
fn parse_env_bool(value: &str, key: &str) -> Result<bool, ConfigError> {
    match value.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected boolean value, got '{}'", value),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.mode, None);
        assert_eq!(config.concurrency, 5);
        assert_eq!(config.batch_size, 20);
        assert_eq!(config.request_delay, Duration::from_millis(500));
        assert_eq!(config.save_interval, 100);
        assert_eq!(config.poll_interval, Duration::from_secs(8));
        assert_eq!(config.retry.max_attempts, 8);
        assert_eq!(config.retry.max_elapsed, Duration::from_secs(300));
        assert!(!config.retry_failed);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = EngineConfig::new()
            .with_mode(ExecutionMode::Batch)
            .with_concurrency(8)
            .with_batch_size(50)
            .with_pacing(Duration::from_secs(2), Duration::ZERO)
            .with_save_interval(10)
            .with_batch_save_every(1)
            .with_poll_interval(Duration::from_millis(10))
            .with_retry_failed(true)
            .with_model("claude-3-5-haiku-20241022")
            .with_temperature(0.7)
            .with_max_tokens(20000);

        assert_eq!(config.mode, Some(ExecutionMode::Batch));
        assert_eq!(config.concurrency, 8);
        assert_eq!(config.batch_size, 50);
        assert_eq!(config.request_delay, Duration::from_secs(2));
        assert_eq!(config.request_jitter, Duration::ZERO);
        assert_eq!(config.save_interval, 10);
        assert_eq!(config.model.as_deref(), Some("claude-3-5-haiku-20241022"));
        assert_eq!(config.max_tokens, Some(20000));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_failures() {
        let cases = [
            (EngineConfig::default().with_concurrency(0), "concurrency"),
            (EngineConfig::default().with_batch_size(0), "batch_size"),
            (EngineConfig::default().with_save_interval(0), "save_interval"),
            (EngineConfig::default().with_batch_save_every(0), "batch_save_every"),
            (
                EngineConfig::default().with_retry(RetryPolicy::default().with_max_attempts(0)),
                "max_attempts",
            ),
            (
                EngineConfig::default().with_retry(RetryPolicy::default().with_base(0.5)),
                "retry.base",
            ),
            (EngineConfig::default().with_temperature(1.5), "temperature"),
            (EngineConfig::default().with_max_tokens(0), "max_tokens"),
            (EngineConfig::default().with_model(" "), "model"),
        ];

        for (config, needle) in cases {
            let err = config.validate().expect_err(needle);
            assert!(err.to_string().contains(needle), "{} not in {}", needle, err);
        }
    }

    #[test]
    fn test_apply_vars() {
        let config = EngineConfig::default()
            .apply_vars(vars(&[
                ("PUZZLE_FORGE_MODE", "batch"),
                ("PUZZLE_FORGE_CONCURRENCY", "12"),
                ("PUZZLE_FORGE_REQUEST_DELAY_SECS", "1.5"),
                ("PUZZLE_FORGE_RETRY_FAILED", "yes"),
                ("PUZZLE_FORGE_RETRY_BUDGET_SECS", "60"),
                ("PUZZLE_FORGE_MODEL", "claude-test"),
            ]))
            .expect("apply");

        assert_eq!(config.mode, Some(ExecutionMode::Batch));
        assert_eq!(config.concurrency, 12);
        assert_eq!(config.request_delay, Duration::from_millis(1500));
        assert!(config.retry_failed);
        assert_eq!(config.retry.max_elapsed, Duration::from_secs(60));
        assert_eq!(config.model.as_deref(), Some("claude-test"));
    }

    #[test]
    fn test_apply_vars_invalid() {
        let err = EngineConfig::default()
            .apply_vars(vars(&[("PUZZLE_FORGE_CONCURRENCY", "many")]))
            .expect_err("invalid");
        assert!(err.to_string().contains("PUZZLE_FORGE_CONCURRENCY"));

        let err = EngineConfig::default()
            .apply_vars(vars(&[("PUZZLE_FORGE_POLL_INTERVAL_SECS", "-1")]))
            .expect_err("negative");
        assert!(err.to_string().contains("PUZZLE_FORGE_POLL_INTERVAL_SECS"));
    }

    #[test]
    fn test_from_yaml() {
        let yaml = r#"
mode: batch
batch_size: 10
request_delay: 2.0
retry:
  max_attempts: 3
retry_failed: true
"#;
        let config = EngineConfig::from_yaml_str(yaml).expect("yaml");
        assert_eq!(config.mode, Some(ExecutionMode::Batch));
        assert_eq!(config.batch_size, 10);
        assert_eq!(config.request_delay, Duration::from_secs(2));
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.base, 2.0);
        assert_eq!(config.concurrency, 5);
        assert!(config.retry_failed);

        assert_eq!(EngineConfig::from_yaml_str("").expect("empty"), EngineConfig::default());
        assert!(EngineConfig::from_yaml_str("concurrency: [1").is_err());
    }

    #[test]
    fn test_from_yaml_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("engine.yaml");
        std::fs::write(&path, "concurrency: 2\n").expect("write");
        assert_eq!(
            EngineConfig::from_yaml_file(&path).expect("file").concurrency,
            2
        );
        assert!(matches!(
            EngineConfig::from_yaml_file(&dir.path().join("missing.yaml")),
            Err(ConfigError::Io(_))
        ));
    }

    #[test]
    fn test_execution_mode_parse() {
        assert_eq!("Batch".parse::<ExecutionMode>().expect("batch"), ExecutionMode::Batch);
        assert_eq!(
            "streaming".parse::<ExecutionMode>().expect("streaming"),
            ExecutionMode::Streaming
        );
        assert!("parallel".parse::<ExecutionMode>().is_err());
        assert_eq!(ExecutionMode::Batch.to_string(), "batch");
    }

    #[test]
    fn test_parse_env_bool() {
        assert!(parse_env_bool("true", "test").expect("bool"));
        assert!(parse_env_bool("ON", "test").expect("bool"));
        assert!(!parse_env_bool("0", "test").expect("bool"));
        assert!(parse_env_bool("maybe", "test").is_err());
    }
}
