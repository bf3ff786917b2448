//! Configuration for the pipeline binaries.
//!
//! Loads TOML with environment variable substitution.
//!
//! # Example
//!
//! ```toml
//! [server]
//! port = 3000
//! api_key = "${ADMIN_API_KEY}"
//!
//! [broker]
//! url = "redis://localhost:6379"
//!
//! [topics]
//! primary = "catalog:sync"
//! dlq = "catalog:sync:dlq"
//! partitions = 2
//!
//! [retry]
//! initial_ms = 1000
//! multiplier = 2.0
//! max_interval_ms = 10000
//! max_elapsed_ms = 30000
//! ```

use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

use regex::Regex;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::retry::RetryPolicy;
use crate::{DEFAULT_CONSUMER_GROUP, DEFAULT_DLQ_GROUP, DEFAULT_DLQ_TOPIC, DEFAULT_PRIMARY_TOPIC};

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Read(#[from] std::io::Error),

    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("validation error: {0}")]
    Validation(String),
}

/// Root configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub broker: BrokerConfig,

    #[serde(default)]
    pub topics: TopicsConfig,

    #[serde(default)]
    pub consumer: ConsumerConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub alerts: AlertsConfig,
}

/// Operator API server configuration
#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    /// Bearer token for the admin surface. Unset means no auth (dev only).
    #[serde(default)]
    pub api_key: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            api_key: None,
        }
    }
}

fn default_port() -> u16 {
    3000
}

/// Broker connection configuration
#[derive(Debug, Deserialize, Clone)]
pub struct BrokerConfig {
    /// `redis://` for production, `memory://` for development.
    #[serde(default = "default_broker_url")]
    pub url: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: default_broker_url(),
        }
    }
}

fn default_broker_url() -> String {
    "redis://localhost:6379".to_string()
}

/// Topic layout configuration
#[derive(Debug, Deserialize, Clone)]
pub struct TopicsConfig {
    #[serde(default = "default_primary_topic")]
    pub primary: String,

    #[serde(default = "default_dlq_topic")]
    pub dlq: String,

    /// Partition count of the primary topic. The DLQ topic always has one.
    #[serde(default = "default_partitions")]
    pub partitions: u32,
}

impl Default for TopicsConfig {
    fn default() -> Self {
        Self {
            primary: default_primary_topic(),
            dlq: default_dlq_topic(),
            partitions: default_partitions(),
        }
    }
}

fn default_primary_topic() -> String {
    DEFAULT_PRIMARY_TOPIC.to_string()
}

fn default_dlq_topic() -> String {
    DEFAULT_DLQ_TOPIC.to_string()
}

fn default_partitions() -> u32 {
    2
}

/// Consumer group configuration
#[derive(Debug, Deserialize, Clone)]
pub struct ConsumerConfig {
    #[serde(default = "default_consumer_group")]
    pub group: String,

    #[serde(default = "default_dlq_group")]
    pub dlq_group: String,

    /// Worker name override. Defaults to hostname, then a random id.
    #[serde(default)]
    pub name: Option<String>,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            group: default_consumer_group(),
            dlq_group: default_dlq_group(),
            name: None,
        }
    }
}

fn default_consumer_group() -> String {
    DEFAULT_CONSUMER_GROUP.to_string()
}

fn default_dlq_group() -> String {
    DEFAULT_DLQ_GROUP.to_string()
}

/// Retry/backoff configuration
#[derive(Debug, Deserialize, Clone)]
pub struct RetryConfig {
    #[serde(default = "default_initial_ms")]
    pub initial_ms: u64,

    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    #[serde(default = "default_max_interval_ms")]
    pub max_interval_ms: u64,

    #[serde(default = "default_max_elapsed_ms")]
    pub max_elapsed_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_ms: default_initial_ms(),
            multiplier: default_multiplier(),
            max_interval_ms: default_max_interval_ms(),
            max_elapsed_ms: default_max_elapsed_ms(),
        }
    }
}

fn default_initial_ms() -> u64 {
    1000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_interval_ms() -> u64 {
    10000
}

fn default_max_elapsed_ms() -> u64 {
    30000
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            initial: Duration::from_millis(config.initial_ms),
            multiplier: config.multiplier,
            max_interval: Duration::from_millis(config.max_interval_ms),
            max_elapsed: Duration::from_millis(config.max_elapsed_ms),
        }
    }
}

/// DLQ alert configuration
#[derive(Debug, Deserialize, Clone, Default)]
pub struct AlertsConfig {
    #[serde(default)]
    pub webhook: Option<AlertWebhookConfig>,
}

/// Webhook alert sink configuration
#[derive(Debug, Deserialize, Clone)]
pub struct AlertWebhookConfig {
    pub url: String,

    #[serde(default = "default_alert_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_alert_timeout_ms() -> u64 {
    10000
}

impl AppConfig {
    /// Load configuration from the default path or the `SYNCOPATE_CONFIG`
    /// env var.
    pub fn load() -> Result<Self, ConfigError> {
        let path =
            env::var("SYNCOPATE_CONFIG").unwrap_or_else(|_| "config/syncopate.toml".to_string());
        Self::load_from(&path)
    }

    /// Load configuration from a specific path. A missing file is not an
    /// error; defaults apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            info!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }

        info!(path = %path.display(), "loading configuration");

        let content = fs::read_to_string(path)?;
        let content = substitute_env_vars(&content);

        debug!("parsing TOML configuration");
        let config: AppConfig = toml::from_str(&content)?;

        config.validate()?;

        info!(
            broker = %config.broker.url,
            primary = %config.topics.primary,
            dlq = %config.topics.dlq,
            partitions = config.topics.partitions,
            "configuration loaded"
        );

        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.topics.primary.is_empty() || self.topics.dlq.is_empty() {
            return Err(ConfigError::Validation(
                "topic names must not be empty".to_string(),
            ));
        }
        if self.topics.primary == self.topics.dlq {
            return Err(ConfigError::Validation(
                "primary and DLQ topics must be distinct".to_string(),
            ));
        }
        if self.topics.partitions == 0 {
            return Err(ConfigError::Validation(
                "partitions must be at least 1".to_string(),
            ));
        }
        if self.retry.multiplier < 1.0 {
            return Err(ConfigError::Validation(format!(
                "retry multiplier must be at least 1.0, got {}",
                self.retry.multiplier
            )));
        }

        if let Some(webhook) = &self.alerts.webhook {
            if webhook.url.contains("${") {
                warn!(
                    url = %webhook.url,
                    "alert webhook URL contains an unsubstituted environment variable"
                );
            }
            if !webhook.url.starts_with("http://") && !webhook.url.starts_with("https://") {
                return Err(ConfigError::Validation(format!(
                    "alert webhook URL must start with http:// or https://, got '{}'",
                    webhook.url
                )));
            }
        }

        Ok(())
    }

    /// Retry policy derived from the retry section.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::from(&self.retry)
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(content: &str) -> String {
    let re = match Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}") {
        Ok(re) => re,
        Err(_) => return content.to_string(),
    };

    re.replace_all(content, |caps: &regex::Captures| {
        let var_name = &caps[1];
        match env::var(var_name) {
            Ok(value) => value,
            Err(_) => {
                debug!(var = %var_name, "environment variable not set, keeping placeholder");
                caps[0].to_string()
            }
        }
    })
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.broker.url, "redis://localhost:6379");
        assert_eq!(config.topics.primary, "catalog:sync");
        assert_eq!(config.topics.dlq, "catalog:sync:dlq");
        assert_eq!(config.topics.partitions, 2);
        assert_eq!(config.consumer.group, "catalog_sync_workers");
        assert_eq!(config.consumer.dlq_group, "catalog_dlq_triage");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_retry_policy_matches_backoff_settings() {
        let policy = AppConfig::default().retry_policy();
        assert_eq!(policy.initial, Duration::from_secs(1));
        assert_eq!(policy.multiplier, 2.0);
        assert_eq!(policy.max_interval, Duration::from_secs(10));
        assert_eq!(policy.max_elapsed, Duration::from_secs(30));
    }

    #[test]
    fn test_parse_partial_config() {
        let toml = r#"
            [server]
            port = 4000

            [topics]
            partitions = 4
        "#;

        let config: AppConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.server.port, 4000);
        assert_eq!(config.topics.partitions, 4);
        assert_eq!(config.topics.primary, "catalog:sync");
        assert_eq!(config.broker.url, "redis://localhost:6379");
    }

    #[test]
    fn test_env_var_substitution() {
        env::set_var("SYNCOPATE_TEST_VAR", "substituted_value");
        let input = "api_key = \"${SYNCOPATE_TEST_VAR}\"";
        let output = substitute_env_vars(input);
        assert_eq!(output, "api_key = \"substituted_value\"");
        env::remove_var("SYNCOPATE_TEST_VAR");
    }

    #[test]
    fn test_env_var_not_set_keeps_placeholder() {
        let input = "api_key = \"${SYNCOPATE_NONEXISTENT_VAR}\"";
        let output = substitute_env_vars(input);
        assert_eq!(output, "api_key = \"${SYNCOPATE_NONEXISTENT_VAR}\"");
    }

    #[test]
    fn test_validation_rejects_identical_topics() {
        let toml = r#"
            [topics]
            primary = "same"
            dlq = "same"
        "#;
        let config: AppConfig = toml::from_str(toml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_zero_partitions() {
        let toml = r#"
            [topics]
            partitions = 0
        "#;
        let config: AppConfig = toml::from_str(toml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_shrinking_multiplier() {
        let toml = r#"
            [retry]
            multiplier = 0.5
        "#;
        let config: AppConfig = toml::from_str(toml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_bad_webhook_url() {
        let toml = r#"
            [alerts.webhook]
            url = "not-a-url"
        "#;
        let config: AppConfig = toml::from_str(toml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_alert_webhook() {
        let toml = r#"
            [alerts.webhook]
            url = "https://hooks.example.com/dlq"
            timeout_ms = 5000
        "#;
        let config: AppConfig = toml::from_str(toml).unwrap();
        let webhook = config.alerts.webhook.unwrap();
        assert_eq!(webhook.url, "https://hooks.example.com/dlq");
        assert_eq!(webhook.timeout_ms, 5000);
    }
}
