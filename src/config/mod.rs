//! Application configuration.
//!
//! Aggregates broker, publisher, consumer and mail settings into a single
//! Config struct that can be loaded from YAML files or environment variables.

mod messaging;

pub use messaging::{
    BrokerConfig, ConsumerConfig, PublisherConfig, DEFAULT_BROKER_URL, DEFAULT_EXCHANGE,
    DEFAULT_QUEUE,
};

use serde::Deserialize;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "NOTIFIER_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "NOTIFIER";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "NOTIFIER_LOG";

/// Legacy environment variable for the broker URL.
pub const AMQP_URL_ENV_VAR: &str = "AMQP_URL";
/// Legacy environment variable for the mail sender.
pub const EMAIL_FROM_ENV_VAR: &str = "EMAIL_FROM";

/// Errors raised while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load config: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("Invalid broker URL '{0}': expected amqp:// or amqps://")]
    InvalidUrl(String),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Outgoing mail settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct MailConfig {
    /// Sender address.
    pub from: String,
}

impl Default for MailConfig {
    fn default() -> Self {
        Self {
            from: "notifications@localhost".to_string(),
        }
    }
}

/// Main application configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Config {
    pub broker: BrokerConfig,
    pub publisher: PublisherConfig,
    pub consumer: ConsumerConfig,
    pub mail: MailConfig,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `config.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Legacy `AMQP_URL` / `EMAIL_FROM`
    /// 5. Environment variables with `CONFIG_ENV_PREFIX` prefix
    ///
    /// The result is validated before it is returned.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        // Legacy env vars lose to their prefixed counterparts
        if std::env::var(format!("{}__BROKER__URL", CONFIG_ENV_PREFIX)).is_err() {
            builder = builder.set_override_option("broker.url", std::env::var(AMQP_URL_ENV_VAR).ok())?;
        }
        if std::env::var(format!("{}__MAIL__FROM", CONFIG_ENV_PREFIX)).is_err() {
            builder = builder.set_override_option("mail.from", std::env::var(EMAIL_FROM_ENV_VAR).ok())?;
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("consumer.patterns")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the bus cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let url = self.broker.url.trim();
        if url.is_empty() {
            return Err(ConfigError::Invalid("broker.url is required".to_string()));
        }
        if !(url.starts_with("amqp://") || url.starts_with("amqps://")) {
            return Err(ConfigError::InvalidUrl(url.to_string()));
        }
        if self.broker.exchange.trim().is_empty() {
            return Err(ConfigError::Invalid("broker.exchange is required".to_string()));
        }
        if self.publisher.buffer_capacity == 0 {
            return Err(ConfigError::Invalid(
                "publisher.buffer_capacity must be at least 1".to_string(),
            ));
        }
        if self.consumer.prefetch == 0 {
            return Err(ConfigError::Invalid(
                "consumer.prefetch must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
