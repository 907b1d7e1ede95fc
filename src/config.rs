//! Configuration management for Visitstream
//!
//! This module handles loading, parsing, validating, and managing
//! configuration from files, environment variables, and CLI overrides.
//! The resulting [`Config`] is passed explicitly to every component at
//! startup; nothing reads the environment after that.

use crate::broker::config::{KafkaSettings, SaslMechanism, SecurityProtocol};
use crate::cli::{Cli, Commands};
use crate::error::{Result, VisitstreamError};
use crate::pipeline::CommitPolicy;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Main configuration structure for Visitstream
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Broker connection and consumer group settings
    #[serde(default)]
    pub kafka: KafkaConfig,

    /// Offset commit policy of the manual-commit report loop
    #[serde(default)]
    pub commit: CommitConfig,

    /// HTTP listener settings
    #[serde(default)]
    pub http: HttpConfig,

    /// Visit store settings
    #[serde(default)]
    pub storage: StorageConfig,

    /// Logging settings
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Seconds to wait for loops and the listener to stop after shutdown
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

fn default_shutdown_grace_secs() -> u64 {
    15
}

/// Kafka configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KafkaConfig {
    /// Kafka brokers (comma-separated)
    #[serde(default = "default_brokers")]
    pub brokers: String,

    /// Topic visits are published to and consumed from
    #[serde(default = "default_topic")]
    pub topic: String,

    /// Consumer group of the insert workers
    #[serde(default = "default_insert_group_id")]
    pub insert_group_id: String,

    /// Number of parallel insert loops sharing the insert group
    #[serde(default = "default_insert_workers")]
    pub insert_workers: usize,

    /// Consumer group of the manual-commit report loop
    #[serde(default = "default_report_group_id")]
    pub report_group_id: String,

    /// Where a new consumer group starts reading ("earliest" or "latest")
    #[serde(default = "default_auto_offset_reset")]
    pub auto_offset_reset: String,

    /// Upper bound on a single poll, in milliseconds
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,

    /// Upper bound on waiting for a delivery report, in milliseconds
    #[serde(default = "default_delivery_timeout_ms")]
    pub delivery_timeout_ms: u64,

    /// Upper bound on the startup metadata request, in milliseconds
    #[serde(default = "default_connect_check_timeout_ms")]
    pub connect_check_timeout_ms: u64,

    /// Create the topic at startup if the cluster does not have it
    #[serde(default = "default_create_topic")]
    pub create_topic: bool,

    /// Partition count of a topic created at startup
    #[serde(default = "default_topic_partitions")]
    pub topic_partitions: i32,

    /// Replication factor of a topic created at startup
    #[serde(default = "default_topic_replication")]
    pub topic_replication: i32,

    /// Security configuration
    #[serde(default)]
    pub security: Option<KafkaSecurityConfig>,
}

fn default_brokers() -> String {
    "localhost:9092".to_string()
}

fn default_topic() -> String {
    "visits".to_string()
}

fn default_insert_group_id() -> String {
    "visits-insert".to_string()
}

fn default_insert_workers() -> usize {
    2
}

fn default_report_group_id() -> String {
    "visits-report".to_string()
}

fn default_auto_offset_reset() -> String {
    "earliest".to_string()
}

fn default_poll_timeout_ms() -> u64 {
    500
}

fn default_delivery_timeout_ms() -> u64 {
    5000
}

fn default_connect_check_timeout_ms() -> u64 {
    10_000
}

fn default_create_topic() -> bool {
    true
}

fn default_topic_partitions() -> i32 {
    1
}

fn default_topic_replication() -> i32 {
    1
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            brokers: default_brokers(),
            topic: default_topic(),
            insert_group_id: default_insert_group_id(),
            insert_workers: default_insert_workers(),
            report_group_id: default_report_group_id(),
            auto_offset_reset: default_auto_offset_reset(),
            poll_timeout_ms: default_poll_timeout_ms(),
            delivery_timeout_ms: default_delivery_timeout_ms(),
            connect_check_timeout_ms: default_connect_check_timeout_ms(),
            create_topic: default_create_topic(),
            topic_partitions: default_topic_partitions(),
            topic_replication: default_topic_replication(),
            security: None,
        }
    }
}

impl KafkaConfig {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn connect_check_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_check_timeout_ms)
    }

    /// Builds the client connection settings.
    ///
    /// # Errors
    ///
    /// Returns `VisitstreamError::Config` if the security protocol or SASL
    /// mechanism name is not recognized.
    pub fn settings(&self) -> Result<KafkaSettings> {
        let mut settings = KafkaSettings::new(&self.brokers)
            .with_auto_offset_reset(&self.auto_offset_reset)
            .with_delivery_timeout(Duration::from_millis(self.delivery_timeout_ms));

        let Some(security) = &self.security else {
            return Ok(settings);
        };

        settings.security_protocol = parse_setting::<SecurityProtocol>(&security.protocol)?;

        if let (Some(username), Some(password)) = (&security.sasl_username, &security.sasl_password)
        {
            let mechanism = match &security.sasl_mechanism {
                Some(name) => parse_setting::<SaslMechanism>(name)?,
                None => SaslMechanism::default(),
            };
            settings = settings.with_sasl(mechanism, username, password);
        }

        if let Some(ca) = &security.ssl_ca_location {
            settings = settings.with_ssl(ca);
        }

        Ok(settings)
    }
}

fn parse_setting<T>(value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|e: T::Err| VisitstreamError::Config(e.to_string()).into())
}

/// Kafka security configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KafkaSecurityConfig {
    /// Security protocol (PLAINTEXT, SSL, SASL_PLAINTEXT, SASL_SSL)
    pub protocol: String,

    /// SASL mechanism (PLAIN, SCRAM-SHA-256, SCRAM-SHA-512)
    pub sasl_mechanism: Option<String>,

    /// SASL username
    pub sasl_username: Option<String>,

    /// SASL password (prefer env var VISITSTREAM_KAFKA_SASL_PASSWORD)
    pub sasl_password: Option<String>,

    /// Path to CA certificate for TLS connections
    pub ssl_ca_location: Option<String>,
}

/// Offset commit configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitConfig {
    /// Finished messages that force a commit
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Seconds after which pending acknowledgements are committed
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
}

fn default_batch_size() -> usize {
    5
}

fn default_interval_secs() -> u64 {
    5
}

impl Default for CommitConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            interval_secs: default_interval_secs(),
        }
    }
}

impl CommitConfig {
    pub fn policy(&self) -> CommitPolicy {
        CommitPolicy::new(self.batch_size, Duration::from_secs(self.interval_secs))
    }
}

/// HTTP listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Address the API listens on
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Seconds a request may take before it is answered with 408
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_listen_addr() -> String {
    "0.0.0.0:5000".to_string()
}

fn default_request_timeout_secs() -> u64 {
    15
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl HttpConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Parses the listen address.
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        self.listen_addr.parse::<SocketAddr>().map_err(|e| {
            VisitstreamError::Config(format!("Invalid listen_addr {}: {}", self.listen_addr, e))
                .into()
        })
    }
}

/// Visit store configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// SQLite database path; defaults to `visits.db` in the data directory
    #[serde(default)]
    pub db_path: Option<PathBuf>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error); `RUST_LOG` wins if set
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json_format: bool,

    /// Also append logs to this file
    #[serde(default)]
    pub file_path: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json_format: false,
            file_path: None,
        }
    }
}

fn env_string(name: &str, target: &mut String) {
    if let Ok(value) = std::env::var(name) {
        *target = value;
    }
}

fn env_parsed<T: FromStr>(name: &str, target: &mut T) {
    if let Ok(value) = std::env::var(name) {
        match value.parse() {
            Ok(parsed) => *target = parsed,
            Err(_) => tracing::warn!("Invalid {}: {}", name, value),
        }
    }
}

impl Config {
    /// Load configuration from file with environment and CLI overrides
    ///
    /// A missing file is not an error: defaults are used and a warning is
    /// logged.
    ///
    /// # Arguments
    ///
    /// * `path` - Path to configuration file
    /// * `cli` - CLI arguments for overrides
    ///
    /// # Errors
    ///
    /// Returns error if the file exists but cannot be read or parsed
    pub fn load(path: &str, cli: &Cli) -> Result<Self> {
        let mut config = if Path::new(path).exists() {
            Self::from_file(path)?
        } else {
            tracing::warn!("Config file not found at {}, using defaults", path);
            Self::default()
        };

        config.apply_env_vars();
        config.apply_cli_overrides(cli);

        Ok(config)
    }

    fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| VisitstreamError::Config(format!("Failed to read config file: {}", e)))?;
        serde_yaml::from_str(&contents)
            .map_err(|e| VisitstreamError::Config(format!("Failed to parse config: {}", e)).into())
    }

    fn apply_env_vars(&mut self) {
        // Kept unprefixed for compatibility with existing deployments.
        env_string("KAFKA_HOST", &mut self.kafka.brokers);

        env_string("VISITSTREAM_KAFKA_TOPIC", &mut self.kafka.topic);
        env_string("VISITSTREAM_INSERT_GROUP_ID", &mut self.kafka.insert_group_id);
        env_string("VISITSTREAM_REPORT_GROUP_ID", &mut self.kafka.report_group_id);
        env_parsed("VISITSTREAM_INSERT_WORKERS", &mut self.kafka.insert_workers);
        env_parsed("VISITSTREAM_KAFKA_CREATE_TOPIC", &mut self.kafka.create_topic);

        env_parsed("VISITSTREAM_COMMIT_BATCH_SIZE", &mut self.commit.batch_size);
        env_parsed(
            "VISITSTREAM_COMMIT_INTERVAL_SECS",
            &mut self.commit.interval_secs,
        );

        env_string("VISITSTREAM_LISTEN_ADDR", &mut self.http.listen_addr);
        env_parsed(
            "VISITSTREAM_HTTP_REQUEST_TIMEOUT_SECS",
            &mut self.http.request_timeout_secs,
        );

        if let Ok(db_path) = std::env::var("VISITSTREAM_DB_PATH") {
            self.storage.db_path = Some(PathBuf::from(db_path));
        }

        env_string("VISITSTREAM_LOG_LEVEL", &mut self.logging.level);
        env_parsed("VISITSTREAM_JSON_LOGS", &mut self.logging.json_format);
        if let Ok(file_path) = std::env::var("VISITSTREAM_LOG_FILE") {
            self.logging.file_path = Some(file_path);
        }

        if let Ok(protocol) = std::env::var("VISITSTREAM_KAFKA_SECURITY_PROTOCOL") {
            self.kafka
                .security
                .get_or_insert_with(KafkaSecurityConfig::default)
                .protocol = protocol;
        }

        if let Some(security) = self.kafka.security.as_mut() {
            if let Ok(mechanism) = std::env::var("VISITSTREAM_KAFKA_SASL_MECHANISM") {
                security.sasl_mechanism = Some(mechanism);
            }
            if let Ok(username) = std::env::var("VISITSTREAM_KAFKA_SASL_USERNAME") {
                security.sasl_username = Some(username);
            }
            if let Ok(password) = std::env::var("VISITSTREAM_KAFKA_SASL_PASSWORD") {
                security.sasl_password = Some(password);
            }
        }
    }

    fn apply_cli_overrides(&mut self, cli: &Cli) {
        if cli.verbose {
            self.logging.level = "debug".to_string();
        }

        match &cli.command {
            Commands::Serve {
                listen: Some(listen),
                ..
            } => {
                self.http.listen_addr = listen.clone();
            }
            Commands::Visits { db: Some(db), .. } => {
                self.storage.db_path = Some(db.clone());
            }
            _ => {}
        }
    }

    /// Validate the configuration
    ///
    /// Ensures all configuration values are within acceptable ranges
    /// and that required fields are properly set.
    ///
    /// # Errors
    ///
    /// Returns `VisitstreamError::Config` describing the first failed check
    pub fn validate(&self) -> Result<()> {
        let kafka = &self.kafka;

        for (name, value) in [
            ("kafka.brokers", &kafka.brokers),
            ("kafka.topic", &kafka.topic),
            ("kafka.insert_group_id", &kafka.insert_group_id),
            ("kafka.report_group_id", &kafka.report_group_id),
        ] {
            if value.trim().is_empty() {
                return Err(VisitstreamError::Config(format!("{} cannot be empty", name)).into());
            }
        }

        if kafka.insert_group_id == kafka.report_group_id {
            return Err(VisitstreamError::Config(
                "kafka.insert_group_id and kafka.report_group_id must differ".to_string(),
            )
            .into());
        }

        if kafka.insert_workers == 0 {
            return Err(VisitstreamError::Config(
                "kafka.insert_workers must be greater than 0".to_string(),
            )
            .into());
        }

        if !["earliest", "latest"].contains(&kafka.auto_offset_reset.as_str()) {
            return Err(VisitstreamError::Config(format!(
                "Invalid kafka.auto_offset_reset: {}. Must be one of: earliest, latest",
                kafka.auto_offset_reset
            ))
            .into());
        }

        if kafka.poll_timeout_ms == 0 || kafka.poll_timeout_ms > 5000 {
            return Err(VisitstreamError::Config(
                "kafka.poll_timeout_ms must be between 1 and 5000".to_string(),
            )
            .into());
        }

        if kafka.delivery_timeout_ms == 0 {
            return Err(VisitstreamError::Config(
                "kafka.delivery_timeout_ms must be greater than 0".to_string(),
            )
            .into());
        }

        if kafka.topic_partitions < 1 || kafka.topic_replication < 1 {
            return Err(VisitstreamError::Config(
                "kafka.topic_partitions and kafka.topic_replication must be at least 1"
                    .to_string(),
            )
            .into());
        }

        if let Some(security) = &kafka.security {
            let protocol = parse_setting::<SecurityProtocol>(&security.protocol)?;
            if let Some(mechanism) = &security.sasl_mechanism {
                parse_setting::<SaslMechanism>(mechanism)?;
            }

            let needs_sasl = matches!(
                protocol,
                SecurityProtocol::SaslPlaintext | SecurityProtocol::SaslSsl
            );
            if needs_sasl
                && (security.sasl_username.is_none() || security.sasl_password.is_none())
            {
                return Err(VisitstreamError::Config(format!(
                    "{} requires sasl_username and sasl_password",
                    protocol.as_str()
                ))
                .into());
            }
        }

        if self.commit.batch_size == 0 {
            return Err(VisitstreamError::Config(
                "commit.batch_size must be greater than 0".to_string(),
            )
            .into());
        }

        if self.commit.interval_secs == 0 {
            return Err(VisitstreamError::Config(
                "commit.interval_secs must be greater than 0".to_string(),
            )
            .into());
        }

        if self.http.request_timeout_secs == 0 {
            return Err(VisitstreamError::Config(
                "http.request_timeout_secs must be greater than 0".to_string(),
            )
            .into());
        }

        self.http.socket_addr()?;

        Ok(())
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            kafka: KafkaConfig::default(),
            commit: CommitConfig::default(),
            http: HttpConfig::default(),
            storage: StorageConfig::default(),
            logging: LoggingConfig::default(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}
