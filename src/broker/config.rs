//! Kafka connection settings.
//!
//! This module provides the connection settings shared by the producer and
//! every consumer, with support for TLS and SASL authentication. Settings
//! are rendered into librdkafka key/value pairs.
//!
//! # Example
//!
//! ```rust
//! use visitstream::broker::config::{KafkaSettings, SaslMechanism, SecurityProtocol};
//!
//! let settings = KafkaSettings::new("kafka.example.com:9093")
//!     .with_sasl(SaslMechanism::ScramSha256, "username", "password");
//! assert_eq!(settings.security_protocol, SecurityProtocol::SaslSsl);
//! ```

use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Errors raised when parsing connection setting names.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum SettingsError {
    /// Invalid security protocol specified.
    #[error("Invalid security protocol: {0}")]
    InvalidSecurityProtocol(String),

    /// Invalid SASL mechanism specified.
    #[error("Invalid SASL mechanism: {0}")]
    InvalidSaslMechanism(String),
}

/// Security protocol for the Kafka connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum SecurityProtocol {
    /// No encryption or authentication.
    #[default]
    Plaintext,
    /// TLS encryption without SASL.
    Ssl,
    /// SASL authentication without TLS.
    SaslPlaintext,
    /// SASL authentication with TLS encryption.
    SaslSsl,
}

impl SecurityProtocol {
    /// Returns the librdkafka configuration string for this protocol.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Plaintext => "PLAINTEXT",
            Self::Ssl => "SSL",
            Self::SaslPlaintext => "SASL_PLAINTEXT",
            Self::SaslSsl => "SASL_SSL",
        }
    }
}

impl FromStr for SecurityProtocol {
    type Err = SettingsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "PLAINTEXT" => Ok(Self::Plaintext),
            "SSL" => Ok(Self::Ssl),
            "SASL_PLAINTEXT" => Ok(Self::SaslPlaintext),
            "SASL_SSL" => Ok(Self::SaslSsl),
            _ => Err(SettingsError::InvalidSecurityProtocol(s.to_string())),
        }
    }
}

/// SASL authentication mechanism.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum SaslMechanism {
    /// PLAIN mechanism (username/password in clear text).
    Plain,
    /// SCRAM-SHA-256 mechanism.
    #[default]
    ScramSha256,
    /// SCRAM-SHA-512 mechanism.
    ScramSha512,
}

impl SaslMechanism {
    /// Returns the librdkafka configuration string for this mechanism.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Plain => "PLAIN",
            Self::ScramSha256 => "SCRAM-SHA-256",
            Self::ScramSha512 => "SCRAM-SHA-512",
        }
    }
}

impl FromStr for SaslMechanism {
    type Err = SettingsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "PLAIN" => Ok(Self::Plain),
            "SCRAM-SHA-256" => Ok(Self::ScramSha256),
            "SCRAM-SHA-512" => Ok(Self::ScramSha512),
            _ => Err(SettingsError::InvalidSaslMechanism(s.to_string())),
        }
    }
}

/// SASL credentials.
#[derive(Debug, Clone)]
pub struct SaslConfig {
    /// Authentication mechanism to use.
    pub mechanism: SaslMechanism,
    /// SASL username.
    pub username: String,
    /// SASL password.
    pub password: String,
}

/// Connection settings for the Kafka producer and consumers.
#[derive(Debug, Clone)]
pub struct KafkaSettings {
    /// Kafka broker addresses (comma-separated).
    pub brokers: String,

    /// Security protocol for the connection.
    pub security_protocol: SecurityProtocol,

    /// SASL configuration (required for SASL protocols).
    pub sasl_config: Option<SaslConfig>,

    /// Path to a CA certificate for TLS connections.
    pub ssl_ca_location: Option<String>,

    /// Auto offset reset policy for new consumer groups ("earliest" or "latest").
    pub auto_offset_reset: String,

    /// Consumer session timeout.
    pub session_timeout: Duration,

    /// Upper bound on how long the producer waits for a delivery report.
    pub delivery_timeout: Duration,
}

impl KafkaSettings {
    /// Creates settings with plaintext defaults.
    ///
    /// # Example
    ///
    /// ```rust
    /// use visitstream::broker::config::KafkaSettings;
    ///
    /// let settings = KafkaSettings::new("localhost:9092");
    /// assert_eq!(settings.auto_offset_reset, "earliest");
    /// ```
    pub fn new(brokers: &str) -> Self {
        Self {
            brokers: brokers.to_string(),
            security_protocol: SecurityProtocol::default(),
            sasl_config: None,
            ssl_ca_location: None,
            auto_offset_reset: "earliest".to_string(),
            session_timeout: Duration::from_secs(30),
            delivery_timeout: Duration::from_secs(5),
        }
    }

    /// Configures SASL authentication.
    ///
    /// This also switches the security protocol to `SaslSsl` unless SASL
    /// over plaintext was already selected.
    pub fn with_sasl(mut self, mechanism: SaslMechanism, username: &str, password: &str) -> Self {
        if self.security_protocol != SecurityProtocol::SaslPlaintext {
            self.security_protocol = SecurityProtocol::SaslSsl;
        }
        self.sasl_config = Some(SaslConfig {
            mechanism,
            username: username.to_string(),
            password: password.to_string(),
        });
        self
    }

    /// Configures TLS with a CA certificate.
    pub fn with_ssl(mut self, ca_location: &str) -> Self {
        self.ssl_ca_location = Some(ca_location.to_string());
        self
    }

    /// Sets the auto offset reset policy.
    pub fn with_auto_offset_reset(mut self, policy: &str) -> Self {
        self.auto_offset_reset = policy.to_string();
        self
    }

    /// Sets the producer delivery timeout.
    pub fn with_delivery_timeout(mut self, timeout: Duration) -> Self {
        self.delivery_timeout = timeout;
        self
    }

    /// Settings shared by producers and consumers.
    pub fn common_settings(&self) -> Vec<(String, String)> {
        let mut settings = vec![
            ("bootstrap.servers".to_string(), self.brokers.clone()),
            (
                "security.protocol".to_string(),
                self.security_protocol.as_str().to_string(),
            ),
        ];

        if let Some(sasl) = &self.sasl_config {
            settings.push((
                "sasl.mechanism".to_string(),
                sasl.mechanism.as_str().to_string(),
            ));
            settings.push(("sasl.username".to_string(), sasl.username.clone()));
            settings.push(("sasl.password".to_string(), sasl.password.clone()));
        }

        if let Some(ca) = &self.ssl_ca_location {
            settings.push(("ssl.ca.location".to_string(), ca.clone()));
        }

        settings
    }

    /// Settings for the producer.
    ///
    /// `acks=all` so a delivery report means every in-sync replica has the
    /// message.
    pub fn producer_settings(&self) -> Vec<(String, String)> {
        let mut settings = self.common_settings();
        settings.push(("acks".to_string(), "all".to_string()));
        settings.push((
            "message.timeout.ms".to_string(),
            self.delivery_timeout.as_millis().to_string(),
        ));
        settings
    }

    /// Settings for a consumer in `group_id`.
    ///
    /// With `manual_commit` the broker never commits on its own and the
    /// owning loop decides when offsets are acknowledged.
    pub fn consumer_settings(&self, group_id: &str, manual_commit: bool) -> Vec<(String, String)> {
        let mut settings = self.common_settings();
        settings.push(("group.id".to_string(), group_id.to_string()));
        settings.push((
            "auto.offset.reset".to_string(),
            self.auto_offset_reset.clone(),
        ));
        settings.push((
            "enable.auto.commit".to_string(),
            (!manual_commit).to_string(),
        ));
        // Manual consumers commit explicit offsets, never the fetch position.
        settings.push((
            "enable.auto.offset.store".to_string(),
            (!manual_commit).to_string(),
        ));
        settings.push((
            "session.timeout.ms".to_string(),
            self.session_timeout.as_millis().to_string(),
        ));
        settings.push(("enable.partition.eof".to_string(), "false".to_string()));
        settings
    }
}
