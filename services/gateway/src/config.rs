//! Gateway configuration.
//!
//! Sources, later overriding earlier:
//! 1. Built-in defaults
//! 2. `config/gateway.{toml,yaml,json}` (optional)
//! 3. `/etc/dicom-gateway/gateway.*` (optional)
//! 4. Environment variables prefixed with `GATEWAY`, e.g.
//!    `GATEWAY__STORAGE__ROOT` -> `storage.root`

use crate::publisher::RetryPolicy;
use rdkafka::config::ClientConfig;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration for the gateway
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub completion: CompletionConfig,
    #[serde(default)]
    pub publisher: PublisherConfig,
    #[serde(default)]
    pub kafka: KafkaConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log format: "json" or "pretty"
    #[serde(default = "default_log_format")]
    pub log_format: String,
    /// Prometheus exporter port; no exporter when unset
    #[serde(default)]
    pub metrics_port: Option<u16>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Root of the `{study}/{series}/{instance}` hierarchy
    #[serde(default = "default_storage_root")]
    pub root: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CompletionConfig {
    /// Idle time after which a study without a declared count is complete
    #[serde(default = "default_quiescence_window_secs")]
    pub quiescence_window_secs: u64,
    /// How often the monitor sweeps pending studies and publishes
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PublisherConfig {
    /// Topic receiving study summaries
    #[serde(default = "default_destination")]
    pub destination: String,
    /// Delivery attempts per publish; 0 retries forever
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    /// Time the sink may take to acknowledge one message
    #[serde(default = "default_delivery_timeout_ms")]
    pub delivery_timeout_ms: u64,
}

/// Kafka connection settings shared by the sink and the instance consumers
#[derive(Debug, Clone, Deserialize)]
pub struct KafkaConfig {
    #[serde(default = "default_bootstrap_servers")]
    pub bootstrap_servers: String,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    /// plaintext, ssl, sasl_plaintext or sasl_ssl
    #[serde(default = "default_security_protocol")]
    pub security_protocol: String,
    /// SASL mechanism (PLAIN, SCRAM-SHA-256, SCRAM-SHA-512)
    #[serde(default = "default_sasl_mechanism")]
    pub sasl_mechanism: String,
    pub sasl_username: Option<String>,
    pub sasl_password: Option<String>,
    pub ssl_ca_location: Option<String>,
    /// Topic carrying decoded `InstanceReceived` events
    #[serde(default = "default_instance_topic")]
    pub instance_topic: String,
    #[serde(default = "default_consumer_group")]
    pub consumer_group: String,
    #[serde(default = "default_auto_offset_reset")]
    pub auto_offset_reset: String,
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IngestConfig {
    /// Concurrent instance consumers
    #[serde(default = "default_workers")]
    pub workers: usize,
}

fn default_service_name() -> String {
    "dicom-gateway".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_storage_root() -> PathBuf {
    PathBuf::from("./buffer")
}

fn default_quiescence_window_secs() -> u64 {
    30
}

fn default_sweep_interval_secs() -> u64 {
    5
}

fn default_destination() -> String {
    "new_study".to_string()
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    30000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_delivery_timeout_ms() -> u64 {
    30000
}

fn default_bootstrap_servers() -> String {
    "localhost:9092".to_string()
}

fn default_client_id() -> String {
    "dicom-gateway".to_string()
}

fn default_security_protocol() -> String {
    "plaintext".to_string()
}

fn default_sasl_mechanism() -> String {
    "PLAIN".to_string()
}

fn default_instance_topic() -> String {
    "dicom.instances".to_string()
}

fn default_consumer_group() -> String {
    "dicom-gateway".to_string()
}

fn default_auto_offset_reset() -> String {
    "earliest".to_string()
}

fn default_session_timeout_ms() -> u32 {
    30000
}

fn default_workers() -> usize {
    4
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            log_format: default_log_format(),
            metrics_port: None,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: default_storage_root(),
        }
    }
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            quiescence_window_secs: default_quiescence_window_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            destination: default_destination(),
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            delivery_timeout_ms: default_delivery_timeout_ms(),
        }
    }
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            bootstrap_servers: default_bootstrap_servers(),
            client_id: default_client_id(),
            security_protocol: default_security_protocol(),
            sasl_mechanism: default_sasl_mechanism(),
            sasl_username: None,
            sasl_password: None,
            ssl_ca_location: None,
            instance_topic: default_instance_topic(),
            consumer_group: default_consumer_group(),
            auto_offset_reset: default_auto_offset_reset(),
            session_timeout_ms: default_session_timeout_ms(),
        }
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
        }
    }
}

impl Config {
    /// Load configuration from config files and the environment
    pub fn load() -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(config::File::with_name("config/gateway").required(false))
            .add_source(config::File::with_name("/etc/dicom-gateway/gateway").required(false))
            .add_source(
                config::Environment::with_prefix("GATEWAY")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }

    /// Parse a TOML document on top of the built-in defaults
    pub fn from_toml(toml: &str) -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(config::File::from_str(toml, config::FileFormat::Toml))
            .build()?
            .try_deserialize()
    }

    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.storage.root.as_os_str().is_empty() {
            return Err(ConfigValidationError::MissingField("storage.root".to_string()));
        }

        if self.completion.quiescence_window_secs == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "completion.quiescence_window_secs".to_string(),
                message: "must be greater than 0".to_string(),
            });
        }

        if self.completion.sweep_interval_secs == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "completion.sweep_interval_secs".to_string(),
                message: "must be greater than 0".to_string(),
            });
        }

        if self.publisher.destination.is_empty() {
            return Err(ConfigValidationError::MissingField(
                "publisher.destination".to_string(),
            ));
        }

        if self.publisher.backoff_multiplier < 1.0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "publisher.backoff_multiplier".to_string(),
                message: "must be at least 1.0".to_string(),
            });
        }

        if self.publisher.initial_backoff_ms > self.publisher.max_backoff_ms {
            return Err(ConfigValidationError::InvalidValue {
                field: "publisher.initial_backoff_ms".to_string(),
                message: "must not exceed publisher.max_backoff_ms".to_string(),
            });
        }

        if self.kafka.bootstrap_servers.is_empty() {
            return Err(ConfigValidationError::MissingField(
                "kafka.bootstrap_servers".to_string(),
            ));
        }

        if self.kafka.security_protocol.to_lowercase().starts_with("sasl")
            && self.kafka.sasl_username.is_none()
        {
            return Err(ConfigValidationError::MissingField(
                "kafka.sasl_username (required for SASL)".to_string(),
            ));
        }

        if self.ingest.workers == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "ingest.workers".to_string(),
                message: "must be greater than 0".to_string(),
            });
        }

        Ok(())
    }
}

impl CompletionConfig {
    pub fn quiescence_window(&self) -> Duration {
        Duration::from_secs(self.quiescence_window_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl PublisherConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            initial_interval: Duration::from_millis(self.initial_backoff_ms),
            max_interval: Duration::from_millis(self.max_backoff_ms),
            multiplier: self.backoff_multiplier,
        }
    }

    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_millis(self.delivery_timeout_ms)
    }
}

impl KafkaConfig {
    fn build_base_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();

        config
            .set("bootstrap.servers", &self.bootstrap_servers)
            .set("client.id", &self.client_id)
            .set("security.protocol", self.security_protocol.to_lowercase());

        if let Some(ref ca) = self.ssl_ca_location {
            config.set("ssl.ca.location", ca);
        }

        if let (Some(ref username), Some(ref password)) = (&self.sasl_username, &self.sasl_password) {
            config
                .set("sasl.mechanisms", &self.sasl_mechanism)
                .set("sasl.username", username)
                .set("sasl.password", password);
        }

        config
    }

    /// Producer settings for persistent delivery: every in-sync replica must
    /// acknowledge, and broker-side retries cannot duplicate a message.
    pub fn build_producer_config(&self) -> ClientConfig {
        let mut config = self.build_base_config();
        config
            .set("acks", "all")
            .set("enable.idempotence", "true")
            .set("message.timeout.ms", "30000");
        config
    }

    pub fn build_consumer_config(&self) -> ClientConfig {
        let mut config = self.build_base_config();
        config
            .set("group.id", &self.consumer_group)
            .set("auto.offset.reset", &self.auto_offset_reset)
            .set("enable.auto.commit", "false")
            .set("session.timeout.ms", self.session_timeout_ms.to_string());
        config
    }
}

/// Configuration validation errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}
