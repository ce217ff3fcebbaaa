//! Configuration for the ingestion pipeline.
//!
//! Values are layered: built-in defaults, then `config/pipeline.*`, then
//! `/etc/tenantflow/pipeline.*`, then environment variables such as
//! `PIPELINE__KAFKA__BOOTSTRAP_SERVERS` (`kafka.bootstrap_servers`).

use rdkafka::config::ClientConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required configuration: {0}")]
    MissingRequired(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to load configuration: {0}")]
    LoadError(#[from] config::ConfigError),
}

/// Main configuration for the pipeline service
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub kafka: KafkaConfig,
    /// Control database holding shard assignments and checkpoints.
    /// Without it the pipeline runs embedded: static assignments, in-memory checkpoints.
    #[serde(default)]
    pub control_database: Option<DatabaseConfig>,
    #[serde(default)]
    pub shards: ShardPoolConfig,
    #[serde(default)]
    pub directory: DirectoryConfig,
    #[serde(default)]
    pub allocator: AllocatorConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub notifications: NotificationConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// `json` or `pretty`
    #[serde(default = "default_log_format")]
    pub log_format: String,
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            log_format: default_log_format(),
            metrics_port: default_metrics_port(),
        }
    }
}

/// Security protocol for Kafka connections
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SecurityProtocol {
    #[default]
    Plaintext,
    Ssl,
    SaslPlaintext,
    SaslSsl,
}

impl SecurityProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            SecurityProtocol::Plaintext => "plaintext",
            SecurityProtocol::Ssl => "ssl",
            SecurityProtocol::SaslPlaintext => "sasl_plaintext",
            SecurityProtocol::SaslSsl => "sasl_ssl",
        }
    }

    fn uses_sasl(&self) -> bool {
        matches!(self, SecurityProtocol::SaslPlaintext | SecurityProtocol::SaslSsl)
    }
}

/// SASL mechanism for authentication
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SaslMechanism {
    #[default]
    Plain,
    ScramSha256,
    ScramSha512,
}

impl SaslMechanism {
    pub fn as_str(&self) -> &'static str {
        match self {
            SaslMechanism::Plain => "PLAIN",
            SaslMechanism::ScramSha256 => "SCRAM-SHA-256",
            SaslMechanism::ScramSha512 => "SCRAM-SHA-512",
        }
    }
}

/// SSL/TLS settings for the Kafka client
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SslConfig {
    pub ca_location: Option<String>,
    pub certificate_location: Option<String>,
    pub key_location: Option<String>,
    pub key_password: Option<String>,
}

/// SASL credentials for the Kafka client
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SaslConfig {
    #[serde(default)]
    pub mechanism: SaslMechanism,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// Topics the pipeline reads from and writes to
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicConfig {
    /// Inbound mutation events
    #[serde(default = "default_mutations_topic")]
    pub mutations: String,
    /// Outbound notifications for dashboards and coordinators
    #[serde(default = "default_notifications_topic")]
    pub notifications: String,
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            mutations: default_mutations_topic(),
            notifications: default_notifications_topic(),
        }
    }
}

/// Kafka connection and consumer tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KafkaConfig {
    #[serde(default = "default_bootstrap_servers")]
    pub bootstrap_servers: String,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default = "default_group_id")]
    pub group_id: String,
    #[serde(default)]
    pub security_protocol: SecurityProtocol,
    #[serde(default)]
    pub ssl: SslConfig,
    #[serde(default)]
    pub sasl: SaslConfig,
    #[serde(default)]
    pub topics: TopicConfig,
    /// Where to start when the group has no committed offset
    #[serde(default = "default_auto_offset_reset")]
    pub auto_offset_reset: String,
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u64,
    #[serde(default = "default_max_poll_interval_ms")]
    pub max_poll_interval_ms: u64,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Additional librdkafka properties
    #[serde(default)]
    pub extra_properties: HashMap<String, String>,
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            bootstrap_servers: default_bootstrap_servers(),
            client_id: default_client_id(),
            group_id: default_group_id(),
            security_protocol: SecurityProtocol::default(),
            ssl: SslConfig::default(),
            sasl: SaslConfig::default(),
            topics: TopicConfig::default(),
            auto_offset_reset: default_auto_offset_reset(),
            session_timeout_ms: default_session_timeout_ms(),
            max_poll_interval_ms: default_max_poll_interval_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            extra_properties: HashMap::new(),
        }
    }
}

impl KafkaConfig {
    fn build_base_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();

        config.set("bootstrap.servers", &self.bootstrap_servers);
        config.set("client.id", &self.client_id);
        config.set("security.protocol", self.security_protocol.as_str());

        if let Some(ref ca) = self.ssl.ca_location {
            config.set("ssl.ca.location", ca);
        }
        if let Some(ref cert) = self.ssl.certificate_location {
            config.set("ssl.certificate.location", cert);
        }
        if let Some(ref key) = self.ssl.key_location {
            config.set("ssl.key.location", key);
        }
        if let Some(ref password) = self.ssl.key_password {
            config.set("ssl.key.password", password);
        }

        if self.security_protocol.uses_sasl() {
            config.set("sasl.mechanism", self.sasl.mechanism.as_str());
            if let Some(ref username) = self.sasl.username {
                config.set("sasl.username", username);
            }
            if let Some(ref password) = self.sasl.password {
                config.set("sasl.password", password);
            }
        }

        for (key, value) in &self.extra_properties {
            config.set(key, value);
        }

        config
    }

    /// Consumer settings. Offsets are committed by the pipeline only after the
    /// partition checkpoint is durable, so auto commit stays off.
    pub fn build_consumer_config(&self) -> ClientConfig {
        let mut config = self.build_base_config();

        config.set("group.id", &self.group_id);
        config.set("auto.offset.reset", &self.auto_offset_reset);
        config.set("enable.auto.commit", "false");
        config.set("enable.partition.eof", "false");
        config.set("session.timeout.ms", self.session_timeout_ms.to_string());
        config.set("max.poll.interval.ms", self.max_poll_interval_ms.to_string());

        config
    }

    /// Producer settings for the notification topic
    pub fn build_producer_config(&self) -> ClientConfig {
        let mut config = self.build_base_config();

        config.set("acks", "all");
        config.set("enable.idempotence", "true");
        config.set("request.timeout.ms", self.request_timeout_ms.to_string());
        config.set("linger.ms", "5");
        config.set("compression.type", "lz4");

        config
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// PostgreSQL pool settings
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_true")]
    pub run_migrations: bool,
}

/// Pool settings applied to every tenant shard connection
#[derive(Debug, Clone, Deserialize)]
pub struct ShardPoolConfig {
    #[serde(default = "default_shard_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Apply the shard schema when a shard is first connected
    #[serde(default = "default_true")]
    pub run_migrations: bool,
}

impl Default for ShardPoolConfig {
    fn default() -> Self {
        Self {
            max_connections: default_shard_max_connections(),
            min_connections: default_min_connections(),
            connect_timeout_secs: default_connect_timeout_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
            run_migrations: true,
        }
    }
}

/// One statically configured tenant → shard mapping
#[derive(Debug, Clone, Deserialize)]
pub struct StaticAssignment {
    pub business_id: String,
    pub location_id: String,
    pub shard_id: String,
    pub url: String,
}

/// Shard directory cache settings
#[derive(Debug, Clone, Deserialize)]
pub struct DirectoryConfig {
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    /// Postgres NOTIFY channel the provisioning process signals on
    #[serde(default = "default_invalidation_channel")]
    pub invalidation_channel: String,
    /// Used when no control database is configured
    #[serde(default)]
    pub assignments: Vec<StaticAssignment>,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: default_cache_ttl_secs(),
            invalidation_channel: default_invalidation_channel(),
            assignments: Vec::new(),
        }
    }
}

impl DirectoryConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

/// Resource id allocation settings
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AllocatorConfig {
    /// Two-letter prefix per resource type, e.g. `memberships = "mb"`
    #[serde(default)]
    pub prefixes: HashMap<String, String>,
}

/// Per-partition worker behaviour
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    /// Attempts per event before the partition is parked
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Timeout for a single store round trip
    #[serde(default = "default_apply_timeout_ms")]
    pub apply_timeout_ms: u64,
    /// Queue depth at which a partition is paused at the source
    #[serde(default = "default_queue_high_watermark")]
    pub queue_high_watermark: usize,
    /// Queue depth at which a paused partition is resumed
    #[serde(default = "default_queue_low_watermark")]
    pub queue_low_watermark: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            apply_timeout_ms: default_apply_timeout_ms(),
            queue_high_watermark: default_queue_high_watermark(),
            queue_low_watermark: default_queue_low_watermark(),
        }
    }
}

impl WorkerConfig {
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    pub fn apply_timeout(&self) -> Duration {
        Duration::from_millis(self.apply_timeout_ms)
    }
}

/// Downstream notification settings
#[derive(Debug, Clone, Deserialize)]
pub struct NotificationConfig {
    /// Publish notifications to the Kafka notifications topic
    #[serde(default = "default_true")]
    pub kafka_enabled: bool,
    /// Capacity of the in-process broadcast channel
    #[serde(default = "default_broadcast_capacity")]
    pub broadcast_capacity: usize,
    #[serde(default = "default_notify_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            kafka_enabled: true,
            broadcast_capacity: default_broadcast_capacity(),
            timeout_ms: default_notify_timeout_ms(),
        }
    }
}

impl NotificationConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Operator API settings
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_api_host")]
    pub host: String,
    #[serde(default = "default_api_port")]
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
        }
    }
}

// Default value functions
fn default_service_name() -> String {
    "tenantflow-pipeline".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_bootstrap_servers() -> String {
    "localhost:9092".to_string()
}

fn default_client_id() -> String {
    "tenantflow-pipeline".to_string()
}

fn default_group_id() -> String {
    "tenantflow-pipeline".to_string()
}

fn default_mutations_topic() -> String {
    "tenantflow.mutations".to_string()
}

fn default_notifications_topic() -> String {
    "tenantflow.notifications".to_string()
}

fn default_auto_offset_reset() -> String {
    "earliest".to_string()
}

fn default_session_timeout_ms() -> u64 {
    30000
}

fn default_max_poll_interval_ms() -> u64 {
    300000
}

fn default_request_timeout_ms() -> u64 {
    30000
}

fn default_max_connections() -> u32 {
    10
}

fn default_shard_max_connections() -> u32 {
    4
}

fn default_min_connections() -> u32 {
    1
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_idle_timeout_secs() -> u64 {
    600
}

fn default_true() -> bool {
    true
}

fn default_cache_ttl_secs() -> u64 {
    60
}

fn default_invalidation_channel() -> String {
    "shard_assignments".to_string()
}

fn default_max_attempts() -> u32 {
    8
}

fn default_initial_backoff_ms() -> u64 {
    100
}

fn default_max_backoff_ms() -> u64 {
    10000
}

fn default_apply_timeout_ms() -> u64 {
    5000
}

fn default_queue_high_watermark() -> usize {
    1000
}

fn default_queue_low_watermark() -> usize {
    100
}

fn default_broadcast_capacity() -> usize {
    1024
}

fn default_notify_timeout_ms() -> u64 {
    2000
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8080
}

impl Config {
    /// Load configuration from files and environment
    pub fn load() -> Result<Self, ConfigError> {
        let config = config::Config::builder()
            .add_source(config::File::with_name("config/pipeline").required(false))
            .add_source(config::File::with_name("/etc/tenantflow/pipeline").required(false))
            // PIPELINE__KAFKA__BOOTSTRAP_SERVERS -> kafka.bootstrap_servers
            .add_source(
                config::Environment::with_prefix("PIPELINE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.kafka.bootstrap_servers.is_empty() {
            return Err(ConfigError::MissingRequired(
                "kafka.bootstrap_servers".to_string(),
            ));
        }

        if self.kafka.group_id.is_empty() {
            return Err(ConfigError::MissingRequired("kafka.group_id".to_string()));
        }

        if self.kafka.security_protocol.uses_sasl() && self.kafka.sasl.username.is_none() {
            return Err(ConfigError::MissingRequired(
                "kafka.sasl.username (required for SASL)".to_string(),
            ));
        }

        if self.worker.max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                key: "worker.max_attempts".to_string(),
                message: "must be at least 1".to_string(),
            });
        }

        if self.worker.queue_low_watermark >= self.worker.queue_high_watermark {
            return Err(ConfigError::InvalidValue {
                key: "worker.queue_low_watermark".to_string(),
                message: "must be below worker.queue_high_watermark".to_string(),
            });
        }

        for (resource_type, prefix) in &self.allocator.prefixes {
            if prefix.len() != 2 || !prefix.chars().all(|c| c.is_ascii_alphanumeric()) {
                return Err(ConfigError::InvalidValue {
                    key: format!("allocator.prefixes.{}", resource_type),
                    message: "prefix must be exactly two ASCII alphanumerics".to_string(),
                });
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert_eq!(config.kafka.topics.mutations, "tenantflow.mutations");
        assert!(config.control_database.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_consumer_config_disables_auto_commit() {
        let config = KafkaConfig::default();
        let consumer_config = config.build_consumer_config();

        assert_eq!(consumer_config.get("enable.auto.commit"), Some("false"));
        assert_eq!(consumer_config.get("group.id"), Some("tenantflow-pipeline"));
        assert!(consumer_config.get("sasl.mechanism").is_none());
    }

    #[test]
    fn test_sasl_requires_username() {
        let mut config = Config::default();
        config.kafka.security_protocol = SecurityProtocol::SaslSsl;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingRequired(_))
        ));

        config.kafka.sasl.username = Some("pipeline".to_string());
        assert!(config.validate().is_ok());
        assert_eq!(
            config.kafka.build_consumer_config().get("sasl.mechanism"),
            Some("PLAIN")
        );
    }

    #[test]
    fn test_rejects_bad_prefix_and_watermarks() {
        let mut config = Config::default();
        config
            .allocator
            .prefixes
            .insert("memberships".to_string(), "mbr".to_string());
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { .. })
        ));

        let mut config = Config::default();
        config.worker.queue_low_watermark = config.worker.queue_high_watermark;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_deserialize_from_toml_source() {
        let raw = r#"
            [kafka]
            bootstrap_servers = "kafka-1:9092"

            [worker]
            max_attempts = 3

            [[directory.assignments]]
            business_id = "B1"
            location_id = "L1"
            shard_id = "shard-a"
            url = "memory://shard-a"
        "#;
        let config: Config = config::Config::builder()
            .add_source(config::File::from_str(raw, config::FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(config.kafka.bootstrap_servers, "kafka-1:9092");
        assert_eq!(config.worker.max_attempts, 3);
        assert_eq!(config.worker.initial_backoff_ms, 100);
        assert_eq!(config.directory.assignments.len(), 1);
        assert_eq!(config.directory.assignments[0].shard_id, "shard-a");
    }
}
