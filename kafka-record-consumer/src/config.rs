use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use envconfig::Envconfig;
use rdkafka::ClientConfig;
use uuid::Uuid;

use crate::error::ConfigError;
use crate::kafka::config::{AutoCommitOnStop, ConsumerConfigBuilder, ConsumerSettings};
use crate::kafka::headers::HeaderDeserializerKind;
use crate::kafka::poll_exception::PollOnError;
use crate::kafka::resume::SeekPolicy;

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    // Kafka configuration
    #[envconfig(default = "localhost:9092")]
    pub kafka_hosts: String,

    #[envconfig(default = "false")]
    pub kafka_tls: bool,

    /// A random group is used when unset
    pub kafka_consumer_group: Option<String>,

    #[envconfig(default = "events")]
    pub kafka_consumer_topic: String,

    #[envconfig(default = "false")]
    pub kafka_consumer_topic_is_pattern: bool,

    #[envconfig(default = "earliest")]
    pub kafka_consumer_offset_reset: String,

    pub kafka_client_id: Option<String>,

    #[envconfig(default = "false")]
    pub kafka_sticky_partition_assignment: bool,

    #[envconfig(default = "45000")]
    pub kafka_session_timeout_ms: u32,

    #[envconfig(default = "3000")]
    pub kafka_heartbeat_interval_ms: u32,

    /// Longest gap between polls before the member is evicted from the group
    #[envconfig(default = "300000")]
    pub kafka_max_poll_interval_ms: u32,

    // Record processing
    #[envconfig(default = "1")]
    pub consumers_count: usize,

    #[envconfig(default = "500")]
    pub max_poll_records: usize,

    #[envconfig(default = "5000")]
    pub poll_timeout_ms: EnvMsDuration,

    #[envconfig(default = "true")]
    pub auto_commit_enable: bool,

    #[envconfig(default = "sync")]
    pub auto_commit_on_stop: AutoCommitOnStop,

    #[envconfig(default = "false")]
    pub break_on_first_error: bool,

    #[envconfig(default = "false")]
    pub allow_manual_commit: bool,

    /// `beginning` or `end`; partitions resume from committed offsets when unset
    pub seek_to: Option<SeekPolicy>,

    /// Path of a JSON file holding processed offsets; replaces broker commits
    pub offset_repository_path: Option<String>,

    /// Headers matching this regex are not propagated, empty disables filtering
    pub header_filter_pattern: Option<String>,

    #[envconfig(default = "raw")]
    pub header_deserializer: HeaderDeserializerKind,

    #[envconfig(default = "ERROR_HANDLER")]
    pub poll_on_error: PollOnError,

    /// Pause before polling again when `POLL_ON_ERROR` is `retry`
    #[envconfig(default = "100")]
    pub poll_retry_backoff_ms: EnvMsDuration,

    #[envconfig(default = "1000")]
    pub reconnect_backoff_ms: EnvMsDuration,

    #[envconfig(default = "30000")]
    pub shutdown_timeout_ms: EnvMsDuration,

    // HTTP server configuration
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "8080")]
    pub port: u16,
}

impl Config {
    pub fn init_with_defaults() -> Result<Self, envconfig::Error> {
        Config::init_from_env()
    }

    /// Get server bind address
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn offset_repository_path(&self) -> Option<PathBuf> {
        self.offset_repository_path
            .as_deref()
            .filter(|path| !path.is_empty())
            .map(PathBuf::from)
    }

    /// The configured group, or a fresh random one
    pub fn group_id(&self) -> String {
        match self.kafka_consumer_group.as_deref() {
            Some(group) if !group.is_empty() => group.to_string(),
            _ => Uuid::new_v4().to_string(),
        }
    }

    pub fn to_settings(&self) -> Result<ConsumerSettings, ConfigError> {
        let settings = ConsumerSettings {
            topic: self.kafka_consumer_topic.clone(),
            topic_is_pattern: self.kafka_consumer_topic_is_pattern,
            consumers_count: self.consumers_count,
            max_poll_records: self.max_poll_records,
            poll_timeout: self.poll_timeout_ms.0,
            auto_commit_enable: self.auto_commit_enable,
            auto_commit_on_stop: self.auto_commit_on_stop,
            break_on_first_error: self.break_on_first_error,
            allow_manual_commit: self.allow_manual_commit,
            seek_policy: self.seek_to,
            header_filter_pattern: self.header_filter_pattern.clone(),
            header_deserializer: self.header_deserializer,
            poll_on_error: self.poll_on_error,
            poll_retry_backoff: self.poll_retry_backoff_ms.0,
            reconnect_backoff: self.reconnect_backoff_ms.0,
            shutdown_timeout: self.shutdown_timeout_ms.0,
        };
        settings.validate()?;
        Ok(settings)
    }

    /// rdkafka client configuration shared by every consumer of the service.
    /// All consumers join the same group, so it is resolved once.
    pub fn to_client_config(&self, group_id: &str) -> ClientConfig {
        let mut builder = ConsumerConfigBuilder::for_record_consumer(&self.kafka_hosts, group_id)
            .with_tls(self.kafka_tls)
            .with_offset_reset(&self.kafka_consumer_offset_reset)
            .with_sticky_partition_assignment(self.kafka_sticky_partition_assignment)
            .with_session_timeout_ms(self.kafka_session_timeout_ms)
            .with_heartbeat_interval_ms(self.kafka_heartbeat_interval_ms)
            .with_max_poll_interval_ms(self.kafka_max_poll_interval_ms);

        if let Some(client_id) = &self.kafka_client_id {
            builder = builder.with_client_id(client_id);
        }

        builder.build()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(Duration::from_millis(ms)))
    }
}
