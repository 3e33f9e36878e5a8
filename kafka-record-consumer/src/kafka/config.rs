use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use rdkafka::ClientConfig;

use crate::error::ConfigError;
use crate::kafka::client::CommitMode;
use crate::kafka::headers::{
    HeaderDeserializerKind, HeaderFilterStrategy, NoopHeaderFilterStrategy,
    RegexHeaderFilterStrategy,
};
use crate::kafka::poll_exception::PollOnError;
use crate::kafka::record_processor::RecordProcessorSettings;
use crate::kafka::resume::SeekPolicy;

/// Kafka consumer configuration builder with defaults for record consumers.
///
/// librdkafka's own auto-commit and offset store are always disabled: the
/// commit manager is the only thing that commits.
pub struct ConsumerConfigBuilder {
    config: ClientConfig,
}

impl ConsumerConfigBuilder {
    pub fn for_record_consumer(bootstrap_servers: &str, group_id: &str) -> Self {
        let mut config = ClientConfig::new();

        config
            .set("bootstrap.servers", bootstrap_servers)
            .set("group.id", group_id);

        config
            .set("enable.auto.offset.store", "false")
            .set("enable.auto.commit", "false")
            .set("enable.partition.eof", "false")
            .set("socket.timeout.ms", "10000")
            .set("session.timeout.ms", "45000")
            .set("heartbeat.interval.ms", "3000")
            .set("max.poll.interval.ms", "300000");

        Self { config }
    }

    /// Enable TLS/SSL for Kafka connection
    pub fn with_tls(mut self, enabled: bool) -> Self {
        if enabled {
            self.config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        }
        self
    }

    /// Where to start when the group has no committed offset
    pub fn with_offset_reset(mut self, policy: &str) -> Self {
        self.config.set("auto.offset.reset", policy);
        self
    }

    pub fn with_client_id(mut self, client_id: &str) -> Self {
        self.config.set("client.id", client_id);
        self
    }

    pub fn with_max_poll_interval_ms(mut self, ms: u32) -> Self {
        self.config.set("max.poll.interval.ms", ms.to_string());
        self
    }

    pub fn with_session_timeout_ms(mut self, ms: u32) -> Self {
        self.config.set("session.timeout.ms", ms.to_string());
        self
    }

    pub fn with_heartbeat_interval_ms(mut self, ms: u32) -> Self {
        self.config.set("heartbeat.interval.ms", ms.to_string());
        self
    }

    /// Use the cooperative-sticky assignor, so a rebalance only revokes the
    /// partitions that actually move
    pub fn with_sticky_partition_assignment(mut self, enabled: bool) -> Self {
        if enabled {
            self.config
                .set("partition.assignment.strategy", "cooperative-sticky");
        }
        self
    }

    pub fn build(self) -> ClientConfig {
        self.config
    }
}

/// How pending offsets are flushed when the consumer stops
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AutoCommitOnStop {
    #[default]
    Sync,
    Async,
    None,
}

impl AutoCommitOnStop {
    /// `None` when nothing should be committed on stop
    pub fn commit_mode(self) -> Option<CommitMode> {
        match self {
            AutoCommitOnStop::Sync => Some(CommitMode::Sync),
            AutoCommitOnStop::Async => Some(CommitMode::Async),
            AutoCommitOnStop::None => None,
        }
    }
}

impl FromStr for AutoCommitOnStop {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sync" => Ok(AutoCommitOnStop::Sync),
            "async" => Ok(AutoCommitOnStop::Async),
            "none" => Ok(AutoCommitOnStop::None),
            _ => Err(ConfigError::unsupported("auto commit on stop mode", s)),
        }
    }
}

impl fmt::Display for AutoCommitOnStop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AutoCommitOnStop::Sync => write!(f, "sync"),
            AutoCommitOnStop::Async => write!(f, "async"),
            AutoCommitOnStop::None => write!(f, "none"),
        }
    }
}

/// Everything a record consumer needs besides the rdkafka client config
#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    /// Comma separated topic names, or a regex when `topic_is_pattern`
    pub topic: String,
    pub topic_is_pattern: bool,
    pub consumers_count: usize,
    pub max_poll_records: usize,
    pub poll_timeout: Duration,
    pub auto_commit_enable: bool,
    pub auto_commit_on_stop: AutoCommitOnStop,
    pub break_on_first_error: bool,
    pub allow_manual_commit: bool,
    pub seek_policy: Option<SeekPolicy>,
    /// `None` filters the default metadata prefix, an empty pattern filters nothing
    pub header_filter_pattern: Option<String>,
    pub header_deserializer: HeaderDeserializerKind,
    pub poll_on_error: PollOnError,
    /// Pause before polling again after an error handled with `Retry`
    pub poll_retry_backoff: Duration,
    pub reconnect_backoff: Duration,
    pub shutdown_timeout: Duration,
}

impl ConsumerSettings {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            topic_is_pattern: false,
            consumers_count: 1,
            max_poll_records: 500,
            poll_timeout: Duration::from_millis(5000),
            auto_commit_enable: true,
            auto_commit_on_stop: AutoCommitOnStop::default(),
            break_on_first_error: false,
            allow_manual_commit: false,
            seek_policy: None,
            header_filter_pattern: None,
            header_deserializer: HeaderDeserializerKind::default(),
            poll_on_error: PollOnError::default(),
            poll_retry_backoff: Duration::from_millis(100),
            reconnect_backoff: Duration::from_millis(1000),
            shutdown_timeout: Duration::from_secs(30),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.consumers_count == 0 {
            return Err(ConfigError::NoConsumers);
        }
        if self.max_poll_records == 0 {
            return Err(ConfigError::invalid("max poll records", "0"));
        }
        if self.subscription().is_empty() {
            return Err(ConfigError::invalid("topic", &self.topic));
        }
        Ok(())
    }

    pub fn processor_settings(&self) -> RecordProcessorSettings {
        RecordProcessorSettings {
            auto_commit_enable: self.auto_commit_enable,
            break_on_first_error: self.break_on_first_error,
            allow_manual_commit: self.allow_manual_commit,
        }
    }

    /// The names handed to `subscribe`. librdkafka treats names starting
    /// with `^` as regular expressions.
    pub fn subscription(&self) -> Vec<String> {
        if self.topic_is_pattern {
            let pattern = self.topic.trim();
            if pattern.is_empty() {
                return vec![];
            }
            if pattern.starts_with('^') {
                return vec![pattern.to_string()];
            }
            return vec![format!("^{pattern}")];
        }

        self.topic
            .split(',')
            .map(str::trim)
            .filter(|topic| !topic.is_empty())
            .map(str::to_string)
            .collect()
    }

    pub fn header_filter(&self) -> Result<Arc<dyn HeaderFilterStrategy>, ConfigError> {
        Ok(match self.header_filter_pattern.as_deref() {
            None => Arc::new(RegexHeaderFilterStrategy::kafka_metadata()?),
            Some("") => Arc::new(NoopHeaderFilterStrategy),
            Some(pattern) => Arc::new(RegexHeaderFilterStrategy::new(pattern)?),
        })
    }
}
