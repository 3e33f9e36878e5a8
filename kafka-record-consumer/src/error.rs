use std::io;

use rdkafka::error::KafkaError;
use thiserror::Error;

use crate::kafka::types::Partition;

/// Errors raised while committing an offset, either to the broker or to an
/// offset repository.
#[derive(Error, Debug)]
pub enum CommitError {
    #[error("kafka rejected the offset commit: {0}")]
    Kafka(#[from] KafkaError),
    #[error("offset repository write failed: {0}")]
    Repository(#[from] OffsetRepositoryError),
    #[error("refusing to commit offset {offset} for {partition}: offset {committed} already committed")]
    Regression {
        partition: Partition,
        offset: i64,
        committed: i64,
    },
    #[error("the consumer that owned this record is gone")]
    ConsumerGone,
}

/// Errors from reading or writing an external offset store.
#[derive(Error, Debug)]
pub enum OffsetRepositoryError {
    #[error("offset repository io error: {0}")]
    Io(#[from] io::Error),
    #[error("offset repository contents could not be (de)serialized: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("{0} is not a valid offset repository key")]
    InvalidKey(String),
}

/// Errors resolving configuration into a runnable consumer.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("unsupported {kind}: {value}")]
    UnsupportedOption { kind: &'static str, value: String },
    #[error("invalid header filter pattern: {0}")]
    InvalidHeaderPattern(#[from] regex::Error),
    #[error("consumers count must be at least 1")]
    NoConsumers,
    #[error("invalid {name}: {value:?}")]
    InvalidValue { name: &'static str, value: String },
}

impl ConfigError {
    pub fn unsupported(kind: &'static str, value: &str) -> Self {
        ConfigError::UnsupportedOption {
            kind,
            value: value.to_owned(),
        }
    }

    pub fn invalid(name: &'static str, value: &str) -> Self {
        ConfigError::InvalidValue {
            name,
            value: value.to_owned(),
        }
    }
}

/// Top level errors for creating and running record consumers.
#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error("kafka error: {0}")]
    Kafka(#[from] KafkaError),
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("offset repository error: {0}")]
    OffsetRepository(#[from] OffsetRepositoryError),
}
