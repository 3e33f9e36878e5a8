use std::fmt;
use std::str::FromStr;

use rdkafka::error::{KafkaError, RDKafkaErrorCode};

use crate::error::ConfigError;

/// What the poll loop does after a non-benign polling error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PollOnError {
    /// Skip the offending record and keep polling
    Discard,
    /// Report the error, then skip the offending record
    #[default]
    ErrorHandler,
    /// Drop the client and connect again
    Reconnect,
    /// Poll the same position again
    Retry,
    /// Stop this consumer for good
    Stop,
}

impl FromStr for PollOnError {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().replace('-', "_").as_str() {
            "DISCARD" => Ok(PollOnError::Discard),
            "ERROR_HANDLER" => Ok(PollOnError::ErrorHandler),
            "RECONNECT" => Ok(PollOnError::Reconnect),
            "RETRY" => Ok(PollOnError::Retry),
            "STOP" => Ok(PollOnError::Stop),
            _ => Err(ConfigError::unsupported("poll error action", s)),
        }
    }
}

impl fmt::Display for PollOnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PollOnError::Discard => "DISCARD",
            PollOnError::ErrorHandler => "ERROR_HANDLER",
            PollOnError::Reconnect => "RECONNECT",
            PollOnError::Retry => "RETRY",
            PollOnError::Stop => "STOP",
        };
        f.write_str(name)
    }
}

/// Decides how the poll loop reacts to a polling error
pub trait PollExceptionStrategy: Send + Sync {
    fn handle_exception(&self, error: &KafkaError) -> PollOnError;
}

/// Applies the configured action to every error, except fatal consumer
/// errors which always reconnect
pub struct DefaultPollExceptionStrategy {
    on_error: PollOnError,
}

impl DefaultPollExceptionStrategy {
    pub fn new(on_error: PollOnError) -> Self {
        Self { on_error }
    }
}

impl Default for DefaultPollExceptionStrategy {
    fn default() -> Self {
        Self::new(PollOnError::default())
    }
}

impl PollExceptionStrategy for DefaultPollExceptionStrategy {
    fn handle_exception(&self, error: &KafkaError) -> PollOnError {
        match error {
            KafkaError::MessageConsumptionFatal(_) if self.on_error != PollOnError::Stop => {
                PollOnError::Reconnect
            }
            _ => self.on_error,
        }
    }
}

/// Errors that are part of normal polling and need no handling. Returns a
/// short label for metrics when the error is benign.
pub fn benign_error_label(error: &KafkaError) -> Option<&'static str> {
    match error {
        KafkaError::PartitionEOF(_) => Some("partition_eof"),
        KafkaError::NoMessageReceived => Some("no_message"),
        KafkaError::MessageConsumption(code) => match code {
            RDKafkaErrorCode::PartitionEOF => Some("partition_eof"),
            RDKafkaErrorCode::OperationTimedOut => Some("op_timed_out"),
            RDKafkaErrorCode::RequestTimedOut => Some("request_timed_out"),
            _ => None,
        },
        _ => None,
    }
}
