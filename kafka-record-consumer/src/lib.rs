//! Kafka record consumer.
//!
//! Polls records from Kafka, hands them one at a time to a [`kafka::Processor`]
//! and commits the offset of the last successfully handled record per
//! partition, either to the broker or to an external offset repository.
//!
//! ## Error logging (anyhow)
//!
//! Log `anyhow::Error` and other errors with a cause chain using `{e:#}` or
//! `error = ?e` so root causes are visible. Build errors with `.context()` /
//! `.with_context()` rather than formatting the source into a new message.

pub mod config;
pub mod error;
pub mod kafka;
pub mod metrics;
pub mod metrics_consts;
pub mod service;
pub mod test_utils;

// Re-export commonly used types for convenience
pub use kafka::{Exchange, Processor};
pub use service::KafkaRecordConsumerService;
