// Kafka module - record polling, processing and offset commits
pub mod client;
pub mod commit_manager;
pub mod config;
pub mod context;
pub mod exchange;
pub mod facade;
pub mod fetch_records;
pub mod headers;
pub mod offset_repository;
pub mod poll_exception;
pub mod rebalance_handler;
pub mod record;
pub mod record_processor;
pub mod resume;
pub mod types;

// Public API
pub use client::{CommitMode, ConsumerClient, SeekTarget};
pub use commit_manager::{CommitManager, ManualCommit};
pub use config::{ConsumerConfigBuilder, ConsumerSettings};
pub use exchange::Exchange;
pub use fetch_records::FetchRecords;
pub use rebalance_handler::RebalanceHandler;
pub use record_processor::{ExceptionHandler, Processor};
pub use types::Partition;
