//! Shared test helpers for the record pipeline.
//!
//! Used in "mod tests" and in the tests/ directory, so they live in the
//! library rather than behind `cfg(test)`.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use rdkafka::error::{KafkaError, KafkaResult, RDKafkaErrorCode};

use crate::kafka::client::{CommitMode, ConsumerClient};
use crate::kafka::commit_manager::CommitManager;
use crate::kafka::exchange::Exchange;
use crate::kafka::headers::{RawHeaderDeserializer, RegexHeaderFilterStrategy};
use crate::kafka::record::{ConsumerRecord, PolledRecords};
use crate::kafka::record_processor::{
    ExceptionHandler, Processor, RecordProcessor, RecordProcessorSettings,
};
use crate::kafka::types::Partition;

/// Consumer client that records commits instead of talking to a broker
#[derive(Default)]
pub struct RecordingClient {
    commits: Mutex<Vec<(Partition, i64, CommitMode)>>,
    fail_commits: AtomicBool,
}

impl RecordingClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every successful commit, as `(partition, next offset, mode)`
    pub fn commits(&self) -> Vec<(Partition, i64, CommitMode)> {
        self.commits.lock().unwrap().clone()
    }

    pub fn commit_count(&self) -> usize {
        self.commits.lock().unwrap().len()
    }

    /// Next offsets committed for one partition, oldest first
    pub fn committed_offsets(&self, partition: &Partition) -> Vec<i64> {
        self.commits
            .lock()
            .unwrap()
            .iter()
            .filter(|(p, _, _)| p == partition)
            .map(|(_, offset, _)| *offset)
            .collect()
    }

    pub fn fail_commits(&self, fail: bool) {
        self.fail_commits.store(fail, Ordering::SeqCst);
    }
}

impl ConsumerClient for RecordingClient {
    fn commit(&self, partition: &Partition, next_offset: i64, mode: CommitMode) -> KafkaResult<()> {
        if self.fail_commits.load(Ordering::SeqCst) {
            return Err(KafkaError::ConsumerCommit(
                RDKafkaErrorCode::RebalanceInProgress,
            ));
        }
        self.commits
            .lock()
            .unwrap()
            .push((partition.clone(), next_offset, mode));
        Ok(())
    }
}

/// Processor that remembers every record it was handed, and fails on the
/// configured offsets
#[derive(Default)]
pub struct RecordingProcessor {
    processed: Mutex<Vec<(Partition, i64)>>,
    failing_offsets: HashSet<i64>,
    calls: AtomicUsize,
}

impl RecordingProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_on(offsets: &[i64]) -> Self {
        Self {
            failing_offsets: offsets.iter().copied().collect(),
            ..Self::default()
        }
    }

    /// Offsets handed to the processor for one partition, failed ones included
    pub fn processed_offsets(&self, partition: &Partition) -> Vec<i64> {
        self.processed
            .lock()
            .unwrap()
            .iter()
            .filter(|(p, _)| p == partition)
            .map(|(_, offset)| *offset)
            .collect()
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Processor for RecordingProcessor {
    async fn process(&self, exchange: &mut Exchange) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.processed
            .lock()
            .unwrap()
            .push((exchange.partition().clone(), exchange.offset()));

        if self.failing_offsets.contains(&exchange.offset()) {
            return Err(anyhow!(
                "failed to process offset {} of {}",
                exchange.offset(),
                exchange.partition()
            ));
        }
        Ok(())
    }
}

/// Exception handler that keeps what it was given
#[derive(Default)]
pub struct CollectingExceptionHandler {
    handled: Mutex<Vec<(i64, String)>>,
}

impl CollectingExceptionHandler {
    pub fn offsets(&self) -> Vec<i64> {
        self.handled
            .lock()
            .unwrap()
            .iter()
            .map(|(offset, _)| *offset)
            .collect()
    }

    pub fn messages(&self) -> Vec<String> {
        self.handled
            .lock()
            .unwrap()
            .iter()
            .map(|(_, message)| message.clone())
            .collect()
    }
}

impl ExceptionHandler for CollectingExceptionHandler {
    fn handle_exception(&self, exchange: &Exchange, error: &anyhow::Error) {
        self.handled
            .lock()
            .unwrap()
            .push((exchange.offset(), format!("{error:#}")));
    }
}

pub fn test_record(partition: &Partition, offset: i64) -> ConsumerRecord {
    ConsumerRecord::new(partition.clone(), offset)
        .with_key(format!("key-{offset}"))
        .with_value(format!("value-{offset}"))
}

/// A poll holding the given offsets per partition, in order
pub fn polled_records(partitions: &[(Partition, &[i64])]) -> PolledRecords {
    partitions
        .iter()
        .flat_map(|(partition, offsets)| {
            offsets
                .iter()
                .map(move |offset| test_record(partition, *offset))
        })
        .collect()
}

/// A record processor backed by a broker-committing manager and `client`
pub fn record_processor(
    processor: Arc<dyn Processor>,
    client: Arc<RecordingClient>,
    settings: RecordProcessorSettings,
) -> RecordProcessor {
    let client: Arc<dyn ConsumerClient> = client;
    RecordProcessor::new(
        processor,
        client,
        CommitManager::new("test-thread", None, settings.allow_manual_commit),
        Arc::new(RegexHeaderFilterStrategy::kafka_metadata().unwrap()),
        Arc::new(RawHeaderDeserializer),
        settings,
    )
}
