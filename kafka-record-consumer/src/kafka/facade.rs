//! Drives one poll worth of records through the record processor.
//!
//! Partitions are processed in poll order, records in ascending offset order.
//! Every successful (or skipped) record has its offset recorded with the
//! commit manager straight away, and each partition is committed once after
//! its records are drained, batching broker round-trips per poll.
//!
//! A break-on-error stops the partition it happened on. Other partitions of
//! the same poll keep going, since their offsets are independent.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::kafka::record::PolledRecords;
use crate::kafka::record_processor::{
    ExceptionHandler, ProcessingResult, RecordPosition, RecordProcessor,
};
use crate::kafka::types::Partition;
use crate::metrics_consts::{POLL_RECORD_COUNT, REVOKED_RECORDS_DROPPED};

/// Optional hook observing every processed record
pub trait ConsumerListener: Send + Sync {
    /// Return false to stop processing the current poll right away
    fn after_process(&self, result: &ProcessingResult) -> bool;
}

pub struct RecordProcessorFacade {
    record_processor: RecordProcessor,
    exception_handler: Arc<dyn ExceptionHandler>,
    listener: Option<Arc<dyn ConsumerListener>>,
    shutdown: CancellationToken,
}

impl RecordProcessorFacade {
    pub fn new(
        record_processor: RecordProcessor,
        exception_handler: Arc<dyn ExceptionHandler>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            record_processor,
            exception_handler,
            listener: None,
            shutdown,
        }
    }

    pub fn with_listener(mut self, listener: Arc<dyn ConsumerListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn record_processor(&self) -> &RecordProcessor {
        &self.record_processor
    }

    fn is_stopping(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    fn commit_partition(&self, partition: &Partition) {
        // without auto-commit, offsets only move through manual commits
        if !self.record_processor.settings().auto_commit_enable {
            return;
        }
        self.record_processor
            .commit_manager()
            .commit(self.record_processor.client(), partition);
    }

    /// Process every record of a poll.
    ///
    /// A `previous` result that hit a break means the batch is on hold:
    /// nothing is processed and `previous` is handed back unchanged.
    ///
    /// Returns the first break result when a partition broke, otherwise the
    /// result of the last processed record (or `previous` when nothing ran).
    pub async fn process_polled_records(
        &self,
        polled: &PolledRecords,
        previous: ProcessingResult,
    ) -> ProcessingResult {
        if previous.break_on_error_hit {
            debug!(
                thread_id = self.record_processor.commit_manager().thread_id(),
                "Previous poll broke on error, not processing this batch"
            );
            return previous;
        }
        if polled.is_empty() {
            return previous;
        }

        metrics::histogram!(POLL_RECORD_COUNT).record(polled.record_count() as f64);

        let commit_manager = self.record_processor.commit_manager();
        let revoked = commit_manager.take_revoked();
        let partitions: Vec<_> = polled
            .partitions()
            .filter(|(partition, records)| {
                if !revoked.contains(*partition) {
                    return true;
                }
                debug!(
                    thread_id = commit_manager.thread_id(),
                    topic = partition.topic(),
                    partition = partition.partition_number(),
                    records = records.len(),
                    "Partition was revoked, dropping its records"
                );
                metrics::counter!(REVOKED_RECORDS_DROPPED).increment(records.len() as u64);
                false
            })
            .collect();

        let partition_count = partitions.len();
        let mut first_break: Option<ProcessingResult> = None;
        let mut last_result = previous;

        for (partition_index, (partition, records)) in partitions.into_iter().enumerate() {
            if self.is_stopping() {
                info!(
                    thread_id = commit_manager.thread_id(),
                    "Consumer is stopping, leaving remaining partitions unprocessed"
                );
                break;
            }

            debug!(
                topic = partition.topic(),
                partition = partition.partition_number(),
                records = records.len(),
                "Processing records for partition"
            );

            let poll_has_more = partition_index + 1 < partition_count;
            let mut partition_result =
                ProcessingResult::baseline(commit_manager.last_recorded_offset(partition));
            let mut listener_stopped = false;

            for (record_index, record) in records.iter().enumerate() {
                if self.is_stopping() {
                    break;
                }

                let position = RecordPosition {
                    partition_has_more: record_index + 1 < records.len(),
                    poll_has_more,
                };

                let result = self
                    .record_processor
                    .process_record(
                        record,
                        position,
                        &partition_result,
                        self.exception_handler.as_ref(),
                    )
                    .await;

                // a break already force-committed the last good offset
                if !result.break_on_error_hit {
                    if let Some(offset) = result.partition_last_offset {
                        commit_manager.record_offset(partition, offset);
                    }
                }

                partition_result = result;
                last_result = result;

                if let Some(listener) = &self.listener {
                    if !listener.after_process(&result) {
                        listener_stopped = true;
                        break;
                    }
                }

                if result.break_on_error_hit {
                    break;
                }
            }

            if partition_result.break_on_error_hit {
                first_break.get_or_insert(partition_result);
            } else {
                self.commit_partition(partition);
            }

            if listener_stopped {
                debug!(
                    topic = partition.topic(),
                    partition = partition.partition_number(),
                    "Listener asked to stop processing this poll"
                );
                break;
            }
        }

        first_break.unwrap_or(last_result)
    }
}
