use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use anyhow::anyhow;
use async_trait::async_trait;
use futures::FutureExt;
use tracing::{debug, error, warn};

use crate::kafka::client::ConsumerClient;
use crate::kafka::commit_manager::CommitManager;
use crate::kafka::exchange::Exchange;
use crate::kafka::headers::{HeaderDeserializer, HeaderFilterStrategy};
use crate::kafka::record::ConsumerRecord;
use crate::metrics_consts::{BREAK_ON_ERROR_HIT, RECORDS_PROCESSED, RECORD_PROCESSING_DURATION};

/// User processing logic, invoked once per record.
///
/// The returned future is awaited before the next record is handed out, so
/// implementations that fan work out must only return once it is done.
#[async_trait]
pub trait Processor: Send + Sync {
    async fn process(&self, exchange: &mut Exchange) -> anyhow::Result<()>;
}

/// Receives processing failures that are skipped rather than breaking
pub trait ExceptionHandler: Send + Sync {
    fn handle_exception(&self, exchange: &Exchange, error: &anyhow::Error);
}

pub struct LoggingExceptionHandler;

impl ExceptionHandler for LoggingExceptionHandler {
    fn handle_exception(&self, exchange: &Exchange, error: &anyhow::Error) {
        error!(
            topic = exchange.topic(),
            partition = exchange.partition().partition_number(),
            offset = exchange.offset(),
            error = ?error,
            "Error during processing, skipping record"
        );
    }
}

/// Outcome of processing one record, or of a partition's run so far
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProcessingResult {
    /// Processing of this partition must stop here
    pub break_on_error_hit: bool,
    /// Last offset that is safe to commit; `None` until one exists
    pub partition_last_offset: Option<i64>,
    pub had_exception: bool,
}

impl ProcessingResult {
    /// Nothing processed yet
    pub fn new_unprocessed() -> Self {
        Self::default()
    }

    /// Clean result whose safe offset is `offset`
    pub fn baseline(offset: Option<i64>) -> Self {
        Self {
            break_on_error_hit: false,
            partition_last_offset: offset,
            had_exception: false,
        }
    }
}

/// Where a record sits in the current poll
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordPosition {
    /// More records of the same partition follow
    pub partition_has_more: bool,
    /// More partitions follow in this poll
    pub poll_has_more: bool,
}

impl RecordPosition {
    pub fn is_last_in_partition(&self) -> bool {
        !self.partition_has_more
    }

    pub fn is_last_in_poll(&self) -> bool {
        !self.partition_has_more && !self.poll_has_more
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordProcessorSettings {
    pub auto_commit_enable: bool,
    pub break_on_first_error: bool,
    pub allow_manual_commit: bool,
}

impl Default for RecordProcessorSettings {
    fn default() -> Self {
        Self {
            auto_commit_enable: true,
            break_on_first_error: false,
            allow_manual_commit: false,
        }
    }
}

/// Runs user logic on one record at a time and classifies the outcome
pub struct RecordProcessor {
    processor: Arc<dyn Processor>,
    client: Arc<dyn ConsumerClient>,
    commit_manager: CommitManager,
    header_filter: Arc<dyn HeaderFilterStrategy>,
    header_deserializer: Arc<dyn HeaderDeserializer>,
    settings: RecordProcessorSettings,
}

impl RecordProcessor {
    pub fn new(
        processor: Arc<dyn Processor>,
        client: Arc<dyn ConsumerClient>,
        commit_manager: CommitManager,
        header_filter: Arc<dyn HeaderFilterStrategy>,
        header_deserializer: Arc<dyn HeaderDeserializer>,
        settings: RecordProcessorSettings,
    ) -> Self {
        Self {
            processor,
            client,
            commit_manager,
            header_filter,
            header_deserializer,
            settings,
        }
    }

    pub fn commit_manager(&self) -> &CommitManager {
        &self.commit_manager
    }

    pub fn client(&self) -> &dyn ConsumerClient {
        self.client.as_ref()
    }

    pub fn settings(&self) -> &RecordProcessorSettings {
        &self.settings
    }

    fn build_exchange(&self, record: &ConsumerRecord, position: RecordPosition) -> Exchange {
        let mut exchange = Exchange::from_record(
            record,
            self.header_filter.as_ref(),
            self.header_deserializer.as_ref(),
        );

        if !self.settings.auto_commit_enable {
            exchange.last_record_before_commit = Some(position.is_last_in_partition());
        }
        if self.settings.allow_manual_commit {
            exchange.manual_commit = Some(self.commit_manager.manual_commit(
                Arc::downgrade(&self.client),
                record.partition().clone(),
                record.offset(),
            ));
        }
        if !self.settings.auto_commit_enable || self.settings.allow_manual_commit {
            exchange.last_poll_record = Some(position.is_last_in_poll());
        }

        exchange
    }

    /// Process a single record. Never retries and never fails: the outcome is
    /// encoded in the returned result.
    ///
    /// `last_result` is the partition's running result before this record,
    /// used to find the last safe offset when this record breaks.
    pub async fn process_record(
        &self,
        record: &ConsumerRecord,
        position: RecordPosition,
        last_result: &ProcessingResult,
        exception_handler: &dyn ExceptionHandler,
    ) -> ProcessingResult {
        let mut exchange = self.build_exchange(record, position);

        let started = Instant::now();
        let outcome = AssertUnwindSafe(self.processor.process(&mut exchange))
            .catch_unwind()
            .await;
        metrics::histogram!(RECORD_PROCESSING_DURATION).record(started.elapsed().as_secs_f64());

        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e),
            Err(panic) => Some(anyhow!("processor panicked: {}", panic_message(panic.as_ref()))),
        };

        match failure {
            None => {
                metrics::counter!(RECORDS_PROCESSED, "outcome" => "success").increment(1);
                ProcessingResult::baseline(Some(record.offset()))
            }
            Some(e) => self.process_exception(&exchange, e, last_result, exception_handler),
        }
    }

    fn process_exception(
        &self,
        exchange: &Exchange,
        e: anyhow::Error,
        last_result: &ProcessingResult,
        exception_handler: &dyn ExceptionHandler,
    ) -> ProcessingResult {
        if !self.settings.break_on_first_error {
            metrics::counter!(RECORDS_PROCESSED, "outcome" => "skipped").increment(1);
            exception_handler.handle_exception(exchange, &e);
            return ProcessingResult {
                break_on_error_hit: false,
                partition_last_offset: Some(exchange.offset()),
                had_exception: true,
            };
        }

        metrics::counter!(RECORDS_PROCESSED, "outcome" => "break").increment(1);
        metrics::counter!(
            BREAK_ON_ERROR_HIT,
            "topic" => exchange.topic().to_string(),
            "partition" => exchange.partition().partition_number().to_string()
        )
        .increment(1);

        let last_offset = last_result.partition_last_offset;
        warn!(
            thread_id = self.commit_manager.thread_id(),
            topic = exchange.topic(),
            partition = exchange.partition().partition_number(),
            offset = exchange.offset(),
            resume_after = ?last_offset,
            error = ?e,
            "Error during processing, breaking out of partition"
        );

        match last_offset {
            Some(offset) => {
                // resume exactly at the failing record on the next connection
                if let Err(commit_error) =
                    self.commit_manager
                        .force_commit(self.client.as_ref(), exchange.partition(), offset)
                {
                    warn!(
                        topic = exchange.topic(),
                        partition = exchange.partition().partition_number(),
                        offset = offset,
                        error = %commit_error,
                        "Could not commit last good offset after processing error"
                    );
                }
            }
            None => debug!(
                topic = exchange.topic(),
                partition = exchange.partition().partition_number(),
                "No offset processed yet for partition, nothing to commit"
            ),
        }

        ProcessingResult {
            break_on_error_hit: true,
            partition_last_offset: last_offset,
            had_exception: true,
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
