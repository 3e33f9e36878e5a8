//! The poll loop of a single record consumer.
//!
//! Each connection gets a fresh client, commit manager, assignment listener
//! and resume strategy. Breaking on a processing error drops the connection
//! and opens a new one, so consumption resumes at the committed offset,
//! which is the failing record.

use std::sync::Arc;

use futures::StreamExt;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, MessageStream, StreamConsumer};
use rdkafka::error::KafkaError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::ConsumerError;
use crate::kafka::client::ConsumerClient;
use crate::kafka::commit_manager::CommitManager;
use crate::kafka::config::ConsumerSettings;
use crate::kafka::context::PipelineConsumerContext;
use crate::kafka::facade::{ConsumerListener, RecordProcessorFacade};
use crate::kafka::offset_repository::OffsetRepository;
use crate::kafka::poll_exception::{
    benign_error_label, DefaultPollExceptionStrategy, PollExceptionStrategy, PollOnError,
};
use crate::kafka::rebalance_handler::PartitionAssignmentListener;
use crate::kafka::record::{ConsumerRecord, PolledRecords};
use crate::kafka::record_processor::{
    ExceptionHandler, LoggingExceptionHandler, ProcessingResult, Processor, RecordProcessor,
};
use crate::kafka::resume::resolve_resume_strategy;
use crate::metrics_consts::{CONSUMER_RECONNECTS, POLL_ERRORS, REVOKED_RECORDS_DROPPED};

type PipelineConsumer = StreamConsumer<PipelineConsumerContext>;

/// Why a connection's poll loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PollOutcome {
    Stop,
    Reconnect(&'static str),
}

/// What to do after a polling error was handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ErrorAction {
    Continue,
    Retry,
    Stop,
    Reconnect,
}

struct Connection {
    consumer: Arc<PipelineConsumer>,
    commit_manager: CommitManager,
    facade: RecordProcessorFacade,
}

pub struct FetchRecords {
    thread_id: String,
    settings: ConsumerSettings,
    client_config: ClientConfig,
    processor: Arc<dyn Processor>,
    exception_handler: Arc<dyn ExceptionHandler>,
    poll_exception_strategy: Arc<dyn PollExceptionStrategy>,
    offset_repository: Option<Arc<dyn OffsetRepository>>,
    listener: Option<Arc<dyn ConsumerListener>>,
    shutdown: CancellationToken,
}

impl FetchRecords {
    pub fn new(
        thread_id: impl Into<String>,
        settings: ConsumerSettings,
        client_config: ClientConfig,
        processor: Arc<dyn Processor>,
        shutdown: CancellationToken,
    ) -> Self {
        let poll_exception_strategy =
            Arc::new(DefaultPollExceptionStrategy::new(settings.poll_on_error));
        Self {
            thread_id: thread_id.into(),
            settings,
            client_config,
            processor,
            exception_handler: Arc::new(LoggingExceptionHandler),
            poll_exception_strategy,
            offset_repository: None,
            listener: None,
            shutdown,
        }
    }

    pub fn with_exception_handler(mut self, handler: Arc<dyn ExceptionHandler>) -> Self {
        self.exception_handler = handler;
        self
    }

    pub fn with_poll_exception_strategy(mut self, strategy: Arc<dyn PollExceptionStrategy>) -> Self {
        self.poll_exception_strategy = strategy;
        self
    }

    pub fn with_offset_repository(mut self, repository: Option<Arc<dyn OffsetRepository>>) -> Self {
        self.offset_repository = repository;
        self
    }

    pub fn with_listener(mut self, listener: Option<Arc<dyn ConsumerListener>>) -> Self {
        self.listener = listener;
        self
    }

    pub fn thread_id(&self) -> &str {
        &self.thread_id
    }

    /// Consume until shutdown is signalled or the poll exception strategy
    /// says stop. Only failures to create or subscribe a client are returned.
    pub async fn run(self) -> Result<(), ConsumerError> {
        info!(
            thread_id = %self.thread_id,
            topic = %self.settings.topic,
            break_on_first_error = self.settings.break_on_first_error,
            "Starting record consumer"
        );

        while !self.shutdown.is_cancelled() {
            let connection = self.connect()?;

            match self.poll_loop(&connection).await {
                PollOutcome::Stop => break,
                PollOutcome::Reconnect(reason) => {
                    metrics::counter!(CONSUMER_RECONNECTS, "reason" => reason).increment(1);
                    info!(
                        thread_id = %self.thread_id,
                        reason = reason,
                        "Closing consumer to reconnect"
                    );
                    drop(connection);

                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.settings.reconnect_backoff) => {}
                    }
                }
            }
        }

        info!(thread_id = %self.thread_id, "Record consumer stopped");
        Ok(())
    }

    fn connect(&self) -> Result<Connection, ConsumerError> {
        let commit_manager = CommitManager::new(
            self.thread_id.clone(),
            self.offset_repository.clone(),
            self.settings.allow_manual_commit,
        );
        let resume_strategy =
            resolve_resume_strategy(self.offset_repository.clone(), self.settings.seek_policy);
        let assignment_listener = Arc::new(PartitionAssignmentListener::new(
            commit_manager.clone(),
            resume_strategy,
            self.settings.auto_commit_enable,
            self.settings.auto_commit_on_stop,
            self.shutdown.clone(),
        ));

        let consumer: PipelineConsumer = self
            .client_config
            .create_with_context(PipelineConsumerContext::new(assignment_listener))?;
        let consumer = Arc::new(consumer);

        let topics = self.settings.subscription();
        let topic_refs: Vec<&str> = topics.iter().map(String::as_str).collect();
        consumer.subscribe(&topic_refs)?;
        info!(
            thread_id = %self.thread_id,
            topics = ?topics,
            "Subscribed to topics"
        );

        let client: Arc<dyn ConsumerClient> = consumer.clone();
        let record_processor = RecordProcessor::new(
            self.processor.clone(),
            client,
            commit_manager.clone(),
            self.settings.header_filter()?,
            Arc::from(self.settings.header_deserializer.build()),
            self.settings.processor_settings(),
        );

        let mut facade = RecordProcessorFacade::new(
            record_processor,
            self.exception_handler.clone(),
            self.shutdown.clone(),
        );
        if let Some(listener) = &self.listener {
            facade = facade.with_listener(listener.clone());
        }

        Ok(Connection {
            consumer,
            commit_manager,
            facade,
        })
    }

    async fn poll_loop(&self, connection: &Connection) -> PollOutcome {
        let mut stream = connection.consumer.stream();

        loop {
            if self.shutdown.is_cancelled() {
                self.finish(connection);
                return PollOutcome::Stop;
            }

            let (polled, poll_error) = tokio::select! {
                _ = self.shutdown.cancelled() => continue,
                batch = self.consume_batch(&mut stream, &connection.commit_manager) => batch,
            };

            if !polled.is_empty() {
                let result = connection
                    .facade
                    .process_polled_records(&polled, ProcessingResult::new_unprocessed())
                    .await;

                if result.break_on_error_hit {
                    warn!(
                        thread_id = %self.thread_id,
                        resume_after = ?result.partition_last_offset,
                        "Processing broke on error, reconnecting to resume at the failing record"
                    );
                    return PollOutcome::Reconnect("break_on_first_error");
                }
            }

            if let Some(e) = poll_error {
                match self.handle_poll_error(&e) {
                    ErrorAction::Continue => {}
                    ErrorAction::Retry => self.wait_before_retry().await,
                    ErrorAction::Reconnect => return PollOutcome::Reconnect("poll_error"),
                    ErrorAction::Stop => {
                        self.unsubscribe(connection);
                        return PollOutcome::Stop;
                    }
                }
            }
        }
    }

    /// Collect up to `max_poll_records` records within `poll_timeout`.
    ///
    /// A non-benign error ends the batch early and is handed back next to the
    /// records already collected, so those still get processed first.
    ///
    /// A rebalance callback can run inside any `next()`. Records collected for
    /// a partition it revoked are dropped, the records fetched after it are
    /// kept.
    async fn consume_batch(
        &self,
        stream: &mut MessageStream<'_, PipelineConsumerContext>,
        commit_manager: &CommitManager,
    ) -> (PolledRecords, Option<KafkaError>) {
        let mut polled = PolledRecords::new();
        let deadline = tokio::time::sleep(self.settings.poll_timeout);
        tokio::pin!(deadline);

        let poll_error = loop {
            tokio::select! {
                _ = &mut deadline => break None,

                next_msg = stream.next() => {
                    match next_msg {
                        Some(Ok(borrowed_message)) => {
                            self.drop_revoked(&mut polled, commit_manager);
                            polled.push(ConsumerRecord::from_borrowed_message(&borrowed_message));
                            if polled.record_count() >= self.settings.max_poll_records {
                                break None;
                            }
                        }
                        Some(Err(e)) => {
                            if let Some(label) = benign_error_label(&e) {
                                metrics::counter!(POLL_ERRORS, "level" => "info", "error" => label)
                                    .increment(1);
                                continue;
                            }
                            break Some(e);
                        }
                        // Stream ended - return what we have
                        None => break None,
                    }
                }
            }
        };

        self.drop_revoked(&mut polled, commit_manager);
        (polled, poll_error)
    }

    fn drop_revoked(&self, polled: &mut PolledRecords, commit_manager: &CommitManager) {
        let revoked = commit_manager.take_revoked();
        if revoked.is_empty() {
            return;
        }

        let dropped = polled.drop_partitions(&revoked);
        if dropped > 0 {
            info!(
                thread_id = %self.thread_id,
                partitions = revoked.len(),
                records = dropped,
                "Dropped fetched records of revoked partitions"
            );
            metrics::counter!(REVOKED_RECORDS_DROPPED).increment(dropped as u64);
        }
    }

    /// Pause before polling again, cut short by shutdown
    async fn wait_before_retry(&self) {
        tokio::select! {
            _ = self.shutdown.cancelled() => {}
            _ = tokio::time::sleep(self.settings.poll_retry_backoff) => {}
        }
    }

    fn handle_poll_error(&self, e: &KafkaError) -> ErrorAction {
        let on_error = self.poll_exception_strategy.handle_exception(e);
        metrics::counter!(POLL_ERRORS, "level" => "warn", "error" => on_error.to_string())
            .increment(1);

        match on_error {
            PollOnError::Retry => {
                warn!(
                    thread_id = %self.thread_id,
                    error = %e,
                    backoff = ?self.settings.poll_retry_backoff,
                    "Error while polling, polling again after backoff"
                );
                ErrorAction::Retry
            }
            PollOnError::Reconnect => {
                warn!(
                    thread_id = %self.thread_id,
                    error = %e,
                    "Error while polling, will reconnect"
                );
                ErrorAction::Reconnect
            }
            // librdkafka never pins the fetch position on a consume error,
            // the failed record is already behind us
            PollOnError::ErrorHandler => {
                error!(
                    thread_id = %self.thread_id,
                    error = ?e,
                    "Error while polling, continuing with the next record"
                );
                ErrorAction::Continue
            }
            PollOnError::Discard => {
                warn!(
                    thread_id = %self.thread_id,
                    error = %e,
                    "Error while polling, discarding and continuing with the next record"
                );
                ErrorAction::Continue
            }
            PollOnError::Stop => {
                warn!(
                    thread_id = %self.thread_id,
                    error = %e,
                    "Error while polling, stopping consumer"
                );
                ErrorAction::Stop
            }
        }
    }

    /// Flush pending offsets per `auto_commit_on_stop`, then leave the group
    fn finish(&self, connection: &Connection) {
        if self.settings.auto_commit_enable {
            match self.settings.auto_commit_on_stop.commit_mode() {
                Some(mode) => {
                    info!(
                        thread_id = %self.thread_id,
                        mode = %self.settings.auto_commit_on_stop,
                        "Committing pending offsets on stop"
                    );
                    connection
                        .commit_manager
                        .commit_all(connection.consumer.as_ref(), mode);
                }
                None => info!(
                    thread_id = %self.thread_id,
                    "Auto commit on stop is disabled (none)"
                ),
            }
        }
        self.unsubscribe(connection);
    }

    fn unsubscribe(&self, connection: &Connection) {
        debug!(thread_id = %self.thread_id, "Unsubscribing");
        connection.consumer.unsubscribe();
    }
}
