use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use kafka_record_consumer::kafka::client::CommitMode;
use kafka_record_consumer::kafka::commit_manager::CommitManager;
use kafka_record_consumer::kafka::exchange::Exchange;
use kafka_record_consumer::kafka::facade::RecordProcessorFacade;
use kafka_record_consumer::kafka::headers::{NoopHeaderFilterStrategy, Utf8HeaderDeserializer};
use kafka_record_consumer::kafka::offset_repository::{MemoryOffsetRepository, OffsetRepository};
use kafka_record_consumer::kafka::record_processor::{
    LoggingExceptionHandler, ProcessingResult, Processor, RecordProcessor,
    RecordProcessorSettings,
};
use kafka_record_consumer::kafka::types::Partition;
use kafka_record_consumer::test_utils::{
    polled_records, record_processor, CollectingExceptionHandler, RecordingClient,
    RecordingProcessor,
};

fn p0() -> Partition {
    Partition::new("orders", 0)
}

fn facade(
    processor: Arc<RecordingProcessor>,
    client: Arc<RecordingClient>,
    settings: RecordProcessorSettings,
) -> RecordProcessorFacade {
    RecordProcessorFacade::new(
        record_processor(processor, client, settings),
        Arc::new(LoggingExceptionHandler),
        CancellationToken::new(),
    )
}

#[tokio::test]
async fn test_break_on_first_error_commits_last_good_offset() {
    let client = Arc::new(RecordingClient::new());
    let processor = Arc::new(RecordingProcessor::failing_on(&[11]));
    let facade = facade(
        processor.clone(),
        client.clone(),
        RecordProcessorSettings {
            break_on_first_error: true,
            ..Default::default()
        },
    );

    let result = facade
        .process_polled_records(
            &polled_records(&[(p0(), &[10, 11, 12])]),
            ProcessingResult::new_unprocessed(),
        )
        .await;

    assert!(result.break_on_error_hit);
    assert_eq!(result.partition_last_offset, Some(10));
    assert_eq!(processor.processed_offsets(&p0()), vec![10, 11]);
    // broker commits carry the next offset to read: the failing record
    assert_eq!(client.commits(), vec![(p0(), 11, CommitMode::Sync)]);
}

#[tokio::test]
async fn test_break_on_first_record_commits_nothing() {
    let client = Arc::new(RecordingClient::new());
    let processor = Arc::new(RecordingProcessor::failing_on(&[10]));
    let facade = facade(
        processor.clone(),
        client.clone(),
        RecordProcessorSettings {
            break_on_first_error: true,
            ..Default::default()
        },
    );

    let result = facade
        .process_polled_records(
            &polled_records(&[(p0(), &[10, 11, 12])]),
            ProcessingResult::new_unprocessed(),
        )
        .await;

    assert!(result.break_on_error_hit);
    assert_eq!(result.partition_last_offset, None);
    assert_eq!(processor.processed_offsets(&p0()), vec![10]);
    assert_eq!(client.commit_count(), 0);
}

#[tokio::test]
async fn test_skip_on_error_processes_everything_and_commits_once() {
    let client = Arc::new(RecordingClient::new());
    let processor = Arc::new(RecordingProcessor::failing_on(&[11]));
    let handler = Arc::new(CollectingExceptionHandler::default());
    let facade = RecordProcessorFacade::new(
        record_processor(processor.clone(), client.clone(), Default::default()),
        handler.clone(),
        CancellationToken::new(),
    );

    let result = facade
        .process_polled_records(
            &polled_records(&[(p0(), &[10, 11, 12])]),
            ProcessingResult::new_unprocessed(),
        )
        .await;

    assert!(!result.break_on_error_hit);
    assert_eq!(result.partition_last_offset, Some(12));
    assert_eq!(processor.processed_offsets(&p0()), vec![10, 11, 12]);
    assert_eq!(handler.offsets(), vec![11]);
    assert_eq!(client.commits(), vec![(p0(), 13, CommitMode::Sync)]);
}

#[tokio::test]
async fn test_records_are_processed_in_offset_order_per_partition() {
    let client = Arc::new(RecordingClient::new());
    let processor = Arc::new(RecordingProcessor::new());
    let facade = facade(processor.clone(), client.clone(), Default::default());
    let p1 = Partition::new("orders", 1);

    facade
        .process_polled_records(
            &polled_records(&[(p0(), &[3, 4, 5, 9]), (p1.clone(), &[100, 101])]),
            ProcessingResult::new_unprocessed(),
        )
        .await;

    assert_eq!(processor.processed_offsets(&p0()), vec![3, 4, 5, 9]);
    assert_eq!(processor.processed_offsets(&p1), vec![100, 101]);
}

#[test]
fn test_committed_offsets_never_go_backwards() {
    let client = RecordingClient::new();
    let manager = CommitManager::new("pipeline-test", None, false);

    for offset in [4, 7, 5, 7, 9, 2, 12] {
        manager.record_offset(&p0(), offset);
        manager.commit(&client, &p0());
    }

    let committed = client.committed_offsets(&p0());
    assert!(committed.windows(2).all(|pair| pair[0] < pair[1]));
    assert_eq!(committed.last(), Some(&13));
}

#[test]
fn test_second_commit_without_new_offset_is_a_noop() {
    let client = RecordingClient::new();
    let manager = CommitManager::new("pipeline-test", None, false);

    manager.record_offset(&p0(), 20);
    assert!(manager.commit(&client, &p0()));
    assert!(!manager.commit(&client, &p0()));

    assert_eq!(client.commit_count(), 1);
}

#[tokio::test]
async fn test_repository_replaces_broker_commits() {
    let client = Arc::new(RecordingClient::new());
    let repository = Arc::new(MemoryOffsetRepository::new());
    let store: Arc<dyn OffsetRepository> = repository.clone();
    let processor = Arc::new(RecordingProcessor::new());
    let record_processor = RecordProcessor::new(
        processor,
        client.clone(),
        CommitManager::new("pipeline-test", Some(store), false),
        Arc::new(NoopHeaderFilterStrategy),
        Arc::new(Utf8HeaderDeserializer),
        RecordProcessorSettings::default(),
    );
    let facade = RecordProcessorFacade::new(
        record_processor,
        Arc::new(LoggingExceptionHandler),
        CancellationToken::new(),
    );

    facade
        .process_polled_records(
            &polled_records(&[(p0(), &[30, 31])]),
            ProcessingResult::new_unprocessed(),
        )
        .await;

    assert_eq!(client.commit_count(), 0);
    // the repository keeps the last processed offset, not the next one
    assert_eq!(repository.offset(&p0()).unwrap(), Some(31));
}

/// Commits every record by hand and remembers the poll markers it saw
#[derive(Default)]
struct ManualCommittingProcessor {
    markers: Mutex<Vec<(i64, Option<bool>, Option<bool>)>>,
}

#[async_trait]
impl Processor for ManualCommittingProcessor {
    async fn process(&self, exchange: &mut Exchange) -> Result<()> {
        self.markers.lock().unwrap().push((
            exchange.offset(),
            exchange.last_record_before_commit,
            exchange.last_poll_record,
        ));
        let manual_commit = exchange
            .manual_commit
            .as_ref()
            .ok_or_else(|| anyhow!("manual commit handle missing"))?;
        manual_commit.commit()?;
        Ok(())
    }
}

#[tokio::test]
async fn test_manual_commit_without_auto_commit() {
    let client = Arc::new(RecordingClient::new());
    let processor = Arc::new(ManualCommittingProcessor::default());
    let facade = RecordProcessorFacade::new(
        record_processor(
            processor.clone(),
            client.clone(),
            RecordProcessorSettings {
                auto_commit_enable: false,
                allow_manual_commit: true,
                ..Default::default()
            },
        ),
        Arc::new(LoggingExceptionHandler),
        CancellationToken::new(),
    );

    let result = facade
        .process_polled_records(
            &polled_records(&[(p0(), &[1, 2])]),
            ProcessingResult::new_unprocessed(),
        )
        .await;

    assert!(!result.had_exception);
    assert_eq!(client.committed_offsets(&p0()), vec![2, 3]);
    assert_eq!(
        *processor.markers.lock().unwrap(),
        vec![(1, Some(false), Some(false)), (2, Some(true), Some(true))]
    );
}
