use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use kafka_record_consumer::kafka::client::{CommitMode, SeekTarget};
use kafka_record_consumer::kafka::commit_manager::CommitManager;
use kafka_record_consumer::kafka::config::AutoCommitOnStop;
use kafka_record_consumer::kafka::facade::RecordProcessorFacade;
use kafka_record_consumer::kafka::offset_repository::{
    FileOffsetRepository, OffsetRepository,
};
use kafka_record_consumer::kafka::rebalance_handler::{
    PartitionAssignmentListener, RebalanceHandler,
};
use kafka_record_consumer::kafka::record_processor::{LoggingExceptionHandler, ProcessingResult};
use kafka_record_consumer::kafka::resume::{resolve_resume_strategy, SeekPolicy};
use kafka_record_consumer::kafka::types::Partition;
use kafka_record_consumer::test_utils::{
    polled_records, record_processor, RecordingClient, RecordingProcessor,
};

fn p(n: i32) -> Partition {
    Partition::new("payments", n)
}

fn listener(
    manager: &CommitManager,
    repository: Option<Arc<dyn OffsetRepository>>,
    seek_policy: Option<SeekPolicy>,
) -> PartitionAssignmentListener {
    PartitionAssignmentListener::new(
        manager.clone(),
        resolve_resume_strategy(repository, seek_policy),
        true,
        AutoCommitOnStop::Sync,
        CancellationToken::new(),
    )
}

#[test]
fn test_revoke_flushes_pending_offset_once_and_forgets_partition() {
    let client = RecordingClient::new();
    let manager = CommitManager::new("rebalance-test", None, false);
    manager.record_offset(&p(0), 9);

    listener(&manager, None, None).on_partitions_revoked(&client, &[p(0)]);

    assert_eq!(client.commits(), vec![(p(0), 10, CommitMode::Sync)]);
    assert_eq!(manager.state(&p(0)), None);
    assert_eq!(manager.last_recorded_offset(&p(0)), None);
}

#[test]
fn test_reassigned_partition_starts_fresh() {
    let client = RecordingClient::new();
    let manager = CommitManager::new("rebalance-test", None, false);
    let listener = listener(&manager, None, None);

    manager.record_offset(&p(0), 50);
    listener.on_partitions_revoked(&client, &[p(0)]);
    listener.on_partitions_assigned(&client, &[p(0)]);

    // a lower offset is accepted again once the old ownership is gone
    manager.record_offset(&p(0), 20);
    assert_eq!(manager.last_recorded_offset(&p(0)), Some(20));
}

#[test]
fn test_seek_policy_applies_once_per_partition() {
    let client = RecordingClient::new();
    let manager = CommitManager::new("rebalance-test", None, false);
    let listener = listener(&manager, None, Some(SeekPolicy::Beginning));

    let first = listener.start_positions(&[p(0), p(1)]);
    listener.on_partitions_assigned(&client, &[p(0), p(1)]);
    listener.on_partitions_revoked(&client, &[p(1)]);
    let second = listener.start_positions(&[p(1), p(2)]);

    assert_eq!(
        first,
        vec![(p(0), SeekTarget::Beginning), (p(1), SeekTarget::Beginning)]
    );
    assert_eq!(second, vec![(p(2), SeekTarget::Beginning)]);
}

#[test]
fn test_file_repository_round_trip_through_rebalance() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("offsets.json");
    let client = RecordingClient::new();

    {
        let repository: Arc<dyn OffsetRepository> =
            Arc::new(FileOffsetRepository::open(&path).unwrap());
        let manager = CommitManager::new("rebalance-test", Some(repository.clone()), false);
        manager.record_offset(&p(3), 77);

        listener(&manager, Some(repository), None).on_partitions_revoked(&client, &[p(3)]);
    }

    // a later consumer, possibly another process, picks the partition up
    let repository: Arc<dyn OffsetRepository> =
        Arc::new(FileOffsetRepository::open(&path).unwrap());
    let manager = CommitManager::new("rebalance-test-2", Some(repository.clone()), false);
    let positions =
        listener(&manager, Some(repository), Some(SeekPolicy::End)).start_positions(&[p(3), p(4)]);

    assert_eq!(client.commit_count(), 0);
    assert_eq!(positions, vec![(p(3), SeekTarget::Offset(78))]);
}

#[tokio::test]
async fn test_revoke_between_fetch_and_processing_drops_records() {
    let client = Arc::new(RecordingClient::new());
    let processor = Arc::new(RecordingProcessor::new());
    let facade = RecordProcessorFacade::new(
        record_processor(processor.clone(), client.clone(), Default::default()),
        Arc::new(LoggingExceptionHandler),
        CancellationToken::new(),
    );
    let manager = facade.record_processor().commit_manager().clone();

    facade
        .process_polled_records(
            &polled_records(&[(p(0), &[8, 9])]),
            ProcessingResult::new_unprocessed(),
        )
        .await;
    // revoked after the next poll was fetched, before it is processed
    listener(&manager, None, None).on_partitions_revoked(client.as_ref(), &[p(0)]);
    facade
        .process_polled_records(
            &polled_records(&[(p(0), &[10, 11])]),
            ProcessingResult::new_unprocessed(),
        )
        .await;

    assert_eq!(processor.processed_offsets(&p(0)), vec![8, 9]);
    assert_eq!(client.committed_offsets(&p(0)), vec![10]);
    assert_eq!(manager.partition_count(), 0);
}
