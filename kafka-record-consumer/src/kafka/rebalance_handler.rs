use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::kafka::client::{CommitMode, ConsumerClient, SeekTarget};
use crate::kafka::commit_manager::CommitManager;
use crate::kafka::config::AutoCommitOnStop;
use crate::kafka::resume::ResumeStrategy;
use crate::kafka::types::Partition;
use crate::metrics_consts::REBALANCE_EVENTS;

/// Reacts to partitions moving between group members.
///
/// Every method runs synchronously inside librdkafka's rebalance callback,
/// on the task that polls the consumer, so no record of this consumer is
/// being processed while they run. They must stay short: the group waits on
/// them.
pub trait RebalanceHandler: Send + Sync {
    /// Called before ownership of `partitions` is given up
    fn on_partitions_revoked(&self, client: &dyn ConsumerClient, partitions: &[Partition]);

    /// Called with the partitions about to be assigned. The returned positions
    /// are written into the assignment; partitions left out start at the
    /// group's committed offset.
    fn start_positions(&self, _partitions: &[Partition]) -> Vec<(Partition, SeekTarget)> {
        vec![]
    }

    /// Called once `partitions` are owned, before any of their records arrive
    fn on_partitions_assigned(&self, client: &dyn ConsumerClient, partitions: &[Partition]);
}

pub struct NoopRebalanceHandler;

impl RebalanceHandler for NoopRebalanceHandler {
    fn on_partitions_revoked(&self, _client: &dyn ConsumerClient, _partitions: &[Partition]) {}

    fn on_partitions_assigned(&self, _client: &dyn ConsumerClient, _partitions: &[Partition]) {}
}

/// Keeps the commit manager and resume strategy in line with partition
/// ownership.
///
/// On revoke, the last recorded offset of each partition is flushed (when
/// the consumer owns commits) and the partition's bookkeeping is dropped no
/// matter how the flush went. On assign, the resume strategy picks where the
/// new partitions start.
pub struct PartitionAssignmentListener {
    commit_manager: CommitManager,
    resume_strategy: Box<dyn ResumeStrategy>,
    auto_commit_enable: bool,
    auto_commit_on_stop: AutoCommitOnStop,
    shutdown: CancellationToken,
}

impl PartitionAssignmentListener {
    pub fn new(
        commit_manager: CommitManager,
        resume_strategy: Box<dyn ResumeStrategy>,
        auto_commit_enable: bool,
        auto_commit_on_stop: AutoCommitOnStop,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            commit_manager,
            resume_strategy,
            auto_commit_enable,
            auto_commit_on_stop,
            shutdown,
        }
    }

    fn flush_revoked(&self, client: &dyn ConsumerClient, partition: &Partition, offset: i64) {
        let mode = if self.shutdown.is_cancelled() {
            match self.auto_commit_on_stop.commit_mode() {
                Some(mode) => mode,
                None => {
                    info!(
                        thread_id = self.commit_manager.thread_id(),
                        topic = partition.topic(),
                        partition = partition.partition_number(),
                        "Auto commit on stop is disabled, not committing revoked partition"
                    );
                    return;
                }
            }
        } else {
            CommitMode::Sync
        };

        if let Err(e) = self
            .commit_manager
            .commit_with_mode(client, partition, offset, mode)
        {
            warn!(
                thread_id = self.commit_manager.thread_id(),
                topic = partition.topic(),
                partition = partition.partition_number(),
                offset = offset,
                error = %e,
                "Failed to commit offset of revoked partition"
            );
        }
    }
}

impl RebalanceHandler for PartitionAssignmentListener {
    fn on_partitions_revoked(&self, client: &dyn ConsumerClient, partitions: &[Partition]) {
        info!(
            thread_id = self.commit_manager.thread_id(),
            partitions = partitions.len(),
            stopping = self.shutdown.is_cancelled(),
            "Partitions revoked"
        );
        metrics::counter!(REBALANCE_EVENTS, "event_type" => "revoke").increment(1);

        for partition in partitions {
            let pending = self
                .commit_manager
                .state(partition)
                .and_then(|state| state.pending());

            match pending {
                Some(offset) if self.auto_commit_enable => {
                    self.flush_revoked(client, partition, offset)
                }
                Some(offset) => debug!(
                    topic = partition.topic(),
                    partition = partition.partition_number(),
                    offset = offset,
                    "Auto commit disabled, dropping uncommitted offset of revoked partition"
                ),
                None => {}
            }

            // ownership is gone either way
            self.commit_manager.revoke(partition);
        }
    }

    fn start_positions(&self, partitions: &[Partition]) -> Vec<(Partition, SeekTarget)> {
        self.resume_strategy.start_positions(partitions)
    }

    fn on_partitions_assigned(&self, _client: &dyn ConsumerClient, partitions: &[Partition]) {
        info!(
            thread_id = self.commit_manager.thread_id(),
            partitions = partitions.len(),
            "Partitions assigned"
        );
        metrics::counter!(REBALANCE_EVENTS, "event_type" => "assign").increment(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kafka::resume::{NoopResumeStrategy, SeekPolicy, SeekPolicyResumeStrategy};
    use crate::test_utils::RecordingClient;

    fn p(n: i32) -> Partition {
        Partition::new("test-topic", n)
    }

    fn listener(manager: &CommitManager, auto_commit: bool) -> PartitionAssignmentListener {
        PartitionAssignmentListener::new(
            manager.clone(),
            Box::new(NoopResumeStrategy),
            auto_commit,
            AutoCommitOnStop::Sync,
            CancellationToken::new(),
        )
    }

    #[test]
    fn test_revoke_commits_pending_once_and_clears() {
        let manager = CommitManager::new("test-thread", None, false);
        let client = RecordingClient::new();
        manager.record_offset(&p(0), 9);

        listener(&manager, true).on_partitions_revoked(&client, &[p(0)]);

        assert_eq!(client.commits(), vec![(p(0), 10, CommitMode::Sync)]);
        assert_eq!(manager.state(&p(0)), None);
    }

    #[test]
    fn test_revoke_without_auto_commit_only_clears() {
        let manager = CommitManager::new("test-thread", None, false);
        let client = RecordingClient::new();
        manager.record_offset(&p(0), 9);

        listener(&manager, false).on_partitions_revoked(&client, &[p(0)]);

        assert_eq!(client.commit_count(), 0);
        assert_eq!(manager.state(&p(0)), None);
    }

    #[test]
    fn test_revoke_clears_even_when_commit_fails() {
        let manager = CommitManager::new("test-thread", None, false);
        let client = RecordingClient::new();
        client.fail_commits(true);
        manager.record_offset(&p(0), 9);
        manager.record_offset(&p(1), 3);

        listener(&manager, true).on_partitions_revoked(&client, &[p(0), p(1)]);

        assert_eq!(manager.partition_count(), 0);
    }

    #[test]
    fn test_revoke_of_committed_partition_does_not_commit() {
        let manager = CommitManager::new("test-thread", None, false);
        let client = RecordingClient::new();
        manager.record_offset(&p(0), 9);
        manager.commit(&client, &p(0));

        listener(&manager, true).on_partitions_revoked(&client, &[p(0)]);

        assert_eq!(client.commit_count(), 1);
        assert_eq!(manager.state(&p(0)), None);
    }

    #[test]
    fn test_revoke_while_stopping_uses_stop_mode() {
        let manager = CommitManager::new("test-thread", None, false);
        let client = RecordingClient::new();
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        manager.record_offset(&p(0), 4);
        manager.record_offset(&p(1), 6);

        let async_listener = PartitionAssignmentListener::new(
            manager.clone(),
            Box::new(NoopResumeStrategy),
            true,
            AutoCommitOnStop::Async,
            shutdown.clone(),
        );
        async_listener.on_partitions_revoked(&client, &[p(0)]);
        assert_eq!(client.commits(), vec![(p(0), 5, CommitMode::Async)]);

        let none_listener = PartitionAssignmentListener::new(
            manager.clone(),
            Box::new(NoopResumeStrategy),
            true,
            AutoCommitOnStop::None,
            shutdown,
        );
        none_listener.on_partitions_revoked(&client, &[p(1)]);
        assert_eq!(client.commit_count(), 1);
        assert_eq!(manager.partition_count(), 0);
    }

    #[test]
    fn test_start_positions_come_from_resume_strategy() {
        let manager = CommitManager::new("test-thread", None, false);
        let listener = PartitionAssignmentListener::new(
            manager,
            Box::new(SeekPolicyResumeStrategy::new(SeekPolicy::End)),
            true,
            AutoCommitOnStop::Sync,
            CancellationToken::new(),
        );

        assert_eq!(
            listener.start_positions(&[p(0), p(1)]),
            vec![(p(0), SeekTarget::End), (p(1), SeekTarget::End)]
        );
        assert!(listener.start_positions(&[p(0)]).is_empty());
    }

    #[test]
    fn test_noop_handler_keeps_committed_positions() {
        assert!(NoopRebalanceHandler.start_positions(&[p(0)]).is_empty());
    }
}
