//! Commit Manager - the single source of truth for committed offsets
//!
//! Tracks, per partition, the latest offset that is safe to commit and the
//! last offset that was actually committed. Every commit to the broker (or
//! to the offset repository standing in for it) goes through here.
//!
//! All offsets handled by this module are *last processed* offsets. The
//! conversion to Kafka's "next offset to consume" happens right before the
//! broker call.
//!
//! The partition map sits behind a single mutex which is held for the whole
//! commit round-trip. The rebalance handler and the poll loop both mutate it,
//! and holding the lock keeps a revoke from interleaving with a commit.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tracing::{debug, info, warn};

use crate::error::CommitError;
use crate::kafka::client::{CommitMode, ConsumerClient};
use crate::kafka::offset_repository::OffsetRepository;
use crate::kafka::types::Partition;
use crate::metrics_consts::{
    OFFSET_COMMITS, OFFSET_OUT_OF_ORDER, PARTITION_LAST_COMMITTED_OFFSET,
};

/// Commit state of a partition that has been seen by this consumer.
/// Partitions that were never seen (or were revoked) have no state at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionCommitState {
    /// An offset is waiting for the next commit
    Recorded {
        pending: i64,
        last_committed: Option<i64>,
    },
    /// Everything recorded so far has been committed
    Committed { last_committed: i64 },
}

impl PartitionCommitState {
    pub fn last_committed(&self) -> Option<i64> {
        match self {
            PartitionCommitState::Recorded { last_committed, .. } => *last_committed,
            PartitionCommitState::Committed { last_committed } => Some(*last_committed),
        }
    }

    pub fn pending(&self) -> Option<i64> {
        match self {
            PartitionCommitState::Recorded { pending, .. } => Some(*pending),
            PartitionCommitState::Committed { .. } => None,
        }
    }

    /// The highest offset this consumer knows to be safe for the partition
    pub fn last_recorded(&self) -> i64 {
        match self {
            PartitionCommitState::Recorded { pending, .. } => *pending,
            PartitionCommitState::Committed { last_committed } => *last_committed,
        }
    }
}

enum CommitTarget {
    Broker,
    Repository(Arc<dyn OffsetRepository>),
}

impl CommitTarget {
    fn label(&self) -> &'static str {
        match self {
            CommitTarget::Broker => "broker",
            CommitTarget::Repository(_) => "repository",
        }
    }
}

struct Inner {
    thread_id: String,
    target: CommitTarget,
    partitions: Mutex<HashMap<Partition, PartitionCommitState>>,
    /// Partitions revoked since the poll loop last looked
    revoked: Mutex<HashSet<Partition>>,
}

/// Per-consumer offset bookkeeping. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct CommitManager {
    inner: Arc<Inner>,
}

impl CommitManager {
    /// Offsets are written to `offset_repository` instead of the broker when
    /// one is given, unless manual commits are allowed.
    pub fn new(
        thread_id: impl Into<String>,
        offset_repository: Option<Arc<dyn OffsetRepository>>,
        allow_manual_commit: bool,
    ) -> Self {
        let target = match offset_repository {
            Some(repository) if !allow_manual_commit => CommitTarget::Repository(repository),
            _ => CommitTarget::Broker,
        };

        Self {
            inner: Arc::new(Inner {
                thread_id: thread_id.into(),
                target,
                partitions: Mutex::new(HashMap::new()),
                revoked: Mutex::new(HashSet::new()),
            }),
        }
    }

    pub fn thread_id(&self) -> &str {
        &self.inner.thread_id
    }

    fn partitions(&self) -> MutexGuard<'_, HashMap<Partition, PartitionCommitState>> {
        // A panic while holding the lock cannot leave a half-updated entry:
        // every mutation is a single insert or remove.
        self.inner
            .partitions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Record the latest offset that is safe to commit for a partition.
    ///
    /// Recorded offsets never move backwards. A lower offset is logged and
    /// ignored.
    pub fn record_offset(&self, partition: &Partition, offset: i64) {
        let mut partitions = self.partitions();

        let next = match partitions.get(partition).copied() {
            None => PartitionCommitState::Recorded {
                pending: offset,
                last_committed: None,
            },
            Some(state) if offset < state.last_recorded() => {
                warn!(
                    thread_id = self.thread_id(),
                    topic = partition.topic(),
                    partition = partition.partition_number(),
                    offset = offset,
                    recorded = state.last_recorded(),
                    "Ignoring offset lower than the recorded offset"
                );
                metrics::counter!(
                    OFFSET_OUT_OF_ORDER,
                    "topic" => partition.topic().to_string(),
                    "partition" => partition.partition_number().to_string()
                )
                .increment(1);
                return;
            }
            Some(state) if offset == state.last_recorded() => return,
            Some(state) => PartitionCommitState::Recorded {
                pending: offset,
                last_committed: state.last_committed(),
            },
        };

        partitions.insert(partition.clone(), next);
    }

    /// Flush the recorded offset of a partition, synchronously.
    ///
    /// Returns true when an offset was committed. Does nothing when no offset
    /// was recorded since the previous commit. Failures are logged and the
    /// pending offset is kept so the next commit retries it.
    pub fn commit(&self, client: &dyn ConsumerClient, partition: &Partition) -> bool {
        let mut partitions = self.partitions();

        let Some(pending) = partitions.get(partition).and_then(|state| state.pending()) else {
            debug!(
                thread_id = self.thread_id(),
                topic = partition.topic(),
                partition = partition.partition_number(),
                "Nothing recorded since last commit"
            );
            return false;
        };

        self.commit_locked(&mut partitions, client, partition, pending, CommitMode::Sync)
            .is_ok()
    }

    /// Commit an explicit offset right away, bypassing the recorded offset.
    ///
    /// Used when normal bookkeeping was interrupted (break on error, revoke,
    /// manual commits) so the next consumer resumes right after `offset`.
    pub fn force_commit(
        &self,
        client: &dyn ConsumerClient,
        partition: &Partition,
        offset: i64,
    ) -> Result<(), CommitError> {
        self.commit_with_mode(client, partition, offset, CommitMode::Sync)
    }

    /// Same as [`CommitManager::force_commit`] with a caller chosen commit mode
    pub fn commit_with_mode(
        &self,
        client: &dyn ConsumerClient,
        partition: &Partition,
        offset: i64,
        mode: CommitMode,
    ) -> Result<(), CommitError> {
        let mut partitions = self.partitions();
        debug!(
            thread_id = self.thread_id(),
            topic = partition.topic(),
            partition = partition.partition_number(),
            offset = offset,
            "Forcing offset commit"
        );
        self.commit_locked(&mut partitions, client, partition, offset, mode)
    }

    /// Flush every pending offset, used when the consumer stops.
    /// Returns the number of partitions committed.
    pub fn commit_all(&self, client: &dyn ConsumerClient, mode: CommitMode) -> usize {
        let mut partitions = self.partitions();

        let pending: Vec<(Partition, i64)> = partitions
            .iter()
            .filter_map(|(partition, state)| state.pending().map(|p| (partition.clone(), p)))
            .collect();

        let mut committed = 0;
        for (partition, offset) in pending {
            if self
                .commit_locked(&mut partitions, client, &partition, offset, mode)
                .is_ok()
            {
                committed += 1;
            }
        }

        if committed > 0 {
            info!(
                thread_id = self.thread_id(),
                "Committed offsets for {} partitions",
                committed
            );
        }
        committed
    }

    /// A handle user code can call to commit this specific record early
    pub fn manual_commit(
        &self,
        client: Weak<dyn ConsumerClient>,
        partition: Partition,
        offset: i64,
    ) -> ManualCommit {
        ManualCommit {
            manager: self.clone(),
            client,
            partition,
            offset,
        }
    }

    /// Drop all state for a partition this consumer no longer owns, returning
    /// the offset that was recorded but not committed yet.
    pub fn revoke(&self, partition: &Partition) -> Option<i64> {
        let removed = self.partitions().remove(partition);
        self.inner
            .revoked
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(partition.clone());
        if removed.is_some() {
            debug!(
                thread_id = self.thread_id(),
                topic = partition.topic(),
                partition = partition.partition_number(),
                "Cleared offset tracking for revoked partition"
            );
        }
        removed.and_then(|state| state.pending())
    }

    /// Partitions revoked since the last call.
    ///
    /// Records of these partitions that were fetched before the revoke must
    /// not be processed: their offsets would recreate bookkeeping for a
    /// partition this consumer no longer owns.
    pub fn take_revoked(&self) -> HashSet<Partition> {
        std::mem::take(
            &mut *self
                .inner
                .revoked
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        )
    }

    /// Pending offset if there is one, otherwise the last committed offset
    pub fn last_recorded_offset(&self, partition: &Partition) -> Option<i64> {
        self.partitions()
            .get(partition)
            .map(PartitionCommitState::last_recorded)
    }

    pub fn state(&self, partition: &Partition) -> Option<PartitionCommitState> {
        self.partitions().get(partition).copied()
    }

    pub fn partition_count(&self) -> usize {
        self.partitions().len()
    }

    fn commit_locked(
        &self,
        partitions: &mut HashMap<Partition, PartitionCommitState>,
        client: &dyn ConsumerClient,
        partition: &Partition,
        offset: i64,
        mode: CommitMode,
    ) -> Result<(), CommitError> {
        let current = partitions.get(partition).copied();

        if let Some(committed) = current.and_then(|state| state.last_committed()) {
            if offset < committed {
                warn!(
                    thread_id = self.thread_id(),
                    topic = partition.topic(),
                    partition = partition.partition_number(),
                    offset = offset,
                    committed = committed,
                    "Refusing to move committed offset backwards"
                );
                return Err(CommitError::Regression {
                    partition: partition.clone(),
                    offset,
                    committed,
                });
            }
        }

        let target = self.inner.target.label();
        let result = match &self.inner.target {
            CommitTarget::Broker => client
                .commit(partition, offset + 1, mode)
                .map_err(CommitError::from),
            CommitTarget::Repository(repository) => repository
                .store_offset(partition, offset)
                .map_err(CommitError::from),
        };

        match result {
            Ok(()) => {
                debug!(
                    thread_id = self.thread_id(),
                    topic = partition.topic(),
                    partition = partition.partition_number(),
                    offset = offset,
                    target = target,
                    "Committed offset"
                );
                metrics::counter!(OFFSET_COMMITS, "target" => target, "outcome" => "success")
                    .increment(1);
                metrics::gauge!(
                    PARTITION_LAST_COMMITTED_OFFSET,
                    "topic" => partition.topic().to_string(),
                    "partition" => partition.partition_number().to_string()
                )
                .set(offset as f64);

                let next = match current {
                    Some(PartitionCommitState::Recorded { pending, .. }) if pending > offset => {
                        PartitionCommitState::Recorded {
                            pending,
                            last_committed: Some(offset),
                        }
                    }
                    _ => PartitionCommitState::Committed {
                        last_committed: offset,
                    },
                };
                partitions.insert(partition.clone(), next);
                Ok(())
            }
            Err(e) => {
                warn!(
                    thread_id = self.thread_id(),
                    topic = partition.topic(),
                    partition = partition.partition_number(),
                    offset = offset,
                    target = target,
                    error = ?e,
                    "Failed to commit offset"
                );
                metrics::counter!(OFFSET_COMMITS, "target" => target, "outcome" => "failure")
                    .increment(1);
                Err(e)
            }
        }
    }
}

/// Commit capability bound to a single record, handed to user code when
/// manual commits are allowed.
///
/// Holds only a weak reference to the client: committing after the consumer
/// was dropped fails with [`CommitError::ConsumerGone`].
#[derive(Clone)]
pub struct ManualCommit {
    manager: CommitManager,
    client: Weak<dyn ConsumerClient>,
    partition: Partition,
    offset: i64,
}

impl ManualCommit {
    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    /// Commit this record's offset synchronously
    pub fn commit(&self) -> Result<(), CommitError> {
        let client = self.client.upgrade().ok_or(CommitError::ConsumerGone)?;
        self.manager
            .force_commit(client.as_ref(), &self.partition, self.offset)
    }
}

impl fmt::Debug for ManualCommit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManualCommit")
            .field("thread_id", &self.manager.thread_id())
            .field("partition", &self.partition)
            .field("offset", &self.offset)
            .finish()
    }
}
