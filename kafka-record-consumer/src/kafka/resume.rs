//! Where to start reading a partition once it is assigned.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, info, warn};

use crate::error::ConfigError;
use crate::kafka::client::SeekTarget;
use crate::kafka::offset_repository::OffsetRepository;
use crate::kafka::types::Partition;
use crate::metrics_consts::RESUME_POSITIONS;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekPolicy {
    Beginning,
    End,
}

impl FromStr for SeekPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "beginning" => Ok(SeekPolicy::Beginning),
            "end" => Ok(SeekPolicy::End),
            _ => Err(ConfigError::unsupported("seek policy", s)),
        }
    }
}

impl fmt::Display for SeekPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SeekPolicy::Beginning => write!(f, "beginning"),
            SeekPolicy::End => write!(f, "end"),
        }
    }
}

impl From<SeekPolicy> for SeekTarget {
    fn from(policy: SeekPolicy) -> Self {
        match policy {
            SeekPolicy::Beginning => SeekTarget::Beginning,
            SeekPolicy::End => SeekTarget::End,
        }
    }
}

/// Decides where newly assigned partitions start.
///
/// Runs inside the rebalance callback, before the assignment is handed to
/// librdkafka, so the positions it returns are part of the assignment itself.
/// It must not block for long and must not fail the callback. Partitions it
/// leaves out start at the group's committed offset.
pub trait ResumeStrategy: Send + Sync {
    fn start_positions(&self, partitions: &[Partition]) -> Vec<(Partition, SeekTarget)>;
}

/// Leave partitions at the group's committed position
pub struct NoopResumeStrategy;

impl ResumeStrategy for NoopResumeStrategy {
    fn start_positions(&self, partitions: &[Partition]) -> Vec<(Partition, SeekTarget)> {
        debug!(
            partitions = partitions.len(),
            "Resuming from committed offsets"
        );
        vec![]
    }
}

/// Start each partition at its beginning or its end, once per partition
/// for the lifetime of the strategy.
pub struct SeekPolicyResumeStrategy {
    policy: SeekPolicy,
    applied: Mutex<HashSet<Partition>>,
}

impl SeekPolicyResumeStrategy {
    pub fn new(policy: SeekPolicy) -> Self {
        Self {
            policy,
            applied: Mutex::new(HashSet::new()),
        }
    }

    pub fn policy(&self) -> SeekPolicy {
        self.policy
    }
}

impl ResumeStrategy for SeekPolicyResumeStrategy {
    fn start_positions(&self, partitions: &[Partition]) -> Vec<(Partition, SeekTarget)> {
        let mut applied = self.applied.lock().unwrap_or_else(PoisonError::into_inner);
        let mut positions = Vec::with_capacity(partitions.len());

        for partition in partitions {
            if !applied.insert(partition.clone()) {
                debug!(
                    topic = partition.topic(),
                    partition = partition.partition_number(),
                    "Seek policy already applied, keeping committed position"
                );
                continue;
            }

            info!(
                topic = partition.topic(),
                partition = partition.partition_number(),
                policy = %self.policy,
                "Starting partition from seek policy"
            );
            metrics::counter!(RESUME_POSITIONS, "strategy" => "seek_policy", "outcome" => "success")
                .increment(1);
            positions.push((partition.clone(), self.policy.into()));
        }

        positions
    }
}

/// Start each partition right after the offset stored in a repository
pub struct OffsetRepositoryResumeStrategy {
    repository: Arc<dyn OffsetRepository>,
}

impl OffsetRepositoryResumeStrategy {
    pub fn new(repository: Arc<dyn OffsetRepository>) -> Self {
        Self { repository }
    }
}

impl ResumeStrategy for OffsetRepositoryResumeStrategy {
    fn start_positions(&self, partitions: &[Partition]) -> Vec<(Partition, SeekTarget)> {
        let mut positions = Vec::with_capacity(partitions.len());

        for partition in partitions {
            let stored = match self.repository.offset(partition) {
                Ok(Some(offset)) => offset,
                Ok(None) => {
                    debug!(
                        topic = partition.topic(),
                        partition = partition.partition_number(),
                        "No stored offset, keeping committed position"
                    );
                    continue;
                }
                Err(e) => {
                    warn!(
                        topic = partition.topic(),
                        partition = partition.partition_number(),
                        error = %e,
                        "Failed to read stored offset"
                    );
                    metrics::counter!(RESUME_POSITIONS, "strategy" => "offset_repository", "outcome" => "failure")
                        .increment(1);
                    continue;
                }
            };

            let next = stored + 1;
            info!(
                topic = partition.topic(),
                partition = partition.partition_number(),
                offset = next,
                "Resuming partition from offset repository"
            );
            metrics::counter!(RESUME_POSITIONS, "strategy" => "offset_repository", "outcome" => "success")
                .increment(1);
            positions.push((partition.clone(), SeekTarget::Offset(next)));
        }

        positions
    }
}

/// An offset repository wins over a seek policy; with neither, partitions
/// resume from the group's committed offsets.
pub fn resolve_resume_strategy(
    offset_repository: Option<Arc<dyn OffsetRepository>>,
    seek_policy: Option<SeekPolicy>,
) -> Box<dyn ResumeStrategy> {
    match (offset_repository, seek_policy) {
        (Some(repository), _) => Box::new(OffsetRepositoryResumeStrategy::new(repository)),
        (None, Some(policy)) => Box::new(SeekPolicyResumeStrategy::new(policy)),
        (None, None) => Box::new(NoopResumeStrategy),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kafka::offset_repository::{MemoryOffsetRepository, MockOffsetRepository};
    use crate::error::OffsetRepositoryError;
    use test_case::test_case;

    fn p(n: i32) -> Partition {
        Partition::new("test-topic", n)
    }

    #[test_case("beginning", Some(SeekPolicy::Beginning))]
    #[test_case("END", Some(SeekPolicy::End))]
    #[test_case(" end ", Some(SeekPolicy::End))]
    #[test_case("middle", None)]
    #[test_case("", None)]
    fn test_seek_policy_from_str(input: &str, expected: Option<SeekPolicy>) {
        assert_eq!(input.parse::<SeekPolicy>().ok(), expected);
    }

    #[test]
    fn test_unknown_seek_policy_error() {
        let err = "middle".parse::<SeekPolicy>().unwrap_err();
        assert_eq!(err.to_string(), "unsupported seek policy: middle");
    }

    #[test]
    fn test_seek_policy_applies_once_per_partition() {
        let strategy = SeekPolicyResumeStrategy::new(SeekPolicy::Beginning);

        let first = strategy.start_positions(&[p(0), p(1)]);
        let second = strategy.start_positions(&[p(1), p(2)]);

        assert_eq!(
            first,
            vec![(p(0), SeekTarget::Beginning), (p(1), SeekTarget::Beginning)]
        );
        assert_eq!(second, vec![(p(2), SeekTarget::Beginning)]);
    }

    #[test]
    fn test_noop_keeps_committed_positions() {
        assert!(NoopResumeStrategy.start_positions(&[p(0), p(1)]).is_empty());
    }

    #[test]
    fn test_repository_strategy_starts_after_stored_offset() {
        let repository = Arc::new(MemoryOffsetRepository::new());
        repository.store_offset(&p(0), 41).unwrap();

        let positions = OffsetRepositoryResumeStrategy::new(repository).start_positions(&[p(0), p(1)]);

        assert_eq!(positions, vec![(p(0), SeekTarget::Offset(42))]);
    }

    #[test]
    fn test_repository_read_failure_is_skipped() {
        let mut repository = MockOffsetRepository::new();
        repository
            .expect_offset()
            .times(2)
            .returning(|partition| match partition.partition_number() {
                0 => Err(OffsetRepositoryError::InvalidKey("broken".to_string())),
                _ => Ok(Some(9)),
            });

        let positions =
            OffsetRepositoryResumeStrategy::new(Arc::new(repository)).start_positions(&[p(0), p(1)]);

        assert_eq!(positions, vec![(p(1), SeekTarget::Offset(10))]);
    }

    #[test]
    fn test_resolution_order() {
        let repository = Arc::new(MemoryOffsetRepository::new());
        repository.store_offset(&p(0), 5).unwrap();

        assert_eq!(
            resolve_resume_strategy(Some(repository), Some(SeekPolicy::End)).start_positions(&[p(0)]),
            vec![(p(0), SeekTarget::Offset(6))]
        );
        assert_eq!(
            resolve_resume_strategy(None, Some(SeekPolicy::End)).start_positions(&[p(1)]),
            vec![(p(1), SeekTarget::End)]
        );
        assert!(resolve_resume_strategy(None, None)
            .start_positions(&[p(2)])
            .is_empty());
    }
}
