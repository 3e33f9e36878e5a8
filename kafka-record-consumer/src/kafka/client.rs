use rdkafka::consumer::{self, BaseConsumer, Consumer, ConsumerContext, StreamConsumer};
use rdkafka::error::KafkaResult;
use rdkafka::{Offset, TopicPartitionList};

use crate::kafka::types::Partition;

/// Whether a commit waits for the broker acknowledgement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitMode {
    Sync,
    Async,
}

impl From<CommitMode> for consumer::CommitMode {
    fn from(mode: CommitMode) -> Self {
        match mode {
            CommitMode::Sync => consumer::CommitMode::Sync,
            CommitMode::Async => consumer::CommitMode::Async,
        }
    }
}

/// Where a newly assigned partition starts fetching
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekTarget {
    Beginning,
    End,
    Offset(i64),
}

impl From<SeekTarget> for Offset {
    fn from(target: SeekTarget) -> Self {
        match target {
            SeekTarget::Beginning => Offset::Beginning,
            SeekTarget::End => Offset::End,
            SeekTarget::Offset(offset) => Offset::Offset(offset),
        }
    }
}

/// The slice of the broker client the record pipeline needs.
///
/// `commit` takes the *next* offset to consume, following the Kafka
/// convention. Translating "last processed" offsets into that form is the
/// commit manager's job, never the client's.
pub trait ConsumerClient: Send + Sync {
    fn commit(&self, partition: &Partition, next_offset: i64, mode: CommitMode) -> KafkaResult<()>;
}

fn commit_with<C, K>(
    consumer: &K,
    partition: &Partition,
    next_offset: i64,
    mode: CommitMode,
) -> KafkaResult<()>
where
    C: ConsumerContext,
    K: Consumer<C>,
{
    let mut list = TopicPartitionList::new();
    list.add_partition_offset(
        partition.topic(),
        partition.partition_number(),
        Offset::Offset(next_offset),
    )?;
    consumer.commit(&list, mode.into())
}

impl<C> ConsumerClient for BaseConsumer<C>
where
    C: ConsumerContext + 'static,
{
    fn commit(&self, partition: &Partition, next_offset: i64, mode: CommitMode) -> KafkaResult<()> {
        commit_with::<C, _>(self, partition, next_offset, mode)
    }
}

impl<C> ConsumerClient for StreamConsumer<C>
where
    C: ConsumerContext + 'static,
{
    fn commit(&self, partition: &Partition, next_offset: i64, mode: CommitMode) -> KafkaResult<()> {
        commit_with::<C, _>(self, partition, next_offset, mode)
    }
}
