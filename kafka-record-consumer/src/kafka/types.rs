use std::fmt;

use rdkafka::topic_partition_list::TopicPartitionListElem;
use rdkafka::TopicPartitionList;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Partition {
    topic: String,
    partition_number: i32,
}

impl Partition {
    pub fn new(topic: impl Into<String>, partition_number: i32) -> Self {
        Self {
            topic: topic.into(),
            partition_number,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition_number(&self) -> i32 {
        self.partition_number
    }

    /// Key used by offset repositories: `{topic}/{partition}`
    pub fn offset_key(&self) -> String {
        format!("{}/{}", self.topic, self.partition_number)
    }

    /// Inverse of [`Partition::offset_key`]. The topic may itself contain `/`,
    /// so the partition number is taken from the last segment.
    pub fn from_offset_key(key: &str) -> Option<Self> {
        let (topic, partition) = key.rsplit_once('/')?;
        if topic.is_empty() {
            return None;
        }
        let partition_number = partition.parse::<i32>().ok()?;
        Some(Self::new(topic, partition_number))
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.topic, self.partition_number)
    }
}

impl From<TopicPartitionListElem<'_>> for Partition {
    fn from(elem: TopicPartitionListElem<'_>) -> Self {
        Self::new(elem.topic(), elem.partition())
    }
}

/// Flatten an rdkafka partition list into our own partition type
pub fn partitions_from_list(list: &TopicPartitionList) -> Vec<Partition> {
    list.elements().into_iter().map(Partition::from).collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PartitionOffset {
    partition: Partition,
    offset: i64,
}

impl PartitionOffset {
    pub fn new(partition: Partition, offset: i64) -> Self {
        Self { partition, offset }
    }

    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    pub fn topic(&self) -> &str {
        self.partition.topic()
    }

    pub fn partition_number(&self) -> i32 {
        self.partition.partition_number()
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rdkafka::Offset;

    #[test]
    fn test_offset_key_round_trip() {
        let partition = Partition::new("orders", 3);
        assert_eq!(partition.offset_key(), "orders/3");
        assert_eq!(Partition::from_offset_key("orders/3"), Some(partition));
    }

    #[test]
    fn test_offset_key_with_slash_in_topic() {
        let parsed = Partition::from_offset_key("team/orders/12").unwrap();
        assert_eq!(parsed.topic(), "team/orders");
        assert_eq!(parsed.partition_number(), 12);
    }

    #[test]
    fn test_invalid_offset_keys() {
        assert_eq!(Partition::from_offset_key("orders"), None);
        assert_eq!(Partition::from_offset_key("orders/x"), None);
        assert_eq!(Partition::from_offset_key("/1"), None);
    }

    #[test]
    fn test_partitions_from_list() {
        let mut list = TopicPartitionList::new();
        list.add_partition_offset("a", 0, Offset::Beginning).unwrap();
        list.add_partition_offset("b", 2, Offset::Beginning).unwrap();

        let partitions = partitions_from_list(&list);
        assert_eq!(
            partitions,
            vec![Partition::new("a", 0), Partition::new("b", 2)]
        );
    }
}
