use std::collections::HashSet;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rdkafka::message::{BorrowedMessage, Headers, Message};
use tracing::warn;

use crate::kafka::types::Partition;
use crate::metrics_consts::OUT_OF_ORDER_RECORDS;

/// A single broker header as delivered, value kept as raw bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordHeader {
    pub key: String,
    pub value: Vec<u8>,
}

impl RecordHeader {
    pub fn new(key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Owned copy of a polled Kafka record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerRecord {
    partition: Partition,
    offset: i64,
    pub key: Option<Vec<u8>>,
    pub value: Option<Vec<u8>>,
    pub headers: Vec<RecordHeader>,
    pub timestamp: Option<SystemTime>,
}

impl ConsumerRecord {
    pub fn new(partition: Partition, offset: i64) -> Self {
        Self {
            partition,
            offset,
            key: None,
            value: None,
            headers: vec![],
            timestamp: None,
        }
    }

    pub fn with_key(mut self, key: impl Into<Vec<u8>>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_value(mut self, value: impl Into<Vec<u8>>) -> Self {
        self.value = Some(value.into());
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.headers.push(RecordHeader::new(key, value));
        self
    }

    pub fn with_timestamp(mut self, timestamp: SystemTime) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Copy everything out of a borrowed rdkafka message
    pub fn from_borrowed_message(msg: &BorrowedMessage<'_>) -> Self {
        // convert from rdkafka's timestamp to common Rust form
        let timestamp = msg
            .timestamp()
            .to_millis()
            .filter(|ms| *ms >= 0)
            .map(|ms| UNIX_EPOCH + Duration::from_millis(ms as u64));

        let headers = msg
            .headers()
            .map(|headers| {
                headers
                    .iter()
                    .map(|header| {
                        RecordHeader::new(header.key, header.value.unwrap_or_default().to_vec())
                    })
                    .collect()
            })
            .unwrap_or_default();

        Self {
            partition: Partition::new(msg.topic(), msg.partition()),
            offset: msg.offset(),
            key: msg.key().map(|k| k.to_vec()),
            value: msg.payload().map(|p| p.to_vec()),
            headers,
            timestamp,
        }
    }

    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    pub fn topic(&self) -> &str {
        self.partition.topic()
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    /// Get the record key as a UTF-8 string if possible
    pub fn key_as_str(&self) -> Option<Result<&str, std::str::Utf8Error>> {
        self.key.as_ref().map(|k| std::str::from_utf8(k))
    }
}

/// The records of one poll, grouped by partition.
///
/// Partitions keep the order in which they were first seen; records keep
/// broker delivery order, which must be ascending by offset.
#[derive(Debug, Default, Clone)]
pub struct PolledRecords {
    partitions: Vec<(Partition, Vec<ConsumerRecord>)>,
}

impl PolledRecords {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a record to its partition. A record whose offset does not
    /// ascend within the partition is dropped.
    pub fn push(&mut self, record: ConsumerRecord) -> bool {
        let position = self
            .partitions
            .iter()
            .position(|(partition, _)| partition == record.partition());

        let records = match position {
            Some(index) => &mut self.partitions[index].1,
            None => {
                self.partitions.push((record.partition().clone(), vec![]));
                let last = self.partitions.len() - 1;
                &mut self.partitions[last].1
            }
        };

        if let Some(previous) = records.last() {
            if record.offset() <= previous.offset() {
                warn!(
                    topic = record.topic(),
                    partition = record.partition().partition_number(),
                    offset = record.offset(),
                    previous_offset = previous.offset(),
                    "Dropping record that does not ascend within its partition"
                );
                metrics::counter!(
                    OUT_OF_ORDER_RECORDS,
                    "topic" => record.topic().to_string(),
                    "partition" => record.partition().partition_number().to_string()
                )
                .increment(1);
                return false;
            }
        }

        records.push(record);
        true
    }

    pub fn partitions(&self) -> impl Iterator<Item = (&Partition, &[ConsumerRecord])> {
        self.partitions
            .iter()
            .map(|(partition, records)| (partition, records.as_slice()))
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    pub fn record_count(&self) -> usize {
        self.partitions.iter().map(|(_, records)| records.len()).sum()
    }

    pub fn records(&self, partition: &Partition) -> Option<&[ConsumerRecord]> {
        self.partitions
            .iter()
            .find(|(p, _)| p == partition)
            .map(|(_, records)| records.as_slice())
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }

    /// Remove every record of the given partitions, returning how many were
    /// dropped
    pub fn drop_partitions(&mut self, partitions: &HashSet<Partition>) -> usize {
        let mut dropped = 0;
        self.partitions.retain(|(partition, records)| {
            let keep = !partitions.contains(partition);
            if !keep {
                dropped += records.len();
            }
            keep
        });
        dropped
    }
}

impl FromIterator<ConsumerRecord> for PolledRecords {
    fn from_iter<I: IntoIterator<Item = ConsumerRecord>>(iter: I) -> Self {
        let mut polled = PolledRecords::new();
        for record in iter {
            polled.push(record);
        }
        polled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(topic: &str, partition: i32, offset: i64) -> ConsumerRecord {
        ConsumerRecord::new(Partition::new(topic, partition), offset)
    }

    #[test]
    fn test_partitions_keep_first_seen_order() {
        let polled: PolledRecords = vec![
            record("t", 1, 5),
            record("t", 0, 1),
            record("t", 1, 6),
            record("t", 0, 2),
        ]
        .into_iter()
        .collect();

        let order: Vec<_> = polled
            .partitions()
            .map(|(p, records)| {
                (
                    p.partition_number(),
                    records.iter().map(|r| r.offset()).collect::<Vec<_>>(),
                )
            })
            .collect();

        assert_eq!(order, vec![(1, vec![5, 6]), (0, vec![1, 2])]);
        assert_eq!(polled.record_count(), 4);
        assert_eq!(polled.partition_count(), 2);
    }

    #[test]
    fn test_non_ascending_records_are_dropped() {
        let mut polled = PolledRecords::new();
        assert!(polled.push(record("t", 0, 10)));
        assert!(!polled.push(record("t", 0, 10)));
        assert!(!polled.push(record("t", 0, 9)));
        assert!(polled.push(record("t", 0, 11)));

        let offsets: Vec<_> = polled
            .records(&Partition::new("t", 0))
            .unwrap()
            .iter()
            .map(|r| r.offset())
            .collect();
        assert_eq!(offsets, vec![10, 11]);
    }

    #[test]
    fn test_drop_partitions_removes_their_records() {
        let mut polled: PolledRecords = vec![
            record("t", 0, 1),
            record("t", 1, 5),
            record("t", 0, 2),
            record("t", 2, 8),
        ]
        .into_iter()
        .collect();

        let gone = HashSet::from([Partition::new("t", 0), Partition::new("t", 2)]);
        assert_eq!(polled.drop_partitions(&gone), 3);

        assert_eq!(polled.partition_count(), 1);
        assert!(polled.records(&Partition::new("t", 0)).is_none());
        assert_eq!(polled.record_count(), 1);
        assert_eq!(polled.drop_partitions(&gone), 0);
    }

    #[test]
    fn test_record_builders() {
        let rec = record("orders", 2, 7)
            .with_key("user-1")
            .with_value(b"payload".to_vec())
            .with_header("trace", "abc");

        assert_eq!(rec.key_as_str(), Some(Ok("user-1")));
        assert_eq!(rec.value.as_deref(), Some(&b"payload"[..]));
        assert_eq!(rec.headers, vec![RecordHeader::new("trace", "abc")]);
        assert_eq!(rec.topic(), "orders");
    }
}
