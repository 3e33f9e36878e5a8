use std::time::SystemTime;

use crate::kafka::commit_manager::ManualCommit;
use crate::kafka::headers::{HeaderDeserializer, HeaderFilterStrategy, HeaderValue};
use crate::kafka::record::{ConsumerRecord, RecordHeader};
use crate::kafka::types::Partition;

/// The unit of work handed to a [`Processor`](crate::kafka::record_processor::Processor):
/// one record plus the consumer metadata downstream logic may inspect.
#[derive(Debug, Clone)]
pub struct Exchange {
    partition: Partition,
    offset: i64,
    pub key: Option<Vec<u8>>,
    pub body: Option<Vec<u8>>,
    pub timestamp: Option<SystemTime>,
    /// Every broker header, unfiltered
    pub raw_headers: Vec<RecordHeader>,
    /// Headers that passed the filter, in delivery order
    pub headers: Vec<(String, HeaderValue)>,
    /// Set when auto-commit is off: true for the last record of its partition
    /// in this poll, i.e. right before the partition gets committed
    pub last_record_before_commit: Option<bool>,
    /// Set when auto-commit is off or manual commit is allowed: true for the
    /// very last record of the poll
    pub last_poll_record: Option<bool>,
    pub manual_commit: Option<ManualCommit>,
}

impl Exchange {
    /// Copy record metadata onto a fresh exchange, propagating the headers the
    /// filter lets through
    pub fn from_record(
        record: &ConsumerRecord,
        filter: &dyn HeaderFilterStrategy,
        deserializer: &dyn HeaderDeserializer,
    ) -> Self {
        let headers = record
            .headers
            .iter()
            .filter(|header| !filter.should_filter(&header.key, &header.value))
            .map(|header| {
                (
                    header.key.clone(),
                    deserializer.deserialize(&header.key, &header.value),
                )
            })
            .collect();

        Self {
            partition: record.partition().clone(),
            offset: record.offset(),
            key: record.key.clone(),
            body: record.value.clone(),
            timestamp: record.timestamp,
            raw_headers: record.headers.clone(),
            headers,
            last_record_before_commit: None,
            last_poll_record: None,
            manual_commit: None,
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

    /// First propagated header with this name
    pub fn header(&self, name: &str) -> Option<&HeaderValue> {
        self.headers
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value)
    }

    pub fn body_as_str(&self) -> Option<Result<&str, std::str::Utf8Error>> {
        self.body.as_ref().map(|b| std::str::from_utf8(b))
    }
}
