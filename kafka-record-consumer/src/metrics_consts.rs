// ==== Record processing ====
/// Counter for records handed to the processor, labelled by outcome
pub const RECORDS_PROCESSED: &str = "kafka_records_processed_total";

/// Histogram for the time spent inside the processor per record
pub const RECORD_PROCESSING_DURATION: &str = "kafka_record_processing_duration_seconds";

/// Counter for partitions that stopped advancing because of break-on-first-error
pub const BREAK_ON_ERROR_HIT: &str = "kafka_break_on_error_hit_total";

/// Counter for records dropped from a poll because their offset did not ascend
pub const OUT_OF_ORDER_RECORDS: &str = "kafka_out_of_order_records_total";

/// Histogram for the number of records in a processed poll
pub const POLL_RECORD_COUNT: &str = "kafka_poll_record_count";

// ==== Offset commits ====
/// Counter for commit attempts, labelled by target and outcome
pub const OFFSET_COMMITS: &str = "kafka_offset_commits_total";

/// Counter for offsets that were recorded below the current recorded offset
pub const OFFSET_OUT_OF_ORDER: &str = "kafka_offset_out_of_order_total";

/// Gauge for the last committed offset per partition
pub const PARTITION_LAST_COMMITTED_OFFSET: &str = "kafka_partition_last_committed_offset";

// ==== Rebalance ====
/// Counter for rebalance callbacks, labelled by event type
pub const REBALANCE_EVENTS: &str = "kafka_rebalance_events_total";

/// Counter for empty rebalance callbacks that were skipped
pub const REBALANCE_EMPTY_SKIPPED: &str = "kafka_rebalance_empty_skipped_total";

/// Counter for start positions set by resume strategies, labelled by strategy and outcome
pub const RESUME_POSITIONS: &str = "kafka_resume_positions_total";

/// Counter for fetched records dropped because their partition was revoked
pub const REVOKED_RECORDS_DROPPED: &str = "kafka_revoked_records_dropped_total";

// ==== Poll loop ====
/// Counter for errors returned while polling, labelled by level and error
pub const POLL_ERRORS: &str = "kafka_poll_errors_total";

/// Counter for consumer reconnects, labelled by reason
pub const CONSUMER_RECONNECTS: &str = "kafka_consumer_reconnects_total";
