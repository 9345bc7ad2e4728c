// ==== Batch processing ====
/// Histogram of the time spent running the processor over one polled batch
pub const BATCH_PROCESSING_DURATION: &str = "state_event_batch_processing_duration_seconds";

/// Counter of events handed to the processor
pub const EVENTS_PROCESSED: &str = "state_event_events_processed_total";

/// Counter of events routed to the dead-letter topic, labelled by reason
pub const EVENTS_DEAD_LETTERED: &str = "state_event_events_dead_lettered_total";

/// Counter of batches discarded because a partition was revoked
pub const BATCHES_ABANDONED: &str = "state_event_batches_abandoned_total";

// ==== Transactions ====
/// Histogram of begin-to-commit time of one batch transaction
pub const COMMIT_DURATION: &str = "state_event_commit_duration_seconds";

/// Counter of committed transactions
pub const TRANSACTIONS_COMMITTED: &str = "state_event_transactions_committed_total";

/// Counter of aborted transactions
pub const TRANSACTIONS_ABORTED: &str = "state_event_transactions_aborted_total";

// ==== Rebalance and replay ====
pub const PARTITIONS_ASSIGNED: &str = "state_event_partitions_assigned_total";
pub const PARTITIONS_REVOKED: &str = "state_event_partitions_revoked_total";

/// Histogram of the time spent replaying the state topic after an assignment
pub const STATE_REPLAY_DURATION: &str = "state_event_state_replay_duration_seconds";

/// Counter of state records read during replay
pub const STATE_REPLAY_RECORDS: &str = "state_event_state_replay_records_total";

// ==== Failures ====
/// Counter of cycle failures, labelled by error type
pub const CYCLE_FAILURES: &str = "state_event_cycle_failures_total";

/// Counter of retries after intermittent failures
pub const RETRIES: &str = "state_event_retries_total";

/// Counter of broker client errors, labelled by operation and kind
pub const KAFKA_ERRORS: &str = "state_event_kafka_errors_total";
