//! Stateful partitioned event processing over Kafka.
//!
//! A [`StateEventSubscription`] consumes an event topic, keeps the latest state
//! per key materialized from a compacted state topic, and commits processor
//! outputs, dead-letters, state updates and consumer offsets in one
//! transaction.
//!
//! ## Error logging (anyhow)
//!
//! When logging `anyhow::Error` or any error with a cause chain, use `{e:#}`
//! inline or `error = ?e` as a structured field so the root cause shows up.
//! Build errors with `.context()` instead of formatting the source into a new
//! message.

pub mod batch;
pub mod bus;
pub mod cache;
pub mod committer;
pub mod config;
pub mod dead_letter;
pub mod error;
pub mod kafka;
pub mod metrics_consts;
pub mod processor;
pub mod rebalance;
pub mod record;
pub mod subscription;
pub mod test_utils;
pub mod topics;

pub use bus::{BusClientFactory, ResetStrategy};
pub use config::SubscriptionConfig;
pub use dead_letter::DeadLetterRecord;
pub use error::{BusError, SubscriptionError};
pub use processor::{Processor, ProcessorResponse};
pub use record::{ProducerRecord, Record, RecordKey};
pub use subscription::{StateEventSubscription, SubscriptionPhase};
pub use topics::SubscriptionTopics;
