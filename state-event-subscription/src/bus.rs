//! The log transport, as seen by a subscription.
//!
//! Consumers and producers are not shared between tasks: the subscription
//! worker is the only caller of poll and of every transactional method. The
//! rebalance listener is the exception; the transport may invoke it from its
//! own threads, so implementations must be thread-safe.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::BusError;
use crate::record::{PartitionOffset, PolledRecord, ProducerRecord};

/// Where to move consumer positions after an aborted cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResetStrategy {
    /// Back to the group's committed offset, earliest if nothing was committed.
    #[default]
    LastCommitted,
    /// Back to the beginning of every assigned partition.
    Earliest,
}

impl std::str::FromStr for ResetStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "last_committed" | "committed" => Ok(ResetStrategy::LastCommitted),
            "earliest" => Ok(ResetStrategy::Earliest),
            other => Err(format!("unknown offset reset strategy: {other}")),
        }
    }
}

pub trait RebalanceListener: Send + Sync {
    fn on_partitions_assigned(&self, partitions: &[i32]);

    fn on_partitions_revoked(&self, partitions: &[i32]);
}

#[async_trait]
pub trait EventConsumer: Send + Sync {
    /// Joins the consumer group for `topic`. Assignments and revocations are
    /// reported to the listener the consumer was created with.
    fn subscribe(&mut self, topic: &str) -> Result<(), BusError>;

    /// Returns up to `max_records` records, waiting at most `timeout` for the
    /// first one. An empty batch is not an error.
    async fn poll(
        &mut self,
        max_records: usize,
        timeout: Duration,
    ) -> Result<Vec<PolledRecord>, BusError>;

    /// Moves every assigned partition back so uncommitted records are
    /// delivered again.
    fn reset_to_last_committed_positions(&mut self, strategy: ResetStrategy)
        -> Result<(), BusError>;
}

#[async_trait]
pub trait StateReader: Send {
    /// Reads `partitions` of `topic` from the earliest offset up to the log
    /// end observed when the call started.
    async fn read_to_end(
        &mut self,
        topic: &str,
        partitions: &[i32],
    ) -> Result<Vec<PolledRecord>, BusError>;
}

#[async_trait]
pub trait TransactionalProducer: Send {
    type Consumer: EventConsumer;

    fn begin_transaction(&mut self) -> Result<(), BusError>;

    /// Sends records inside the open transaction and waits for delivery.
    async fn send(&mut self, records: Vec<ProducerRecord>) -> Result<(), BusError>;

    /// Adds the consumer's next offsets to the open transaction.
    fn send_offsets_to_transaction(
        &mut self,
        offsets: &[PartitionOffset],
        consumer: &Self::Consumer,
    ) -> Result<(), BusError>;

    fn commit_transaction(&mut self) -> Result<(), BusError>;

    fn abort_transaction(&mut self) -> Result<(), BusError>;
}

/// Creates the transport clients for one connection attempt.
#[async_trait]
pub trait BusClientFactory: Send + Sync + 'static {
    type Consumer: EventConsumer + 'static;
    type Producer: TransactionalProducer<Consumer = Self::Consumer> + 'static;
    type StateReader: StateReader + 'static;

    async fn create_consumer(
        &self,
        group_id: &str,
        client_id: &str,
        listener: Arc<dyn RebalanceListener>,
    ) -> Result<Self::Consumer, BusError>;

    async fn create_producer(&self, transactional_id: &str) -> Result<Self::Producer, BusError>;

    async fn create_state_reader(&self, client_id: &str) -> Result<Self::StateReader, BusError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("last_committed", Some(ResetStrategy::LastCommitted) ; "last committed")]
    #[test_case("Committed", Some(ResetStrategy::LastCommitted) ; "committed alias")]
    #[test_case(" earliest ", Some(ResetStrategy::Earliest) ; "earliest")]
    #[test_case("latest", None ; "latest is not supported")]
    fn parses_reset_strategy(raw: &str, expected: Option<ResetStrategy>) {
        assert_eq!(raw.parse::<ResetStrategy>().ok(), expected);
    }
}
