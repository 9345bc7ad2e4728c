use std::time::Instant;

use metrics::{counter, histogram};
use tracing::{debug, error};

use crate::batch::StagedBatch;
use crate::bus::TransactionalProducer;
use crate::cache::MaterializedStateCache;
use crate::error::{BusError, SubscriptionError};
use crate::metrics_consts::{COMMIT_DURATION, TRANSACTIONS_ABORTED, TRANSACTIONS_COMMITTED};
use crate::record::{PartitionOffset, ProducerRecord, RecordKey};
use crate::topics::SubscriptionTopics;

/// Counts of what one committed transaction carried.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CommitSummary {
    pub outputs: usize,
    pub dead_letters: usize,
    pub state_writes: usize,
    pub partitions: usize,
}

/// Commits a staged batch as one transaction: outputs, dead-letters, state
/// writes and consumer offsets become visible together or not at all. The
/// cache is updated only once the commit succeeded.
pub struct TransactionalCommitter {
    topics: SubscriptionTopics,
}

impl TransactionalCommitter {
    pub fn new(topics: SubscriptionTopics) -> Self {
        Self { topics }
    }

    pub async fn commit<P, K, S>(
        &self,
        producer: &mut P,
        consumer: &P::Consumer,
        batch: StagedBatch<K, S>,
        cache: &mut MaterializedStateCache<K, S>,
    ) -> Result<CommitSummary, SubscriptionError>
    where
        P: TransactionalProducer,
        K: RecordKey,
    {
        let dead_letters = batch
            .dead_letters
            .iter()
            .map(|d| d.to_producer_record(&self.topics.dead_letter))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| SubscriptionError::fatal("encode_dead_letter", e))?;

        let state_records: Vec<ProducerRecord> = batch
            .state_writes
            .iter()
            .map(|w| {
                ProducerRecord::new(&self.topics.state, w.key.to_key_bytes(), w.payload.clone())
                    .with_partition(w.partition)
            })
            .collect();

        let summary = CommitSummary {
            outputs: batch.output_records.len(),
            dead_letters: dead_letters.len(),
            state_writes: state_records.len(),
            partitions: batch.offsets.len(),
        };

        let start = Instant::now();
        producer.begin_transaction()?;

        let sent = send_in_transaction(
            producer,
            consumer,
            batch.output_records,
            dead_letters,
            state_records,
            &batch.offsets,
        )
        .await;

        if let Err(e) = sent {
            counter!(TRANSACTIONS_ABORTED).increment(1);
            if let Err(abort_err) = producer.abort_transaction() {
                error!(error = ?abort_err, "failed to abort transaction after {e}");
            }
            return Err(e.into());
        }

        for write in batch.state_writes {
            cache.apply(write.partition, write.key, write.state);
        }

        counter!(TRANSACTIONS_COMMITTED).increment(1);
        histogram!(COMMIT_DURATION).record(start.elapsed().as_secs_f64());
        debug!(
            outputs = summary.outputs,
            dead_letters = summary.dead_letters,
            state_writes = summary.state_writes,
            partitions = summary.partitions,
            "transaction committed"
        );
        Ok(summary)
    }
}

async fn send_in_transaction<P: TransactionalProducer>(
    producer: &mut P,
    consumer: &P::Consumer,
    outputs: Vec<ProducerRecord>,
    dead_letters: Vec<ProducerRecord>,
    state_records: Vec<ProducerRecord>,
    offsets: &[PartitionOffset],
) -> Result<(), BusError> {
    if !outputs.is_empty() {
        producer.send(outputs).await?;
    }
    if !dead_letters.is_empty() {
        producer.send(dead_letters).await?;
    }
    if !state_records.is_empty() {
        producer.send(state_records).await?;
    }
    producer.send_offsets_to_transaction(offsets, consumer)?;
    producer.commit_transaction()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::StateWrite;
    use crate::bus::{BusClientFactory, EventConsumer};
    use crate::dead_letter::DeadLetterRecord;
    use crate::rebalance::RebalanceCoordinator;
    use crate::test_utils::{FaultPoint, InMemoryBus};
    use std::collections::HashMap;

    fn staged(offset: i64) -> StagedBatch<String, i64> {
        StagedBatch {
            output_records: vec![ProducerRecord::new("posted", b"k".to_vec(), Some(b"1".to_vec()))],
            dead_letters: vec![DeadLetterRecord::new(b"bad".to_vec(), None, Some(b"\"Bad\"".to_vec()))],
            state_writes: vec![
                StateWrite {
                    partition: 0,
                    key: "k".to_string(),
                    state: Some(1),
                    payload: Some(b"1".to_vec()),
                },
                StateWrite {
                    partition: 0,
                    key: "gone".to_string(),
                    state: None,
                    payload: None,
                },
            ],
            offsets: vec![PartitionOffset {
                topic: "ledger".to_string(),
                partition: 0,
                offset,
            }],
            revoked_partitions: Vec::new(),
        }
    }

    async fn clients(
        bus: &InMemoryBus,
    ) -> (
        <InMemoryBus as BusClientFactory>::Consumer,
        <InMemoryBus as BusClientFactory>::Producer,
    ) {
        let coordinator = RebalanceCoordinator::new("ledger-state");
        let mut consumer = bus
            .create_consumer("group", "client", coordinator.listener())
            .await
            .unwrap();
        consumer.subscribe("ledger").unwrap();
        let producer = bus.create_producer("group-0").await.unwrap();
        (consumer, producer)
    }

    fn cache() -> MaterializedStateCache<String, i64> {
        let mut cache = MaterializedStateCache::new();
        cache.load_partition(0, HashMap::from([("gone".to_string(), 9)]));
        cache
    }

    #[tokio::test]
    async fn commits_everything_then_updates_cache() {
        let bus = InMemoryBus::new();
        bus.create_topic("ledger", 1);
        let (consumer, mut producer) = clients(&bus).await;
        let mut cache = cache();

        let committer = TransactionalCommitter::new(SubscriptionTopics::for_event_topic("ledger"));
        let summary = committer
            .commit(&mut producer, &consumer, staged(8), &mut cache)
            .await
            .unwrap();

        assert_eq!(
            summary,
            CommitSummary {
                outputs: 1,
                dead_letters: 1,
                state_writes: 2,
                partitions: 1,
            }
        );
        assert_eq!(bus.records("posted").len(), 1);
        assert_eq!(bus.records("ledger-dlq").len(), 1);
        let state = bus.records("ledger-state");
        assert_eq!(state.len(), 2);
        assert_eq!(state[1].key.as_deref(), Some(&b"gone"[..]));
        assert_eq!(state[1].payload, None);
        assert_eq!(bus.committed_offset("group", "ledger", 0), Some(8));

        assert_eq!(cache.get(0, &"k".to_string()), Some(&1));
        assert_eq!(cache.get(0, &"gone".to_string()), None);
    }

    #[tokio::test]
    async fn failure_before_commit_aborts_and_leaves_cache_alone() {
        let bus = InMemoryBus::new();
        bus.create_topic("ledger", 1);
        let (consumer, mut producer) = clients(&bus).await;
        let mut cache = cache();
        bus.inject_intermittent(FaultPoint::CommitTransaction, 1);

        let committer = TransactionalCommitter::new(SubscriptionTopics::for_event_topic("ledger"));
        let err = committer
            .commit(&mut producer, &consumer, staged(8), &mut cache)
            .await
            .unwrap_err();

        assert!(matches!(err, SubscriptionError::Intermittent { .. }));
        assert!(bus.records("posted").is_empty());
        assert!(bus.records("ledger-dlq").is_empty());
        assert!(bus.records("ledger-state").is_empty());
        assert_eq!(bus.committed_offset("group", "ledger", 0), None);
        assert_eq!(bus.aborted_transactions(), 1);

        assert_eq!(cache.get(0, &"gone".to_string()), Some(&9));
        assert_eq!(cache.get(0, &"k".to_string()), None);
    }
}
