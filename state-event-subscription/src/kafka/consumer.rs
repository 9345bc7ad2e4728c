use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::consumer::{Consumer, ConsumerGroupMetadata, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::{ClientConfig, Offset, TopicPartitionList};
use tokio::time::{sleep, timeout_at, Instant};
use tracing::{info, warn};

use crate::bus::{EventConsumer, RebalanceListener, ResetStrategy};
use crate::error::BusError;
use crate::kafka::context::SubscriptionConsumerContext;
use crate::kafka::error::classify_kafka_error;
use crate::kafka::to_polled_record;
use crate::record::PolledRecord;

const TRANSIENT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Group consumer for the event topic. Offsets are never committed here; the
/// transactional producer commits them together with the batch outputs.
pub struct KafkaEventConsumer {
    consumer: StreamConsumer<SubscriptionConsumerContext>,
    operation_timeout: Duration,
}

impl KafkaEventConsumer {
    pub fn new(
        config: &ClientConfig,
        listener: Arc<dyn RebalanceListener>,
        operation_timeout: Duration,
    ) -> Result<Self, BusError> {
        let consumer: StreamConsumer<SubscriptionConsumerContext> = config
            .create_with_context(SubscriptionConsumerContext::new(listener))
            .map_err(|e| classify_kafka_error("create_consumer", e))?;
        Ok(Self {
            consumer,
            operation_timeout,
        })
    }

    /// Identifies the group generation to the transaction coordinator, which
    /// rejects offsets from a member that has been rebalanced out.
    pub fn group_metadata(&self) -> Option<ConsumerGroupMetadata> {
        self.consumer.group_metadata()
    }

    fn seek_to(&self, strategy: ResetStrategy) -> Result<usize, KafkaError> {
        let assignment = self.consumer.assignment()?;
        if assignment.count() == 0 {
            return Ok(0);
        }

        let committed = match strategy {
            ResetStrategy::LastCommitted => self
                .consumer
                .committed_offsets(assignment, self.operation_timeout)?,
            ResetStrategy::Earliest => assignment,
        };

        let mut positions = TopicPartitionList::new();
        for elem in committed.elements() {
            let offset = match (strategy, elem.offset()) {
                (ResetStrategy::LastCommitted, Offset::Offset(offset)) => Offset::Offset(offset),
                _ => Offset::Beginning,
            };
            positions.add_partition_offset(elem.topic(), elem.partition(), offset)?;
        }

        let sought = self
            .consumer
            .seek_partitions(positions, self.operation_timeout)?;
        for elem in sought.elements() {
            elem.error()?;
        }
        Ok(sought.count())
    }
}

#[async_trait]
impl EventConsumer for KafkaEventConsumer {
    fn subscribe(&mut self, topic: &str) -> Result<(), BusError> {
        self.consumer
            .subscribe(&[topic])
            .map_err(|e| classify_kafka_error("subscribe", e))?;
        info!(topic, "subscribed to event topic");
        Ok(())
    }

    /// Collects records until `max_records` arrived or `timeout` elapsed.
    async fn poll(
        &mut self,
        max_records: usize,
        timeout: Duration,
    ) -> Result<Vec<PolledRecord>, BusError> {
        let deadline = Instant::now() + timeout;
        let mut records = Vec::with_capacity(max_records.min(1024));

        while records.len() < max_records {
            let Ok(next) = timeout_at(deadline, self.consumer.recv()).await else {
                break;
            };
            match next {
                Ok(message) => records.push(to_polled_record(&message)),
                Err(KafkaError::PartitionEOF(_)) => {}
                Err(e) => {
                    let error = classify_kafka_error("poll", e);
                    if !error.is_intermittent() {
                        return Err(error);
                    }
                    warn!(error = ?error, "transient consumer error, continuing to poll");
                    sleep(TRANSIENT_ERROR_BACKOFF).await;
                }
            }
        }

        Ok(records)
    }

    fn reset_to_last_committed_positions(
        &mut self,
        strategy: ResetStrategy,
    ) -> Result<(), BusError> {
        let partitions = self
            .seek_to(strategy)
            .map_err(|e| classify_kafka_error("reset_positions", e))?;
        info!(partitions, strategy = ?strategy, "consumer positions rewound");
        Ok(())
    }
}
