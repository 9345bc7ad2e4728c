use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use futures::future::join_all;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::{ClientConfig, Offset, TopicPartitionList};
use tracing::{error, info};

use crate::bus::TransactionalProducer;
use crate::error::BusError;
use crate::kafka::consumer::KafkaEventConsumer;
use crate::kafka::error::classify_kafka_error;
use crate::record::{PartitionOffset, ProducerRecord};

/// A `FutureProducer` with transactions initialized. Every blocking call is
/// bounded by the operation timeout.
pub struct KafkaTransactionalProducer {
    inner: FutureProducer,
    timeout: Duration,
}

impl KafkaTransactionalProducer {
    /// Blocks until the transaction coordinator accepted the transactional id,
    /// fencing any older producer that used it.
    pub fn from_config(config: &ClientConfig, timeout: Duration) -> Result<Self, BusError> {
        let inner: FutureProducer = config
            .create()
            .map_err(|e| classify_kafka_error("create_producer", e))?;

        match inner.client().fetch_metadata(None, timeout) {
            Ok(metadata) => {
                info!(
                    "Successfully connected to Kafka brokers. Found {} topics.",
                    metadata.topics().len()
                );
            }
            Err(e) => {
                error!("Failed to fetch metadata from Kafka brokers: {e:?}");
                return Err(classify_kafka_error("create_producer", e));
            }
        }

        inner
            .init_transactions(timeout)
            .map_err(|e| classify_kafka_error("init_transactions", e))?;

        Ok(Self { inner, timeout })
    }
}

#[async_trait]
impl TransactionalProducer for KafkaTransactionalProducer {
    type Consumer = KafkaEventConsumer;

    fn begin_transaction(&mut self) -> Result<(), BusError> {
        self.inner
            .begin_transaction()
            .map_err(|e| classify_kafka_error("begin_transaction", e))
    }

    async fn send(&mut self, records: Vec<ProducerRecord>) -> Result<(), BusError> {
        let mut deliveries = Vec::with_capacity(records.len());
        for record in &records {
            let mut future_record: FutureRecord<'_, [u8], [u8]> =
                FutureRecord::to(&record.topic).key(record.key.as_slice());
            if let Some(payload) = &record.payload {
                future_record = future_record.payload(payload.as_slice());
            }
            if let Some(partition) = record.partition {
                future_record = future_record.partition(partition);
            }

            let delivery = self
                .inner
                .send_result(future_record)
                .map_err(|(e, _)| classify_kafka_error("send", e))?;
            deliveries.push(delivery);
        }

        for delivery in join_all(deliveries).await {
            match delivery {
                Ok(Ok(_)) => {}
                Ok(Err((e, _))) => return Err(classify_kafka_error("send", e)),
                Err(_) => {
                    return Err(BusError::intermittent(
                        "send",
                        anyhow!("delivery canceled before acknowledgement"),
                    ))
                }
            }
        }
        Ok(())
    }

    fn send_offsets_to_transaction(
        &mut self,
        offsets: &[PartitionOffset],
        consumer: &KafkaEventConsumer,
    ) -> Result<(), BusError> {
        let metadata = consumer.group_metadata().ok_or_else(|| {
            BusError::fatal(
                "send_offsets_to_transaction",
                anyhow!("consumer has no group metadata"),
            )
        })?;

        let mut tpl = TopicPartitionList::new();
        for offset in offsets {
            tpl.add_partition_offset(&offset.topic, offset.partition, Offset::Offset(offset.offset))
                .map_err(|e| classify_kafka_error("send_offsets_to_transaction", e))?;
        }

        self.inner
            .send_offsets_to_transaction(&tpl, &metadata, self.timeout)
            .map_err(|e| classify_kafka_error("send_offsets_to_transaction", e))
    }

    fn commit_transaction(&mut self) -> Result<(), BusError> {
        self.inner
            .commit_transaction(self.timeout)
            .map_err(|e| classify_kafka_error("commit_transaction", e))
    }

    fn abort_transaction(&mut self) -> Result<(), BusError> {
        self.inner
            .abort_transaction(self.timeout)
            .map_err(|e| classify_kafka_error("abort_transaction", e))
    }
}
