//! Reads state partitions from the beginning up to the log end observed when
//! the read started.
//!
//! Uses a fresh assign-only `BaseConsumer` per read so watermarks and
//! metadata are never stale, and drops it once the read is done.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use anyhow::anyhow;
use async_trait::async_trait;
use rdkafka::consumer::{BaseConsumer, Consumer};
use rdkafka::error::KafkaError;
use rdkafka::{ClientConfig, Message, Offset, TopicPartitionList};
use tracing::{debug, warn};

use crate::bus::StateReader;
use crate::error::BusError;
use crate::kafka::error::classify_kafka_error;
use crate::kafka::to_polled_record;
use crate::record::PolledRecord;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

pub struct KafkaStateReader {
    config: ClientConfig,
    operation_timeout: Duration,
    read_timeout: Duration,
}

impl KafkaStateReader {
    pub fn new(config: ClientConfig, operation_timeout: Duration, read_timeout: Duration) -> Self {
        Self {
            config,
            operation_timeout,
            read_timeout,
        }
    }
}

#[async_trait]
impl StateReader for KafkaStateReader {
    async fn read_to_end(
        &mut self,
        topic: &str,
        partitions: &[i32],
    ) -> Result<Vec<PolledRecord>, BusError> {
        let config = self.config.clone();
        let topic = topic.to_string();
        let partitions = partitions.to_vec();
        let operation_timeout = self.operation_timeout;
        let read_timeout = self.read_timeout;

        tokio::task::spawn_blocking(move || {
            read_partitions(&config, &topic, &partitions, operation_timeout, read_timeout)
        })
        .await
        .map_err(|e| BusError::unknown("read_state", e))?
    }
}

fn read_partitions(
    config: &ClientConfig,
    topic: &str,
    partitions: &[i32],
    operation_timeout: Duration,
    read_timeout: Duration,
) -> Result<Vec<PolledRecord>, BusError> {
    let consumer: BaseConsumer = config
        .create()
        .map_err(|e| classify_kafka_error("create_state_reader", e))?;

    // Partition -> end offset (exclusive) at the time of the read.
    let mut remaining = BTreeMap::new();
    let mut tpl = TopicPartitionList::new();
    for &partition in partitions {
        let (low, high) = consumer
            .fetch_watermarks(topic, partition, operation_timeout)
            .map_err(|e| classify_kafka_error("fetch_watermarks", e))?;
        if high <= low {
            continue;
        }
        tpl.add_partition_offset(topic, partition, Offset::Offset(low))
            .map_err(|e| classify_kafka_error("read_state", e))?;
        remaining.insert(partition, high);
    }

    if remaining.is_empty() {
        return Ok(Vec::new());
    }

    consumer
        .assign(&tpl)
        .map_err(|e| classify_kafka_error("read_state", e))?;

    let deadline = Instant::now() + read_timeout;
    let mut records = Vec::new();
    while !remaining.is_empty() {
        if Instant::now() >= deadline {
            return Err(BusError::intermittent(
                "read_state",
                anyhow!(
                    "timed out reading {topic} partitions {:?} to their end",
                    remaining.keys().collect::<Vec<_>>()
                ),
            ));
        }

        match consumer.poll(POLL_INTERVAL) {
            None => {}
            Some(Ok(message)) => {
                let partition = message.partition();
                let offset = message.offset();
                records.push(to_polled_record(&message));
                if remaining.get(&partition).is_some_and(|end| offset + 1 >= *end) {
                    remaining.remove(&partition);
                }
            }
            // Commit markers occupy the last offsets of a transactional log, so
            // the end of a partition may only show up as EOF.
            Some(Err(KafkaError::PartitionEOF(partition))) => {
                remaining.remove(&partition);
            }
            Some(Err(e)) => {
                let error = classify_kafka_error("read_state", e);
                if !error.is_intermittent() {
                    return Err(error);
                }
                warn!(topic, error = ?error, "transient error while reading state");
            }
        }
    }

    debug!(topic, records = records.len(), "state partitions read to end");
    Ok(records)
}
