//! The bus traits implemented over librdkafka.

pub mod config;
pub mod consumer;
pub mod context;
pub mod error;
pub mod producer;
pub mod state_reader;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::DateTime;
use rdkafka::Message;

use crate::bus::{BusClientFactory, RebalanceListener};
use crate::config::SubscriptionConfig;
use crate::error::BusError;
use crate::record::PolledRecord;

pub use config::KafkaClientConfigBuilder;
pub use consumer::KafkaEventConsumer;
pub use error::classify_kafka_error;
pub use producer::KafkaTransactionalProducer;
pub use state_reader::KafkaStateReader;

/// Creates rdkafka clients from a [`SubscriptionConfig`].
pub struct KafkaBusFactory {
    config: SubscriptionConfig,
}

impl KafkaBusFactory {
    pub fn new(config: SubscriptionConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl BusClientFactory for KafkaBusFactory {
    type Consumer = KafkaEventConsumer;
    type Producer = KafkaTransactionalProducer;
    type StateReader = KafkaStateReader;

    async fn create_consumer(
        &self,
        group_id: &str,
        client_id: &str,
        listener: Arc<dyn RebalanceListener>,
    ) -> Result<KafkaEventConsumer, BusError> {
        let client_config =
            KafkaClientConfigBuilder::for_group_consumer(&self.config.kafka_hosts, group_id)
                .with_tls(self.config.kafka_tls)
                .with_client_id(client_id)
                .with_offset_reset(self.config.offset_reset)
                .build();
        KafkaEventConsumer::new(
            &client_config,
            listener,
            self.config.kafka_operation_timeout(),
        )
    }

    async fn create_producer(
        &self,
        transactional_id: &str,
    ) -> Result<KafkaTransactionalProducer, BusError> {
        let client_config = KafkaClientConfigBuilder::for_transactional_producer(
            &self.config.kafka_hosts,
            transactional_id,
        )
        .with_tls(self.config.kafka_tls)
        .with_client_id(transactional_id)
        .with_transaction_timeout_ms(self.config.transaction_timeout_ms)
        .build();
        let timeout = self.config.kafka_operation_timeout();

        tokio::task::spawn_blocking(move || {
            KafkaTransactionalProducer::from_config(&client_config, timeout)
        })
        .await
        .map_err(|e| BusError::unknown("create_producer", e))?
    }

    async fn create_state_reader(&self, client_id: &str) -> Result<KafkaStateReader, BusError> {
        let client_config =
            KafkaClientConfigBuilder::for_state_reader(&self.config.kafka_hosts, client_id)
                .with_tls(self.config.kafka_tls)
                .with_client_id(client_id)
                .build();
        Ok(KafkaStateReader::new(
            client_config,
            self.config.kafka_operation_timeout(),
            self.config.state_replay_timeout(),
        ))
    }
}

pub(crate) fn to_polled_record<M: Message>(message: &M) -> PolledRecord {
    PolledRecord {
        topic: message.topic().to_string(),
        partition: message.partition(),
        offset: message.offset(),
        timestamp: message
            .timestamp()
            .to_millis()
            .and_then(DateTime::from_timestamp_millis),
        key: message.key().map(<[u8]>::to_vec),
        payload: message.payload().map(<[u8]>::to_vec),
    }
}
