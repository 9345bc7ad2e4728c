use rdkafka::ClientConfig;

use crate::bus::ResetStrategy;

/// Builds client configs for the three clients a subscription uses.
///
/// - `for_group_consumer`: joins the group, never commits on its own. Offsets
///   only move through the producer's transaction.
/// - `for_state_reader`: assign-only, reads state partitions to their end.
///   `group.id` is required by rdkafka but the reader never joins the group.
/// - `for_transactional_producer`: idempotent producer with a stable
///   `transactional.id`.
///
/// Consumers read with `isolation.level=read_committed` so aborted
/// transactions are never observed.
pub struct KafkaClientConfigBuilder {
    config: ClientConfig,
}

impl KafkaClientConfigBuilder {
    pub fn for_group_consumer(bootstrap_servers: &str, group_id: &str) -> Self {
        let mut config = ClientConfig::new();

        config
            .set("bootstrap.servers", bootstrap_servers)
            .set("group.id", group_id)
            .set("isolation.level", "read_committed")
            .set("enable.auto.offset.store", "false")
            .set("enable.auto.commit", "false")
            .set("socket.timeout.ms", "10000")
            .set("session.timeout.ms", "60000")
            .set("heartbeat.interval.ms", "5000")
            .set("max.poll.interval.ms", "300000");

        Self { config }
    }

    pub fn for_state_reader(bootstrap_servers: &str, group_id: &str) -> Self {
        let mut config = ClientConfig::new();

        config
            .set("bootstrap.servers", bootstrap_servers)
            .set("group.id", group_id)
            .set("isolation.level", "read_committed")
            .set("enable.auto.commit", "false")
            .set("enable.partition.eof", "true")
            .set("socket.timeout.ms", "10000");

        Self { config }
    }

    pub fn for_transactional_producer(bootstrap_servers: &str, transactional_id: &str) -> Self {
        let mut config = ClientConfig::new();

        config
            .set("bootstrap.servers", bootstrap_servers)
            .set("transactional.id", transactional_id)
            .set("enable.idempotence", "true")
            .set("statistics.interval.ms", "10000")
            .set("linger.ms", "5");

        Self { config }
    }

    /// Enable TLS/SSL for Kafka connection
    pub fn with_tls(mut self, enabled: bool) -> Self {
        if enabled {
            self.config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        }
        self
    }

    pub fn with_client_id(mut self, client_id: &str) -> Self {
        self.config.set("client.id", client_id);
        self
    }

    /// Where a group with nothing committed starts. Both strategies fall back
    /// to the beginning of the partition.
    pub fn with_offset_reset(mut self, strategy: ResetStrategy) -> Self {
        let policy = match strategy {
            ResetStrategy::LastCommitted | ResetStrategy::Earliest => "earliest",
        };
        self.config.set("auto.offset.reset", policy);
        self
    }

    /// Producer only: how long the broker keeps an open transaction before
    /// aborting it.
    pub fn with_transaction_timeout_ms(mut self, ms: u64) -> Self {
        self.config.set("transaction.timeout.ms", ms.to_string());
        self
    }

    /// Add any custom configuration
    pub fn set(mut self, key: &str, value: &str) -> Self {
        self.config.set(key, value);
        self
    }

    pub fn build(self) -> ClientConfig {
        self.config
    }
}
