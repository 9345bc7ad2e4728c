use std::collections::HashMap;
use std::time::Duration;

use envconfig::Envconfig;
use lifecycle::RetryPolicy;

use crate::bus::ResetStrategy;
use crate::topics::SubscriptionTopics;

#[derive(Envconfig, Clone, Debug)]
pub struct SubscriptionConfig {
    // Kafka connection
    #[envconfig(default = "localhost:9092")]
    pub kafka_hosts: String,

    #[envconfig(default = "false")]
    pub kafka_tls: bool,

    #[envconfig(default = "state-event-subscription")]
    pub kafka_consumer_group: String,

    #[envconfig(default = "state-event-subscription")]
    pub kafka_client_id: String,

    #[envconfig(default = "events")]
    pub event_topic: String,

    /// Distinguishes replicas of the same group in the transactional id
    #[envconfig(default = "0")]
    pub instance_id: String,

    // Processing
    #[envconfig(default = "1000")]
    pub poll_timeout_ms: u64,

    #[envconfig(default = "500")]
    pub max_batch_size: usize,

    #[envconfig(default = "30000")]
    pub processor_timeout_ms: u64,

    #[envconfig(default = "16")]
    pub processor_parallelism: usize,

    // Failure handling
    #[envconfig(default = "5")]
    pub max_processor_retries: u32,

    #[envconfig(default = "100")]
    pub retry_backoff_ms: u64,

    #[envconfig(default = "10000")]
    pub max_retry_backoff_ms: u64,

    #[envconfig(default = "last_committed")]
    pub offset_reset: ResetStrategy,

    // Lifecycle
    #[envconfig(default = "30000")]
    pub close_timeout_ms: u64,

    #[envconfig(default = "60000")]
    pub transaction_timeout_ms: u64,

    /// Bound on single broker round trips: commits, seeks, watermark queries
    #[envconfig(default = "10000")]
    pub kafka_operation_timeout_ms: u64,

    /// Bound on reading assigned state partitions to their end
    #[envconfig(default = "300000")]
    pub state_replay_timeout_ms: u64,
}

impl SubscriptionConfig {
    pub fn init_with_defaults() -> Result<Self, envconfig::Error> {
        SubscriptionConfig::init_from_env()
    }

    /// Defaults only, ignoring the environment.
    pub fn for_topic(group: &str, event_topic: &str) -> Result<Self, envconfig::Error> {
        let vars = HashMap::from([
            ("KAFKA_CONSUMER_GROUP".to_string(), group.to_string()),
            ("EVENT_TOPIC".to_string(), event_topic.to_string()),
        ]);
        SubscriptionConfig::init_from_hashmap(&vars)
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.kafka_client_id = client_id.into();
        self
    }

    pub fn with_instance_id(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = instance_id.into();
        self
    }

    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_processor_timeout(mut self, timeout: Duration) -> Self {
        self.processor_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_max_processor_retries(mut self, retries: u32) -> Self {
        self.max_processor_retries = retries;
        self
    }

    pub fn with_retry_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.retry_backoff_ms = initial.as_millis() as u64;
        self.max_retry_backoff_ms = max.as_millis() as u64;
        self
    }

    pub fn with_max_batch_size(mut self, size: usize) -> Self {
        self.max_batch_size = size;
        self
    }

    pub fn with_processor_parallelism(mut self, parallelism: usize) -> Self {
        self.processor_parallelism = parallelism;
        self
    }

    pub fn with_offset_reset(mut self, strategy: ResetStrategy) -> Self {
        self.offset_reset = strategy;
        self
    }

    pub fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn processor_timeout(&self) -> Duration {
        Duration::from_millis(self.processor_timeout_ms)
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }

    pub fn transaction_timeout(&self) -> Duration {
        Duration::from_millis(self.transaction_timeout_ms)
    }

    pub fn kafka_operation_timeout(&self) -> Duration {
        Duration::from_millis(self.kafka_operation_timeout_ms)
    }

    pub fn state_replay_timeout(&self) -> Duration {
        Duration::from_millis(self.state_replay_timeout_ms)
    }

    /// Pause before polling again after a batch was abandoned to a rebalance.
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn max_batch_size(&self) -> usize {
        self.max_batch_size.max(1)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_processor_retries,
            Duration::from_millis(self.retry_backoff_ms),
            Duration::from_millis(self.max_retry_backoff_ms.max(self.retry_backoff_ms)),
        )
    }

    pub fn topics(&self) -> SubscriptionTopics {
        SubscriptionTopics::for_event_topic(&self.event_topic)
    }

    /// Stable per replica, so a restarted instance fences its predecessor's
    /// open transaction.
    pub fn transactional_id(&self) -> String {
        format!(
            "{}-{}-{}",
            self.kafka_consumer_group, self.event_topic, self.instance_id
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_environment() {
        let config = SubscriptionConfig::for_topic("ledger-group", "ledger").unwrap();

        assert_eq!(config.kafka_hosts, "localhost:9092");
        assert_eq!(config.poll_timeout(), Duration::from_secs(1));
        assert_eq!(config.processor_timeout(), Duration::from_secs(30));
        assert_eq!(config.max_processor_retries, 5);
        assert_eq!(config.offset_reset, ResetStrategy::LastCommitted);
        assert_eq!(config.topics().state, "ledger-state");
        assert_eq!(config.transactional_id(), "ledger-group-ledger-0");
    }

    #[test]
    fn builders_override_defaults() {
        let config = SubscriptionConfig::for_topic("g", "t")
            .unwrap()
            .with_instance_id("pod-3")
            .with_max_processor_retries(2)
            .with_retry_backoff(Duration::from_millis(5), Duration::from_millis(1))
            .with_max_batch_size(0);

        assert_eq!(config.transactional_id(), "g-t-pod-3");
        let policy = config.retry_policy();
        assert_eq!(policy.max_retries, 2);
        assert_eq!(policy.max_backoff, Duration::from_millis(5));
        assert_eq!(config.max_batch_size(), 1);
    }

    #[test]
    fn rejects_unknown_offset_reset() {
        let vars = HashMap::from([("OFFSET_RESET".to_string(), "latest".to_string())]);
        assert!(SubscriptionConfig::init_from_hashmap(&vars).is_err());
    }
}
