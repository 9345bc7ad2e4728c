use std::sync::Arc;

use rdkafka::consumer::{BaseConsumer, ConsumerContext, Rebalance};
use rdkafka::{ClientContext, TopicPartitionList};
use tracing::{debug, error, info};

use crate::bus::RebalanceListener;

/// Forwards rebalance callbacks to the subscription's listener.
///
/// Revocations are reported before librdkafka gives the partitions up, so a
/// batch in flight can see them and abort. Assignments are reported once
/// they took effect. Both run on librdkafka's thread and must stay cheap.
pub struct SubscriptionConsumerContext {
    listener: Arc<dyn RebalanceListener>,
}

impl SubscriptionConsumerContext {
    pub fn new(listener: Arc<dyn RebalanceListener>) -> Self {
        Self { listener }
    }
}

impl ClientContext for SubscriptionConsumerContext {}

impl ConsumerContext for SubscriptionConsumerContext {
    fn pre_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Revoke(partitions) => {
                let revoked = partition_numbers(partitions);
                if revoked.is_empty() {
                    debug!("Skipping empty revoke rebalance");
                    return;
                }
                info!(partitions = ?revoked, "Revoking partitions");
                self.listener.on_partitions_revoked(&revoked);
            }
            Rebalance::Assign(partitions) => {
                debug!("Pre-rebalance assign event for {} partitions", partitions.count());
            }
            Rebalance::Error(e) => {
                error!("Rebalance error: {e}");
            }
        }
    }

    fn post_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        if let Rebalance::Assign(partitions) = rebalance {
            let assigned = partition_numbers(partitions);
            if assigned.is_empty() {
                debug!("Skipping empty assign rebalance");
                return;
            }
            info!(partitions = ?assigned, "Assigned partitions");
            self.listener.on_partitions_assigned(&assigned);
        }
    }
}

fn partition_numbers(partitions: &TopicPartitionList) -> Vec<i32> {
    let mut numbers: Vec<i32> = partitions
        .elements()
        .iter()
        .map(|elem| elem.partition())
        .collect();
    numbers.sort_unstable();
    numbers.dedup();
    numbers
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collects_sorted_partition_numbers() {
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition("ledger", 3);
        tpl.add_partition("ledger", 1);
        tpl.add_partition("ledger", 3);

        assert_eq!(partition_numbers(&tpl), vec![1, 3]);
    }
}
