#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use lifecycle::StatusRegistry;
use serde::{Deserialize, Serialize};

use state_event_subscription::record::decode_value;
use state_event_subscription::test_utils::InMemoryBus;
use state_event_subscription::{
    Processor, ProcessorResponse, ProducerRecord, Record, StateEventSubscription,
    SubscriptionConfig,
};

pub const GROUP: &str = "ledger-group";
pub const EVENTS: &str = "ledger";
pub const STATE: &str = "ledger-state";
pub const DEAD_LETTERS: &str = "ledger-dlq";
pub const POSTED: &str = "ledger-posted";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum LedgerEvent {
    Deposit { amount: i64 },
    Withdraw { amount: i64 },
    Bad,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Posted {
    pub account: String,
    pub balance: i64,
}

type Hook = Box<dyn FnOnce() + Send>;

/// Keeps a balance per account, publishes every posting, fails on `Bad`.
/// Every invocation is recorded with the state it was given.
pub struct LedgerProcessor {
    seen: Arc<Mutex<Vec<(String, Option<i64>)>>>,
    before_first: Mutex<Option<Hook>>,
}

impl LedgerProcessor {
    pub fn new() -> Self {
        Self {
            seen: Arc::new(Mutex::new(Vec::new())),
            before_first: Mutex::new(None),
        }
    }

    /// Runs `hook` inside the first invocation, before anything is returned.
    pub fn with_hook(self, hook: impl FnOnce() + Send + 'static) -> Self {
        *self.before_first.lock().unwrap() = Some(Box::new(hook));
        self
    }

    pub fn seen(&self) -> Arc<Mutex<Vec<(String, Option<i64>)>>> {
        self.seen.clone()
    }
}

#[async_trait]
impl Processor for LedgerProcessor {
    type Key = String;
    type Event = LedgerEvent;
    type State = i64;

    async fn on_next(
        &self,
        current_state: Option<i64>,
        event: Record<String, LedgerEvent>,
    ) -> Result<ProcessorResponse<i64>> {
        let hook = self.before_first.lock().unwrap().take();
        if let Some(hook) = hook {
            hook();
        }
        self.seen
            .lock()
            .unwrap()
            .push((event.key.clone(), current_state));

        let balance = current_state.unwrap_or(0);
        let balance = match event.value {
            Some(LedgerEvent::Deposit { amount }) => balance + amount,
            Some(LedgerEvent::Withdraw { amount }) => balance - amount,
            Some(LedgerEvent::Bad) => bail!("cannot post a Bad entry"),
            None => return Ok(ProcessorResponse::clear()),
        };

        let posted = ProducerRecord::json(
            POSTED,
            &event.key,
            &Posted {
                account: event.key.clone(),
                balance,
            },
        )?;
        Ok(ProcessorResponse::update(balance).with_event(posted))
    }
}

pub fn ledger_bus(partitions: usize) -> InMemoryBus {
    let bus = InMemoryBus::new();
    bus.create_topic(EVENTS, partitions);
    bus.create_topic(STATE, partitions);
    bus
}

pub fn test_config() -> SubscriptionConfig {
    SubscriptionConfig::for_topic(GROUP, EVENTS)
        .unwrap()
        .with_poll_timeout(Duration::from_millis(20))
        .with_processor_timeout(Duration::from_secs(2))
        .with_retry_backoff(Duration::from_millis(5), Duration::from_millis(20))
        .with_close_timeout(Duration::from_secs(5))
}

pub fn start(
    bus: &InMemoryBus,
    config: SubscriptionConfig,
    processor: LedgerProcessor,
) -> (StateEventSubscription<InMemoryBus, LedgerProcessor>, StatusRegistry) {
    let registry = StatusRegistry::new("test");
    let reporter = registry.register(EVENTS);
    let mut subscription =
        StateEventSubscription::new(config, Arc::new(bus.clone()), processor, reporter);
    assert!(subscription.start());
    (subscription, registry)
}

pub async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let waited = tokio::time::timeout(Duration::from_secs(10), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {what}");
}

/// Balances published on the posting topic, in commit order.
pub fn postings(bus: &InMemoryBus) -> Vec<Posted> {
    bus.records(POSTED)
        .iter()
        .map(|r| decode_value(r.payload.as_deref().unwrap()).unwrap())
        .collect()
}

/// Latest committed state for `account`; `None` if never written or cleared.
pub fn committed_balance(bus: &InMemoryBus, account: &str) -> Option<i64> {
    bus.records(STATE)
        .iter()
        .rev()
        .find(|r| r.key.as_deref() == Some(account.as_bytes()))
        .and_then(|r| r.payload.as_deref())
        .map(|payload| decode_value(payload).unwrap())
}
