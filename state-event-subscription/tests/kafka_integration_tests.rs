//! Runs the ledger subscription against a real broker. Needs the local
//! docker-compose Kafka on localhost:9092; run with `--ignored`.

mod common;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use lifecycle::{LifecycleStatus, StatusRegistry};
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use rdkafka::Message;
use uuid::Uuid;

use state_event_subscription::kafka::KafkaBusFactory;
use state_event_subscription::{StateEventSubscription, SubscriptionConfig, SubscriptionTopics};

use common::*;

const KAFKA_BROKERS: &str = "localhost:9092";

async fn create_topics(names: &[&str]) -> Result<()> {
    let admin: AdminClient<DefaultClientContext> = ClientConfig::new()
        .set("bootstrap.servers", KAFKA_BROKERS)
        .create()?;
    let topics: Vec<NewTopic> = names
        .iter()
        .map(|name| NewTopic::new(name, 1, TopicReplication::Fixed(1)))
        .collect();
    // Per-topic results are ignored: topics from earlier runs already exist.
    admin.create_topics(&topics, &AdminOptions::new()).await?;
    Ok(())
}

async fn send_events(topic: &str, account: &str, events: &[LedgerEvent]) -> Result<()> {
    let producer: FutureProducer = ClientConfig::new()
        .set("bootstrap.servers", KAFKA_BROKERS)
        .set("message.timeout.ms", "5000")
        .create()?;

    for event in events {
        let payload = serde_json::to_vec(event)?;
        let record = FutureRecord::to(topic).key(account).payload(&payload);
        producer
            .send(record, Timeout::After(Duration::from_secs(5)))
            .await
            .map_err(|(e, _)| anyhow::anyhow!("Failed to send message: {e}"))?;
    }
    Ok(())
}

async fn read_postings(account: &str, expected: usize) -> Result<Vec<Posted>> {
    let consumer: StreamConsumer = ClientConfig::new()
        .set("bootstrap.servers", KAFKA_BROKERS)
        .set("group.id", format!("ledger-verify-{}", Uuid::new_v4()))
        .set("isolation.level", "read_committed")
        .set("auto.offset.reset", "earliest")
        .create()?;
    consumer.subscribe(&[POSTED])?;

    let mut postings = Vec::new();
    let read = tokio::time::timeout(Duration::from_secs(30), async {
        while postings.len() < expected {
            let message = consumer.recv().await?;
            if message.key() != Some(account.as_bytes()) {
                continue;
            }
            if let Some(payload) = message.payload() {
                postings.push(serde_json::from_slice::<Posted>(payload)?);
            }
        }
        Ok::<_, anyhow::Error>(())
    })
    .await;
    read??;
    Ok(postings)
}

#[tokio::test]
#[ignore = "needs a Kafka broker on localhost:9092"]
async fn ledger_round_trip_through_kafka() -> Result<()> {
    let event_topic = format!("ledger-it-{}", Uuid::new_v4());
    let topics = SubscriptionTopics::for_event_topic(&event_topic);
    create_topics(&[
        topics.event.as_str(),
        topics.state.as_str(),
        topics.dead_letter.as_str(),
        POSTED,
    ])
    .await?;

    let config = SubscriptionConfig::for_topic(&format!("{event_topic}-group"), &event_topic)?
        .with_poll_timeout(Duration::from_millis(200));
    let registry = StatusRegistry::new("kafka-it");
    let reporter = registry.register(event_topic.clone());
    let factory = Arc::new(KafkaBusFactory::new(config.clone()));
    let mut subscription =
        StateEventSubscription::new(config, factory, LedgerProcessor::new(), reporter);
    subscription.start();

    let account = Uuid::new_v4().to_string();
    send_events(
        &event_topic,
        &account,
        &[
            LedgerEvent::Deposit { amount: 100 },
            LedgerEvent::Withdraw { amount: 30 },
        ],
    )
    .await?;

    let postings = read_postings(&account, 2).await?;
    let balances: Vec<i64> = postings.iter().map(|p| p.balance).collect();
    assert_eq!(balances, vec![100, 70]);
    assert_eq!(subscription.status(), LifecycleStatus::Up);

    subscription.close().await?;
    Ok(())
}
