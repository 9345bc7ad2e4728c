use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use envconfig::Envconfig;
use serde::{Deserialize, Serialize};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

use lifecycle::{LifecycleStatus, StatusRegistry};
use state_event_subscription::kafka::KafkaBusFactory;
use state_event_subscription::{
    Processor, ProcessorResponse, ProducerRecord, Record, StateEventSubscription,
    SubscriptionConfig,
};

#[derive(Envconfig, Clone, Debug)]
struct LedgerConfig {
    #[envconfig(default = "false")]
    pub log_json: bool,

    #[envconfig(default = "ledger-posted")]
    pub ledger_output_topic: String,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum LedgerEvent {
    Deposit { amount: i64 },
    Withdraw { amount: i64 },
}

#[derive(Debug, Serialize)]
struct LedgerPosted<'a> {
    account: &'a str,
    amount: i64,
    balance: i64,
}

/// Keeps one balance per account and publishes every posting.
struct LedgerProcessor {
    output_topic: String,
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
        let Some(entry) = event.value else {
            return Ok(ProcessorResponse::clear());
        };

        let balance = current_state.unwrap_or(0);
        let (amount, balance) = match entry {
            LedgerEvent::Deposit { amount } => (amount, balance + amount),
            LedgerEvent::Withdraw { amount } if amount > balance => {
                bail!("insufficient funds on {}: balance {balance}, withdrawal {amount}", event.key)
            }
            LedgerEvent::Withdraw { amount } => (-amount, balance - amount),
        };

        let posted = ProducerRecord::json(
            &self.output_topic,
            &event.key,
            &LedgerPosted {
                account: &event.key,
                amount,
                balance,
            },
        )?;
        Ok(ProcessorResponse::update(balance).with_event(posted))
    }
}

fn init_tracing(json: bool) {
    let log_layer = if json {
        fmt::layer()
            .json()
            .with_target(true)
            .with_filter(EnvFilter::from_default_env())
            .boxed()
    } else {
        fmt::layer()
            .with_target(true)
            .with_thread_ids(true)
            .with_level(true)
            .with_filter(EnvFilter::from_default_env())
            .boxed()
    };

    tracing_subscriber::registry().with(log_layer).init();
}

async fn shutdown() -> Result<()> {
    let mut term =
        signal(SignalKind::terminate()).context("failed to register SIGTERM handler")?;
    let mut interrupt =
        signal(SignalKind::interrupt()).context("failed to register SIGINT handler")?;

    tokio::select! {
        _ = term.recv() => {},
        _ = interrupt.recv() => {},
    };

    info!("Shutting down gracefully...");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let ledger_config =
        LedgerConfig::init_from_env().context("Failed to load ledger configuration")?;
    init_tracing(ledger_config.log_json);

    let config = SubscriptionConfig::init_with_defaults()
        .context("Failed to load configuration from environment variables")?;
    info!("Configuration loaded: {:?}", config);

    let liveness = StatusRegistry::new("liveness");
    let reporter = liveness.register(config.event_topic.clone());

    let factory = Arc::new(KafkaBusFactory::new(config.clone()));
    let processor = LedgerProcessor {
        output_topic: ledger_config.ledger_output_topic,
    };
    let mut subscription = StateEventSubscription::new(config, factory, processor, reporter);
    subscription.start();
    info!(topics = ?subscription.topics(), "Started ledger subscription");

    tokio::select! {
        result = shutdown() => result?,
        _ = subscription.join() => {},
    }

    if let LifecycleStatus::Error { reason } = subscription.status() {
        error!(reason = %reason, "Ledger subscription stopped on its own");
        return Err(anyhow!("ledger subscription failed: {reason}"));
    }

    subscription
        .close()
        .await
        .context("Ledger subscription did not close within its timeout")?;
    info!(status = ?liveness.get_status(), "Ledger subscription closed");
    Ok(())
}
