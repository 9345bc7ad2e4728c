use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use lifecycle::{
    LifecycleError, LifecycleStatus, LoopRunner, RetryClassifier, RetryDecision, StatusReporter,
};
use metrics::counter;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::batch::BatchProcessor;
use crate::bus::{BusClientFactory, EventConsumer};
use crate::cache::MaterializedStateCache;
use crate::committer::TransactionalCommitter;
use crate::config::SubscriptionConfig;
use crate::error::SubscriptionError;
use crate::metrics_consts::{BATCHES_ABANDONED, CYCLE_FAILURES, RETRIES};
use crate::processor::Processor;
use crate::rebalance::RebalanceCoordinator;
use crate::topics::SubscriptionTopics;

/// Where the subscription worker currently is in its loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionPhase {
    Connecting,
    Replaying,
    Polling,
    Processing,
    Committing,
    Stopped,
}

/// A state-and-event subscription: consumes the event topic, keeps the latest
/// state per key materialized from the state topic, runs the processor and
/// commits outputs, dead-letters, state and offsets in one transaction.
///
/// One background worker drives the loop. Intermittent failures rewind the
/// consumer to its committed offsets and retry with backoff; a fatal failure,
/// or more than `max_processor_retries` consecutive intermittent ones, stops
/// the worker and reports `LifecycleStatus::Error` with the reason.
pub struct StateEventSubscription<F: BusClientFactory, P: Processor> {
    config: SubscriptionConfig,
    topics: SubscriptionTopics,
    factory: Arc<F>,
    processor: Arc<P>,
    runner: LoopRunner,
    phase: Arc<watch::Sender<SubscriptionPhase>>,
}

impl<F: BusClientFactory, P: Processor> StateEventSubscription<F, P> {
    pub fn new(
        config: SubscriptionConfig,
        factory: Arc<F>,
        processor: P,
        status: StatusReporter,
    ) -> Self {
        let topics = config.topics();
        let runner = LoopRunner::new(
            format!("state-event-subscription:{}", topics.event),
            status,
            config.close_timeout(),
        );
        let (phase, _initial) = watch::channel(SubscriptionPhase::Stopped);
        Self {
            config,
            topics,
            factory,
            processor: Arc::new(processor),
            runner,
            phase: Arc::new(phase),
        }
    }

    /// Spawns the worker unless it is already running.
    pub fn start(&mut self) -> bool {
        let worker = SubscriptionWorker {
            config: self.config.clone(),
            topics: self.topics.clone(),
            factory: self.factory.clone(),
            batch_processor: BatchProcessor::new(
                self.processor.clone(),
                self.topics.clone(),
                self.config.processor_timeout(),
                self.config.processor_parallelism,
            ),
            committer: TransactionalCommitter::new(self.topics.clone()),
            status: self.runner.status().clone(),
            phase: self.phase.clone(),
        };
        self.runner.start(move |stop| worker.run(stop))
    }

    /// Asks the worker to stop after its current cycle and waits up to the
    /// close timeout. Fails when called from the worker itself.
    pub async fn stop(&mut self) -> Result<(), LifecycleError> {
        self.runner.stop().await
    }

    /// Stops the worker and discards the subscription.
    pub async fn close(mut self) -> Result<(), LifecycleError> {
        let result = self.stop().await;
        if let Err(e) = &result {
            warn!(topic = %self.topics.event, "subscription did not close cleanly: {e}");
        }
        result
    }

    /// Waits for the worker to exit on its own.
    pub async fn join(&mut self) {
        self.runner.join().await;
    }

    pub fn is_running(&self) -> bool {
        self.runner.is_running()
    }

    pub fn status(&self) -> LifecycleStatus {
        self.runner.status().current()
    }

    pub fn last_error(&self) -> Option<String> {
        self.runner.status().last_error()
    }

    pub fn phase(&self) -> SubscriptionPhase {
        *self.phase.borrow()
    }

    pub fn watch_phase(&self) -> watch::Receiver<SubscriptionPhase> {
        self.phase.subscribe()
    }

    pub fn topics(&self) -> &SubscriptionTopics {
        &self.topics
    }
}

struct Connection<F: BusClientFactory, P: Processor> {
    consumer: F::Consumer,
    producer: F::Producer,
    state_reader: F::StateReader,
    coordinator: RebalanceCoordinator,
    cache: MaterializedStateCache<P::Key, P::State>,
}

enum CycleOutcome {
    Idle,
    Committed,
}

enum LoopExit {
    Stopped,
    Reconnect,
    Fatal(String),
}

struct SubscriptionWorker<F: BusClientFactory, P: Processor> {
    config: SubscriptionConfig,
    topics: SubscriptionTopics,
    factory: Arc<F>,
    batch_processor: BatchProcessor<P>,
    committer: TransactionalCommitter,
    status: StatusReporter,
    phase: Arc<watch::Sender<SubscriptionPhase>>,
}

impl<F: BusClientFactory, P: Processor> SubscriptionWorker<F, P> {
    async fn run(self, stop: CancellationToken) {
        let mut retry = RetryClassifier::new(self.config.retry_policy());

        while !stop.is_cancelled() {
            self.set_phase(SubscriptionPhase::Connecting);
            let mut connection = match self.connect().await {
                Ok(connection) => connection,
                Err(e) => match self.classify(&mut retry, &e) {
                    RetryDecision::Retry { backoff, .. } => {
                        if !sleep_unless_stopped(backoff, &stop).await {
                            break;
                        }
                        continue;
                    }
                    RetryDecision::Stop { reason } => {
                        self.stop_with_error(reason);
                        return;
                    }
                },
            };

            self.status.report(LifecycleStatus::Up);
            let exit = self.consume(&mut connection, &mut retry, &stop).await;
            let partitions = connection.cache.owned_partitions();
            let discarded = connection.cache.clear();
            debug!(
                topic = %self.topics.event,
                ?partitions,
                keys = discarded,
                "discarded materialized state"
            );
            drop(connection);

            match exit {
                LoopExit::Stopped => break,
                LoopExit::Reconnect => {
                    info!(topic = %self.topics.event, "recreating consumer and producer");
                    continue;
                }
                LoopExit::Fatal(reason) => {
                    self.stop_with_error(reason);
                    return;
                }
            }
        }

        info!(topic = %self.topics.event, "subscription stopped");
        self.set_phase(SubscriptionPhase::Stopped);
    }

    async fn connect(&self) -> Result<Connection<F, P>, SubscriptionError> {
        let coordinator = RebalanceCoordinator::new(&self.topics.state);
        let mut consumer = self
            .factory
            .create_consumer(
                &self.config.kafka_consumer_group,
                &self.config.kafka_client_id,
                coordinator.listener(),
            )
            .await?;
        consumer.subscribe(&self.topics.event)?;

        let producer = self
            .factory
            .create_producer(&self.config.transactional_id())
            .await?;
        let state_reader = self
            .factory
            .create_state_reader(&format!("{}-state", self.config.kafka_client_id))
            .await?;

        info!(
            topic = %self.topics.event,
            group = %self.config.kafka_consumer_group,
            transactional_id = %self.config.transactional_id(),
            "subscription connected"
        );
        Ok(Connection {
            consumer,
            producer,
            state_reader,
            coordinator,
            cache: MaterializedStateCache::new(),
        })
    }

    async fn consume(
        &self,
        conn: &mut Connection<F, P>,
        retry: &mut RetryClassifier,
        stop: &CancellationToken,
    ) -> LoopExit {
        loop {
            if stop.is_cancelled() {
                return LoopExit::Stopped;
            }

            // Only a commit resets the retry counter; idle polls leave it.
            let failure = match self.cycle(conn).await {
                Ok(CycleOutcome::Idle) => continue,
                Ok(CycleOutcome::Committed) => {
                    retry.record_success();
                    self.status.report(LifecycleStatus::Up);
                    continue;
                }
                Err(SubscriptionError::RebalanceInProgress { partitions }) => {
                    counter!(BATCHES_ABANDONED).increment(1);
                    info!(
                        partitions = ?partitions,
                        "batch abandoned after rebalance, rewinding to committed offsets"
                    );
                    match conn
                        .consumer
                        .reset_to_last_committed_positions(self.config.offset_reset)
                    {
                        Ok(()) => {
                            if !sleep_unless_stopped(self.config.retry_backoff(), stop).await {
                                return LoopExit::Stopped;
                            }
                            continue;
                        }
                        Err(e) => SubscriptionError::from(e),
                    }
                }
                Err(e) => e,
            };

            match self.classify(retry, &failure) {
                RetryDecision::Retry { backoff, .. } => {
                    counter!(RETRIES).increment(1);
                    let rewound = conn
                        .consumer
                        .reset_to_last_committed_positions(self.config.offset_reset);
                    if !sleep_unless_stopped(backoff, stop).await {
                        return LoopExit::Stopped;
                    }
                    if let Err(e) = rewound {
                        warn!(error = %e, "failed to rewind consumer");
                        return LoopExit::Reconnect;
                    }
                }
                RetryDecision::Stop { reason } => return LoopExit::Fatal(reason),
            }
        }
    }

    /// One poll-process-commit cycle.
    async fn cycle(&self, conn: &mut Connection<F, P>) -> Result<CycleOutcome, SubscriptionError> {
        self.set_phase(SubscriptionPhase::Polling);
        let records = conn
            .consumer
            .poll(self.config.max_batch_size(), self.config.poll_timeout())
            .await?;

        let changes = conn.coordinator.drain(&mut conn.cache);
        if conn.coordinator.has_pending_replay() {
            self.set_phase(SubscriptionPhase::Replaying);
            conn.coordinator
                .replay_pending(&mut conn.cache, &mut conn.state_reader)
                .await?;
        }

        if records.is_empty() {
            return Ok(CycleOutcome::Idle);
        }

        let stale: BTreeSet<i32> = records
            .iter()
            .map(|r| r.partition)
            .filter(|p| changes.was_revoked(*p) || !conn.cache.contains_partition(*p))
            .collect();
        if !stale.is_empty() {
            return Err(SubscriptionError::RebalanceInProgress {
                partitions: stale.into_iter().collect(),
            });
        }

        self.set_phase(SubscriptionPhase::Processing);
        let batch = self
            .batch_processor
            .process(records, &conn.cache, conn.coordinator.signal())
            .await;
        if batch.rebalanced() {
            return Err(SubscriptionError::RebalanceInProgress {
                partitions: batch.revoked_partitions,
            });
        }
        let revoked = conn.coordinator.signal().revoked_among(&batch.partitions());
        if !revoked.is_empty() {
            return Err(SubscriptionError::RebalanceInProgress {
                partitions: revoked,
            });
        }

        self.set_phase(SubscriptionPhase::Committing);
        self.committer
            .commit(&mut conn.producer, &conn.consumer, batch, &mut conn.cache)
            .await?;
        Ok(CycleOutcome::Committed)
    }

    fn classify(&self, retry: &mut RetryClassifier, failure: &SubscriptionError) -> RetryDecision {
        counter!(CYCLE_FAILURES, "error_type" => failure.error_type()).increment(1);
        retry.on_failure(failure)
    }

    fn stop_with_error(&self, reason: String) {
        error!(topic = %self.topics.event, reason = %reason, "subscription stopped on fatal failure");
        self.status.report(LifecycleStatus::Error { reason });
        self.set_phase(SubscriptionPhase::Stopped);
    }

    fn set_phase(&self, phase: SubscriptionPhase) {
        self.phase.send_replace(phase);
    }
}

/// Returns false if `stop` fired first.
async fn sleep_unless_stopped(backoff: Duration, stop: &CancellationToken) -> bool {
    tokio::select! {
        _ = stop.cancelled() => false,
        _ = tokio::time::sleep(backoff) => true,
    }
}
