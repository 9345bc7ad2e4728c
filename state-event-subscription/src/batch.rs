use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::{counter, histogram};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::cache::MaterializedStateCache;
use crate::dead_letter::DeadLetterRecord;
use crate::metrics_consts::{BATCH_PROCESSING_DURATION, EVENTS_DEAD_LETTERED, EVENTS_PROCESSED};
use crate::processor::{Processor, ProcessorResponse};
use crate::rebalance::RebalanceSignal;
use crate::record::{
    encode_value, InboundEvent, PartitionOffset, PolledRecord, ProducerRecord, Record, RecordKey,
};
use crate::topics::SubscriptionTopics;

/// Final state of one key touched by a batch, to be written to the state topic.
#[derive(Debug, Clone, PartialEq)]
pub struct StateWrite<K, S> {
    pub partition: i32,
    pub key: K,
    pub state: Option<S>,
    /// JSON of `state`, `None` for a tombstone.
    pub payload: Option<Vec<u8>>,
}

/// Everything a processed batch wants to commit.
#[derive(Debug)]
pub struct StagedBatch<K, S> {
    pub output_records: Vec<ProducerRecord>,
    pub dead_letters: Vec<DeadLetterRecord>,
    pub state_writes: Vec<StateWrite<K, S>>,
    pub offsets: Vec<PartitionOffset>,
    /// Partitions of this batch revoked while it was processed. When
    /// non-empty nothing else in the batch may be committed.
    pub revoked_partitions: Vec<i32>,
}

impl<K, S> StagedBatch<K, S> {
    fn new(offsets: Vec<PartitionOffset>) -> Self {
        Self {
            output_records: Vec::new(),
            dead_letters: Vec::new(),
            state_writes: Vec::new(),
            offsets,
            revoked_partitions: Vec::new(),
        }
    }

    fn abandoned(revoked_partitions: Vec<i32>) -> Self {
        Self {
            revoked_partitions,
            ..Self::new(Vec::new())
        }
    }

    pub fn rebalanced(&self) -> bool {
        !self.revoked_partitions.is_empty()
    }

    pub fn partitions(&self) -> Vec<i32> {
        self.offsets.iter().map(|o| o.partition).collect()
    }
}

enum Invocation<S> {
    Completed(ProcessorResponse<S>),
    Failed(anyhow::Error),
    TimedOut,
    Panicked(String),
}

type InvocationHandle<S> = JoinHandle<Option<anyhow::Result<ProcessorResponse<S>>>>;

struct LaneEvent<K, E> {
    record: Record<K, E>,
    offset: i64,
    payload: Option<Vec<u8>>,
}

/// All events of one key on one partition in the batch, in arrival order.
struct Lane<K, E, S> {
    key: K,
    partition: i32,
    events: VecDeque<LaneEvent<K, E>>,
    state: Option<S>,
    /// JSON of `state`, kept for dead-letter snapshots and the state write.
    payload: Option<Vec<u8>>,
}

/// Runs the processor over a polled batch.
///
/// Events are grouped by key and processed in waves: wave `n` holds the
/// `n`-th event of every key, so each key sees its events strictly in offset
/// order with the previous result as current state, while different keys of
/// the same wave run concurrently.
pub struct BatchProcessor<P: Processor> {
    processor: Arc<P>,
    topics: SubscriptionTopics,
    processor_timeout: Duration,
    parallelism: usize,
    permits: Arc<Semaphore>,
}

impl<P: Processor> BatchProcessor<P> {
    pub fn new(
        processor: Arc<P>,
        topics: SubscriptionTopics,
        processor_timeout: Duration,
        parallelism: usize,
    ) -> Self {
        let parallelism = parallelism.max(1);
        Self {
            processor,
            topics,
            processor_timeout,
            parallelism,
            permits: Arc::new(Semaphore::new(parallelism)),
        }
    }

    pub async fn process(
        &self,
        batch: Vec<PolledRecord>,
        cache: &MaterializedStateCache<P::Key, P::State>,
        signal: &RebalanceSignal,
    ) -> StagedBatch<P::Key, P::State> {
        let start = Instant::now();
        let partitions: BTreeSet<i32> = batch.iter().map(|r| r.partition).collect();
        let event_count = batch.len();
        let mut staged = StagedBatch::new(next_offsets(&self.topics.event, &batch));

        let mut lanes = self.group_by_key(batch, cache, &mut staged);
        let depth = lanes.iter().map(|l| l.events.len()).max().unwrap_or(0);

        for wave in 0..depth {
            let revoked = signal.revoked_among(&partitions);
            if !revoked.is_empty() {
                debug!(wave, revoked = ?revoked, "partitions revoked mid-batch");
                return StagedBatch::abandoned(revoked);
            }

            let mut pending = Vec::new();
            for (index, lane) in lanes.iter_mut().enumerate() {
                if let Some(event) = lane.events.pop_front() {
                    let handle = self.spawn(lane.state.clone(), event.record);
                    pending.push((index, event.offset, event.payload, handle));
                }
            }

            let slots = u32::try_from(pending.len().div_ceil(self.parallelism)).unwrap_or(u32::MAX);
            let deadline = tokio::time::Instant::now()
                + self.processor_timeout.saturating_mul(slots.saturating_add(1));

            for (index, offset, payload, handle) in pending {
                let invocation = self.await_invocation(handle, deadline).await;
                self.apply(&mut lanes[index], offset, payload, invocation, &mut staged);
            }
        }

        let revoked = signal.revoked_among(&partitions);
        if !revoked.is_empty() {
            debug!(revoked = ?revoked, "partitions revoked at the end of the batch");
            return StagedBatch::abandoned(revoked);
        }

        staged.state_writes = lanes
            .into_iter()
            .map(|lane| StateWrite {
                partition: lane.partition,
                key: lane.key,
                state: lane.state,
                payload: lane.payload,
            })
            .collect();

        counter!(EVENTS_PROCESSED).increment(event_count as u64);
        histogram!(BATCH_PROCESSING_DURATION).record(start.elapsed().as_secs_f64());
        debug!(
            events = event_count,
            keys = staged.state_writes.len(),
            outputs = staged.output_records.len(),
            dead_letters = staged.dead_letters.len(),
            "batch processed"
        );
        staged
    }

    fn group_by_key(
        &self,
        batch: Vec<PolledRecord>,
        cache: &MaterializedStateCache<P::Key, P::State>,
        staged: &mut StagedBatch<P::Key, P::State>,
    ) -> Vec<Lane<P::Key, P::Event, P::State>> {
        let mut lanes: Vec<Lane<P::Key, P::Event, P::State>> = Vec::new();
        let mut index: HashMap<(i32, P::Key), usize> = HashMap::new();

        for raw in batch {
            let event = match InboundEvent::<P::Key, P::Event>::decode(&raw) {
                Ok(event) => event,
                Err(e) => {
                    warn!(
                        topic = %raw.topic,
                        partition = raw.partition,
                        offset = raw.offset,
                        error = %e,
                        "undecodable event, sending to dead-letter topic"
                    );
                    counter!(EVENTS_DEAD_LETTERED, "reason" => "undecodable").increment(1);
                    staged.dead_letters.push(DeadLetterRecord::new(
                        raw.key.unwrap_or_default(),
                        None,
                        raw.payload,
                    ));
                    continue;
                }
            };

            let lane_id = (event.partition, event.record.key.clone());
            let lane_index = match index.get(&lane_id) {
                Some(i) => *i,
                None => {
                    let key = event.record.key.clone();
                    let state = cache.get(event.partition, &key).cloned();
                    let payload = state.as_ref().and_then(|s| encode_value(s).ok());
                    lanes.push(Lane {
                        key: key.clone(),
                        partition: event.partition,
                        events: VecDeque::new(),
                        state,
                        payload,
                    });
                    index.insert(lane_id, lanes.len() - 1);
                    lanes.len() - 1
                }
            };

            lanes[lane_index].events.push_back(LaneEvent {
                record: event.record,
                offset: event.offset,
                payload: raw.payload,
            });
        }

        lanes
    }

    fn spawn(
        &self,
        state: Option<P::State>,
        record: Record<P::Key, P::Event>,
    ) -> InvocationHandle<P::State> {
        let processor = self.processor.clone();
        let permits = self.permits.clone();
        let timeout = self.processor_timeout;

        tokio::spawn(async move {
            let _permit = permits.acquire_owned().await.ok();
            tokio::time::timeout(timeout, processor.on_next(state, record))
                .await
                .ok()
        })
    }

    async fn await_invocation(
        &self,
        mut handle: InvocationHandle<P::State>,
        deadline: tokio::time::Instant,
    ) -> Invocation<P::State> {
        match tokio::time::timeout_at(deadline, &mut handle).await {
            Ok(Ok(Some(Ok(response)))) => Invocation::Completed(response),
            Ok(Ok(Some(Err(e)))) => Invocation::Failed(e),
            Ok(Ok(None)) => Invocation::TimedOut,
            Ok(Err(e)) if e.is_panic() => Invocation::Panicked(e.to_string()),
            Ok(Err(e)) => Invocation::Failed(anyhow::Error::new(e)),
            Err(_) => {
                handle.abort();
                Invocation::TimedOut
            }
        }
    }

    fn apply(
        &self,
        lane: &mut Lane<P::Key, P::Event, P::State>,
        offset: i64,
        event_payload: Option<Vec<u8>>,
        invocation: Invocation<P::State>,
        staged: &mut StagedBatch<P::Key, P::State>,
    ) {
        let response = match invocation {
            Invocation::Completed(response) => response,
            Invocation::Failed(e) => {
                warn!(
                    key = ?lane.key,
                    partition = lane.partition,
                    offset,
                    "processor failed, sending event to dead-letter topic: {e:#}"
                );
                dead_letter(lane, event_payload, "error", staged);
                return;
            }
            Invocation::TimedOut => {
                warn!(
                    key = ?lane.key,
                    partition = lane.partition,
                    offset,
                    timeout_ms = self.processor_timeout.as_millis() as u64,
                    "processor did not complete in time, sending event to dead-letter topic"
                );
                dead_letter(lane, event_payload, "timeout", staged);
                return;
            }
            Invocation::Panicked(reason) => {
                error!(
                    key = ?lane.key,
                    partition = lane.partition,
                    offset,
                    reason = %reason,
                    "processor panicked, sending event to dead-letter topic"
                );
                dead_letter(lane, event_payload, "panic", staged);
                return;
            }
        };

        if response.mark_for_dead_letter {
            debug!(key = ?lane.key, offset, "processor marked event for dead-letter");
            dead_letter(lane, event_payload, "marked", staged);
            staged.output_records.extend(response.response_events);
            return;
        }

        let payload = match response.updated_state.as_ref().map(|s| encode_value(s)).transpose() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(
                    key = ?lane.key,
                    offset,
                    error = %e,
                    "processor returned a state that cannot be serialized"
                );
                dead_letter(lane, event_payload, "unserializable_state", staged);
                return;
            }
        };

        staged
            .output_records
            .extend(self.chunk_tombstones(lane.state.as_ref(), response.updated_state.as_ref()));
        staged.output_records.extend(response.response_events);
        lane.state = response.updated_state;
        lane.payload = payload;
    }

    /// Tombstones for chunks referenced by `previous` and no longer by `next`.
    fn chunk_tombstones(
        &self,
        previous: Option<&P::State>,
        next: Option<&P::State>,
    ) -> Vec<ProducerRecord> {
        let Some(previous) = previous else {
            return Vec::new();
        };
        let kept: HashSet<String> = next
            .map(|s| self.processor.chunk_references(s))
            .unwrap_or_default()
            .into_iter()
            .collect();

        let mut seen = HashSet::new();
        self.processor
            .chunk_references(previous)
            .into_iter()
            .filter(|chunk| !kept.contains(chunk) && seen.insert(chunk.clone()))
            .map(|chunk| ProducerRecord::tombstone(&self.topics.chunks, &chunk))
            .collect()
    }
}

fn dead_letter<K: RecordKey, E, S>(
    lane: &mut Lane<K, E, S>,
    event_payload: Option<Vec<u8>>,
    reason: &'static str,
    staged: &mut StagedBatch<K, S>,
) {
    counter!(EVENTS_DEAD_LETTERED, "reason" => reason).increment(1);
    staged.dead_letters.push(DeadLetterRecord::new(
        lane.key.to_key_bytes(),
        lane.payload.take(),
        event_payload,
    ));
    lane.state = None;
}

/// Next offset to consume per partition: highest offset seen plus one.
fn next_offsets(topic: &str, batch: &[PolledRecord]) -> Vec<PartitionOffset> {
    let mut highest: BTreeMap<i32, i64> = BTreeMap::new();
    for record in batch {
        let entry = highest.entry(record.partition).or_insert(record.offset);
        *entry = (*entry).max(record.offset);
    }
    highest
        .into_iter()
        .map(|(partition, offset)| PartitionOffset {
            topic: topic.to_string(),
            partition,
            offset: offset + 1,
        })
        .collect()
}
