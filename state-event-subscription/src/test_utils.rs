//! An in-memory log implementing every bus trait, for tests.
//!
//! Topics are vectors of partitions, transactions are staged in the producer
//! and only become visible on commit, consumer groups keep committed offsets.
//! Tests can inject failures at any transport call and drive rebalances by
//! hand; rebalance callbacks are invoked synchronously on the calling task,
//! the way a broker client may call them from its own thread.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::bus::{
    BusClientFactory, EventConsumer, RebalanceListener, ResetStrategy, StateReader,
    TransactionalProducer,
};
use crate::error::{BusError, BusErrorKind};
use crate::record::{PartitionOffset, PolledRecord, ProducerRecord};

/// Transport calls where a failure can be injected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultPoint {
    CreateConsumer,
    CreateProducer,
    Subscribe,
    Poll,
    ResetPositions,
    ReadState,
    BeginTransaction,
    Send,
    SendOffsets,
    CommitTransaction,
}

impl FaultPoint {
    fn operation(self) -> &'static str {
        match self {
            FaultPoint::CreateConsumer => "create_consumer",
            FaultPoint::CreateProducer => "create_producer",
            FaultPoint::Subscribe => "subscribe",
            FaultPoint::Poll => "poll",
            FaultPoint::ResetPositions => "reset_positions",
            FaultPoint::ReadState => "read_state",
            FaultPoint::BeginTransaction => "begin_transaction",
            FaultPoint::Send => "send",
            FaultPoint::SendOffsets => "send_offsets_to_transaction",
            FaultPoint::CommitTransaction => "commit_transaction",
        }
    }
}

#[derive(Debug, Clone)]
struct StoredRecord {
    key: Option<Vec<u8>>,
    payload: Option<Vec<u8>>,
    timestamp: DateTime<Utc>,
}

struct ConsumerState {
    group: String,
    topic: Option<String>,
    assigned: BTreeSet<i32>,
    positions: HashMap<i32, i64>,
    listener: Arc<dyn RebalanceListener>,
    awaiting_assignment: bool,
    skip_next_poll: bool,
}

#[derive(Default)]
struct BusState {
    topics: HashMap<String, Vec<Vec<StoredRecord>>>,
    committed: CommittedOffsets,
    consumers: HashMap<u64, ConsumerState>,
    next_consumer_id: u64,
    faults: HashMap<FaultPoint, VecDeque<BusErrorKind>>,
    state_reads: Vec<Vec<i32>>,
    consumers_created: usize,
    committed_transactions: usize,
    aborted_transactions: usize,
    empty_poll_after_rewind: bool,
}

impl BusState {
    fn take_fault(&mut self, point: FaultPoint) -> Result<(), BusError> {
        let Some(kind) = self.faults.get_mut(&point).and_then(VecDeque::pop_front) else {
            return Ok(());
        };
        Err(BusError::new(
            kind,
            point.operation(),
            anyhow!("injected {:?} failure", point),
        ))
    }

    fn partitions_mut(&mut self, topic: &str, at_least: usize) -> &mut Vec<Vec<StoredRecord>> {
        let partitions = self.topics.entry(topic.to_string()).or_default();
        while partitions.len() < at_least.max(1) {
            partitions.push(Vec::new());
        }
        partitions
    }

    fn append(&mut self, topic: &str, partition: i32, key: Option<Vec<u8>>, payload: Option<Vec<u8>>) -> i64 {
        let index = usize::try_from(partition).unwrap_or(0);
        let partitions = self.partitions_mut(topic, index + 1);
        let log = &mut partitions[index];
        log.push(StoredRecord {
            key,
            payload,
            timestamp: Utc::now(),
        });
        (log.len() - 1) as i64
    }
}

type CommittedOffsets = HashMap<(String, String, i32), i64>;

fn committed_or_earliest(committed: &CommittedOffsets, group: &str, topic: &str, partition: i32) -> i64 {
    committed
        .get(&(group.to_string(), topic.to_string(), partition))
        .copied()
        .unwrap_or(0)
}

/// In-memory log shared by every client it creates. Cheap to clone.
#[derive(Clone, Default)]
pub struct InMemoryBus {
    inner: Arc<Mutex<BusState>>,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, BusState> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Creates a topic, or grows it to `partitions`.
    pub fn create_topic(&self, topic: &str, partitions: usize) {
        self.state().partitions_mut(topic, partitions);
    }

    pub fn produce_raw(
        &self,
        topic: &str,
        partition: i32,
        key: Option<Vec<u8>>,
        payload: Option<Vec<u8>>,
    ) -> i64 {
        self.state().append(topic, partition, key, payload)
    }

    pub fn produce_json<V: Serialize + ?Sized>(
        &self,
        topic: &str,
        partition: i32,
        key: &str,
        value: &V,
    ) -> i64 {
        let payload = serde_json::to_vec(value).unwrap_or_default();
        self.produce_raw(topic, partition, Some(key.as_bytes().to_vec()), Some(payload))
    }

    /// Every visible record of `topic`, by partition then offset.
    pub fn records(&self, topic: &str) -> Vec<PolledRecord> {
        let state = self.state();
        let Some(partitions) = state.topics.get(topic) else {
            return Vec::new();
        };
        partitions
            .iter()
            .enumerate()
            .flat_map(|(partition, log)| {
                log.iter()
                    .enumerate()
                    .map(move |(offset, r)| polled(topic, partition as i32, offset as i64, r))
            })
            .collect()
    }

    pub fn committed_offset(&self, group: &str, topic: &str, partition: i32) -> Option<i64> {
        self.state()
            .committed
            .get(&(group.to_string(), topic.to_string(), partition))
            .copied()
    }

    /// Makes the next `times` calls at `point` fail with `kind`.
    pub fn inject_fault(&self, point: FaultPoint, kind: BusErrorKind, times: usize) {
        self.state()
            .faults
            .entry(point)
            .or_default()
            .extend(std::iter::repeat(kind).take(times));
    }

    pub fn inject_intermittent(&self, point: FaultPoint, times: usize) {
        self.inject_fault(point, BusErrorKind::Intermittent, times);
    }

    pub fn inject_fatal(&self, point: FaultPoint, times: usize) {
        self.inject_fault(point, BusErrorKind::Fatal, times);
    }

    /// Makes the first poll after every position reset come back empty, like
    /// a slow broker that has not refetched the rewound records yet.
    pub fn empty_poll_after_rewind(&self, enabled: bool) {
        self.state().empty_poll_after_rewind = enabled;
    }

    /// Takes `partitions` away from every live consumer and notifies their
    /// listeners before returning.
    pub fn revoke(&self, partitions: &[i32]) {
        let mut notify = Vec::new();
        {
            let mut state = self.state();
            for consumer in state.consumers.values_mut() {
                let lost: Vec<i32> = partitions
                    .iter()
                    .copied()
                    .filter(|p| consumer.assigned.remove(p))
                    .collect();
                for p in &lost {
                    consumer.positions.remove(p);
                }
                if !lost.is_empty() {
                    notify.push((consumer.listener.clone(), lost));
                }
            }
        }
        for (listener, lost) in notify {
            listener.on_partitions_revoked(&lost);
        }
    }

    /// Hands `partitions` to every live subscribed consumer, positioned at
    /// the group's committed offsets, and notifies their listeners.
    pub fn assign(&self, partitions: &[i32]) {
        let mut notify = Vec::new();
        {
            let mut guard = self.state();
            let state = &mut *guard;
            for consumer in state.consumers.values_mut() {
                let Some(topic) = consumer.topic.clone() else {
                    continue;
                };
                consumer.awaiting_assignment = false;
                let mut gained = Vec::new();
                for p in partitions {
                    if consumer.assigned.insert(*p) {
                        let position =
                            committed_or_earliest(&state.committed, &consumer.group, &topic, *p);
                        consumer.positions.insert(*p, position);
                        gained.push(*p);
                    }
                }
                if !gained.is_empty() {
                    notify.push((consumer.listener.clone(), gained));
                }
            }
        }
        for (listener, gained) in notify {
            listener.on_partitions_assigned(&gained);
        }
    }

    pub fn assigned_partitions(&self) -> Vec<i32> {
        let state = self.state();
        let all: BTreeSet<i32> = state
            .consumers
            .values()
            .flat_map(|c| c.assigned.iter().copied())
            .collect();
        all.into_iter().collect()
    }

    /// Partitions of every state replay, in call order.
    pub fn state_reads(&self) -> Vec<Vec<i32>> {
        self.state().state_reads.clone()
    }

    pub fn consumers_created(&self) -> usize {
        self.state().consumers_created
    }

    pub fn live_consumers(&self) -> usize {
        self.state().consumers.len()
    }

    pub fn committed_transactions(&self) -> usize {
        self.state().committed_transactions
    }

    pub fn aborted_transactions(&self) -> usize {
        self.state().aborted_transactions
    }

    pub fn state_reader(&self) -> InMemoryStateReader {
        InMemoryStateReader { bus: self.clone() }
    }
}

fn polled(topic: &str, partition: i32, offset: i64, record: &StoredRecord) -> PolledRecord {
    PolledRecord {
        topic: topic.to_string(),
        partition,
        offset,
        timestamp: Some(record.timestamp),
        key: record.key.clone(),
        payload: record.payload.clone(),
    }
}

pub struct InMemoryConsumer {
    bus: InMemoryBus,
    id: u64,
    group: String,
}

impl Drop for InMemoryConsumer {
    fn drop(&mut self) {
        self.bus.state().consumers.remove(&self.id);
    }
}

#[async_trait]
impl EventConsumer for InMemoryConsumer {
    fn subscribe(&mut self, topic: &str) -> Result<(), BusError> {
        let mut state = self.bus.state();
        state.take_fault(FaultPoint::Subscribe)?;
        if let Some(consumer) = state.consumers.get_mut(&self.id) {
            consumer.topic = Some(topic.to_string());
            consumer.awaiting_assignment = true;
        }
        Ok(())
    }

    async fn poll(
        &mut self,
        max_records: usize,
        timeout: Duration,
    ) -> Result<Vec<PolledRecord>, BusError> {
        let mut assignment = None;
        let records = {
            let mut guard = self.bus.state();
            guard.take_fault(FaultPoint::Poll)?;
            let state = &mut *guard;
            let Some(consumer) = state.consumers.get_mut(&self.id) else {
                return Err(BusError::fatal("poll", anyhow!("consumer is closed")));
            };
            let Some(topic) = consumer.topic.clone() else {
                return Err(BusError::fatal("poll", anyhow!("consumer is not subscribed")));
            };

            if consumer.awaiting_assignment {
                if let Some(partitions) = state.topics.get(&topic) {
                    let all: Vec<i32> = (0..partitions.len() as i32).collect();
                    for p in &all {
                        let position =
                            committed_or_earliest(&state.committed, &consumer.group, &topic, *p);
                        consumer.assigned.insert(*p);
                        consumer.positions.insert(*p, position);
                    }
                    consumer.awaiting_assignment = false;
                    assignment = Some((consumer.listener.clone(), all));
                }
            }

            let mut records = Vec::new();
            if consumer.skip_next_poll {
                consumer.skip_next_poll = false;
            } else if let Some(partitions) = state.topics.get(&topic) {
                for p in consumer.assigned.iter().copied() {
                    let Some(log) = partitions.get(p as usize) else {
                        continue;
                    };
                    let position = consumer.positions.entry(p).or_insert(0);
                    while records.len() < max_records {
                        let Some(record) = log.get(*position as usize) else {
                            break;
                        };
                        records.push(polled(&topic, p, *position, record));
                        *position += 1;
                    }
                }
            }
            records
        };

        if let Some((listener, partitions)) = assignment {
            listener.on_partitions_assigned(&partitions);
        }
        if records.is_empty() {
            tokio::time::sleep(timeout.min(Duration::from_millis(10))).await;
        }
        Ok(records)
    }

    fn reset_to_last_committed_positions(
        &mut self,
        strategy: ResetStrategy,
    ) -> Result<(), BusError> {
        let mut guard = self.bus.state();
        guard.take_fault(FaultPoint::ResetPositions)?;
        let state = &mut *guard;
        let skip_next_poll = state.empty_poll_after_rewind;
        let Some(consumer) = state.consumers.get_mut(&self.id) else {
            return Ok(());
        };
        consumer.skip_next_poll = skip_next_poll;
        let Some(topic) = consumer.topic.clone() else {
            return Ok(());
        };
        for p in consumer.assigned.iter().copied() {
            let position = match strategy {
                ResetStrategy::LastCommitted => {
                    committed_or_earliest(&state.committed, &consumer.group, &topic, p)
                }
                ResetStrategy::Earliest => 0,
            };
            consumer.positions.insert(p, position);
        }
        Ok(())
    }
}

#[derive(Default)]
struct PendingTransaction {
    records: Vec<ProducerRecord>,
    offsets: Vec<(String, PartitionOffset)>,
}

pub struct InMemoryProducer {
    bus: InMemoryBus,
    transactional_id: String,
    open: Option<PendingTransaction>,
}

impl InMemoryProducer {
    pub fn transactional_id(&self) -> &str {
        &self.transactional_id
    }

    fn open_transaction(&mut self, operation: &'static str) -> Result<&mut PendingTransaction, BusError> {
        self.open
            .as_mut()
            .ok_or_else(|| BusError::fatal(operation, anyhow!("no open transaction")))
    }
}

#[async_trait]
impl TransactionalProducer for InMemoryProducer {
    type Consumer = InMemoryConsumer;

    fn begin_transaction(&mut self) -> Result<(), BusError> {
        self.bus.state().take_fault(FaultPoint::BeginTransaction)?;
        if self.open.is_some() {
            return Err(BusError::fatal(
                "begin_transaction",
                anyhow!("a transaction is already open"),
            ));
        }
        self.open = Some(PendingTransaction::default());
        Ok(())
    }

    async fn send(&mut self, records: Vec<ProducerRecord>) -> Result<(), BusError> {
        self.bus.state().take_fault(FaultPoint::Send)?;
        self.open_transaction("send")?.records.extend(records);
        Ok(())
    }

    fn send_offsets_to_transaction(
        &mut self,
        offsets: &[PartitionOffset],
        consumer: &InMemoryConsumer,
    ) -> Result<(), BusError> {
        self.bus.state().take_fault(FaultPoint::SendOffsets)?;
        let group = consumer.group.clone();
        self.open_transaction("send_offsets_to_transaction")?
            .offsets
            .extend(offsets.iter().map(|o| (group.clone(), o.clone())));
        Ok(())
    }

    fn commit_transaction(&mut self) -> Result<(), BusError> {
        let mut state = self.bus.state();
        state.take_fault(FaultPoint::CommitTransaction)?;
        let Some(transaction) = self.open.take() else {
            return Err(BusError::fatal(
                "commit_transaction",
                anyhow!("no open transaction"),
            ));
        };

        for record in transaction.records {
            let partition = match record.partition {
                Some(p) => p,
                None => {
                    let count = state.partitions_mut(&record.topic, 1).len();
                    key_partition(&record.key, count)
                }
            };
            state.append(&record.topic, partition, Some(record.key), record.payload);
        }
        for (group, offset) in transaction.offsets {
            state
                .committed
                .insert((group, offset.topic, offset.partition), offset.offset);
        }
        state.committed_transactions += 1;
        Ok(())
    }

    fn abort_transaction(&mut self) -> Result<(), BusError> {
        self.open = None;
        self.bus.state().aborted_transactions += 1;
        Ok(())
    }
}

fn key_partition(key: &[u8], partitions: usize) -> i32 {
    let sum: u64 = key.iter().map(|b| u64::from(*b)).sum();
    (sum % partitions.max(1) as u64) as i32
}

pub struct InMemoryStateReader {
    bus: InMemoryBus,
}

#[async_trait]
impl StateReader for InMemoryStateReader {
    async fn read_to_end(
        &mut self,
        topic: &str,
        partitions: &[i32],
    ) -> Result<Vec<PolledRecord>, BusError> {
        let mut state = self.bus.state();
        state.take_fault(FaultPoint::ReadState)?;
        state.state_reads.push(partitions.to_vec());

        let Some(logs) = state.topics.get(topic) else {
            return Ok(Vec::new());
        };
        let mut records = Vec::new();
        for p in partitions {
            if let Some(log) = logs.get(*p as usize) {
                records.extend(
                    log.iter()
                        .enumerate()
                        .map(|(offset, r)| polled(topic, *p, offset as i64, r)),
                );
            }
        }
        Ok(records)
    }
}

#[async_trait]
impl BusClientFactory for InMemoryBus {
    type Consumer = InMemoryConsumer;
    type Producer = InMemoryProducer;
    type StateReader = InMemoryStateReader;

    async fn create_consumer(
        &self,
        group_id: &str,
        _client_id: &str,
        listener: Arc<dyn RebalanceListener>,
    ) -> Result<InMemoryConsumer, BusError> {
        let mut state = self.state();
        state.take_fault(FaultPoint::CreateConsumer)?;
        state.next_consumer_id += 1;
        state.consumers_created += 1;
        let id = state.next_consumer_id;
        state.consumers.insert(
            id,
            ConsumerState {
                group: group_id.to_string(),
                topic: None,
                assigned: BTreeSet::new(),
                positions: HashMap::new(),
                listener,
                awaiting_assignment: false,
                skip_next_poll: false,
            },
        );
        Ok(InMemoryConsumer {
            bus: self.clone(),
            id,
            group: group_id.to_string(),
        })
    }

    async fn create_producer(&self, transactional_id: &str) -> Result<InMemoryProducer, BusError> {
        self.state().take_fault(FaultPoint::CreateProducer)?;
        Ok(InMemoryProducer {
            bus: self.clone(),
            transactional_id: transactional_id.to_string(),
            open: None,
        })
    }

    async fn create_state_reader(&self, _client_id: &str) -> Result<InMemoryStateReader, BusError> {
        Ok(self.state_reader())
    }
}
