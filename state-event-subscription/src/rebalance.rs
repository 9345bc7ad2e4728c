use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashSet;
use metrics::{counter, histogram};
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::bus::{RebalanceListener, StateReader};
use crate::cache::MaterializedStateCache;
use crate::error::{CodecError, SubscriptionError};
use crate::metrics_consts::{
    PARTITIONS_ASSIGNED, PARTITIONS_REVOKED, STATE_REPLAY_DURATION, STATE_REPLAY_RECORDS,
};
use crate::record::{decode_value, PolledRecord, RecordKey};

/// Notification forwarded from the transport to the subscription worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RebalanceEvent {
    Assigned(Vec<i32>),
    Revoked(Vec<i32>),
}

/// Listener half of the rebalance coordination, handed to the transport.
///
/// Callbacks only queue events for the worker and flag revoked partitions;
/// the flag lets a batch that is already being processed notice that it lost
/// a partition before it commits.
pub struct RebalanceSignal {
    events: mpsc::UnboundedSender<RebalanceEvent>,
    revoked: DashSet<i32>,
}

impl RebalanceSignal {
    fn new(events: mpsc::UnboundedSender<RebalanceEvent>) -> Self {
        Self {
            events,
            revoked: DashSet::new(),
        }
    }

    /// Partitions among `partitions` revoked since the worker last drained
    /// rebalance events.
    pub fn revoked_among<'a>(&self, partitions: impl IntoIterator<Item = &'a i32>) -> Vec<i32> {
        let mut hit: Vec<i32> = partitions
            .into_iter()
            .filter(|p| self.revoked.contains(*p))
            .copied()
            .collect();
        hit.sort_unstable();
        hit.dedup();
        hit
    }

    fn acknowledge_revoked(&self, partitions: &[i32]) {
        for partition in partitions {
            self.revoked.remove(partition);
        }
    }

    fn forward(&self, event: RebalanceEvent) {
        if let Err(e) = self.events.send(event) {
            debug!("rebalance event dropped, worker is gone: {:?}", e.0);
        }
    }
}

impl RebalanceListener for RebalanceSignal {
    fn on_partitions_assigned(&self, partitions: &[i32]) {
        info!(partitions = ?partitions, "partitions assigned");
        counter!(PARTITIONS_ASSIGNED).increment(partitions.len() as u64);
        self.forward(RebalanceEvent::Assigned(partitions.to_vec()));
    }

    fn on_partitions_revoked(&self, partitions: &[i32]) {
        info!(partitions = ?partitions, "partitions revoked");
        counter!(PARTITIONS_REVOKED).increment(partitions.len() as u64);
        for partition in partitions {
            self.revoked.insert(*partition);
        }
        self.forward(RebalanceEvent::Revoked(partitions.to_vec()));
    }
}

/// Net effect of the rebalance events drained in one cycle.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RebalanceChanges {
    /// Partitions that must be replayed before any of their events is processed.
    pub assigned: Vec<i32>,
    pub revoked: Vec<i32>,
}

impl RebalanceChanges {
    pub fn is_empty(&self) -> bool {
        self.assigned.is_empty() && self.revoked.is_empty()
    }

    pub fn was_revoked(&self, partition: i32) -> bool {
        self.revoked.contains(&partition)
    }
}

/// Worker half: applies queued rebalance events to the state cache.
///
/// Assigned partitions stay pending until their snapshot is in the cache, so
/// a replay that fails is attempted again on the next cycle.
pub struct RebalanceCoordinator {
    signal: Arc<RebalanceSignal>,
    events: mpsc::UnboundedReceiver<RebalanceEvent>,
    state_topic: String,
    pending: BTreeSet<i32>,
}

impl RebalanceCoordinator {
    pub fn new(state_topic: impl Into<String>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            signal: Arc::new(RebalanceSignal::new(tx)),
            events: rx,
            state_topic: state_topic.into(),
            pending: BTreeSet::new(),
        }
    }

    pub fn signal(&self) -> &Arc<RebalanceSignal> {
        &self.signal
    }

    pub fn listener(&self) -> Arc<dyn RebalanceListener> {
        self.signal.clone()
    }

    /// Applies every queued event: revoked partitions leave the cache and the
    /// pending set at once, assigned partitions join the pending set. A
    /// partition revoked and assigned again within one drain is replayed.
    pub fn drain<K: RecordKey, S>(
        &mut self,
        cache: &mut MaterializedStateCache<K, S>,
    ) -> RebalanceChanges {
        let mut to_replay = BTreeSet::new();
        let mut revoked = BTreeSet::new();

        while let Ok(event) = self.events.try_recv() {
            match event {
                RebalanceEvent::Assigned(partitions) => {
                    self.pending.extend(partitions.iter().copied());
                    to_replay.extend(partitions);
                }
                RebalanceEvent::Revoked(partitions) => {
                    let dropped = cache.drop_partitions(&partitions);
                    debug!(partitions = ?partitions, dropped, "dropped cached state");
                    for partition in &partitions {
                        to_replay.remove(partition);
                        self.pending.remove(partition);
                    }
                    self.signal.acknowledge_revoked(&partitions);
                    revoked.extend(partitions);
                }
            }
        }

        RebalanceChanges {
            assigned: to_replay.into_iter().collect(),
            revoked: revoked.into_iter().collect(),
        }
    }

    /// Partitions assigned but not yet replayed.
    pub fn pending_replay(&self) -> Vec<i32> {
        self.pending.iter().copied().collect()
    }

    pub fn has_pending_replay(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Replays every pending partition. They leave the pending set only
    /// once their snapshot is loaded.
    pub async fn replay_pending<K, S, R>(
        &mut self,
        cache: &mut MaterializedStateCache<K, S>,
        reader: &mut R,
    ) -> Result<(), SubscriptionError>
    where
        K: RecordKey,
        S: DeserializeOwned,
        R: StateReader + ?Sized,
    {
        let partitions = self.pending_replay();
        self.replay(cache, reader, &partitions).await?;
        for partition in &partitions {
            self.pending.remove(partition);
        }
        Ok(())
    }

    /// Rebuilds the cache for `partitions` from the state topic. Any record
    /// that cannot be decoded is fatal: processing against a partial snapshot
    /// would corrupt state.
    pub async fn replay<K, S, R>(
        &self,
        cache: &mut MaterializedStateCache<K, S>,
        reader: &mut R,
        partitions: &[i32],
    ) -> Result<(), SubscriptionError>
    where
        K: RecordKey,
        S: DeserializeOwned,
        R: StateReader + ?Sized,
    {
        if partitions.is_empty() {
            return Ok(());
        }

        let start = Instant::now();
        let records = reader.read_to_end(&self.state_topic, partitions).await?;
        let record_count = records.len();

        let mut snapshot: HashMap<i32, HashMap<K, S>> =
            partitions.iter().map(|p| (*p, HashMap::new())).collect();
        for record in &records {
            let key = decode_state_key(record)?;
            let entries = snapshot.entry(record.partition).or_default();
            match record.payload.as_deref() {
                Some(payload) => {
                    let state = decode_value(payload)
                        .map_err(|e| state_decode_error(&self.state_topic, record, e))?;
                    entries.insert(key, state);
                }
                None => {
                    entries.remove(&key);
                }
            }
        }

        for (partition, entries) in snapshot {
            info!(
                topic = %self.state_topic,
                partition,
                keys = entries.len(),
                "replayed state partition"
            );
            cache.load_partition(partition, entries);
        }

        counter!(STATE_REPLAY_RECORDS).increment(record_count as u64);
        histogram!(STATE_REPLAY_DURATION).record(start.elapsed().as_secs_f64());
        Ok(())
    }
}

fn decode_state_key<K: RecordKey>(record: &PolledRecord) -> Result<K, SubscriptionError> {
    record
        .key
        .as_deref()
        .ok_or(CodecError::MissingKey)
        .and_then(K::from_key_bytes)
        .map_err(|e| state_decode_error(&record.topic, record, e))
}

fn state_decode_error(topic: &str, record: &PolledRecord, e: CodecError) -> SubscriptionError {
    SubscriptionError::fatal(
        "replay_state",
        anyhow::Error::new(e).context(format!(
            "undecodable state record at {topic}/{}@{}",
            record.partition, record.offset
        )),
    )
}
