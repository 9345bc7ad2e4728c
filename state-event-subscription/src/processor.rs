use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::record::{ProducerRecord, Record, RecordKey};

/// What one processor invocation decided for its key.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessorResponse<S> {
    /// New state for the key. `None` clears it.
    pub updated_state: Option<S>,
    /// Records to publish in the same transaction as the state update.
    pub response_events: Vec<ProducerRecord>,
    /// Give up on the key: dead-letter the event and clear the state. Response
    /// events are still published.
    pub mark_for_dead_letter: bool,
}

impl<S> ProcessorResponse<S> {
    pub fn update(state: S) -> Self {
        Self {
            updated_state: Some(state),
            response_events: Vec::new(),
            mark_for_dead_letter: false,
        }
    }

    pub fn clear() -> Self {
        Self {
            updated_state: None,
            response_events: Vec::new(),
            mark_for_dead_letter: false,
        }
    }

    pub fn dead_letter() -> Self {
        Self {
            updated_state: None,
            response_events: Vec::new(),
            mark_for_dead_letter: true,
        }
    }

    pub fn with_event(mut self, event: ProducerRecord) -> Self {
        self.response_events.push(event);
        self
    }
}

/// User logic driven by a state-and-event subscription.
///
/// `on_next` receives the current state of the event's key (the committed
/// state, or the result of the previous event for the same key within the
/// batch) and returns what to persist and publish. It must finish within the
/// configured processor timeout; an error, a panic or a timeout dead-letters
/// the event. Retried invocations with the same state and event should have
/// equivalent effects.
#[async_trait]
pub trait Processor: Send + Sync + 'static {
    type Key: RecordKey;
    type Event: DeserializeOwned + Send + 'static;
    type State: Serialize + DeserializeOwned + Clone + Send + Sync + 'static;

    async fn on_next(
        &self,
        current_state: Option<Self::State>,
        event: Record<Self::Key, Self::Event>,
    ) -> anyhow::Result<ProcessorResponse<Self::State>>;

    /// Ids of large-object chunks referenced by `state`. When an update drops
    /// a reference, a tombstone for that chunk id is published on the chunk
    /// topic in the same transaction.
    fn chunk_references(&self, _state: &Self::State) -> Vec<String> {
        Vec::new()
    }
}
