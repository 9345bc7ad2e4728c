/// Suffix appended to the event topic to name the compacted state topic.
pub const STATE_TOPIC_SUFFIX: &str = "-state";

/// Suffix appended to the event topic to name the dead-letter topic.
pub const DEAD_LETTER_TOPIC_SUFFIX: &str = "-dlq";

/// Suffix appended to the event topic to name the large-object chunk topic.
pub const CHUNK_TOPIC_SUFFIX: &str = "-chunks";

/// The topics one subscription reads and writes, all derived from the event
/// topic name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionTopics {
    pub event: String,
    pub state: String,
    pub dead_letter: String,
    pub chunks: String,
}

impl SubscriptionTopics {
    pub fn for_event_topic(event_topic: &str) -> Self {
        Self {
            event: event_topic.to_string(),
            state: format!("{event_topic}{STATE_TOPIC_SUFFIX}"),
            dead_letter: format!("{event_topic}{DEAD_LETTER_TOPIC_SUFFIX}"),
            chunks: format!("{event_topic}{CHUNK_TOPIC_SUFFIX}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derives_companion_topics() {
        let topics = SubscriptionTopics::for_event_topic("ledger");
        assert_eq!(topics.event, "ledger");
        assert_eq!(topics.state, "ledger-state");
        assert_eq!(topics.dead_letter, "ledger-dlq");
        assert_eq!(topics.chunks, "ledger-chunks");
    }
}
