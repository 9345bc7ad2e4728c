use metrics::counter;
use rdkafka::error::{KafkaError, RDKafkaErrorCode};

use crate::error::{BusError, BusErrorKind};
use crate::metrics_consts::KAFKA_ERRORS;

/// Maps an rdkafka error onto the retry classes the subscription loop
/// understands.
pub fn classify_kafka_error(operation: &'static str, error: KafkaError) -> BusError {
    let kind = kafka_error_kind(&error);
    counter!(
        KAFKA_ERRORS,
        "operation" => operation,
        "kind" => kind_label(kind)
    )
    .increment(1);
    BusError::new(kind, operation, error)
}

fn kafka_error_kind(error: &KafkaError) -> BusErrorKind {
    match error {
        KafkaError::Transaction(e) => {
            if e.is_fatal() {
                BusErrorKind::Fatal
            } else if e.is_retriable() || e.txn_requires_abort() {
                BusErrorKind::Intermittent
            } else {
                code_kind(e.code())
            }
        }
        KafkaError::MessageConsumptionFatal(_)
        | KafkaError::Canceled
        | KafkaError::ClientConfig(..)
        | KafkaError::ClientCreation(_) => BusErrorKind::Fatal,
        other => other
            .rdkafka_error_code()
            .map_or(BusErrorKind::Unknown, code_kind),
    }
}

fn code_kind(code: RDKafkaErrorCode) -> BusErrorKind {
    match code {
        RDKafkaErrorCode::AllBrokersDown
        | RDKafkaErrorCode::BrokerTransportFailure
        | RDKafkaErrorCode::OperationTimedOut
        | RDKafkaErrorCode::RequestTimedOut
        | RDKafkaErrorCode::NetworkException
        | RDKafkaErrorCode::LeaderNotAvailable
        | RDKafkaErrorCode::NotLeaderForPartition
        | RDKafkaErrorCode::NotCoordinator
        | RDKafkaErrorCode::CoordinatorNotAvailable
        | RDKafkaErrorCode::CoordinatorLoadInProgress
        | RDKafkaErrorCode::RebalanceInProgress
        | RDKafkaErrorCode::IllegalGeneration
        | RDKafkaErrorCode::UnknownMemberId
        | RDKafkaErrorCode::QueueFull
        | RDKafkaErrorCode::NotEnoughReplicas
        | RDKafkaErrorCode::NotEnoughReplicasAfterAppend
        | RDKafkaErrorCode::ConcurrentTransactions => BusErrorKind::Intermittent,

        RDKafkaErrorCode::Authentication
        | RDKafkaErrorCode::SaslAuthenticationFailed
        | RDKafkaErrorCode::TopicAuthorizationFailed
        | RDKafkaErrorCode::GroupAuthorizationFailed
        | RDKafkaErrorCode::ClusterAuthorizationFailed
        | RDKafkaErrorCode::TransactionalIdAuthorizationFailed
        | RDKafkaErrorCode::UnknownTopicOrPartition
        | RDKafkaErrorCode::UnknownTopic
        | RDKafkaErrorCode::ProducerFenced
        | RDKafkaErrorCode::InvalidProducerEpoch
        | RDKafkaErrorCode::UnsupportedVersion
        | RDKafkaErrorCode::Fatal => BusErrorKind::Fatal,

        _ => BusErrorKind::Unknown,
    }
}

fn kind_label(kind: BusErrorKind) -> &'static str {
    match kind {
        BusErrorKind::Intermittent => "intermittent",
        BusErrorKind::Fatal => "fatal",
        BusErrorKind::Unknown => "unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(KafkaError::MessageConsumption(RDKafkaErrorCode::BrokerTransportFailure), BusErrorKind::Intermittent ; "broker transport")]
    #[test_case(KafkaError::Global(RDKafkaErrorCode::AllBrokersDown), BusErrorKind::Intermittent ; "all brokers down")]
    #[test_case(KafkaError::MessageProduction(RDKafkaErrorCode::QueueFull), BusErrorKind::Intermittent ; "producer queue full")]
    #[test_case(KafkaError::ConsumerCommit(RDKafkaErrorCode::RebalanceInProgress), BusErrorKind::Intermittent ; "rebalance in progress")]
    #[test_case(KafkaError::Global(RDKafkaErrorCode::Authentication), BusErrorKind::Fatal ; "authentication")]
    #[test_case(KafkaError::MessageProduction(RDKafkaErrorCode::ProducerFenced), BusErrorKind::Fatal ; "fenced producer")]
    #[test_case(KafkaError::MessageConsumptionFatal(RDKafkaErrorCode::Fatal), BusErrorKind::Fatal ; "fatal consumption")]
    #[test_case(KafkaError::ClientCreation("bad config".to_string()), BusErrorKind::Fatal ; "client creation")]
    #[test_case(KafkaError::Canceled, BusErrorKind::Fatal ; "canceled")]
    #[test_case(KafkaError::MessageConsumption(RDKafkaErrorCode::InvalidMessage), BusErrorKind::Unknown ; "unmapped code")]
    fn classifies(error: KafkaError, expected: BusErrorKind) {
        let classified = classify_kafka_error("poll", error);
        assert_eq!(classified.kind, expected);
        assert_eq!(classified.operation, "poll");
    }
}
