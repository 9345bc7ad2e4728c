use lifecycle::{Classify, FailureClass};
use thiserror::Error;

/// How a transport failure should be treated by the retry loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusErrorKind {
    /// Broker unavailable, timeouts, fenced or rebalancing group.
    Intermittent,
    /// Authentication, misconfiguration, unknown topics.
    Fatal,
    /// An error code nobody mapped.
    Unknown,
}

/// A failure reported by the log transport.
#[derive(Debug, Error)]
#[error("{operation} failed: {source}")]
pub struct BusError {
    pub kind: BusErrorKind,
    pub operation: &'static str,
    #[source]
    pub source: anyhow::Error,
}

impl BusError {
    pub fn new(kind: BusErrorKind, operation: &'static str, source: impl Into<anyhow::Error>) -> Self {
        Self {
            kind,
            operation,
            source: source.into(),
        }
    }

    pub fn intermittent(operation: &'static str, source: impl Into<anyhow::Error>) -> Self {
        Self::new(BusErrorKind::Intermittent, operation, source)
    }

    pub fn fatal(operation: &'static str, source: impl Into<anyhow::Error>) -> Self {
        Self::new(BusErrorKind::Fatal, operation, source)
    }

    pub fn unknown(operation: &'static str, source: impl Into<anyhow::Error>) -> Self {
        Self::new(BusErrorKind::Unknown, operation, source)
    }

    pub fn is_intermittent(&self) -> bool {
        self.kind == BusErrorKind::Intermittent
    }
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("key is not valid utf-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("record has no key")]
    MissingKey,

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

/// Everything that can stop or interrupt a poll-process-commit cycle.
#[derive(Debug, Error)]
pub enum SubscriptionError {
    #[error("intermittent failure during {operation}: {source:#}")]
    Intermittent {
        operation: &'static str,
        source: anyhow::Error,
    },

    #[error("fatal failure during {operation}: {source:#}")]
    Fatal {
        operation: &'static str,
        source: anyhow::Error,
    },

    /// Partitions touched by the current batch were revoked before it could
    /// be committed.
    #[error("rebalance in progress, partitions {partitions:?} revoked during the batch")]
    RebalanceInProgress { partitions: Vec<i32> },

    #[error("unclassified failure during {operation}: {source:#}")]
    Unclassified {
        operation: &'static str,
        source: anyhow::Error,
    },
}

impl SubscriptionError {
    pub fn fatal(operation: &'static str, source: impl Into<anyhow::Error>) -> Self {
        Self::Fatal {
            operation,
            source: source.into(),
        }
    }

    pub fn intermittent(operation: &'static str, source: impl Into<anyhow::Error>) -> Self {
        Self::Intermittent {
            operation,
            source: source.into(),
        }
    }

    /// Tag for metrics.
    pub fn error_type(&self) -> &'static str {
        match self {
            SubscriptionError::Intermittent { .. } => "intermittent",
            SubscriptionError::Fatal { .. } => "fatal",
            SubscriptionError::RebalanceInProgress { .. } => "rebalance_in_progress",
            SubscriptionError::Unclassified { .. } => "unclassified",
        }
    }
}

impl From<BusError> for SubscriptionError {
    fn from(e: BusError) -> Self {
        let BusError {
            kind,
            operation,
            source,
        } = e;
        match kind {
            BusErrorKind::Intermittent => SubscriptionError::Intermittent { operation, source },
            BusErrorKind::Fatal => SubscriptionError::Fatal { operation, source },
            BusErrorKind::Unknown => SubscriptionError::Unclassified { operation, source },
        }
    }
}

impl Classify for SubscriptionError {
    fn failure_class(&self) -> FailureClass {
        match self {
            SubscriptionError::Intermittent { .. } | SubscriptionError::RebalanceInProgress { .. } => {
                FailureClass::Intermittent
            }
            SubscriptionError::Fatal { .. } => FailureClass::Fatal,
            SubscriptionError::Unclassified { .. } => FailureClass::Unclassified,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use test_case::test_case;

    #[test_case(BusErrorKind::Intermittent, FailureClass::Intermittent ; "intermittent")]
    #[test_case(BusErrorKind::Fatal, FailureClass::Fatal ; "fatal")]
    #[test_case(BusErrorKind::Unknown, FailureClass::Unclassified ; "unknown")]
    fn bus_errors_keep_their_class(kind: BusErrorKind, expected: FailureClass) {
        let err: SubscriptionError = BusError::new(kind, "poll", anyhow!("broker said no")).into();
        assert_eq!(err.failure_class(), expected);
    }

    #[test]
    fn rebalance_is_intermittent() {
        let err = SubscriptionError::RebalanceInProgress {
            partitions: vec![1, 2],
        };
        assert_eq!(err.failure_class(), FailureClass::Intermittent);
        assert_eq!(err.error_type(), "rebalance_in_progress");
    }

    #[test]
    fn message_carries_operation_and_cause() {
        let err: SubscriptionError =
            BusError::fatal("commit_transaction", anyhow!("producer fenced")).into();
        assert_eq!(
            err.to_string(),
            "fatal failure during commit_transaction: producer fenced"
        );
    }
}
