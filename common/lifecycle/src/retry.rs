use std::fmt::Display;
use std::time::Duration;

use rand::Rng;
use tracing::{error, warn};

/// How a failure should be treated by a subscription loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Transient I/O, rebalance races, timeouts. Retried a bounded number of times.
    Intermittent,
    /// Misconfiguration, unrecoverable serialization, explicit fatal signal.
    Fatal,
    /// Nobody recognised it. Treated as fatal, never retried blindly.
    Unclassified,
}

pub trait Classify {
    fn failure_class(&self) -> FailureClass;
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, initial_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            max_retries,
            initial_backoff,
            max_backoff,
        }
    }

    /// Exponential backoff for the given (1-based) attempt, capped at `max_backoff`.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(1u32 << exp)
            .min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Reset positions, sleep `backoff`, and run the inner loop again.
    Retry { attempt: u32, backoff: Duration },
    /// Report error status with `reason` and stop the subscription.
    Stop { reason: String },
}

/// Counts consecutive intermittent failures of one subscription.
///
/// The counter is reset by [`record_success`](RetryClassifier::record_success)
/// after every complete poll-process-commit cycle. Once more than
/// `max_retries` consecutive intermittent failures were seen, the next
/// decision is `Stop`.
#[derive(Debug)]
pub struct RetryClassifier {
    policy: RetryPolicy,
    attempts: u32,
}

impl RetryClassifier {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            attempts: 0,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn record_success(&mut self) {
        self.attempts = 0;
    }

    pub fn on_failure<E>(&mut self, failure: &E) -> RetryDecision
    where
        E: Classify + Display + ?Sized,
    {
        match failure.failure_class() {
            FailureClass::Intermittent => {
                self.attempts = self.attempts.saturating_add(1);
                if self.attempts <= self.policy.max_retries {
                    let backoff = with_jitter(self.policy.backoff_for(self.attempts));
                    warn!(
                        attempt = self.attempts,
                        max_retries = self.policy.max_retries,
                        backoff_ms = backoff.as_millis() as u64,
                        "intermittent failure, retrying: {failure}"
                    );
                    RetryDecision::Retry {
                        attempt: self.attempts,
                        backoff,
                    }
                } else {
                    let reason = format!(
                        "giving up after {} consecutive intermittent failures: {failure}",
                        self.attempts
                    );
                    error!("{reason}");
                    RetryDecision::Stop { reason }
                }
            }
            FailureClass::Fatal => {
                let reason = format!("fatal failure: {failure}");
                error!("{reason}");
                RetryDecision::Stop { reason }
            }
            FailureClass::Unclassified => {
                let reason = format!("unclassified failure treated as fatal: {failure}");
                error!("{reason}");
                RetryDecision::Stop { reason }
            }
        }
    }
}

// Adds up to 25% random jitter.
fn with_jitter(backoff: Duration) -> Duration {
    let max_jitter_ms = (backoff.as_millis() / 4) as u64;
    if max_jitter_ms == 0 {
        return backoff;
    }
    backoff + Duration::from_millis(rand::thread_rng().gen_range(0..=max_jitter_ms))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fmt;
    use test_case::test_case;

    struct Failure(FailureClass);

    impl Classify for Failure {
        fn failure_class(&self) -> FailureClass {
            self.0
        }
    }

    impl fmt::Display for Failure {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{:?}", self.0)
        }
    }

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy::new(max_retries, Duration::from_millis(10), Duration::from_millis(50))
    }

    #[test]
    fn stops_after_max_retries_plus_one() {
        let mut classifier = RetryClassifier::new(policy(3));
        let failure = Failure(FailureClass::Intermittent);

        for attempt in 1..=3 {
            match classifier.on_failure(&failure) {
                RetryDecision::Retry { attempt: a, .. } => assert_eq!(a, attempt),
                other => panic!("expected retry, got {other:?}"),
            }
        }
        assert!(matches!(
            classifier.on_failure(&failure),
            RetryDecision::Stop { .. }
        ));
        assert_eq!(classifier.attempts(), 4);
    }

    #[test]
    fn success_resets_attempts() {
        let mut classifier = RetryClassifier::new(policy(2));
        let failure = Failure(FailureClass::Intermittent);

        classifier.on_failure(&failure);
        classifier.on_failure(&failure);
        classifier.record_success();
        assert_eq!(classifier.attempts(), 0);

        assert!(matches!(
            classifier.on_failure(&failure),
            RetryDecision::Retry { attempt: 1, .. }
        ));
    }

    #[test_case(FailureClass::Fatal, "fatal failure: Fatal" ; "fatal")]
    #[test_case(FailureClass::Unclassified, "unclassified failure treated as fatal: Unclassified" ; "unclassified")]
    fn non_intermittent_failures_stop_immediately(class: FailureClass, expected: &str) {
        let mut classifier = RetryClassifier::new(policy(10));
        assert_eq!(
            classifier.on_failure(&Failure(class)),
            RetryDecision::Stop {
                reason: expected.to_string()
            }
        );
        assert_eq!(classifier.attempts(), 0);
    }

    #[test_case(1, 10 ; "first attempt")]
    #[test_case(2, 20 ; "second attempt")]
    #[test_case(3, 40 ; "third attempt")]
    #[test_case(4, 50 ; "capped")]
    #[test_case(40, 50 ; "large attempt stays capped")]
    fn backoff_is_exponential_and_capped(attempt: u32, expected_ms: u64) {
        assert_eq!(
            policy(0).backoff_for(attempt),
            Duration::from_millis(expected_ms)
        );
    }

    #[test]
    fn jitter_stays_within_a_quarter() {
        for _ in 0..100 {
            let backoff = with_jitter(Duration::from_millis(100));
            assert!(backoff >= Duration::from_millis(100));
            assert!(backoff <= Duration::from_millis(125));
        }
    }
}
