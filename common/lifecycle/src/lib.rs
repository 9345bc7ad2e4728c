//! Shared primitives for long-running log subscriptions: a single-worker loop
//! runner with cooperative stop and bounded join, lifecycle status reporting,
//! and the retry classifier that decides between retrying and stopping.

mod error;
mod retry;
mod runner;
mod status;

pub use error::LifecycleError;
pub use retry::{Classify, FailureClass, RetryClassifier, RetryDecision, RetryPolicy};
pub use runner::LoopRunner;
pub use status::{
    LifecycleStatus, RegistryStatus, StatusRegistry, StatusReporter, StatusSink,
};
