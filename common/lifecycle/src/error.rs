//! Lifecycle error types returned by the loop runner.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LifecycleError {
    /// `stop()` was called from the worker it is supposed to wait for.
    #[error("runner '{name}' cannot be stopped from inside its own worker")]
    StopFromWorker { name: String },

    /// The worker did not observe the stop flag within the join timeout.
    #[error("runner '{name}' worker did not exit within {timeout:?}")]
    JoinTimeout { name: String, timeout: Duration },

    /// The worker task panicked or was cancelled by the runtime.
    #[error("runner '{name}' worker terminated abnormally: {reason}")]
    WorkerTerminated { name: String, reason: String },
}
