use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::FutureExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::LifecycleError;
use crate::status::{LifecycleStatus, StatusReporter};

static NEXT_RUNNER_ID: AtomicU64 = AtomicU64::new(1);

tokio::task_local! {
    static CURRENT_RUNNER: u64;
}

/// Owns exactly one background worker and the token used to stop it.
///
/// The body receives a [`CancellationToken`] and is expected to check it
/// between units of work; the runner never aborts the worker. Stopping
/// waits up to `join_timeout` for the body to return.
pub struct LoopRunner {
    id: u64,
    name: String,
    status: StatusReporter,
    join_timeout: Duration,
    stop_token: CancellationToken,
    worker: Option<JoinHandle<()>>,
}

impl LoopRunner {
    pub fn new(name: impl Into<String>, status: StatusReporter, join_timeout: Duration) -> Self {
        Self {
            id: NEXT_RUNNER_ID.fetch_add(1, Ordering::Relaxed),
            name: name.into(),
            status,
            join_timeout,
            stop_token: CancellationToken::new(),
            worker: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status(&self) -> &StatusReporter {
        &self.status
    }

    pub fn is_running(&self) -> bool {
        self.worker.as_ref().is_some_and(|w| !w.is_finished())
    }

    /// True when called from inside this runner's worker task.
    pub fn in_worker(&self) -> bool {
        CURRENT_RUNNER
            .try_with(|id| *id == self.id)
            .unwrap_or(false)
    }

    /// Spawns the worker unless one is already running. Returns whether a
    /// new worker was spawned.
    pub fn start<F, Fut>(&mut self, body: F) -> bool
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if self.is_running() {
            debug!(runner = %self.name, "worker already running, ignoring start");
            return false;
        }

        self.stop_token = CancellationToken::new();
        self.status.report(LifecycleStatus::Starting);

        let name = self.name.clone();
        let status = self.status.clone();
        let work = body(self.stop_token.clone());

        let handle = tokio::spawn(CURRENT_RUNNER.scope(self.id, async move {
            info!(runner = %name, "worker started");
            match AssertUnwindSafe(work).catch_unwind().await {
                Ok(()) => {
                    if !status.current().is_error() {
                        status.report(LifecycleStatus::Down);
                    }
                    info!(runner = %name, "worker exited");
                }
                Err(panic) => {
                    let reason = panic_message(panic.as_ref());
                    error!(
                        runner = %name,
                        reason = %reason,
                        "worker reached an unrecoverable state and stopped"
                    );
                    status.report(LifecycleStatus::Error { reason });
                }
            }
        }));

        self.worker = Some(handle);
        true
    }

    /// Signals the stop flag and waits (bounded) for the worker to exit.
    pub async fn stop(&mut self) -> Result<(), LifecycleError> {
        if self.in_worker() {
            return Err(LifecycleError::StopFromWorker {
                name: self.name.clone(),
            });
        }

        self.stop_token.cancel();
        let Some(mut worker) = self.worker.take() else {
            return Ok(());
        };

        match tokio::time::timeout(self.join_timeout, &mut worker).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(LifecycleError::WorkerTerminated {
                name: self.name.clone(),
                reason: e.to_string(),
            }),
            Err(_) => {
                warn!(
                    runner = %self.name,
                    timeout_ms = self.join_timeout.as_millis() as u64,
                    "worker did not exit in time, leaving it to finish in the background"
                );
                self.worker = Some(worker);
                Err(LifecycleError::JoinTimeout {
                    name: self.name.clone(),
                    timeout: self.join_timeout,
                })
            }
        }
    }

    /// Waits for the worker to exit on its own, without signalling stop.
    pub async fn join(&mut self) {
        if let Some(worker) = self.worker.take() {
            if let Err(e) = worker.await {
                warn!(runner = %self.name, error = %e, "worker join failed");
            }
        }
    }
}

impl Drop for LoopRunner {
    fn drop(&mut self) {
        self.stop_token.cancel();
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "worker panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::StatusRegistry;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn runner(registry: &StatusRegistry, join_timeout: Duration) -> LoopRunner {
        LoopRunner::new("test", registry.register("test"), join_timeout)
    }

    #[tokio::test]
    async fn start_spawns_one_worker() {
        let registry = StatusRegistry::new("test");
        let mut runner = runner(&registry, Duration::from_secs(1));
        let spawned = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let spawned = spawned.clone();
            runner.start(|stop| async move {
                spawned.fetch_add(1, Ordering::SeqCst);
                stop.cancelled().await;
            });
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(runner.is_running());
        assert_eq!(spawned.load(Ordering::SeqCst), 1);

        runner.stop().await.unwrap();
        assert!(!runner.is_running());
        assert_eq!(registry.status_of("test"), Some(LifecycleStatus::Down));
    }

    #[tokio::test]
    async fn stop_times_out_when_body_ignores_flag() {
        let registry = StatusRegistry::new("test");
        let mut runner = runner(&registry, Duration::from_millis(50));
        runner.start(|_stop| async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let err = runner.stop().await.unwrap_err();
        assert!(matches!(err, LifecycleError::JoinTimeout { .. }));
        assert!(runner.is_running());
    }

    #[tokio::test]
    async fn panic_in_worker_reports_error() {
        let registry = StatusRegistry::new("test");
        let mut runner = runner(&registry, Duration::from_secs(1));
        runner.start(|_stop| async move {
            panic!("state went sideways");
        });

        runner.join().await;
        assert_eq!(
            registry.status_of("test"),
            Some(LifecycleStatus::Error {
                reason: "state went sideways".to_string()
            })
        );
    }

    #[tokio::test]
    async fn error_status_survives_clean_exit() {
        let registry = StatusRegistry::new("test");
        let mut runner = runner(&registry, Duration::from_secs(1));
        let status = runner.status().clone();
        runner.start(move |_stop| async move {
            status.report(LifecycleStatus::Error {
                reason: "fatal".to_string(),
            });
        });

        runner.join().await;
        assert_eq!(
            registry.status_of("test"),
            Some(LifecycleStatus::Error {
                reason: "fatal".to_string()
            })
        );
    }

    #[tokio::test]
    async fn stop_from_inside_the_worker_fails_fast() {
        let registry = StatusRegistry::new("test");
        let shared = Arc::new(tokio::sync::Mutex::new(runner(
            &registry,
            Duration::from_secs(1),
        )));
        let (tx, rx) = tokio::sync::oneshot::channel();

        let inner = shared.clone();
        shared.lock().await.start(move |_stop| async move {
            let result = inner.lock().await.stop().await;
            assert!(tx.send(result).is_ok());
        });

        let result = rx.await.unwrap();
        assert!(matches!(result, Err(LifecycleError::StopFromWorker { .. })));

        shared.lock().await.join().await;
        assert_eq!(registry.status_of("test"), Some(LifecycleStatus::Down));
    }

    #[tokio::test]
    async fn in_worker_is_scoped_to_the_worker_task() {
        let registry = StatusRegistry::new("test");
        let mut runner = runner(&registry, Duration::from_secs(1));
        let runner_id = runner.id;
        assert!(!runner.in_worker());

        let (tx, rx) = tokio::sync::oneshot::channel();
        runner.start(move |_stop| async move {
            let inside = CURRENT_RUNNER.try_with(|id| *id == runner_id).unwrap_or(false);
            assert!(tx.send(inside).is_ok());
        });

        assert!(rx.await.unwrap());
        runner.join().await;
    }
}
