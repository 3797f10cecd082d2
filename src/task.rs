//! Cancellable fixed-period background loops.
//!
//! The execution substrate under printer workers and the scheduler: a
//! spawned task runs `setup`, then invokes `step` every interval until the
//! cancellation token fires, then runs `teardown`. Step failures never kill
//! the loop; transport-classified errors log as warnings, everything else
//! as errors.

use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::driver::DriverError;
use crate::store::StoreError;

/// A step failure, classified for log demotion.
#[derive(Debug, Error)]
#[error("{source}")]
pub struct StepError {
    /// Transient faults (network, timeouts) that the next tick will retry.
    pub transient: bool,
    #[source]
    source: anyhow::Error,
}

impl StepError {
    pub fn transient(source: impl Into<anyhow::Error>) -> StepError {
        StepError {
            transient: true,
            source: source.into(),
        }
    }

    pub fn permanent(source: impl Into<anyhow::Error>) -> StepError {
        StepError {
            transient: false,
            source: source.into(),
        }
    }
}

impl From<DriverError> for StepError {
    fn from(err: DriverError) -> StepError {
        if err.is_transport() {
            StepError::transient(err)
        } else {
            StepError::permanent(err)
        }
    }
}

impl From<StoreError> for StepError {
    fn from(err: StoreError) -> StepError {
        StepError::permanent(err)
    }
}

/// One periodic unit of work.
///
/// Implementations own all their mutable state; the runner is the only
/// caller, so no locking is needed inside `step`.
pub trait PeriodicStep: Send + 'static {
    fn name(&self) -> &str;

    /// Scoped acquisition before the first step.
    fn setup(&mut self) -> impl Future<Output = ()> + Send;

    fn step(&mut self) -> impl Future<Output = Result<(), StepError>> + Send;

    /// Scoped release after the loop exits.
    fn teardown(&mut self) -> impl Future<Output = ()> + Send;
}

/// Handle to a running periodic loop.
pub struct PeriodicTask {
    name: String,
    cancel: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl PeriodicTask {
    /// Spawn the loop. The first step runs after one full interval, so a
    /// freshly started worker does not race its own setup.
    pub fn start<S: PeriodicStep>(mut runner: S, interval: Duration) -> PeriodicTask {
        let name = runner.name().to_string();
        let cancel = CancellationToken::new();
        let loop_cancel = cancel.clone();
        let loop_name = name.clone();

        let handle = tokio::spawn(async move {
            info!(task = %loop_name, "started");
            runner.setup().await;

            let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(10)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first interval tick completes immediately; consume it so
            // the loop sleeps before its first step.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = loop_cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        match runner.step().await {
                            Ok(()) => {}
                            Err(err) if err.transient => {
                                warn!(task = %loop_name, error = %err, "step failed (transient)");
                            }
                            Err(err) => {
                                error!(task = %loop_name, error = %err, "step failed");
                            }
                        }
                    }
                }
            }

            runner.teardown().await;
            info!(task = %loop_name, "stopped");
        });

        PeriodicTask {
            name,
            cancel,
            handle: Mutex::new(Some(handle)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Request cooperative shutdown without waiting for the loop to exit.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Stop the loop and wait for teardown. Idempotent.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let handle = {
            let mut slot = match self.handle.lock() {
                Ok(slot) => slot,
                Err(_) => return,
            };
            slot.take()
        };
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                if !err.is_cancelled() {
                    warn!(task = %self.name, error = %err, "loop join failed");
                }
            }
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        // Best-effort: a dropped handle must not leave the loop running.
        self.cancel.cancel();
    }
}
