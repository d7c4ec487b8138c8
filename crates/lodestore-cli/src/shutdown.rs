//! Ordered, deadline-bounded teardown.
//!
//! A [`ShutdownOrchestrator`] holds named steps that run in registration
//! order against one shared deadline.  Every step runs even when an earlier
//! one fails; the failures are collected into [`ShutdownError::Steps`].
//! The orchestrator fires at most once.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::time::Instant;
use tracing::{debug, error, info};

/// Future returned by a shutdown step.
pub type StepFuture = BoxFuture<'static, Result<(), String>>;

/// A step receives the time left before the shared deadline.
type StepFn = Box<dyn FnOnce(Duration) -> StepFuture + Send>;

struct Step {
    name: &'static str,
    run: StepFn,
}

/// A step that did not complete cleanly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepFailure {
    pub step: &'static str,
    pub error: String,
}

/// Outcome of one step.
#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub step: &'static str,
    pub result: Result<(), String>,
}

/// Every step's outcome, in execution order.
#[derive(Debug, Clone, Default)]
pub struct ShutdownReport {
    pub outcomes: Vec<StepOutcome>,
}

impl ShutdownReport {
    pub fn failures(&self) -> Vec<StepFailure> {
        self.outcomes
            .iter()
            .filter_map(|o| match &o.result {
                Ok(()) => None,
                Err(e) => Some(StepFailure {
                    step: o.step,
                    error: e.clone(),
                }),
            })
            .collect()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ShutdownError {
    #[error("{} shutdown step(s) failed: {}", .0.len(), describe(.0))]
    Steps(Vec<StepFailure>),
}

fn describe(failures: &[StepFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("{}: {}", f.step, f.error))
        .collect::<Vec<_>>()
        .join("; ")
}

pub struct ShutdownOrchestrator {
    deadline: Duration,
    fired: AtomicBool,
    steps: Mutex<Vec<Step>>,
}

impl ShutdownOrchestrator {
    pub fn new(deadline: Duration) -> Self {
        Self {
            deadline,
            fired: AtomicBool::new(false),
            steps: Mutex::new(Vec::new()),
        }
    }

    /// Append a step.  Steps run in the order they are added.
    pub fn add_step<F>(&mut self, name: &'static str, step: F)
    where
        F: FnOnce(Duration) -> StepFuture + Send + 'static,
    {
        self.steps
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(Step {
                name,
                run: Box::new(step),
            });
    }

    /// Run every step once.  Later calls return an empty report.
    pub async fn run(&self) -> Result<ShutdownReport, ShutdownError> {
        if self.fired.swap(true, Ordering::AcqRel) {
            debug!("shutdown already triggered");
            return Ok(ShutdownReport::default());
        }

        let steps = std::mem::take(
            &mut *self
                .steps
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        let expires = Instant::now() + self.deadline;
        info!(deadline = ?self.deadline, steps = steps.len(), "shutting down");

        let mut report = ShutdownReport::default();
        for step in steps {
            let started = Instant::now();
            let remaining = expires.saturating_duration_since(started);
            info!(step = step.name, ?remaining, "shutdown step");

            let result = match tokio::time::timeout_at(expires, (step.run)(remaining)).await {
                Ok(result) => result,
                Err(_) => Err(format!("exceeded shutdown deadline of {:?}", self.deadline)),
            };
            match &result {
                Ok(()) => info!(
                    step = step.name,
                    elapsed = ?started.elapsed(),
                    "shutdown step complete"
                ),
                Err(e) => error!(step = step.name, error = %e, "shutdown step failed"),
            }
            report.outcomes.push(StepOutcome {
                step: step.name,
                result,
            });
        }

        let failures = report.failures();
        if failures.is_empty() {
            info!("shutdown complete");
            Ok(report)
        } else {
            Err(ShutdownError::Steps(failures))
        }
    }
}

/// Resolves on Ctrl-C, or SIGTERM on unix.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "cannot listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("received ctrl-c"),
        () = terminate => info!("received SIGTERM"),
    }
}
