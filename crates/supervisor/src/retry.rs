//! Retry supervisor
//!
//! Drives a unit of work until it succeeds, fails fatally, runs out of
//! retries, or the process is asked to terminate. Backoff sleeps race the
//! termination latch so a shutdown never waits out a long delay.

use std::fmt;
use std::future::Future;

use runtime_core::GracefulTerminator;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::fault::{FaultClass, FaultClassifier};
use crate::policy::RetryPolicy;

/// Why the supervisor gave up. Carries the last failure intact.
#[derive(Debug, Error)]
pub enum SupervisorError<E> {
    #[error("non-retriable failure after {attempts} attempt(s): {error}")]
    Fatal { error: E, attempts: u32 },

    #[error("retries exhausted after {attempts} attempt(s): {error}")]
    Exhausted { error: E, attempts: u32 },

    #[error("terminated after {attempts} attempt(s)")]
    Terminated { attempts: u32 },
}

impl<E> SupervisorError<E> {
    /// Number of times the work was invoked
    pub fn attempts(&self) -> u32 {
        match self {
            SupervisorError::Fatal { attempts, .. }
            | SupervisorError::Exhausted { attempts, .. }
            | SupervisorError::Terminated { attempts } => *attempts,
        }
    }

    pub fn is_terminated(&self) -> bool {
        matches!(self, SupervisorError::Terminated { .. })
    }

    /// The last failure of the work, if the loop ended on one
    pub fn into_error(self) -> Option<E> {
        match self {
            SupervisorError::Fatal { error, .. } | SupervisorError::Exhausted { error, .. } => {
                Some(error)
            }
            SupervisorError::Terminated { .. } => None,
        }
    }
}

/// Bounded-retry driver
#[derive(Debug, Clone)]
pub struct RetrySupervisor {
    policy: RetryPolicy,
    classifier: FaultClassifier,
    terminator: GracefulTerminator,
}

impl RetrySupervisor {
    pub fn new(policy: RetryPolicy, terminator: GracefulTerminator) -> Self {
        Self {
            policy,
            classifier: FaultClassifier::default(),
            terminator,
        }
    }

    pub fn with_classifier(mut self, classifier: FaultClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn classifier(&self) -> &FaultClassifier {
        &self.classifier
    }

    pub fn terminator(&self) -> &GracefulTerminator {
        &self.terminator
    }

    /// Invoke `work` until it succeeds or the supervisor gives up.
    ///
    /// The termination latch is checked before every invocation and raced
    /// against every backoff sleep. An in-flight invocation is not cancelled.
    pub async fn run<F, Fut, T, E>(&self, mut work: F) -> Result<T, SupervisorError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        let max_retries = self.policy.max_retries();
        let mut attempt: u32 = 0;

        loop {
            if self.terminator.should_terminate() {
                info!(attempts = attempt, "Termination requested, not starting another attempt");
                return Err(SupervisorError::Terminated { attempts: attempt });
            }

            let failure = match work().await {
                Ok(value) => {
                    if attempt > 0 {
                        info!(attempts = attempt + 1, "Succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) => e,
            };
            let attempts = attempt + 1;

            match self.classifier.classify(&failure) {
                FaultClass::NonRetriable => {
                    error!(attempts, error = %failure, "Non-retriable failure, giving up");
                    return Err(SupervisorError::Fatal {
                        error: failure,
                        attempts,
                    });
                }
                FaultClass::Retriable if attempt >= max_retries => {
                    error!(
                        attempts,
                        max_retries,
                        error = %failure,
                        "Transient failure, retries exhausted"
                    );
                    return Err(SupervisorError::Exhausted {
                        error: failure,
                        attempts,
                    });
                }
                FaultClass::Retriable => {}
            }

            let delay = self.policy.backoff_for(attempt);
            warn!(
                attempt = attempts,
                max_retries,
                delay_ms = delay.as_millis() as u64,
                error = %failure,
                "Transient failure, retrying after backoff"
            );

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.terminator.terminated() => {
                    info!(attempts, "Termination requested during backoff");
                    return Err(SupervisorError::Terminated { attempts });
                }
            }

            attempt += 1;
        }
    }
}

/// Run `work` under `policy` with the default classifier and the process-wide terminator
pub async fn run_with_retries<F, Fut, T, E>(
    work: F,
    policy: RetryPolicy,
) -> Result<T, SupervisorError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: fmt::Display,
{
    RetrySupervisor::new(policy, GracefulTerminator::global().clone())
        .run(work)
        .await
}
