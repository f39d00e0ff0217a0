//! Retry with exponential backoff.
//!
//! A failed batch moves through a small state machine:
//!
//! ```text
//! Attempting(0) --ok--> Success
//!      |
//!    error (transient)
//!      v
//! Attempting(n) --wait 2^n * base--> persist again
//!      |                                 |
//!      |  n > max_attempts               ok -> Success
//!      v
//!  Exhausted   (also reached directly on a permanent error)
//! ```
//!
//! With a base delay of 1s the waits before retries 1..=5 are 2s, 4s, 8s,
//! 16s and 32s.
//!
//! The entries of a batch stay pending on the stream while it waits, so
//! [`RetryManager::run_with_keepalive`] runs a hook before every wait that
//! lets the caller keep other consumers from reclaiming them.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::metrics::PipelineMetrics;
use crate::persister::PersistError;

/// Backoff parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries allowed after the initial attempt
    pub max_attempts: u32,
    pub base_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry `attempt` (1-based): `2^attempt * base_delay`, capped.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Sum of every wait a batch can spend in backoff before it is exhausted.
    pub fn total_backoff(&self) -> Duration {
        let mut total = Duration::ZERO;
        for attempt in 1..=self.max_attempts {
            let delay = self.delay_for(attempt);
            if delay >= self.max_delay {
                // Every later wait is capped too.
                let remaining = self.max_attempts - attempt + 1;
                return total.saturating_add(self.max_delay.saturating_mul(remaining));
            }
            total = total.saturating_add(delay);
        }
        total
    }
}

/// How one attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    Succeeded,
    /// Failed, but may succeed if tried again
    Transient,
    /// Failed in a way retrying cannot fix
    Permanent,
}

/// Position of a batch in the retry state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryState {
    /// About to run attempt `n` (0 is the initial, un-delayed attempt)
    Attempting(u32),
    Success,
    Exhausted,
}

impl RetryState {
    /// Transition after the current attempt finished.
    pub fn next(self, outcome: AttemptOutcome, max_attempts: u32) -> RetryState {
        match (self, outcome) {
            (RetryState::Attempting(_), AttemptOutcome::Succeeded) => RetryState::Success,
            (RetryState::Attempting(_), AttemptOutcome::Permanent) => RetryState::Exhausted,
            (RetryState::Attempting(n), AttemptOutcome::Transient) if n + 1 > max_attempts => {
                RetryState::Exhausted
            }
            (RetryState::Attempting(n), AttemptOutcome::Transient) => RetryState::Attempting(n + 1),
            (terminal, _) => terminal,
        }
    }
}

/// Final result of [`RetryManager::run`].
#[derive(Debug)]
pub enum RetryOutcome<T> {
    Succeeded {
        value: T,
        /// Retries needed (0 when the first attempt worked)
        retries: u32,
    },
    Exhausted {
        error: PersistError,
        /// Total attempts made, including the initial one
        attempts: u32,
    },
}

pub struct RetryManager {
    policy: RetryPolicy,
    metrics: Arc<PipelineMetrics>,
}

impl RetryManager {
    pub fn new(policy: RetryPolicy, metrics: Arc<PipelineMetrics>) -> Self {
        Self { policy, metrics }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `operation` until it succeeds, fails permanently, or the retry
    /// budget is spent.
    pub async fn run<F, Fut, T>(&self, operation: F) -> RetryOutcome<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, PersistError>>,
    {
        self.run_with_keepalive(operation, || async {}).await
    }

    /// Like [`run`](Self::run), calling `keepalive` before each backoff wait.
    pub async fn run_with_keepalive<F, Fut, T, K, KFut>(
        &self,
        mut operation: F,
        mut keepalive: K,
    ) -> RetryOutcome<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, PersistError>>,
        K: FnMut() -> KFut,
        KFut: Future<Output = ()>,
    {
        let mut attempt = 0;

        loop {
            if attempt > 0 {
                let delay = self.policy.delay_for(attempt);
                debug!(
                    attempt = attempt,
                    backoff_ms = delay.as_millis() as u64,
                    "Retrying batch after backoff"
                );
                keepalive().await;
                sleep(delay).await;
                self.metrics.record_retry();
            }

            let error = match operation().await {
                Ok(value) => {
                    if attempt > 0 {
                        debug!(retries = attempt, "Batch succeeded after retry");
                    }
                    return RetryOutcome::Succeeded {
                        value,
                        retries: attempt,
                    };
                }
                Err(error) => error,
            };

            let permanent = error.is_permanent();
            let outcome = if permanent {
                AttemptOutcome::Permanent
            } else {
                AttemptOutcome::Transient
            };
            match RetryState::Attempting(attempt).next(outcome, self.policy.max_attempts) {
                RetryState::Attempting(next) => {
                    warn!(
                        attempt = attempt + 1,
                        max_retries = self.policy.max_attempts,
                        error = %error,
                        "Batch failed, will retry"
                    );
                    attempt = next;
                }
                _ => {
                    warn!(
                        attempts = attempt + 1,
                        permanent = permanent,
                        error = %error,
                        "Batch failed, giving up"
                    );
                    return RetryOutcome::Exhausted {
                        error,
                        attempts: attempt + 1,
                    };
                }
            }
        }
    }
}
