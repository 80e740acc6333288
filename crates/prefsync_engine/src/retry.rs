//! Bounded exponential-backoff retry for fallible async operations.

use crate::config::RetryPolicy;
use crate::error::{Disposition, EngineError, EngineResult};
use std::future::Future;
use tracing::debug;

/// Wraps fallible async operations with bounded retry.
///
/// The executor owns no routing logic: failures it will not retry
/// (terminal, rate-limited, offline) are returned to the caller, who
/// decides whether to surface them or park the request in the offline
/// queue.
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    /// Creates an executor with the given policy.
    #[must_use]
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    /// Returns the policy.
    #[must_use]
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Invokes `operation` until it succeeds, a non-retryable failure
    /// occurs, or the attempt limit is reached.
    ///
    /// `operation` receives the 1-indexed attempt number. `classify` maps
    /// each failure to a [`Disposition`]; only `Retryable` failures are
    /// retried, after the policy's backoff delay.
    ///
    /// # Errors
    ///
    /// Returns the last failure once attempts are exhausted, or the first
    /// non-retryable failure.
    pub async fn execute<T, Op, Fut, C>(&self, mut operation: Op, classify: C) -> EngineResult<T>
    where
        Op: FnMut(u32) -> Fut,
        Fut: Future<Output = EngineResult<T>>,
        C: Fn(&EngineError) -> Disposition,
    {
        let mut attempt = 1u32;
        loop {
            match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(error) => {
                    match classify(&error) {
                        Disposition::Retryable if attempt < self.policy.max_attempts => {
                            let delay = self.policy.delay_for_attempt(attempt);
                            debug!(
                                attempt,
                                max_attempts = self.policy.max_attempts,
                                delay_ms = delay.as_millis() as u64,
                                %error,
                                "retrying after backoff"
                            );
                            tokio::time::sleep(delay).await;
                            attempt += 1;
                        }
                        _ => return Err(error),
                    }
                }
            }
        }
    }
}
