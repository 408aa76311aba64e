//! Bounded-attempt retry with exponential backoff and jitter.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::error::InvokeError;
use crate::workflow::RetryPolicy;

/// Progress notifications emitted while a call is being retried.
///
/// The scheduler uses these to drive the RUNNING ↔ RETRYING transitions
/// without workers touching task state themselves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptProgress {
    /// Attempt `attempt` (1-indexed) is about to run.
    Started { attempt: u32 },
    /// The previous attempt failed with a retryable error; the controller is
    /// sleeping `delay` before attempt `next_attempt`.
    BackingOff { next_attempt: u32, delay: Duration },
}

/// Backoff before retrying after attempt `attempt` (1-indexed).
///
/// `min(initial * base^(attempt-1), max_delay)`, multiplied by a uniform
/// factor in [0.5, 1.5] when jitter is enabled.
pub fn backoff_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(63);
    let raw = policy.initial_delay * policy.exponential_base.powi(exponent as i32);
    let capped = raw.min(policy.max_delay);

    let secs = if policy.jitter {
        capped * rand::thread_rng().gen_range(0.5..=1.5)
    } else {
        capped
    };
    Duration::from_secs_f64(secs.max(0.0))
}

/// Executes an operation up to `max_attempts` times.
pub struct RetryController {
    policy: RetryPolicy,
}

impl RetryController {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `op` until it succeeds, fails non-retryably, or attempts run out.
    ///
    /// Non-retryable errors (rejections, cancellations) return immediately.
    /// When all attempts fail retryably, returns `RetryExhausted` carrying
    /// the attempt count and the last cause. The backoff sleep races the
    /// cancellation token, so cancelled tasks stop retrying promptly.
    pub async fn execute<T, Op, Fut>(
        &self,
        cancel: &CancellationToken,
        mut progress: impl FnMut(AttemptProgress),
        mut op: Op,
    ) -> Result<T, InvokeError>
    where
        Op: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, InvokeError>>,
    {
        let max_attempts = self.policy.max_attempts.max(1);

        for attempt in 1..=max_attempts {
            if cancel.is_cancelled() {
                return Err(InvokeError::Cancelled);
            }

            progress(AttemptProgress::Started { attempt });

            let error = match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            if !error.is_retryable() {
                return Err(error);
            }

            if attempt == max_attempts {
                return Err(InvokeError::RetryExhausted {
                    attempts: max_attempts,
                    last: Box::new(error),
                });
            }

            let delay = backoff_delay(&self.policy, attempt);
            tracing::debug!(
                attempt,
                next_attempt = attempt + 1,
                ?delay,
                error = %error,
                "Retryable failure, backing off"
            );
            progress(AttemptProgress::BackingOff {
                next_attempt: attempt + 1,
                delay,
            });

            tokio::select! {
                _ = cancel.cancelled() => return Err(InvokeError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }

        // The loop always returns on the last attempt.
        unreachable!("retry loop exited without a result")
    }
}
