//! The resilience pipeline wrapped around every bare agent invocation.
//!
//! Composition order, outermost first: breaker gate, retry loop, timeout
//! guard, bare invocation. Each attempt's outcome feeds the shared breaker,
//! and the gate is re-checked between attempts so an agent whose breaker
//! opened mid-loop is not called again until it recovers.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use crate::agent::{AgentInvoker, InvokeOutput};
use crate::error::InvokeError;
use crate::resilience::breaker::CircuitBreaker;
use crate::resilience::retry::{AttemptProgress, RetryController};
use crate::workflow::RetryPolicy;

/// Per-call overrides from the task definition. Either field, when present,
/// replaces the agent default wholesale.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    pub timeout: Option<Duration>,
    pub retry: Option<RetryPolicy>,
}

/// Breaker + retry + timeout around one agent's `invoke_raw`.
pub struct ResiliencePipeline {
    agent: String,
    breaker: Arc<CircuitBreaker>,
    default_retry: RetryPolicy,
    default_timeout: Duration,
}

impl ResiliencePipeline {
    pub fn new(
        agent: impl Into<String>,
        breaker: Arc<CircuitBreaker>,
        default_retry: RetryPolicy,
        default_timeout: Duration,
    ) -> Self {
        Self {
            agent: agent.into(),
            breaker,
            default_retry,
            default_timeout,
        }
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Drive one invocation through the full pipeline.
    ///
    /// Never panics on agent failure; every outcome is an `InvokeError`
    /// variant. A denied breaker gate short-circuits with `BreakerOpen`
    /// without consuming any retry attempts. When the breaker opens while
    /// attempts remain, the call stops retrying and reports exhaustion with
    /// the last transport error as the cause.
    pub async fn execute(
        &self,
        invoker: &dyn AgentInvoker,
        action: &str,
        params: &Map<String, Value>,
        options: &CallOptions,
        cancel: &CancellationToken,
        progress: impl FnMut(AttemptProgress),
    ) -> Result<InvokeOutput, InvokeError> {
        if !self.breaker.may_invoke() {
            tracing::debug!(agent = %self.agent, "Breaker open, denying invocation");
            return Err(InvokeError::BreakerOpen {
                agent: self.agent.clone(),
            });
        }

        let timeout = options.timeout.unwrap_or(self.default_timeout);
        let retry = RetryController::new(
            options
                .retry
                .clone()
                .unwrap_or_else(|| self.default_retry.clone()),
        );

        let attempts_done = AtomicU32::new(0);
        let last_transport_error: Mutex<Option<InvokeError>> = Mutex::new(None);

        let outcome = retry
            .execute(cancel, progress, |attempt| {
                let attempts_done = &attempts_done;
                let last_transport_error = &last_transport_error;
                async move {
                    // The initial gate admitted attempt 1; later attempts
                    // must pass the gate again in case the breaker opened.
                    if attempt > 1 && !self.breaker.may_invoke() {
                        return Err(InvokeError::BreakerOpen {
                            agent: self.agent.clone(),
                        });
                    }
                    attempts_done.store(attempt, Ordering::SeqCst);

                    let result = tokio::select! {
                        _ = cancel.cancelled() => Err(InvokeError::Cancelled),
                        result = tokio::time::timeout(timeout, invoker.invoke_raw(action, params)) => {
                            match result {
                                Ok(inner) => inner,
                                Err(_elapsed) => Err(InvokeError::Timeout { timeout }),
                            }
                        }
                    };

                    match &result {
                        Ok(_) => self.breaker.record_success(),
                        // Transport-class faults count toward the breaker.
                        Err(error @ (InvokeError::Timeout { .. } | InvokeError::Transport { .. })) => {
                            self.breaker.record_failure();
                            *last_transport_error
                                .lock()
                                .expect("pipeline lock poisoned") = Some(error.clone());
                        }
                        // A rejection proves the service reachable; treat it
                        // as a breaker success so client mistakes cannot
                        // poison the shared breaker.
                        Err(InvokeError::Rejected { .. }) => self.breaker.record_success(),
                        Err(_) => {}
                    }

                    result
                }
            })
            .await;

        match outcome {
            // The breaker opened between attempts: the call is spent, and the
            // cause the caller cares about is the failure that opened it.
            Err(InvokeError::BreakerOpen { agent }) => {
                let last = last_transport_error
                    .lock()
                    .expect("pipeline lock poisoned")
                    .take();
                match last {
                    Some(last) => Err(InvokeError::RetryExhausted {
                        attempts: attempts_done.load(Ordering::SeqCst),
                        last: Box::new(last),
                    }),
                    None => Err(InvokeError::BreakerOpen { agent }),
                }
            }
            other => other,
        }
    }
}
