//! Fault handling around external calls: circuit breaker, bounded retry
//! with exponential backoff, and deadline enforcement, composed into one
//! pipeline per agent.

mod breaker;
mod pipeline;
mod retry;

pub use breaker::{BreakerListener, BreakerState, BreakerTransition, CircuitBreaker};
pub use pipeline::{CallOptions, ResiliencePipeline};
pub use retry::{backoff_delay, AttemptProgress, RetryController};
