//! Error types for Foreman.

use std::time::Duration;

use serde::Serialize;

/// Top-level error type for the engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Invocation error: {0}")]
    Invoke(#[from] InvokeError),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),
}

/// Configuration-related errors.
///
/// These are the only errors surfaced to the caller before a run starts;
/// everything that happens during a run is recorded on the task records
/// instead of propagated.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse configuration: {0}")]
    Parse(String),

    #[error("Unsupported configuration format: {extension} (expected .yaml, .yml or .json)")]
    UnsupportedFormat { extension: String },

    #[error("Duplicate agent name: {name}")]
    DuplicateAgent { name: String },

    #[error("Duplicate task name: {name}")]
    DuplicateTask { name: String },

    #[error("Task '{task}' references undefined agent '{agent}'")]
    UnknownAgent { task: String, agent: String },

    #[error("Task '{task}' depends on undefined task '{dependency}'")]
    UnknownDependency { task: String, dependency: String },

    #[error("Dependency cycle detected involving task '{task}'")]
    DependencyCycle { task: String },

    #[error("Agent '{agent}' has no endpoint (required for {kind} agents)")]
    MissingEndpoint { agent: String, kind: String },

    #[error("No builder registered for custom agent driver '{driver}'")]
    UnknownDriver { driver: String },

    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),
}

/// Errors produced by a single agent invocation.
///
/// The resilience pipeline classifies these into retryable
/// (`Timeout`, `Transport`) and non-retryable (everything else) kinds.
#[derive(Debug, Clone, thiserror::Error)]
pub enum InvokeError {
    #[error("request timed out after {timeout:?}")]
    Timeout { timeout: Duration },

    #[error("transport fault: {reason}")]
    Transport { reason: String },

    #[error("remote rejected the request ({}): {reason}", status_label(.status))]
    Rejected { status: Option<u16>, reason: String },

    #[error("all {attempts} attempts failed, last error: {last}")]
    RetryExhausted { attempts: u32, last: Box<InvokeError> },

    #[error("circuit breaker is open for agent '{agent}'")]
    BreakerOpen { agent: String },

    #[error("invocation cancelled")]
    Cancelled,
}

fn status_label(status: &Option<u16>) -> String {
    match status {
        Some(code) => format!("HTTP {code}"),
        None => "no status".to_string(),
    }
}

/// Coarse classification of an [`InvokeError`], stable across retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InvokeErrorKind {
    Timeout,
    Transport,
    Rejected,
    RetryExhausted,
    BreakerOpen,
    Cancelled,
}

impl InvokeError {
    /// Whether the retry controller may attempt the call again.
    ///
    /// Transport-level faults and timeouts are transient; rejections,
    /// breaker denials and cancellations are not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            InvokeError::Timeout { .. } | InvokeError::Transport { .. }
        )
    }

    pub fn kind(&self) -> InvokeErrorKind {
        match self {
            InvokeError::Timeout { .. } => InvokeErrorKind::Timeout,
            InvokeError::Transport { .. } => InvokeErrorKind::Transport,
            InvokeError::Rejected { .. } => InvokeErrorKind::Rejected,
            InvokeError::RetryExhausted { .. } => InvokeErrorKind::RetryExhausted,
            InvokeError::BreakerOpen { .. } => InvokeErrorKind::BreakerOpen,
            InvokeError::Cancelled => InvokeErrorKind::Cancelled,
        }
    }
}

/// Internal engine invariant violations.
///
/// These indicate a bug in the scheduler rather than a bad workflow or a
/// failing agent, so they propagate instead of being recorded on a task.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Task '{task}' cannot transition from {from} to {to}")]
    InvalidTransition {
        task: String,
        from: &'static str,
        to: &'static str,
    },

    #[error("Unknown task '{name}' in workflow state")]
    UnknownTask { name: String },
}

/// Result type alias for the engine.
pub type Result<T> = std::result::Result<T, Error>;
