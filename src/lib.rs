//! Foreman — a declarative workflow engine for external agents.
//!
//! Executes workflows: DAGs of tasks, each task being one call to a named
//! agent speaking to an external service (a chat/completion endpoint, a
//! JSON-RPC tool server, or an arbitrary HTTP API). Every call runs behind
//! a per-agent resilience pipeline, and every state transition is observable
//! on an event bus.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        Entry Points                          │
//! │        ┌─────────┐                   ┌──────────────┐        │
//! │        │   CLI   │                   │  REST (axum) │        │
//! │        └────┬────┘                   └──────┬───────┘        │
//! └─────────────┼───────────────────────────────┼────────────────┘
//!               ▼                               ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         Scheduler                            │
//! │   readiness ── dispatch ── completion channel ── policy      │
//! │        │                                          │          │
//! │   ┌────┴─────────┐                      ┌─────────┴────┐     │
//! │   │ State machine│──── transitions ────▶│  Event bus   │     │
//! │   └──────────────┘                      └──────────────┘     │
//! └───────────────────────────┬──────────────────────────────────┘
//!                             ▼   per task
//! ┌──────────────────────────────────────────────────────────────┐
//! │                    Resilience pipeline                       │
//! │      breaker gate ─▶ retry loop ─▶ timeout ─▶ invoke_raw     │
//! └───────────────────────────┬──────────────────────────────────┘
//!                             ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │     Agents: chat-completion │ JSON-RPC │ generic HTTP        │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use foreman::agent::AgentFactory;
//! use foreman::engine::Scheduler;
//! use foreman::workflow;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let definition = workflow::load_from_file("workflow.yaml")?;
//!     let scheduler = Scheduler::new(AgentFactory::new());
//!     let report = scheduler.run(&definition).await?;
//!     println!("{}: {}", report.name, report.status);
//!     Ok(())
//! }
//! ```

pub mod agent;
pub mod cli;
pub mod engine;
pub mod error;
pub mod resilience;
pub mod server;
pub mod settings;
pub mod testing;
pub mod workflow;

pub use error::{Error, Result};

/// Re-export commonly used types.
pub mod prelude {
    pub use crate::agent::{AgentFactory, AgentInvoker, AgentResponse, InvokeOutput};
    pub use crate::engine::{
        EventBus, EventKind, Scheduler, TaskRecord, TaskState, WorkflowEvent, WorkflowReport,
        WorkflowState,
    };
    pub use crate::error::{Error, InvokeError, InvokeErrorKind, Result};
    pub use crate::resilience::{CallOptions, CircuitBreaker, ResiliencePipeline};
    pub use crate::workflow::{
        AgentDefinition, AgentKind, FailureStrategy, TaskDefinition, WorkflowDefinition,
    };
}
