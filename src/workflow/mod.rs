//! Workflow document model: agents, tasks, and the policies around them.

mod definition;
mod loader;

pub use definition::{
    AgentDefinition, AgentKind, AuthScheme, BreakerPolicy, FailureStrategy, RetryPolicy,
    TaskDefinition, WorkflowDefinition,
};
pub use loader::{load_from_file, load_from_yaml, validate};
