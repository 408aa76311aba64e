//! Workflow execution: scheduler, state machine, and event bus.

mod events;
mod scheduler;
mod state;

pub use events::{EventBus, EventKind, WorkflowEvent, DEFAULT_SUBSCRIBER_CAPACITY};
pub use scheduler::Scheduler;
pub use state::{StateMachine, TaskError, TaskRecord, TaskState, WorkflowReport, WorkflowState};
