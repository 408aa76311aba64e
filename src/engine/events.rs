//! Workflow event bus.
//!
//! Observers subscribe and receive every state transition as a value
//! message over a bounded queue. Publishing never blocks the scheduler: a
//! full subscriber queue drops the event for that subscriber with a logged
//! warning, and delivery order to each subscriber matches publish order.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Everything that can happen during a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    WorkflowStarted,
    WorkflowCompleted,
    WorkflowFailed,
    TaskReady,
    TaskStarted,
    TaskRetrying,
    TaskCompleted,
    TaskFailed,
    TaskCancelled,
    BreakerOpened,
    BreakerHalfOpen,
    BreakerClosed,
}

/// One state transition, as delivered to observers.
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowEvent {
    #[serde(rename = "event_type")]
    pub kind: EventKind,
    pub workflow_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_name: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub payload: Value,
}

impl WorkflowEvent {
    pub fn new(kind: EventKind, workflow_id: Uuid) -> Self {
        Self {
            kind,
            workflow_id,
            task_name: None,
            timestamp: Utc::now(),
            payload: Value::Null,
        }
    }

    pub fn for_task(kind: EventKind, workflow_id: Uuid, task: impl Into<String>) -> Self {
        Self {
            task_name: Some(task.into()),
            ..Self::new(kind, workflow_id)
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }
}

struct Subscriber {
    tx: mpsc::Sender<WorkflowEvent>,
}

/// Fan-out of [`WorkflowEvent`]s to subscribed observers.
///
/// One bus per engine; subscribers registered before a run see all of its
/// events, in publish order.
pub struct EventBus {
    subscribers: Mutex<Vec<Subscriber>>,
}

/// Queue capacity used by [`EventBus::subscribe`].
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 256;

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Register an observer with the default queue capacity.
    pub fn subscribe(&self) -> mpsc::Receiver<WorkflowEvent> {
        self.subscribe_with_capacity(DEFAULT_SUBSCRIBER_CAPACITY)
    }

    /// Register an observer with an explicit queue capacity.
    pub fn subscribe_with_capacity(&self, capacity: usize) -> mpsc::Receiver<WorkflowEvent> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        self.subscribers
            .lock()
            .expect("event bus lock poisoned")
            .push(Subscriber { tx });
        rx
    }

    /// Deliver an event to every subscriber, in registration order.
    ///
    /// Never blocks: a full queue drops this event for that subscriber, and
    /// a closed receiver unsubscribes it.
    pub fn publish(&self, event: WorkflowEvent) {
        let mut subscribers = self.subscribers.lock().expect("event bus lock poisoned");
        subscribers.retain(|subscriber| match subscriber.tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(dropped)) => {
                tracing::warn!(
                    kind = ?dropped.kind,
                    task = dropped.task_name.as_deref().unwrap_or("-"),
                    "Subscriber queue full, dropping event"
                );
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .expect("event bus lock poisoned")
            .len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
