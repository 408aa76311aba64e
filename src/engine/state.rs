//! Task and workflow run-state, and the transitions between them.
//!
//! All mutation goes through [`StateMachine`], which enforces the legal
//! transition table and publishes an event for every change. Workers never
//! touch this type; the scheduler owns it for the whole run.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::engine::events::{EventBus, EventKind, WorkflowEvent};
use crate::error::{EngineError, InvokeError, InvokeErrorKind};
use crate::workflow::{FailureStrategy, WorkflowDefinition};

/// Per-task lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Ready,
    Running,
    Retrying,
    Completed,
    Failed,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Ready => "ready",
            TaskState::Running => "running",
            TaskState::Retrying => "retrying",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
            TaskState::Cancelled => "cancelled",
        }
    }
}

/// Workflow-level lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowState {
    Pending,
    Running,
    Completed,
    PartiallyCompleted,
    Failed,
    Cancelled,
}

impl WorkflowState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, WorkflowState::Pending | WorkflowState::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowState::Pending => "pending",
            WorkflowState::Running => "running",
            WorkflowState::Completed => "completed",
            WorkflowState::PartiallyCompleted => "partially_completed",
            WorkflowState::Failed => "failed",
            WorkflowState::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal error recorded on a failed task.
#[derive(Debug, Clone, Serialize)]
pub struct TaskError {
    pub kind: InvokeErrorKind,
    pub message: String,
}

impl From<&InvokeError> for TaskError {
    fn from(error: &InvokeError) -> Self {
        Self {
            kind: error.kind(),
            message: error.to_string(),
        }
    }
}

/// Mutable run-state of one task.
#[derive(Debug, Clone, Serialize)]
pub struct TaskRecord {
    pub name: String,
    pub agent: String,
    pub action: String,
    pub state: TaskState,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskError>,
}

/// Immutable result of a finished run, handed back to the caller.
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowReport {
    pub workflow_id: Uuid,
    pub name: String,
    pub status: WorkflowState,
    pub completed_tasks: usize,
    pub failed_tasks: usize,
    pub cancelled_tasks: usize,
    pub total_tasks: usize,
    pub elapsed_secs: f64,
    /// Payloads of completed tasks, keyed by task name.
    pub results: BTreeMap<String, Value>,
    /// Error messages of failed tasks, keyed by task name.
    pub errors: BTreeMap<String, String>,
    pub tasks: Vec<TaskRecord>,
}

/// Owns every task record for one run and enforces the transition table.
pub struct StateMachine {
    workflow_id: Uuid,
    name: String,
    state: WorkflowState,
    started_at: Option<DateTime<Utc>>,
    records: Vec<TaskRecord>,
    index: HashMap<String, usize>,
    /// task → its dependencies
    dependencies: HashMap<String, Vec<String>>,
    /// task → tasks that depend on it
    dependents: HashMap<String, Vec<String>>,
    /// Tasks whose failure dependents are allowed to proceed past.
    tolerated_failures: HashSet<String>,
    bus: Arc<EventBus>,
}

impl StateMachine {
    pub fn new(definition: &WorkflowDefinition, workflow_id: Uuid, bus: Arc<EventBus>) -> Self {
        let records: Vec<TaskRecord> = definition
            .tasks
            .iter()
            .map(|task| TaskRecord {
                name: task.name.clone(),
                agent: task.agent.clone(),
                action: task.action.clone(),
                state: TaskState::Pending,
                attempts: 0,
                started_at: None,
                finished_at: None,
                result: None,
                error: None,
            })
            .collect();

        let index = records
            .iter()
            .enumerate()
            .map(|(i, r)| (r.name.clone(), i))
            .collect();

        let mut dependencies: HashMap<String, Vec<String>> = HashMap::new();
        let mut dependents: HashMap<String, Vec<String>> = HashMap::new();
        for task in &definition.tasks {
            dependencies.insert(task.name.clone(), task.depends_on.clone());
            for dep in &task.depends_on {
                dependents
                    .entry(dep.clone())
                    .or_default()
                    .push(task.name.clone());
            }
        }

        let tolerated_failures = definition
            .tasks
            .iter()
            .filter(|t| t.continue_on_failure)
            .map(|t| t.name.clone())
            .collect();

        Self {
            workflow_id,
            name: definition.name.clone(),
            state: WorkflowState::Pending,
            started_at: None,
            records,
            index,
            dependencies,
            dependents,
            tolerated_failures,
            bus,
        }
    }

    pub fn workflow_id(&self) -> Uuid {
        self.workflow_id
    }

    pub fn state(&self) -> WorkflowState {
        self.state
    }

    pub fn record(&self, name: &str) -> Option<&TaskRecord> {
        self.index.get(name).map(|&i| &self.records[i])
    }

    pub fn records(&self) -> &[TaskRecord] {
        &self.records
    }

    /// Mark the workflow running and announce it.
    pub fn start(&mut self, parallel: bool) {
        self.state = WorkflowState::Running;
        self.started_at = Some(Utc::now());
        self.bus.publish(
            WorkflowEvent::new(EventKind::WorkflowStarted, self.workflow_id).with_payload(json!({
                "name": self.name,
                "total_tasks": self.records.len(),
                "parallel_execution": parallel,
            })),
        );
    }

    /// Names of PENDING tasks whose dependencies are all satisfied, in
    /// declaration order.
    ///
    /// A dependency is satisfied when it is COMPLETED, or when it FAILED and
    /// carries `continue_on_failure` (its dependents proceed and observe a
    /// missing result).
    pub fn ready_tasks(&self) -> Vec<String> {
        self.records
            .iter()
            .filter(|record| record.state == TaskState::Pending)
            .filter(|record| {
                self.dependencies
                    .get(&record.name)
                    .map(|deps| deps.iter().all(|dep| self.dependency_satisfied(dep)))
                    .unwrap_or(true)
            })
            .map(|record| record.name.clone())
            .collect()
    }

    fn dependency_satisfied(&self, dep: &str) -> bool {
        match self.record(dep).map(|r| r.state) {
            Some(TaskState::Completed) => true,
            Some(TaskState::Failed) => self.tolerated_failures.contains(dep),
            _ => false,
        }
    }

    pub fn all_terminal(&self) -> bool {
        self.records.iter().all(|r| r.state.is_terminal())
    }

    /// (completed, failed, cancelled)
    pub fn counts(&self) -> (usize, usize, usize) {
        let mut counts = (0, 0, 0);
        for record in &self.records {
            match record.state {
                TaskState::Completed => counts.0 += 1,
                TaskState::Failed => counts.1 += 1,
                TaskState::Cancelled => counts.2 += 1,
                _ => {}
            }
        }
        counts
    }

    pub fn mark_ready(&mut self, name: &str) -> Result<(), EngineError> {
        self.transition(name, TaskState::Ready)?;
        self.publish_task(EventKind::TaskReady, name, json!({ "new_state": "ready" }));
        Ok(())
    }

    pub fn start_task(&mut self, name: &str) -> Result<(), EngineError> {
        let old = self.transition(name, TaskState::Running)?;
        let idx = self.index[name];
        self.records[idx].attempts = 1;
        self.records[idx].started_at = Some(Utc::now());
        self.publish_task(
            EventKind::TaskStarted,
            name,
            json!({ "old_state": old.as_str(), "new_state": "running", "attempt": 1 }),
        );
        Ok(())
    }

    /// The task's retry controller is sleeping before another attempt.
    pub fn task_backing_off(
        &mut self,
        name: &str,
        next_attempt: u32,
        delay: Duration,
    ) -> Result<(), EngineError> {
        self.transition(name, TaskState::Retrying)?;
        self.publish_task(
            EventKind::TaskRetrying,
            name,
            json!({
                "old_state": "running",
                "new_state": "retrying",
                "next_attempt": next_attempt,
                "delay_ms": delay.as_millis() as u64,
            }),
        );
        Ok(())
    }

    /// Backoff elapsed; attempt `attempt` is running.
    pub fn task_resumed(&mut self, name: &str, attempt: u32) -> Result<(), EngineError> {
        self.transition(name, TaskState::Running)?;
        let idx = self.index[name];
        self.records[idx].attempts = attempt;
        self.publish_task(
            EventKind::TaskStarted,
            name,
            json!({ "old_state": "retrying", "new_state": "running", "attempt": attempt }),
        );
        Ok(())
    }

    pub fn complete_task(&mut self, name: &str, result: Value) -> Result<(), EngineError> {
        self.transition(name, TaskState::Completed)?;
        let idx = self.index[name];
        self.records[idx].finished_at = Some(Utc::now());
        self.records[idx].result = Some(result.clone());
        self.publish_task(
            EventKind::TaskCompleted,
            name,
            json!({ "old_state": "running", "new_state": "completed", "result": result }),
        );
        Ok(())
    }

    pub fn fail_task(&mut self, name: &str, error: TaskError) -> Result<(), EngineError> {
        self.transition(name, TaskState::Failed)?;
        let idx = self.index[name];
        self.records[idx].finished_at = Some(Utc::now());
        self.records[idx].error = Some(error.clone());
        self.publish_task(
            EventKind::TaskFailed,
            name,
            json!({
                "old_state": "running",
                "new_state": "failed",
                "error": error.message,
                "error_kind": error.kind,
            }),
        );
        Ok(())
    }

    /// Cancel one task if it is not already terminal. Returns whether a
    /// transition happened.
    pub fn cancel_task(&mut self, name: &str, reason: &str) -> Result<bool, EngineError> {
        let idx = *self
            .index
            .get(name)
            .ok_or_else(|| EngineError::UnknownTask {
                name: name.to_string(),
            })?;
        if self.records[idx].state.is_terminal() {
            return Ok(false);
        }

        let old = self.transition(name, TaskState::Cancelled)?;
        let idx = self.index[name];
        self.records[idx].finished_at = Some(Utc::now());
        self.publish_task(
            EventKind::TaskCancelled,
            name,
            json!({ "old_state": old.as_str(), "new_state": "cancelled", "reason": reason }),
        );
        Ok(true)
    }

    /// Cancel all direct and transitive dependents of `name` that have not
    /// started (PENDING/READY). Used by the continue-on-failure strategies.
    pub fn cancel_dependents(&mut self, name: &str) -> Result<Vec<String>, EngineError> {
        let mut cancelled = Vec::new();
        let mut queue: VecDeque<String> = self
            .dependents
            .get(name)
            .cloned()
            .unwrap_or_default()
            .into();
        let mut seen: HashSet<String> = HashSet::new();

        while let Some(dependent) = queue.pop_front() {
            if !seen.insert(dependent.clone()) {
                continue;
            }
            let state = self
                .record(&dependent)
                .map(|r| r.state)
                .ok_or_else(|| EngineError::UnknownTask {
                    name: dependent.clone(),
                })?;
            if matches!(state, TaskState::Pending | TaskState::Ready)
                && self.cancel_task(&dependent, &format!("upstream task '{name}' failed"))?
            {
                cancelled.push(dependent.clone());
            }
            if let Some(next) = self.dependents.get(&dependent) {
                queue.extend(next.iter().cloned());
            }
        }
        Ok(cancelled)
    }

    /// Cancel every task that has not been dispatched yet.
    pub fn cancel_undispatched(&mut self, reason: &str) -> Result<(), EngineError> {
        let names: Vec<String> = self
            .records
            .iter()
            .filter(|r| matches!(r.state, TaskState::Pending | TaskState::Ready))
            .map(|r| r.name.clone())
            .collect();
        for name in names {
            self.cancel_task(&name, reason)?;
        }
        Ok(())
    }

    /// Compute and record the workflow's terminal state, announce it, and
    /// freeze the records into a report.
    pub fn finish(
        mut self,
        strategy: FailureStrategy,
        cancel_requested: bool,
        deadline_hit: bool,
        elapsed: Duration,
    ) -> WorkflowReport {
        let (completed, failed, cancelled) = self.counts();

        let status = if cancel_requested {
            WorkflowState::Cancelled
        } else if deadline_hit {
            WorkflowState::Failed
        } else if failed == 0 && cancelled == 0 {
            WorkflowState::Completed
        } else if failed > 0
            && completed > 0
            && strategy == FailureStrategy::PartialCompletionAllowed
        {
            WorkflowState::PartiallyCompleted
        } else {
            WorkflowState::Failed
        };
        self.state = status;

        let kind = match status {
            WorkflowState::Completed | WorkflowState::PartiallyCompleted => {
                EventKind::WorkflowCompleted
            }
            _ => EventKind::WorkflowFailed,
        };
        self.bus.publish(
            WorkflowEvent::new(kind, self.workflow_id).with_payload(json!({
                "status": status.as_str(),
                "completed_tasks": completed,
                "failed_tasks": failed,
                "cancelled_tasks": cancelled,
                "total_tasks": self.records.len(),
            })),
        );

        let results = self
            .records
            .iter()
            .filter(|r| r.state == TaskState::Completed)
            .filter_map(|r| r.result.clone().map(|v| (r.name.clone(), v)))
            .collect();
        let errors = self
            .records
            .iter()
            .filter(|r| r.state == TaskState::Failed)
            .filter_map(|r| {
                r.error
                    .as_ref()
                    .map(|e| (r.name.clone(), e.message.clone()))
            })
            .collect();

        WorkflowReport {
            workflow_id: self.workflow_id,
            name: self.name,
            status,
            completed_tasks: completed,
            failed_tasks: failed,
            cancelled_tasks: cancelled,
            total_tasks: self.records.len(),
            elapsed_secs: elapsed.as_secs_f64(),
            results,
            errors,
            tasks: self.records,
        }
    }

    /// Apply one transition, enforcing the legal table. Returns the previous
    /// state.
    fn transition(&mut self, name: &str, to: TaskState) -> Result<TaskState, EngineError> {
        let idx = *self
            .index
            .get(name)
            .ok_or_else(|| EngineError::UnknownTask {
                name: name.to_string(),
            })?;
        let from = self.records[idx].state;

        use TaskState::*;
        let legal = matches!(
            (from, to),
            (Pending, Ready)
                | (Ready, Running)
                | (Running, Completed)
                | (Running, Retrying)
                | (Running, Failed)
                | (Retrying, Running)
                // any non-terminal state can be cancelled
                | (Pending, Cancelled)
                | (Ready, Cancelled)
                | (Running, Cancelled)
                | (Retrying, Cancelled)
        );
        if !legal {
            return Err(EngineError::InvalidTransition {
                task: name.to_string(),
                from: from.as_str(),
                to: to.as_str(),
            });
        }

        self.records[idx].state = to;
        Ok(from)
    }

    fn publish_task(&self, kind: EventKind, task: &str, payload: Value) {
        self.bus
            .publish(WorkflowEvent::for_task(kind, self.workflow_id, task).with_payload(payload));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::load_from_yaml;

    fn machine(yaml: &str) -> StateMachine {
        let definition = load_from_yaml(yaml).unwrap();
        StateMachine::new(&definition, Uuid::new_v4(), Arc::new(EventBus::new()))
    }

    fn diamond() -> StateMachine {
        machine(
            r#"
name: diamond
agents:
  - name: api
    type: generic_http
    endpoint: "http://localhost:9000"
tasks:
  - name: root
    agent: api
    action: get
  - name: left
    agent: api
    action: get
    depends_on: [root]
  - name: right
    agent: api
    action: get
    depends_on: [root]
  - name: join
    agent: api
    action: get
    depends_on: [left, right]
"#,
        )
    }

    #[test]
    fn readiness_follows_dependencies() {
        let mut machine = diamond();
        assert_eq!(machine.ready_tasks(), vec!["root"]);

        machine.mark_ready("root").unwrap();
        machine.start_task("root").unwrap();
        machine.complete_task("root", json!({"ok": true})).unwrap();

        assert_eq!(machine.ready_tasks(), vec!["left", "right"]);

        for name in ["left", "right"] {
            machine.mark_ready(name).unwrap();
            machine.start_task(name).unwrap();
            machine.complete_task(name, Value::Null).unwrap();
        }
        assert_eq!(machine.ready_tasks(), vec!["join"]);
    }

    #[test]
    fn happy_path_transitions() {
        let mut machine = diamond();
        machine.start(false);
        machine.mark_ready("root").unwrap();
        machine.start_task("root").unwrap();
        machine.task_backing_off("root", 2, Duration::from_millis(10)).unwrap();
        machine.task_resumed("root", 2).unwrap();
        machine.complete_task("root", json!("done")).unwrap();

        let record = machine.record("root").unwrap();
        assert_eq!(record.state, TaskState::Completed);
        assert_eq!(record.attempts, 2);
        assert!(record.started_at.is_some());
        assert!(record.finished_at.is_some());
        assert_eq!(record.result, Some(json!("done")));
    }

    #[test]
    fn illegal_transitions_are_rejected() {
        let mut machine = diamond();

        // Pending → Running skips Ready.
        let err = machine.start_task("root").unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition { .. }));

        // Completed is terminal; nothing moves out of it.
        machine.mark_ready("root").unwrap();
        machine.start_task("root").unwrap();
        machine.complete_task("root", Value::Null).unwrap();
        let err = machine.fail_task(
            "root",
            TaskError {
                kind: InvokeErrorKind::Transport,
                message: "late".into(),
            },
        );
        assert!(err.is_err());

        // Cancelling a terminal task is a silent no-op, not an error.
        assert!(!machine.cancel_task("root", "too late").unwrap());
    }

    #[test]
    fn dependent_cancellation_is_transitive() {
        let mut machine = diamond();
        machine.mark_ready("root").unwrap();
        machine.start_task("root").unwrap();
        machine
            .fail_task(
                "root",
                TaskError {
                    kind: InvokeErrorKind::RetryExhausted,
                    message: "gave up".into(),
                },
            )
            .unwrap();

        let mut cancelled = machine.cancel_dependents("root").unwrap();
        cancelled.sort();
        assert_eq!(cancelled, vec!["join", "left", "right"]);
        assert_eq!(machine.record("join").unwrap().state, TaskState::Cancelled);
        assert!(machine.all_terminal());
        assert_eq!(machine.counts(), (0, 1, 3));
    }

    #[test]
    fn finish_status_matrix() {
        // All completed → COMPLETED.
        let mut m = diamond();
        for name in ["root", "left", "right", "join"] {
            m.mark_ready(name).unwrap();
            m.start_task(name).unwrap();
            m.complete_task(name, Value::Null).unwrap();
        }
        let report = m.finish(
            FailureStrategy::StopOnFirstFailure,
            false,
            false,
            Duration::from_secs(1),
        );
        assert_eq!(report.status, WorkflowState::Completed);
        assert_eq!(report.completed_tasks, 4);

        // Mixed results under partial completion → PARTIALLY_COMPLETED.
        let mut m = diamond();
        m.mark_ready("root").unwrap();
        m.start_task("root").unwrap();
        m.complete_task("root", json!(1)).unwrap();
        m.mark_ready("left").unwrap();
        m.start_task("left").unwrap();
        m.fail_task(
            "left",
            TaskError {
                kind: InvokeErrorKind::RetryExhausted,
                message: "boom".into(),
            },
        )
        .unwrap();
        m.cancel_dependents("left").unwrap();
        m.mark_ready("right").unwrap();
        m.start_task("right").unwrap();
        m.complete_task("right", json!(2)).unwrap();
        let report = m.finish(
            FailureStrategy::PartialCompletionAllowed,
            false,
            false,
            Duration::from_secs(1),
        );
        assert_eq!(report.status, WorkflowState::PartiallyCompleted);
        assert_eq!(report.results.len(), 2);
        assert_eq!(report.errors["left"], "boom");

        // Same outcome under continue_on_failure → FAILED.
        let mut m = diamond();
        m.mark_ready("root").unwrap();
        m.start_task("root").unwrap();
        m.fail_task(
            "root",
            TaskError {
                kind: InvokeErrorKind::Transport,
                message: "down".into(),
            },
        )
        .unwrap();
        m.cancel_dependents("root").unwrap();
        let report = m.finish(
            FailureStrategy::ContinueOnFailure,
            false,
            false,
            Duration::from_secs(1),
        );
        assert_eq!(report.status, WorkflowState::Failed);

        // Explicit cancellation wins.
        let mut m = diamond();
        m.cancel_undispatched("operator request").unwrap();
        let report = m.finish(
            FailureStrategy::StopOnFirstFailure,
            true,
            false,
            Duration::from_secs(1),
        );
        assert_eq!(report.status, WorkflowState::Cancelled);
    }

    #[test]
    fn terminal_counts_always_add_up() {
        let mut m = diamond();
        m.mark_ready("root").unwrap();
        m.start_task("root").unwrap();
        m.fail_task(
            "root",
            TaskError {
                kind: InvokeErrorKind::Timeout,
                message: "slow".into(),
            },
        )
        .unwrap();
        m.cancel_dependents("root").unwrap();
        assert!(m.all_terminal());

        let (completed, failed, cancelled) = m.counts();
        assert_eq!(completed + failed + cancelled, m.records().len());
    }

    #[test]
    fn events_are_published_for_transitions() {
        let definition = load_from_yaml(
            r#"
name: tiny
agents:
  - name: api
    type: generic_http
    endpoint: "http://localhost:9000"
tasks:
  - name: only
    agent: api
    action: get
"#,
        )
        .unwrap();
        let bus = Arc::new(EventBus::new());
        let mut rx = bus.subscribe();
        let mut machine = StateMachine::new(&definition, Uuid::new_v4(), bus);

        machine.start(true);
        machine.mark_ready("only").unwrap();
        machine.start_task("only").unwrap();
        machine.complete_task("only", json!(1)).unwrap();
        let _ = machine.finish(
            FailureStrategy::StopOnFirstFailure,
            false,
            false,
            Duration::from_secs(1),
        );

        let kinds: Vec<EventKind> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|e| e.kind)
            .collect();
        assert_eq!(
            kinds,
            vec![
                EventKind::WorkflowStarted,
                EventKind::TaskReady,
                EventKind::TaskStarted,
                EventKind::TaskCompleted,
                EventKind::WorkflowCompleted,
            ]
        );
    }
}
