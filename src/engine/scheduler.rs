//! The workflow scheduler.
//!
//! Owns the state machine for one run. Task invocations execute as spawned
//! workers that report attempt progress and terminal outcomes back over a
//! single completion channel; all state mutation happens here, in the
//! scheduler's own control flow.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::agent::{AgentFactory, AgentHandle, InvokeOutput};
use crate::engine::events::{EventBus, EventKind, WorkflowEvent};
use crate::engine::state::{StateMachine, TaskError, WorkflowReport};
use crate::error::{Error, InvokeError};
use crate::resilience::{AttemptProgress, BreakerTransition, CallOptions};
use crate::workflow::{self, FailureStrategy, WorkflowDefinition};

/// What a worker sends back over the completion channel.
enum WorkerMessage {
    Progress {
        task: String,
        progress: AttemptProgress,
    },
    Done {
        task: String,
        outcome: Result<InvokeOutput, InvokeError>,
    },
}

/// Drives one workflow at a time to a terminal state.
///
/// `run` blocks until the workflow is terminal and never propagates agent
/// failures; every task outcome lands on the returned report. The only
/// up-front error is an invalid configuration.
pub struct Scheduler {
    factory: AgentFactory,
    bus: Arc<EventBus>,
}

impl Scheduler {
    pub fn new(factory: AgentFactory) -> Self {
        Self {
            factory,
            bus: Arc::new(EventBus::new()),
        }
    }

    /// The event bus for this scheduler. Subscribe before calling `run` to
    /// observe every transition of the run.
    pub fn events(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Run a workflow to completion.
    pub async fn run(&self, definition: &WorkflowDefinition) -> Result<WorkflowReport, Error> {
        self.run_with_cancel(definition, CancellationToken::new())
            .await
    }

    /// Run a workflow to completion, stopping early if `cancel` fires.
    pub async fn run_with_cancel(
        &self,
        definition: &WorkflowDefinition,
        cancel: CancellationToken,
    ) -> Result<WorkflowReport, Error> {
        workflow::validate(definition)?;

        let workflow_id = Uuid::new_v4();
        let agents = self.build_agents(definition, workflow_id)?;
        let started = Instant::now();

        let mut machine = StateMachine::new(definition, workflow_id, self.bus.clone());
        machine.start(definition.parallel_execution);

        tracing::info!(
            workflow = %definition.name,
            %workflow_id,
            tasks = definition.tasks.len(),
            parallel = definition.parallel_execution,
            strategy = %definition.failure_strategy,
            "Starting workflow"
        );

        let call_options: HashMap<String, CallOptions> = definition
            .tasks
            .iter()
            .map(|task| {
                (
                    task.name.clone(),
                    CallOptions {
                        timeout: task.timeout(),
                        retry: task.retry.clone(),
                    },
                )
            })
            .collect();
        let continue_flags: HashMap<String, bool> = definition
            .tasks
            .iter()
            .map(|task| (task.name.clone(), task.continue_on_failure))
            .collect();
        let task_inputs: HashMap<String, (String, Map<String, Value>)> = definition
            .tasks
            .iter()
            .map(|task| {
                (
                    task.name.clone(),
                    (task.action.clone(), task.parameters.clone()),
                )
            })
            .collect();

        let (tx, mut rx) = mpsc::unbounded_channel::<WorkerMessage>();
        // Cancels in-flight workers without implying the caller asked to stop.
        let workers_cancel = CancellationToken::new();

        let has_deadline = definition.global_timeout().is_some();
        let deadline_at = tokio::time::Instant::now()
            + definition
                .global_timeout()
                .unwrap_or(Duration::from_secs(86_400 * 365));

        let mut in_flight: usize = 0;
        let mut cancel_requested = cancel.is_cancelled();
        let mut deadline_hit = false;
        let mut stop_dispatch = cancel_requested;

        loop {
            if machine.all_terminal() {
                break;
            }

            if stop_dispatch {
                machine.cancel_undispatched(if cancel_requested {
                    "workflow cancelled"
                } else {
                    "workflow stopped"
                })?;
                break;
            }

            let ready = machine.ready_tasks();
            if ready.is_empty() {
                // Remaining tasks are unreachable behind failed dependencies.
                machine.cancel_undispatched("unreachable due to upstream failures")?;
                break;
            }

            let batch: Vec<String> = if definition.parallel_execution {
                ready
            } else {
                ready.into_iter().take(1).collect()
            };

            for name in batch {
                machine.mark_ready(&name)?;
                machine.start_task(&name)?;

                let record = machine
                    .record(&name)
                    .expect("dispatched task must have a record");
                let handle = agents
                    .get(&record.agent)
                    .expect("validated agent must exist")
                    .clone();
                let (action, params) = task_inputs
                    .get(&name)
                    .cloned()
                    .expect("dispatched task must have inputs");
                let options = call_options
                    .get(&name)
                    .cloned()
                    .expect("dispatched task must have options");

                spawn_worker(
                    name,
                    handle,
                    action,
                    params,
                    options,
                    workers_cancel.clone(),
                    tx.clone(),
                );
                in_flight += 1;
            }

            // Wait for the whole batch to reach terminal states before
            // computing readiness again.
            while in_flight > 0 {
                tokio::select! {
                    biased;

                    _ = cancel.cancelled(), if !cancel_requested => {
                        tracing::info!(%workflow_id, "Cancellation requested, stopping workers");
                        cancel_requested = true;
                        stop_dispatch = true;
                        workers_cancel.cancel();
                        machine.cancel_undispatched("workflow cancelled")?;
                    }

                    _ = tokio::time::sleep_until(deadline_at), if has_deadline && !deadline_hit => {
                        tracing::warn!(%workflow_id, "Global deadline exceeded, stopping workers");
                        deadline_hit = true;
                        stop_dispatch = true;
                        workers_cancel.cancel();
                        machine.cancel_undispatched("global deadline exceeded")?;
                    }

                    message = rx.recv() => {
                        let Some(message) = message else { break };
                        match message {
                            WorkerMessage::Progress { task, progress } => match progress {
                                AttemptProgress::Started { attempt } if attempt > 1 => {
                                    machine.task_resumed(&task, attempt)?;
                                }
                                AttemptProgress::Started { .. } => {
                                    // First attempt; the dispatch already moved
                                    // the task to RUNNING.
                                }
                                AttemptProgress::BackingOff { next_attempt, delay } => {
                                    machine.task_backing_off(&task, next_attempt, delay)?;
                                }
                            },
                            WorkerMessage::Done { task, outcome } => {
                                in_flight -= 1;
                                self.settle_task(
                                    &mut machine,
                                    definition.failure_strategy,
                                    &continue_flags,
                                    &workers_cancel,
                                    &mut stop_dispatch,
                                    &task,
                                    outcome,
                                )?;
                            }
                        }
                    }
                }
            }
        }

        let report = machine.finish(
            definition.failure_strategy,
            cancel_requested,
            deadline_hit,
            started.elapsed(),
        );
        tracing::info!(
            %workflow_id,
            status = %report.status,
            completed = report.completed_tasks,
            failed = report.failed_tasks,
            cancelled = report.cancelled_tasks,
            "Workflow finished"
        );
        Ok(report)
    }

    /// Record a terminal worker outcome and apply the failure strategy.
    #[allow(clippy::too_many_arguments)]
    fn settle_task(
        &self,
        machine: &mut StateMachine,
        strategy: FailureStrategy,
        continue_flags: &HashMap<String, bool>,
        workers_cancel: &CancellationToken,
        stop_dispatch: &mut bool,
        task: &str,
        outcome: Result<InvokeOutput, InvokeError>,
    ) -> Result<(), Error> {
        match outcome {
            Ok(output) => {
                machine.complete_task(task, output.payload)?;
            }
            Err(InvokeError::Cancelled) => {
                machine.cancel_task(task, "cancelled while in flight")?;
            }
            Err(error) => {
                tracing::warn!(task, error = %error, "Task failed");
                machine.fail_task(task, TaskError::from(&error))?;

                // A task that opted into continue_on_failure neither stops
                // the workflow nor cancels its dependents.
                if continue_flags.get(task).copied().unwrap_or(false) {
                    return Ok(());
                }

                match strategy {
                    FailureStrategy::StopOnFirstFailure => {
                        *stop_dispatch = true;
                        workers_cancel.cancel();
                        machine.cancel_undispatched("stopping after first failure")?;
                    }
                    FailureStrategy::ContinueOnFailure
                    | FailureStrategy::PartialCompletionAllowed => {
                        let cancelled = machine.cancel_dependents(task)?;
                        if !cancelled.is_empty() {
                            tracing::debug!(
                                task,
                                dependents = ?cancelled,
                                "Cancelled dependents of failed task"
                            );
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Instantiate one agent handle per declaration, each with a breaker
    /// listener that publishes `breaker_*` events on this run's bus.
    fn build_agents(
        &self,
        definition: &WorkflowDefinition,
        workflow_id: Uuid,
    ) -> Result<HashMap<String, Arc<AgentHandle>>, Error> {
        let mut agents = HashMap::new();
        for agent_def in &definition.agents {
            let bus = self.bus.clone();
            let agent_name = agent_def.name.clone();
            let listener = Box::new(move |transition: BreakerTransition| {
                let kind = match transition {
                    BreakerTransition::Opened => EventKind::BreakerOpened,
                    BreakerTransition::HalfOpened => EventKind::BreakerHalfOpen,
                    BreakerTransition::Closed => EventKind::BreakerClosed,
                };
                bus.publish(
                    WorkflowEvent::new(kind, workflow_id)
                        .with_payload(serde_json::json!({ "agent": agent_name })),
                );
            });

            let handle = self.factory.build(agent_def, Some(listener))?;
            agents.insert(agent_def.name.clone(), Arc::new(handle));
        }
        Ok(agents)
    }
}

fn spawn_worker(
    task: String,
    handle: Arc<AgentHandle>,
    action: String,
    params: Map<String, Value>,
    options: CallOptions,
    cancel: CancellationToken,
    tx: mpsc::UnboundedSender<WorkerMessage>,
) {
    tokio::spawn(async move {
        let progress_tx = tx.clone();
        let progress_task = task.clone();

        let outcome = handle
            .invoke(&action, &params, &options, &cancel, move |progress| {
                let _ = progress_tx.send(WorkerMessage::Progress {
                    task: progress_task.clone(),
                    progress,
                });
            })
            .await;

        let _ = tx.send(WorkerMessage::Done { task, outcome });
    });
}
