//! REST control surface (axum) for submitting and tracking workflows.
//!
//! The server never shares mutable engine state: each submitted workflow
//! gets its own scheduler, and the server follows the run by subscribing to
//! that scheduler's event bus.

mod routes;

pub use routes::router;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::agent::AgentFactory;
use crate::engine::{EventKind, Scheduler, WorkflowReport};
use crate::settings::ServerSettings;
use crate::workflow::WorkflowDefinition;

/// Shared server state.
pub type AppState = Arc<AppStateInner>;

/// Builds the factory used for each submitted run. Injectable so tests can
/// wire scripted agents.
pub type FactoryBuilder = dyn Fn() -> AgentFactory + Send + Sync;

pub struct AppStateInner {
    started_at: Instant,
    make_factory: Arc<FactoryBuilder>,
    executions: RwLock<HashMap<Uuid, ExecutionEntry>>,
}

/// What the server tracks per submitted workflow.
#[derive(Clone)]
pub struct ExecutionEntry {
    pub execution_id: Uuid,
    pub name: String,
    /// queued | running | completed | partially_completed | failed | cancelled
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub total_tasks: usize,
    pub terminal_tasks: usize,
    pub current_task: Option<String>,
    pub report: Option<WorkflowReport>,
    pub cancel: CancellationToken,
}

impl AppStateInner {
    pub fn new() -> AppState {
        Self::with_factory(Arc::new(AgentFactory::new))
    }

    pub fn with_factory(make_factory: Arc<FactoryBuilder>) -> AppState {
        Arc::new(Self {
            started_at: Instant::now(),
            make_factory,
            executions: RwLock::new(HashMap::new()),
        })
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    pub async fn get(&self, id: Uuid) -> Option<ExecutionEntry> {
        self.executions.read().await.get(&id).cloned()
    }

    pub async fn list(&self) -> Vec<ExecutionEntry> {
        self.executions.read().await.values().cloned().collect()
    }

    /// Register a validated workflow and start it in the background.
    ///
    /// Returns the execution id immediately; progress is tracked through the
    /// run's event bus.
    pub async fn launch(self: Arc<Self>, definition: WorkflowDefinition) -> ExecutionEntry {
        let execution_id = Uuid::new_v4();
        let cancel = CancellationToken::new();

        let entry = ExecutionEntry {
            execution_id,
            name: definition.name.clone(),
            status: "queued".to_string(),
            created_at: Utc::now(),
            completed_at: None,
            total_tasks: definition.tasks.len(),
            terminal_tasks: 0,
            current_task: None,
            report: None,
            cancel: cancel.clone(),
        };
        self.executions
            .write()
            .await
            .insert(execution_id, entry.clone());

        let state = self.clone();
        let factory = (self.make_factory)();
        tokio::spawn(async move {
            let scheduler = Scheduler::new(factory);
            let mut events = scheduler.events().subscribe();

            // Follow the run through its events so status queries see live
            // progress without sharing engine state.
            let follower_state = state.clone();
            let follower = tokio::spawn(async move {
                while let Some(event) = events.recv().await {
                    let mut executions = follower_state.executions.write().await;
                    let Some(entry) = executions.get_mut(&execution_id) else {
                        break;
                    };
                    match event.kind {
                        EventKind::WorkflowStarted => {
                            entry.status = "running".to_string();
                        }
                        EventKind::TaskStarted => {
                            entry.current_task = event.task_name.clone();
                        }
                        EventKind::TaskCompleted
                        | EventKind::TaskFailed
                        | EventKind::TaskCancelled => {
                            entry.terminal_tasks += 1;
                        }
                        _ => {}
                    }
                }
            });

            let result = scheduler.run_with_cancel(&definition, cancel).await;
            follower.abort();

            let mut executions = state.executions.write().await;
            if let Some(entry) = executions.get_mut(&execution_id) {
                entry.completed_at = Some(Utc::now());
                entry.current_task = None;
                match result {
                    Ok(report) => {
                        entry.status = report.status.as_str().to_string();
                        entry.terminal_tasks = report.total_tasks;
                        entry.report = Some(report);
                    }
                    Err(error) => {
                        tracing::error!(%execution_id, %error, "Workflow run failed to start");
                        entry.status = "failed".to_string();
                    }
                }
            }
        });

        entry
    }
}

/// Bind and serve the API until the process exits.
pub async fn serve(settings: &ServerSettings) -> anyhow::Result<()> {
    let state = AppStateInner::new();
    let app = router(state);

    let addr = format!("{}:{}", settings.host, settings.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("API server listening on {addr}");
    axum::serve(listener, app).await?;
    Ok(())
}
