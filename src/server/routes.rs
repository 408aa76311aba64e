//! API route handlers.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::agent::{AgentFactory, AgentResponse};
use crate::server::{AppState, ExecutionEntry};
use crate::workflow::{self, AgentDefinition, WorkflowDefinition};

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/health", get(health))
        .route(
            "/api/v1/workflows",
            post(submit_workflow).get(list_workflows),
        )
        .route(
            "/api/v1/workflows/{id}",
            get(get_workflow).delete(cancel_workflow),
        )
        .route("/api/v1/workflows/{id}/status", get(workflow_status))
        .route("/api/v1/agents/test", post(test_agent))
        .with_state(state)
}

/// Error responses rendered as `{ "error": ... }` JSON.
enum ApiError {
    NotFound(String),
    Conflict(String),
    Invalid(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(m) => (StatusCode::NOT_FOUND, m),
            ApiError::Conflict(m) => (StatusCode::CONFLICT, m),
            ApiError::Invalid(m) => (StatusCode::UNPROCESSABLE_ENTITY, m),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    uptime_secs: u64,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        uptime_secs: state.uptime_secs(),
    })
}

#[derive(Serialize)]
struct SubmitResponse {
    execution_id: Uuid,
    name: String,
    status: String,
    total_tasks: usize,
}

async fn submit_workflow(
    State(state): State<AppState>,
    Json(definition): Json<WorkflowDefinition>,
) -> Result<Json<SubmitResponse>, ApiError> {
    workflow::validate(&definition).map_err(|e| ApiError::Invalid(e.to_string()))?;

    let entry = state.launch(definition).await;
    tracing::info!(
        execution_id = %entry.execution_id,
        workflow = %entry.name,
        "Workflow queued"
    );

    Ok(Json(SubmitResponse {
        execution_id: entry.execution_id,
        name: entry.name,
        status: entry.status,
        total_tasks: entry.total_tasks,
    }))
}

#[derive(Serialize)]
struct StatusResponse {
    execution_id: Uuid,
    status: String,
    /// Terminal tasks as a percentage of all tasks, 0–100.
    progress: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    current_task: Option<String>,
    message: String,
}

fn progress_of(entry: &ExecutionEntry) -> f64 {
    if entry.total_tasks == 0 {
        return 100.0;
    }
    (entry.terminal_tasks as f64 / entry.total_tasks as f64) * 100.0
}

async fn workflow_status(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<StatusResponse>, ApiError> {
    let entry = state
        .get(id)
        .await
        .ok_or_else(|| ApiError::NotFound(format!("Workflow execution {id} not found")))?;

    Ok(Json(StatusResponse {
        execution_id: entry.execution_id,
        status: entry.status.clone(),
        progress: progress_of(&entry),
        current_task: entry.current_task.clone(),
        message: format!("Workflow {}", entry.status),
    }))
}

#[derive(Serialize)]
struct ExecutionDetail {
    execution_id: Uuid,
    name: String,
    status: String,
    created_at: chrono::DateTime<chrono::Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    completed_at: Option<chrono::DateTime<chrono::Utc>>,
    total_tasks: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    report: Option<crate::engine::WorkflowReport>,
}

impl From<ExecutionEntry> for ExecutionDetail {
    fn from(entry: ExecutionEntry) -> Self {
        Self {
            execution_id: entry.execution_id,
            name: entry.name,
            status: entry.status,
            created_at: entry.created_at,
            completed_at: entry.completed_at,
            total_tasks: entry.total_tasks,
            report: entry.report,
        }
    }
}

async fn get_workflow(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ExecutionDetail>, ApiError> {
    let entry = state
        .get(id)
        .await
        .ok_or_else(|| ApiError::NotFound(format!("Workflow execution {id} not found")))?;
    Ok(Json(entry.into()))
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    #[serde(default = "default_page")]
    page: usize,
    #[serde(default = "default_page_size")]
    page_size: usize,
    status: Option<String>,
}

fn default_page() -> usize {
    1
}

fn default_page_size() -> usize {
    10
}

#[derive(Serialize)]
struct ListResponse {
    workflows: Vec<ExecutionDetail>,
    total: usize,
    page: usize,
    page_size: usize,
}

async fn list_workflows(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Json<ListResponse> {
    let mut entries = state.list().await;
    if let Some(status) = &query.status {
        entries.retain(|e| &e.status == status);
    }
    // Newest first.
    entries.sort_by(|a, b| b.created_at.cmp(&a.created_at));

    let total = entries.len();
    let page = query.page.max(1);
    let page_size = query.page_size.clamp(1, 100);
    let start = (page - 1).saturating_mul(page_size);

    let workflows = entries
        .into_iter()
        .skip(start)
        .take(page_size)
        .map(ExecutionDetail::from)
        .collect();

    Json(ListResponse {
        workflows,
        total,
        page,
        page_size,
    })
}

async fn cancel_workflow(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    let entry = state
        .get(id)
        .await
        .ok_or_else(|| ApiError::NotFound(format!("Workflow execution {id} not found")))?;

    if !matches!(entry.status.as_str(), "queued" | "running") {
        return Err(ApiError::Conflict(format!(
            "Cannot cancel workflow with status: {}",
            entry.status
        )));
    }

    entry.cancel.cancel();
    tracing::info!(execution_id = %id, "Workflow cancellation requested");
    Ok(Json(json!({ "message": "Workflow cancellation requested" })))
}

#[derive(Debug, Deserialize)]
struct AgentTestRequest {
    agent: AgentDefinition,
    action: String,
    #[serde(default)]
    parameters: Map<String, Value>,
}

#[derive(Serialize)]
struct AgentTestResponse {
    agent_name: String,
    #[serde(flatten)]
    response: AgentResponse,
}

/// Invoke one action against one agent, bypassing retry and breaker so the
/// caller sees the bare outcome.
async fn test_agent(
    Json(request): Json<AgentTestRequest>,
) -> Result<Json<AgentTestResponse>, ApiError> {
    let factory = AgentFactory::new();
    let handle = factory
        .build(&request.agent, None)
        .map_err(|e| ApiError::Invalid(e.to_string()))?;

    let started = std::time::Instant::now();
    let outcome = handle
        .invoke_bare(&request.action, &request.parameters, request.agent.timeout())
        .await;

    Ok(Json(AgentTestResponse {
        agent_name: request.agent.name.clone(),
        response: AgentResponse::from_outcome(&outcome, started.elapsed()),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use crate::server::AppStateInner;
    use crate::testing::{
        scripted_agent_def, scripted_factory, task_def, workflow_def, ScriptedAgent, StubRegistry,
    };

    fn scripted_state(registry: StubRegistry) -> AppState {
        AppStateInner::with_factory(Arc::new(move || scripted_factory(registry.clone())))
    }

    fn empty_state() -> AppState {
        scripted_state(Arc::new(Mutex::new(HashMap::new())))
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn sample_workflow() -> Value {
        let definition = workflow_def(
            "api-test",
            vec![scripted_agent_def("stub")],
            vec![task_def("only", "stub")],
        );
        serde_json::to_value(definition).unwrap()
    }

    #[tokio::test]
    async fn health_reports_version() {
        let response = router(empty_state())
            .oneshot(get("/api/v1/health"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
    }

    #[tokio::test]
    async fn submit_then_poll_until_completed() {
        let registry: StubRegistry = Arc::new(Mutex::new(HashMap::new()));
        registry.lock().unwrap().insert(
            "stub".to_string(),
            ScriptedAgent::always(json!({"ok": true})),
        );
        let state = scripted_state(registry);
        let app = router(state);

        let response = app
            .clone()
            .oneshot(post_json("/api/v1/workflows", sample_workflow()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "queued");
        assert_eq!(body["total_tasks"], 1);
        let id = body["execution_id"].as_str().unwrap().to_string();

        // Poll status until the background run finishes.
        let mut status = String::new();
        for _ in 0..50 {
            let response = app
                .clone()
                .oneshot(get(&format!("/api/v1/workflows/{id}/status")))
                .await
                .unwrap();
            status = body_json(response).await["status"]
                .as_str()
                .unwrap()
                .to_string();
            if status != "queued" && status != "running" {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(status, "completed");

        // The full record carries the per-task report.
        let response = app
            .clone()
            .oneshot(get(&format!("/api/v1/workflows/{id}")))
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["report"]["results"]["only"]["ok"], true);
    }

    #[tokio::test]
    async fn invalid_workflow_is_rejected_up_front() {
        let app = router(empty_state());
        let mut doc = sample_workflow();
        doc["tasks"][0]["agent"] = json!("nonexistent");

        let response = app
            .oneshot(post_json("/api/v1/workflows", doc))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let body = body_json(response).await;
        assert!(body["error"].as_str().unwrap().contains("nonexistent"));
    }

    #[tokio::test]
    async fn unknown_execution_is_404() {
        let app = router(empty_state());
        let response = app
            .oneshot(get(&format!("/api/v1/workflows/{}/status", Uuid::new_v4())))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn list_supports_status_filter_and_pagination() {
        let registry: StubRegistry = Arc::new(Mutex::new(HashMap::new()));
        registry.lock().unwrap().insert(
            "stub".to_string(),
            ScriptedAgent::always(json!({"ok": true})),
        );
        let state = scripted_state(registry);
        let app = router(state);

        for _ in 0..3 {
            let response = app
                .clone()
                .oneshot(post_json("/api/v1/workflows", sample_workflow()))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }

        let response = app
            .clone()
            .oneshot(get("/api/v1/workflows?page=1&page_size=2"))
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["total"], 3);
        assert_eq!(body["workflows"].as_array().unwrap().len(), 2);

        let response = app
            .clone()
            .oneshot(get("/api/v1/workflows?status=definitely_not_a_status"))
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["total"], 0);
    }

    #[tokio::test]
    async fn cancelling_a_terminal_execution_conflicts() {
        let registry: StubRegistry = Arc::new(Mutex::new(HashMap::new()));
        registry.lock().unwrap().insert(
            "stub".to_string(),
            ScriptedAgent::always(json!({"ok": true})),
        );
        let app = router(scripted_state(registry));

        let response = app
            .clone()
            .oneshot(post_json("/api/v1/workflows", sample_workflow()))
            .await
            .unwrap();
        let id = body_json(response).await["execution_id"]
            .as_str()
            .unwrap()
            .to_string();

        // Wait for the run to finish.
        for _ in 0..50 {
            let response = app
                .clone()
                .oneshot(get(&format!("/api/v1/workflows/{id}/status")))
                .await
                .unwrap();
            let status = body_json(response).await["status"]
                .as_str()
                .unwrap()
                .to_string();
            if status == "completed" {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri(format!("/api/v1/workflows/{id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }
}
