//! End-to-end engine tests with scripted agents.
//!
//! Covers the observable contracts of the scheduler: dependency ordering,
//! parallel fan-out, retry/backoff, breaker behavior across tasks, the
//! failure strategies, cancellation, and deterministic re-runs.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::json;
use tokio_util::sync::CancellationToken;

use foreman::engine::{EventKind, Scheduler, TaskState, WorkflowEvent, WorkflowState};
use foreman::error::InvokeErrorKind;
use foreman::testing::{
    fast_retry, scripted_agent_def, scripted_factory, task_def, task_def_after, workflow_def,
    ScriptedAgent, ScriptedCall, StubRegistry,
};
use foreman::workflow::{AgentDefinition, BreakerPolicy, FailureStrategy, WorkflowDefinition};

fn new_registry() -> StubRegistry {
    Arc::new(Mutex::new(HashMap::new()))
}

fn register(registry: &StubRegistry, name: &str, stub: Arc<ScriptedAgent>) {
    registry.lock().unwrap().insert(name.to_string(), stub);
}

fn transport_fail() -> ScriptedCall {
    ScriptedCall::Fail(foreman::error::InvokeError::Transport {
        reason: "HTTP 503: unavailable".into(),
    })
}

/// Collect all events currently buffered on a receiver.
fn drain_events(rx: &mut tokio::sync::mpsc::Receiver<WorkflowEvent>) -> Vec<WorkflowEvent> {
    std::iter::from_fn(|| rx.try_recv().ok()).collect()
}

// S1: two tasks in sequence on one agent; both succeed, ordering holds.
#[tokio::test]
async fn sequential_success_chain() {
    let registry = new_registry();
    register(&registry, "a1", ScriptedAgent::always(json!({"ok": true})));

    let definition = workflow_def(
        "sequential",
        vec![scripted_agent_def("a1")],
        vec![task_def("t1", "a1"), task_def_after("t2", "a1", &["t1"])],
    );

    let scheduler = Scheduler::new(scripted_factory(registry));
    let report = scheduler.run(&definition).await.unwrap();

    assert_eq!(report.status, WorkflowState::Completed);
    assert_eq!(report.results["t1"], json!({"ok": true}));
    assert_eq!(report.results["t2"], json!({"ok": true}));
    assert!(report.errors.is_empty());

    let t1 = report.tasks.iter().find(|t| t.name == "t1").unwrap();
    let t2 = report.tasks.iter().find(|t| t.name == "t2").unwrap();
    assert!(t1.finished_at.unwrap() <= t2.started_at.unwrap());
}

// S2: parallel fan-out overlaps, fan-in waits for the whole batch.
#[tokio::test]
async fn parallel_fan_out_fan_in() {
    let registry = new_registry();
    for name in ["a1", "a2", "a3"] {
        register(
            &registry,
            name,
            ScriptedAgent::new(vec![ScriptedCall::SucceedAfter(
                Duration::from_millis(100),
                json!({"agent": name}),
            )]),
        );
    }
    register(&registry, "a4", ScriptedAgent::always(json!("joined")));

    let mut definition = workflow_def(
        "fan",
        vec![
            scripted_agent_def("a1"),
            scripted_agent_def("a2"),
            scripted_agent_def("a3"),
            scripted_agent_def("a4"),
        ],
        vec![
            task_def("t1", "a1"),
            task_def("t2", "a2"),
            task_def("t3", "a3"),
            task_def_after("t4", "a4", &["t1", "t2", "t3"]),
        ],
    );
    definition.parallel_execution = true;

    let scheduler = Scheduler::new(scripted_factory(registry));
    let mut events = scheduler.events().subscribe();
    let report = scheduler.run(&definition).await.unwrap();

    assert_eq!(report.status, WorkflowState::Completed);

    let events = drain_events(&mut events);
    let position = |kind: EventKind, task: &str| {
        events
            .iter()
            .position(|e| e.kind == kind && e.task_name.as_deref() == Some(task))
            .unwrap_or_else(|| panic!("missing {kind:?} for {task}"))
    };

    // All three fan-out tasks start before any of them completes.
    let last_start = ["t1", "t2", "t3"]
        .iter()
        .map(|t| position(EventKind::TaskStarted, t))
        .max()
        .unwrap();
    let first_complete = ["t1", "t2", "t3"]
        .iter()
        .map(|t| position(EventKind::TaskCompleted, t))
        .min()
        .unwrap();
    assert!(
        last_start < first_complete,
        "fan-out batch did not overlap: last start {last_start}, first completion {first_complete}"
    );

    // The join task starts only after the last fan-out completion.
    let last_complete = ["t1", "t2", "t3"]
        .iter()
        .map(|t| position(EventKind::TaskCompleted, t))
        .max()
        .unwrap();
    assert!(position(EventKind::TaskStarted, "t4") > last_complete);

    let t4 = report.tasks.iter().find(|t| t.name == "t4").unwrap();
    for name in ["t1", "t2", "t3"] {
        let t = report.tasks.iter().find(|t| t.name == name).unwrap();
        assert!(t.finished_at.unwrap() <= t4.started_at.unwrap());
    }
}

// S3: two transport faults, then success; attempt count and measured
// backoff match the policy.
#[tokio::test]
async fn retry_then_success() {
    let registry = new_registry();
    let stub = ScriptedAgent::new(vec![
        transport_fail(),
        transport_fail(),
        ScriptedCall::Succeed(json!({"ok": true})),
    ]);
    register(&registry, "flaky", stub.clone());

    let mut agent = scripted_agent_def("flaky");
    // 0.1s then 0.2s of backoff, deterministic.
    agent.retry = fast_retry(3);

    let definition = workflow_def("retry", vec![agent], vec![task_def("t1", "flaky")]);

    let scheduler = Scheduler::new(scripted_factory(registry));
    let mut events = scheduler.events().subscribe();

    let started = Instant::now();
    let report = scheduler.run(&definition).await.unwrap();
    let elapsed = started.elapsed();

    assert_eq!(report.status, WorkflowState::Completed);
    let t1 = report.tasks.iter().find(|t| t.name == "t1").unwrap();
    assert_eq!(t1.attempts, 3);
    assert_eq!(stub.calls(), 3);
    assert!(
        elapsed >= Duration::from_millis(300),
        "backoff too short: {elapsed:?}"
    );

    // The retry surfaced as RETRYING transitions on the bus.
    let events = drain_events(&mut events);
    let retrying = events
        .iter()
        .filter(|e| e.kind == EventKind::TaskRetrying)
        .count();
    assert_eq!(retrying, 2);
}

// S4: the breaker opens during the first task's retries; the second task on
// the same agent is denied without touching the endpoint.
#[tokio::test]
async fn breaker_opens_across_tasks() {
    let registry = new_registry();
    let stub = ScriptedAgent::always_failing();
    register(&registry, "down", stub.clone());

    let mut agent = scripted_agent_def("down");
    agent.retry = fast_retry(3);
    agent.breaker = BreakerPolicy {
        failure_threshold: 2,
        recovery_timeout: 60.0,
    };

    let mut definition = workflow_def(
        "breaker",
        vec![agent],
        vec![task_def("t1", "down"), task_def("t2", "down")],
    );
    definition.failure_strategy = FailureStrategy::ContinueOnFailure;

    let scheduler = Scheduler::new(scripted_factory(registry));
    let mut events = scheduler.events().subscribe();
    let report = scheduler.run(&definition).await.unwrap();

    assert_eq!(report.status, WorkflowState::Failed);

    let t1 = report.tasks.iter().find(|t| t.name == "t1").unwrap();
    let t2 = report.tasks.iter().find(|t| t.name == "t2").unwrap();
    assert_eq!(t1.state, TaskState::Failed);
    assert_eq!(
        t1.error.as_ref().unwrap().kind,
        InvokeErrorKind::RetryExhausted
    );
    assert_eq!(t2.state, TaskState::Failed);
    assert_eq!(t2.error.as_ref().unwrap().kind, InvokeErrorKind::BreakerOpen);

    // Two failures tripped the threshold-2 breaker; the endpoint never saw
    // the second task.
    assert_eq!(stub.calls(), 2);

    let events = drain_events(&mut events);
    assert!(events.iter().any(|e| e.kind == EventKind::BreakerOpened));
}

// S5: one failure among successes under partial completion.
#[tokio::test]
async fn partial_completion() {
    let registry = new_registry();
    register(&registry, "good", ScriptedAgent::always(json!({"ok": 1})));
    register(&registry, "bad", ScriptedAgent::always_failing());

    let mut definition = workflow_def(
        "partial",
        vec![scripted_agent_def("good"), scripted_agent_def("bad")],
        vec![
            task_def("t1", "good"),
            task_def("t2", "bad"),
            task_def("t3", "good"),
        ],
    );
    definition.failure_strategy = FailureStrategy::PartialCompletionAllowed;

    let scheduler = Scheduler::new(scripted_factory(registry));
    let report = scheduler.run(&definition).await.unwrap();

    assert_eq!(report.status, WorkflowState::PartiallyCompleted);
    assert_eq!(report.completed_tasks, 2);
    assert_eq!(report.failed_tasks, 1);
    assert!(report.results.contains_key("t1"));
    assert!(report.results.contains_key("t3"));
    assert!(!report.results.contains_key("t2"));
    assert!(report.errors.contains_key("t2"));
}

// S6: a failed dependency cancels its dependents; independent work
// proceeds; the workflow is FAILED (no partial flag) and the cancellation
// is visible in the event log.
#[tokio::test]
async fn dependency_cancellation() {
    let registry = new_registry();
    register(&registry, "bad", ScriptedAgent::always_failing());
    let good = ScriptedAgent::always(json!({"ok": true}));
    register(&registry, "good", good.clone());

    let mut definition = workflow_def(
        "cascade",
        vec![scripted_agent_def("bad"), scripted_agent_def("good")],
        vec![
            task_def("t1", "bad"),
            task_def_after("t2", "good", &["t1"]),
            task_def("t3", "good"),
        ],
    );
    definition.failure_strategy = FailureStrategy::ContinueOnFailure;

    let scheduler = Scheduler::new(scripted_factory(registry));
    let mut events = scheduler.events().subscribe();
    let report = scheduler.run(&definition).await.unwrap();

    assert_eq!(report.status, WorkflowState::Failed);

    let t2 = report.tasks.iter().find(|t| t.name == "t2").unwrap();
    let t3 = report.tasks.iter().find(|t| t.name == "t3").unwrap();
    assert_eq!(t2.state, TaskState::Cancelled);
    assert_eq!(t3.state, TaskState::Completed);

    // t2 was never dispatched: the only call to "good" came from t3.
    assert_eq!(good.calls(), 1);

    let events = drain_events(&mut events);
    assert!(events
        .iter()
        .any(|e| e.kind == EventKind::TaskCancelled && e.task_name.as_deref() == Some("t2")));

    // Terminal counts always add up at the end.
    assert_eq!(
        report.completed_tasks + report.failed_tasks + report.cancelled_tasks,
        report.total_tasks
    );
}

// A task with continue_on_failure set does not cascade to its dependents.
#[tokio::test]
async fn continue_on_failure_task_spares_dependents() {
    let registry = new_registry();
    register(&registry, "bad", ScriptedAgent::always_failing());
    register(&registry, "good", ScriptedAgent::always(json!("fine")));

    let mut definition = workflow_def(
        "tolerant",
        vec![scripted_agent_def("bad"), scripted_agent_def("good")],
        vec![
            {
                let mut t = task_def("optional", "bad");
                t.continue_on_failure = true;
                t
            },
            task_def_after("dependent", "good", &["optional"]),
        ],
    );
    definition.failure_strategy = FailureStrategy::ContinueOnFailure;

    let scheduler = Scheduler::new(scripted_factory(registry));
    let report = scheduler.run(&definition).await.unwrap();

    // The tolerated failure neither stops the run nor cancels the
    // dependent; the dependent runs with the upstream result missing.
    let dependent = report.tasks.iter().find(|t| t.name == "dependent").unwrap();
    assert_eq!(dependent.state, TaskState::Completed);
    assert_eq!(report.failed_tasks, 1);
    assert_eq!(report.completed_tasks, 1);
    assert!(!report.results.contains_key("optional"));
}

// Under stop-on-first-failure nothing new starts after the first failure.
#[tokio::test]
async fn stop_on_first_failure_stops_dispatch() {
    let registry = new_registry();
    register(&registry, "bad", ScriptedAgent::always_failing());
    let never_called = ScriptedAgent::always(json!("unused"));
    register(&registry, "good", never_called.clone());

    let definition = workflow_def(
        "stop",
        vec![scripted_agent_def("bad"), scripted_agent_def("good")],
        vec![task_def("t1", "bad"), task_def("t2", "good")],
    );

    let scheduler = Scheduler::new(scripted_factory(registry));
    let mut events = scheduler.events().subscribe();
    let report = scheduler.run(&definition).await.unwrap();

    assert_eq!(report.status, WorkflowState::Failed);
    let t2 = report.tasks.iter().find(|t| t.name == "t2").unwrap();
    assert_eq!(t2.state, TaskState::Cancelled);
    assert_eq!(never_called.calls(), 0);

    // No task_started after the task_failed event.
    let events = drain_events(&mut events);
    let failed_at = events
        .iter()
        .position(|e| e.kind == EventKind::TaskFailed)
        .unwrap();
    assert!(!events[failed_at..]
        .iter()
        .any(|e| e.kind == EventKind::TaskStarted));
}

// The global deadline cancels whatever is still running.
#[tokio::test]
async fn global_deadline_cancels_the_run() {
    let registry = new_registry();
    register(
        &registry,
        "slow",
        ScriptedAgent::new(vec![ScriptedCall::SucceedAfter(
            Duration::from_secs(30),
            json!("too late"),
        )]),
    );

    let mut definition = workflow_def(
        "deadline",
        vec![scripted_agent_def("slow")],
        vec![task_def("t1", "slow"), task_def_after("t2", "slow", &["t1"])],
    );
    definition.global_timeout = Some(0.3);

    let scheduler = Scheduler::new(scripted_factory(registry));
    let started = Instant::now();
    let report = scheduler.run(&definition).await.unwrap();

    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(report.status, WorkflowState::Failed);
    assert_eq!(report.completed_tasks, 0);
    assert_eq!(report.cancelled_tasks, 2);
}

// External cancellation mid-run yields CANCELLED and interrupts workers.
#[tokio::test]
async fn external_cancellation() {
    let registry = new_registry();
    register(
        &registry,
        "slow",
        ScriptedAgent::new(vec![ScriptedCall::SucceedAfter(
            Duration::from_secs(30),
            json!("too late"),
        )]),
    );

    let definition = workflow_def(
        "cancelme",
        vec![scripted_agent_def("slow")],
        vec![task_def("t1", "slow")],
    );

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let scheduler = Scheduler::new(scripted_factory(registry));
    let started = Instant::now();
    let report = scheduler
        .run_with_cancel(&definition, cancel)
        .await
        .unwrap();

    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(report.status, WorkflowState::Cancelled);
    assert_eq!(report.cancelled_tasks, 1);
}

// Running the same deterministic workflow twice yields identical results.
#[tokio::test]
async fn deterministic_rerun_matches() {
    let definition = || {
        let mut definition = workflow_def(
            "deterministic",
            vec![scripted_agent_def("a"), scripted_agent_def("b")],
            vec![
                task_def("first", "a"),
                task_def_after("second", "b", &["first"]),
            ],
        );
        definition.parallel_execution = false;
        definition
    };

    let mut outcomes = Vec::new();
    for _ in 0..2 {
        let registry = new_registry();
        register(&registry, "a", ScriptedAgent::always(json!({"n": 1})));
        register(&registry, "b", ScriptedAgent::always(json!({"n": 2})));

        let scheduler = Scheduler::new(scripted_factory(registry));
        let report = scheduler.run(&definition()).await.unwrap();
        outcomes.push((report.status, report.results.clone()));
    }

    assert_eq!(outcomes[0].0, outcomes[1].0);
    assert_eq!(outcomes[0].1, outcomes[1].1);
}

// Loading a document and re-serializing preserves semantics (round-trip
// through the loader, not just serde).
#[tokio::test]
async fn document_roundtrip_runs_identically() {
    let yaml = r#"
name: roundtrip
parallel_execution: false
agents:
  - name: a
    type: custom
    params:
      driver: scripted
tasks:
  - name: one
    agent: a
    action: test
  - name: two
    agent: a
    action: test
    depends_on: [one]
"#;
    let loaded = foreman::workflow::load_from_yaml(yaml).unwrap();
    let reserialized = serde_yaml::to_string(&loaded).unwrap();
    let reloaded = foreman::workflow::load_from_yaml(&reserialized).unwrap();

    let run = |definition: WorkflowDefinition| async move {
        let registry = new_registry();
        register(&registry, "a", ScriptedAgent::always(json!("v")));
        let scheduler = Scheduler::new(scripted_factory(registry));
        scheduler.run(&definition).await.unwrap()
    };

    let first = run(loaded).await;
    let second = run(reloaded).await;
    assert_eq!(first.status, second.status);
    assert_eq!(first.results, second.results);
}

// Task-level retry overrides replace the agent policy wholesale.
#[tokio::test]
async fn task_retry_override_wins() {
    let registry = new_registry();
    let stub = ScriptedAgent::always_failing();
    register(&registry, "flaky", stub.clone());

    let mut agent = scripted_agent_def("flaky");
    agent.retry = fast_retry(5);

    let mut task = task_def("t1", "flaky");
    task.retry = Some(fast_retry(2));

    let mut definition = workflow_def("override", vec![agent], vec![task]);
    definition.failure_strategy = FailureStrategy::ContinueOnFailure;

    let scheduler = Scheduler::new(scripted_factory(registry));
    let report = scheduler.run(&definition).await.unwrap();

    // Two attempts from the task override, not five from the agent.
    assert_eq!(stub.calls(), 2);
    let t1 = report.tasks.iter().find(|t| t.name == "t1").unwrap();
    assert_eq!(t1.attempts, 2);
    assert_eq!(
        t1.error.as_ref().unwrap().kind,
        InvokeErrorKind::RetryExhausted
    );
}

// A max_concurrency cap serializes a parallel fan-out against one agent.
#[tokio::test]
async fn concurrency_cap_serializes_parallel_batch() {
    let registry = new_registry();
    register(
        &registry,
        "limited",
        ScriptedAgent::new(vec![ScriptedCall::SucceedAfter(
            Duration::from_millis(80),
            json!("done"),
        )]),
    );

    let mut agent = scripted_agent_def("limited");
    agent.max_concurrency = Some(1);

    let mut definition = workflow_def(
        "capped",
        vec![agent],
        vec![
            task_def("t1", "limited"),
            task_def("t2", "limited"),
            task_def("t3", "limited"),
        ],
    );
    definition.parallel_execution = true;

    let scheduler = Scheduler::new(scripted_factory(registry));
    let started = Instant::now();
    let report = scheduler.run(&definition).await.unwrap();

    assert_eq!(report.status, WorkflowState::Completed);
    // Three 80ms calls through a single slot cannot overlap.
    assert!(
        started.elapsed() >= Duration::from_millis(240),
        "capped batch finished too fast: {:?}",
        started.elapsed()
    );
}

// The agent-test surface drives a real HTTP agent against a local fixture.
#[tokio::test]
async fn agent_test_endpoint_normalizes_response() {
    use axum::routing::get;
    use axum::{Json, Router};
    use tower::ServiceExt;

    // Local fixture standing in for the external service.
    let fixture = Router::new().route(
        "/ping",
        get(|| async { Json(json!({"pong": true})) }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, fixture).await.unwrap();
    });

    let agent: AgentDefinition = serde_json::from_value(json!({
        "name": "probe",
        "type": "generic_http",
        "endpoint": format!("http://{addr}"),
    }))
    .unwrap();

    let app = foreman::server::router(foreman::server::AppStateInner::new());
    let request = axum::http::Request::builder()
        .method("POST")
        .uri("/api/v1/agents/test")
        .header("content-type", "application/json")
        .body(axum::body::Body::from(
            json!({
                "agent": agent,
                "action": "ping",
                "parameters": {"method": "GET", "endpoint": "/ping"},
            })
            .to_string(),
        ))
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), axum::http::StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();

    assert_eq!(body["agent_name"], "probe");
    assert_eq!(body["success"], true);
    assert_eq!(body["result"]["pong"], true);
}
