//! Test harness: scripted stub agents and definition builders.
//!
//! Provides:
//! - [`ScriptedAgent`]: an [`AgentInvoker`] that replays a fixed sequence of
//!   outcomes and counts its calls
//! - [`scripted_factory`]: an [`AgentFactory`] with the `scripted` custom
//!   driver wired to a shared registry of stubs
//! - Builders for workflow/agent/task definitions with sensible defaults
//!
//! Used by the engine's own tests and by the integration suite; none of this
//! reaches for the network.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::agent::{AgentFactory, AgentInvoker, InvokeOutput};
use crate::error::InvokeError;
use crate::workflow::{
    AgentDefinition, AgentKind, BreakerPolicy, FailureStrategy, RetryPolicy, TaskDefinition,
    WorkflowDefinition,
};

/// One scripted outcome for a [`ScriptedAgent`] call.
#[derive(Clone)]
pub enum ScriptedCall {
    Succeed(Value),
    Fail(InvokeError),
    /// Sleep, then succeed. Used to make overlap observable in tests.
    SucceedAfter(Duration, Value),
}

/// A stub invoker that replays scripted outcomes in order.
///
/// Once the script is exhausted, every further call repeats the last
/// outcome (or succeeds with `null` for an empty script).
pub struct ScriptedAgent {
    script: Mutex<Vec<ScriptedCall>>,
    cursor: AtomicU32,
    calls: AtomicU32,
}

impl ScriptedAgent {
    pub fn new(script: Vec<ScriptedCall>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script),
            cursor: AtomicU32::new(0),
            calls: AtomicU32::new(0),
        })
    }

    /// Always succeed with `payload`.
    pub fn always(payload: Value) -> Arc<Self> {
        Self::new(vec![ScriptedCall::Succeed(payload)])
    }

    /// Always fail with a transport fault.
    pub fn always_failing() -> Arc<Self> {
        Self::new(vec![ScriptedCall::Fail(InvokeError::Transport {
            reason: "scripted failure".into(),
        })])
    }

    /// Number of `invoke_raw` calls observed so far.
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AgentInvoker for ScriptedAgent {
    async fn invoke_raw(
        &self,
        _action: &str,
        _params: &Map<String, Value>,
    ) -> Result<InvokeOutput, InvokeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let step = {
            let script = self.script.lock().expect("script lock poisoned");
            if script.is_empty() {
                return Ok(InvokeOutput::from_payload(Value::Null));
            }
            let index = self.cursor.fetch_add(1, Ordering::SeqCst) as usize;
            script[index.min(script.len() - 1)].clone()
        };

        match step {
            ScriptedCall::Succeed(payload) => Ok(InvokeOutput::from_payload(payload)),
            ScriptedCall::Fail(error) => Err(error),
            ScriptedCall::SucceedAfter(delay, payload) => {
                tokio::time::sleep(delay).await;
                Ok(InvokeOutput::from_payload(payload))
            }
        }
    }
}

/// Registry mapping agent names to their scripted stubs.
pub type StubRegistry = Arc<Mutex<HashMap<String, Arc<ScriptedAgent>>>>;

/// Build a factory whose `scripted` custom driver looks stubs up by agent
/// name in `registry`.
pub fn scripted_factory(registry: StubRegistry) -> AgentFactory {
    let mut factory = AgentFactory::new();
    factory.register_custom("scripted", move |definition: &AgentDefinition| {
        let stubs = registry.lock().expect("stub registry lock poisoned");
        let stub = stubs.get(&definition.name).cloned().unwrap_or_else(|| {
            ScriptedAgent::always(serde_json::json!({"stub": definition.name}))
        });
        Ok(stub as Arc<dyn AgentInvoker>)
    });
    factory
}

/// A `custom`-kind agent definition driven by the `scripted` driver.
pub fn scripted_agent_def(name: &str) -> AgentDefinition {
    let mut params = Map::new();
    params.insert("driver".to_string(), Value::String("scripted".into()));
    AgentDefinition {
        name: name.to_string(),
        kind: AgentKind::Custom,
        endpoint: None,
        authentication: None,
        timeout: 5.0,
        retry: fast_retry(1),
        breaker: BreakerPolicy::default(),
        max_concurrency: None,
        params,
    }
}

/// A retry policy with test-friendly delays and no jitter.
pub fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        initial_delay: 0.1,
        max_delay: 1.0,
        exponential_base: 2.0,
        jitter: false,
    }
}

/// A task bound to `agent` with no dependencies.
pub fn task_def(name: &str, agent: &str) -> TaskDefinition {
    TaskDefinition {
        name: name.to_string(),
        description: None,
        agent: agent.to_string(),
        action: "test".to_string(),
        parameters: Map::new(),
        timeout: None,
        retry: None,
        depends_on: Vec::new(),
        continue_on_failure: false,
    }
}

/// A task bound to `agent` depending on `deps`.
pub fn task_def_after(name: &str, agent: &str, deps: &[&str]) -> TaskDefinition {
    TaskDefinition {
        depends_on: deps.iter().map(|d| d.to_string()).collect(),
        ..task_def(name, agent)
    }
}

/// A minimal workflow definition around the given agents and tasks.
pub fn workflow_def(
    name: &str,
    agents: Vec<AgentDefinition>,
    tasks: Vec<TaskDefinition>,
) -> WorkflowDefinition {
    WorkflowDefinition {
        name: name.to_string(),
        description: None,
        version: "1.0.0".to_string(),
        parallel_execution: false,
        failure_strategy: FailureStrategy::StopOnFirstFailure,
        global_timeout: None,
        agents,
        tasks,
    }
}
