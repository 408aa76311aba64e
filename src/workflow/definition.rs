//! Serde document model for workflow definitions.
//!
//! A workflow document declares a set of agents (external services) and a DAG
//! of tasks, each task being one call to one agent:
//!
//! ```yaml
//! name: "nightly-report"
//! version: "1.0.0"
//! parallel_execution: true
//! failure_strategy: partial_completion_allowed
//! global_timeout: 600
//!
//! agents:
//!   - name: summarizer
//!     type: chat_llm
//!     endpoint: "https://api.example.com/v1/chat/completions"
//!     authentication:
//!       type: bearer
//!       token: "${LLM_TOKEN}"
//!     params:
//!       model: gpt-4o-mini
//!       max_tokens: 512
//!
//!   - name: metrics
//!     type: generic_http
//!     endpoint: "https://metrics.internal"
//!     retry:
//!       max_attempts: 5
//!       initial_delay: 0.5
//!
//! tasks:
//!   - name: fetch_metrics
//!     agent: metrics
//!     action: fetch
//!     parameters:
//!       endpoint: "/api/daily"
//!       method: GET
//!
//!   - name: summarize
//!     agent: summarizer
//!     action: chat_completion
//!     depends_on: [fetch_metrics]
//!     parameters:
//!       prompt: "Summarize the daily metrics."
//! ```

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Top-level workflow document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Workflow name.
    pub name: String,

    /// Optional human-readable description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Version string.
    #[serde(default = "default_version")]
    pub version: String,

    /// Dispatch the whole ready set concurrently instead of one task at a time.
    #[serde(default)]
    pub parallel_execution: bool,

    /// What happens to the rest of the workflow when a task fails.
    #[serde(default)]
    pub failure_strategy: FailureStrategy,

    /// Wall-clock limit for the whole run, in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub global_timeout: Option<f64>,

    /// Declared agents, in document order.
    pub agents: Vec<AgentDefinition>,

    /// Declared tasks, in document order. Sequential runs dispatch ready
    /// tasks in this order.
    pub tasks: Vec<TaskDefinition>,
}

fn default_version() -> String {
    "1.0.0".to_string()
}

impl WorkflowDefinition {
    /// Look up an agent by name.
    pub fn agent(&self, name: &str) -> Option<&AgentDefinition> {
        self.agents.iter().find(|a| a.name == name)
    }

    pub fn global_timeout(&self) -> Option<Duration> {
        self.global_timeout.map(Duration::from_secs_f64)
    }
}

/// Policy applied after any task reaches FAILED.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStrategy {
    /// Cancel everything still pending and fail the workflow.
    #[default]
    StopOnFirstFailure,
    /// Cancel only the failed task's dependents; independent tasks proceed.
    ContinueOnFailure,
    /// Like `ContinueOnFailure`, but the workflow may end partially completed.
    PartialCompletionAllowed,
}

impl fmt::Display for FailureStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureStrategy::StopOnFirstFailure => "stop_on_first_failure",
            FailureStrategy::ContinueOnFailure => "continue_on_failure",
            FailureStrategy::PartialCompletionAllowed => "partial_completion_allowed",
        };
        f.write_str(s)
    }
}

/// The transport an agent speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    /// OpenAI-style chat completion endpoint.
    ChatLlm,
    /// JSON-RPC 2.0 tool server.
    JsonrpcTool,
    /// Arbitrary REST API.
    GenericHttp,
    /// Built by a driver registered on the factory (see `params.driver`).
    Custom,
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AgentKind::ChatLlm => "chat_llm",
            AgentKind::JsonrpcTool => "jsonrpc_tool",
            AgentKind::GenericHttp => "generic_http",
            AgentKind::Custom => "custom",
        };
        f.write_str(s)
    }
}

/// A named client of one external service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDefinition {
    /// Unique name within the workflow; tasks reference it.
    pub name: String,

    #[serde(rename = "type")]
    pub kind: AgentKind,

    /// Base URL of the service. Required for every kind except `custom`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authentication: Option<AuthScheme>,

    /// Per-call deadline in seconds, unless the task overrides it.
    #[serde(default = "default_timeout")]
    pub timeout: f64,

    #[serde(default)]
    pub retry: RetryPolicy,

    #[serde(default)]
    pub breaker: BreakerPolicy,

    /// Cap on concurrent invocations of this agent. Unlimited when absent;
    /// useful to keep a parallel fan-out from overloading one service.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrency: Option<u32>,

    /// Free-form, kind-specific parameters (model name, driver, ...).
    /// Task parameters overlay these at invocation time.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub params: Map<String, Value>,
}

fn default_timeout() -> f64 {
    30.0
}

impl AgentDefinition {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs_f64(self.timeout)
    }
}

/// How requests to an agent authenticate themselves.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthScheme {
    /// `Authorization: Bearer <token>`
    Bearer { token: String },
    /// `<header>: <key>`, header defaulting to `X-API-Key`.
    ApiKey {
        key: String,
        #[serde(default = "default_api_key_header")]
        header: String,
    },
    /// `Authorization: Basic base64(username:password)`
    Basic { username: String, password: String },
}

fn default_api_key_header() -> String {
    "X-API-Key".to_string()
}

/// Bounded-attempt retry with exponential backoff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Delay before the second attempt, in seconds.
    pub initial_delay: f64,
    /// Backoff ceiling, in seconds.
    pub max_delay: f64,
    pub exponential_base: f64,
    /// Multiply each delay by a uniform factor in [0.5, 1.5].
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: 1.0,
            max_delay: 60.0,
            exponential_base: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }
}

/// Circuit breaker thresholds, one breaker per agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerPolicy {
    /// Consecutive transport failures before the breaker opens.
    pub failure_threshold: u32,
    /// Seconds the breaker stays open before allowing a probe.
    pub recovery_timeout: f64,
}

impl Default for BreakerPolicy {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: 60.0,
        }
    }
}

impl BreakerPolicy {
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.recovery_timeout)
    }
}

/// One invocation of one agent, the unit of scheduling and failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDefinition {
    /// Unique name within the workflow; dependencies reference it.
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Name of the agent that executes this task.
    #[serde(rename = "agent", alias = "agent_name")]
    pub agent: String,

    /// Opaque to the engine; the agent kind gives it meaning (chat action,
    /// RPC method, HTTP verb hint, ...).
    pub action: String,

    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub parameters: Map<String, Value>,

    /// Per-call deadline override in seconds. Replaces the agent's deadline
    /// wholesale when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<f64>,

    /// Retry override. Replaces the agent's policy wholesale when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,

    /// Names of tasks that must complete before this one becomes ready.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,

    /// When true, this task's failure does not cancel its dependents.
    #[serde(default)]
    pub continue_on_failure: bool,
}

impl TaskDefinition {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout.map(Duration::from_secs_f64)
    }
}
