//! Agent clients: heterogeneous transports normalized to one trait.
//!
//! Every agent kind reduces to `invoke_raw(action, params)`; the kinds differ
//! only in how they translate that pair to a wire request and how they map
//! the wire response back. The factory binds each built client to its own
//! resilience pipeline (breaker + retry + timeout).

mod chat;
mod http;
mod jsonrpc;

pub use chat::ChatCompletionAgent;
pub use http::HttpApiAgent;
pub use jsonrpc::JsonRpcAgent;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use crate::error::{ConfigError, InvokeError};
use crate::resilience::{
    AttemptProgress, BreakerListener, CallOptions, CircuitBreaker, ResiliencePipeline,
};
use crate::workflow::{AgentDefinition, AgentKind, AuthScheme};

/// The one capability every agent kind implements.
#[async_trait]
pub trait AgentInvoker: Send + Sync {
    /// Perform a single bare call. No retry, no breaker, no deadline — the
    /// resilience pipeline supplies those around this method.
    async fn invoke_raw(
        &self,
        action: &str,
        params: &Map<String, Value>,
    ) -> Result<InvokeOutput, InvokeError>;
}

/// Normalized result of one successful bare call.
#[derive(Debug, Clone)]
pub struct InvokeOutput {
    /// The payload the caller cares about (parsed JSON, or a raw string
    /// lifted into a JSON value).
    pub payload: Value,
    /// Transport details: status code, request ids, final URL, ...
    pub metadata: Map<String, Value>,
}

impl InvokeOutput {
    pub fn from_payload(payload: Value) -> Self {
        Self {
            payload,
            metadata: Map::new(),
        }
    }

    pub fn with_metadata(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }
}

/// The uniform response shape handed to records and the REST surface.
#[derive(Debug, Clone, Serialize)]
pub struct AgentResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Measured wall-clock latency of the whole invocation, in seconds.
    pub elapsed_secs: f64,
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl AgentResponse {
    pub fn from_outcome(outcome: &Result<InvokeOutput, InvokeError>, elapsed: Duration) -> Self {
        match outcome {
            Ok(output) => Self {
                success: true,
                result: Some(output.payload.clone()),
                error: None,
                elapsed_secs: elapsed.as_secs_f64(),
                metadata: output.metadata.clone(),
            },
            Err(error) => Self {
                success: false,
                result: None,
                error: Some(error.to_string()),
                elapsed_secs: elapsed.as_secs_f64(),
                metadata: Map::new(),
            },
        }
    }
}

/// Apply an auth scheme to an outgoing request.
pub(crate) fn apply_auth(
    request: reqwest::RequestBuilder,
    auth: Option<&AuthScheme>,
) -> reqwest::RequestBuilder {
    match auth {
        None => request,
        Some(AuthScheme::Bearer { token }) => {
            request.header("Authorization", format!("Bearer {token}"))
        }
        Some(AuthScheme::ApiKey { key, header }) => request.header(header.as_str(), key.as_str()),
        Some(AuthScheme::Basic { username, password }) => {
            let encoded =
                base64::engine::general_purpose::STANDARD.encode(format!("{username}:{password}"));
            request.header("Authorization", format!("Basic {encoded}"))
        }
    }
}

/// Map a reqwest transport error to the invocation taxonomy.
pub(crate) fn transport_error(agent: &str, error: reqwest::Error) -> InvokeError {
    if error.is_timeout() {
        // The pipeline's own guard normally fires first; this covers
        // client-level timeouts (e.g. connect timeouts).
        InvokeError::Transport {
            reason: format!("{agent}: request timed out in transport: {error}"),
        }
    } else {
        InvokeError::Transport {
            reason: format!("{agent}: {error}"),
        }
    }
}

/// Classify a non-success HTTP status: server-side trouble is retryable
/// transport, everything else is a rejection.
pub(crate) fn status_error(status: u16, body: &str) -> InvokeError {
    if status >= 500 {
        InvokeError::Transport {
            reason: format!("HTTP {status}: {body}"),
        }
    } else {
        InvokeError::Rejected {
            status: Some(status),
            reason: body.to_string(),
        }
    }
}

/// Builder for custom agent kinds, registered on the factory by driver name.
pub type CustomBuilder =
    dyn Fn(&AgentDefinition) -> Result<Arc<dyn AgentInvoker>, ConfigError> + Send + Sync;

/// Builds agent clients from definitions and binds each to its resilience
/// pipeline. One factory per run; the underlying HTTP client (and its
/// connection pool) is shared by every agent the factory builds.
pub struct AgentFactory {
    client: reqwest::Client,
    custom: HashMap<String, Arc<CustomBuilder>>,
}

impl AgentFactory {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            custom: HashMap::new(),
        }
    }

    /// Register a builder for `custom` agents whose `params.driver` matches
    /// `driver`.
    pub fn register_custom<F>(&mut self, driver: impl Into<String>, builder: F)
    where
        F: Fn(&AgentDefinition) -> Result<Arc<dyn AgentInvoker>, ConfigError>
            + Send
            + Sync
            + 'static,
    {
        self.custom.insert(driver.into(), Arc::new(builder));
    }

    /// Build the bare client for a definition.
    pub fn build_invoker(
        &self,
        definition: &AgentDefinition,
    ) -> Result<Arc<dyn AgentInvoker>, ConfigError> {
        match definition.kind {
            AgentKind::ChatLlm => Ok(Arc::new(ChatCompletionAgent::new(
                self.client.clone(),
                definition,
            )?)),
            AgentKind::JsonrpcTool => Ok(Arc::new(JsonRpcAgent::new(
                self.client.clone(),
                definition,
            )?)),
            AgentKind::GenericHttp => Ok(Arc::new(HttpApiAgent::new(
                self.client.clone(),
                definition,
            )?)),
            AgentKind::Custom => {
                let driver = definition
                    .params
                    .get("driver")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default();
                let builder =
                    self.custom
                        .get(driver)
                        .ok_or_else(|| ConfigError::UnknownDriver {
                            driver: if driver.is_empty() {
                                "(unset)".to_string()
                            } else {
                                driver.to_string()
                            },
                        })?;
                builder(definition)
            }
        }
    }

    /// Build a client and wrap it in its resilience pipeline.
    pub fn build(
        &self,
        definition: &AgentDefinition,
        breaker_listener: Option<BreakerListener>,
    ) -> Result<AgentHandle, ConfigError> {
        let invoker = self.build_invoker(definition)?;

        let mut breaker = CircuitBreaker::new(definition.breaker.clone());
        if let Some(listener) = breaker_listener {
            breaker = breaker.with_listener(listener);
        }

        Ok(AgentHandle {
            name: definition.name.clone(),
            invoker,
            limiter: definition
                .max_concurrency
                .map(|n| Arc::new(tokio::sync::Semaphore::new(n as usize))),
            pipeline: ResiliencePipeline::new(
                definition.name.clone(),
                Arc::new(breaker),
                definition.retry.clone(),
                definition.timeout(),
            ),
        })
    }
}

impl Default for AgentFactory {
    fn default() -> Self {
        Self::new()
    }
}

/// A built agent: the bare client plus its resilience pipeline and an
/// optional concurrency limiter.
pub struct AgentHandle {
    pub name: String,
    invoker: Arc<dyn AgentInvoker>,
    limiter: Option<Arc<tokio::sync::Semaphore>>,
    pipeline: ResiliencePipeline,
}

impl AgentHandle {
    /// Invoke through the full pipeline.
    ///
    /// When the agent carries a `max_concurrency` cap, excess concurrent
    /// invocations queue here before entering the pipeline, so waiting for a
    /// slot does not consume the call's own deadline.
    pub async fn invoke(
        &self,
        action: &str,
        params: &Map<String, Value>,
        options: &CallOptions,
        cancel: &CancellationToken,
        progress: impl FnMut(AttemptProgress),
    ) -> Result<InvokeOutput, InvokeError> {
        let _permit = match &self.limiter {
            Some(limiter) => {
                let limiter = limiter.clone();
                tokio::select! {
                    _ = cancel.cancelled() => return Err(InvokeError::Cancelled),
                    permit = limiter.acquire_owned() => {
                        // The semaphore lives as long as the handle and is
                        // never closed.
                        Some(permit.expect("agent concurrency semaphore closed"))
                    }
                }
            }
            None => None,
        };

        self.pipeline
            .execute(
                self.invoker.as_ref(),
                action,
                params,
                options,
                cancel,
                progress,
            )
            .await
    }

    /// Invoke bare, with only a deadline guard. Used by the agent test
    /// endpoint, where breaker state and retries would obscure the result.
    pub async fn invoke_bare(
        &self,
        action: &str,
        params: &Map<String, Value>,
        timeout: Duration,
    ) -> Result<InvokeOutput, InvokeError> {
        match tokio::time::timeout(timeout, self.invoker.invoke_raw(action, params)).await {
            Ok(result) => result,
            Err(_elapsed) => Err(InvokeError::Timeout { timeout }),
        }
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        self.pipeline.breaker()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::BreakerPolicy;
    use crate::workflow::RetryPolicy;

    fn request() -> reqwest::RequestBuilder {
        reqwest::Client::new().post("http://localhost:1/")
    }

    #[test]
    fn bearer_auth_sets_authorization_header() {
        let req = apply_auth(
            request(),
            Some(&AuthScheme::Bearer {
                token: "tok123".into(),
            }),
        )
        .build()
        .unwrap();
        assert_eq!(req.headers()["Authorization"], "Bearer tok123");
    }

    #[test]
    fn api_key_auth_uses_configured_header() {
        let req = apply_auth(
            request(),
            Some(&AuthScheme::ApiKey {
                key: "k".into(),
                header: "X-Custom-Key".into(),
            }),
        )
        .build()
        .unwrap();
        assert_eq!(req.headers()["X-Custom-Key"], "k");
    }

    #[test]
    fn basic_auth_encodes_credentials() {
        let req = apply_auth(
            request(),
            Some(&AuthScheme::Basic {
                username: "user".into(),
                password: "pass".into(),
            }),
        )
        .build()
        .unwrap();
        // base64("user:pass")
        assert_eq!(req.headers()["Authorization"], "Basic dXNlcjpwYXNz");
    }

    #[test]
    fn no_auth_leaves_headers_untouched() {
        let req = apply_auth(request(), None).build().unwrap();
        assert!(req.headers().get("Authorization").is_none());
    }

    #[test]
    fn status_classification() {
        assert!(matches!(
            status_error(503, "unavailable"),
            InvokeError::Transport { .. }
        ));
        assert!(matches!(
            status_error(500, "boom"),
            InvokeError::Transport { .. }
        ));
        assert!(matches!(
            status_error(404, "missing"),
            InvokeError::Rejected {
                status: Some(404),
                ..
            }
        ));
        assert!(matches!(
            status_error(422, "invalid"),
            InvokeError::Rejected { .. }
        ));
    }

    #[test]
    fn unknown_custom_driver_is_a_config_error() {
        let factory = AgentFactory::new();
        let definition = AgentDefinition {
            name: "stub".into(),
            kind: AgentKind::Custom,
            endpoint: None,
            authentication: None,
            timeout: 30.0,
            retry: RetryPolicy::default(),
            breaker: BreakerPolicy::default(),
            max_concurrency: None,
            params: Map::new(),
        };
        let err = match factory.build_invoker(&definition) {
            Ok(_) => panic!("expected build_invoker to fail for unknown custom driver"),
            Err(err) => err,
        };
        assert!(matches!(err, ConfigError::UnknownDriver { .. }));
    }

    #[test]
    fn agent_response_normalizes_success_and_failure() {
        let ok: Result<InvokeOutput, InvokeError> = Ok(InvokeOutput::from_payload(
            serde_json::json!({"answer": 42}),
        ));
        let response = AgentResponse::from_outcome(&ok, Duration::from_millis(120));
        assert!(response.success);
        assert_eq!(response.result.unwrap()["answer"], 42);
        assert!(response.error.is_none());

        let err: Result<InvokeOutput, InvokeError> = Err(InvokeError::BreakerOpen {
            agent: "llm".into(),
        });
        let response = AgentResponse::from_outcome(&err, Duration::from_millis(1));
        assert!(!response.success);
        assert!(response.result.is_none());
        assert!(response.error.unwrap().contains("circuit breaker"));
    }
}
