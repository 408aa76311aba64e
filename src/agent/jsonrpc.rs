//! JSON-RPC 2.0 tool-server agent client.
//!
//! The task's action becomes the RPC method and the task params become the
//! RPC params. Request ids increase monotonically per agent instance and are
//! echoed into the output metadata.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use crate::agent::{apply_auth, status_error, transport_error, AgentInvoker, InvokeOutput};
use crate::error::{ConfigError, InvokeError};
use crate::workflow::{AgentDefinition, AuthScheme};

pub struct JsonRpcAgent {
    name: String,
    client: reqwest::Client,
    endpoint: String,
    auth: Option<AuthScheme>,
    next_id: AtomicU64,
}

impl JsonRpcAgent {
    pub fn new(client: reqwest::Client, definition: &AgentDefinition) -> Result<Self, ConfigError> {
        let endpoint = definition
            .endpoint
            .clone()
            .ok_or_else(|| ConfigError::MissingEndpoint {
                agent: definition.name.clone(),
                kind: definition.kind.to_string(),
            })?;

        Ok(Self {
            name: definition.name.clone(),
            client,
            endpoint,
            auth: definition.authentication.clone(),
            next_id: AtomicU64::new(1),
        })
    }
}

/// Whether a JSON-RPC error code describes a server-side fault worth
/// retrying. Parse/request/method/params errors (-32700..-32600 range) are
/// caller mistakes; the internal-error and implementation-defined server
/// range is transient.
fn is_server_fault(code: i64) -> bool {
    code == -32603 || (-32099..=-32000).contains(&code)
}

#[async_trait]
impl AgentInvoker for JsonRpcAgent {
    async fn invoke_raw(
        &self,
        action: &str,
        params: &Map<String, Value>,
    ) -> Result<InvokeOutput, InvokeError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": action,
            "params": Value::Object(params.clone()),
        });

        tracing::debug!(agent = %self.name, method = %action, id, "Sending JSON-RPC request");

        let response = apply_auth(self.client.post(&self.endpoint), self.auth.as_ref())
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(|e| transport_error(&self.name, e))?;

        let status = response.status().as_u16();
        let text = response.text().await.unwrap_or_default();

        if !(200..300).contains(&status) {
            return Err(status_error(status, &text));
        }

        let body: Value = serde_json::from_str(&text).map_err(|e| InvokeError::Transport {
            reason: format!("{}: invalid JSON-RPC response: {e}", self.name),
        })?;

        if let Some(error) = body.get("error") {
            let code = error.get("code").and_then(Value::as_i64).unwrap_or(0);
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error");
            let reason = format!("RPC error {code}: {message}");

            return if is_server_fault(code) {
                Err(InvokeError::Transport { reason })
            } else {
                Err(InvokeError::Rejected {
                    status: None,
                    reason,
                })
            };
        }

        let result = body.get("result").cloned().unwrap_or(Value::Null);
        Ok(InvokeOutput::from_payload(result)
            .with_metadata("status_code", status)
            .with_metadata("jsonrpc_id", id))
    }
}
