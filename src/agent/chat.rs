//! Chat-completion (LLM) agent client.
//!
//! Speaks the OpenAI-style chat completions shape: the request body is the
//! agent's default params (model, max_tokens, temperature, ...) overlaid
//! with the task's params, posted as JSON to the configured endpoint.

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use crate::agent::{apply_auth, status_error, transport_error, AgentInvoker, InvokeOutput};
use crate::error::{ConfigError, InvokeError};
use crate::workflow::{AgentDefinition, AuthScheme};

pub struct ChatCompletionAgent {
    name: String,
    client: reqwest::Client,
    endpoint: String,
    auth: Option<AuthScheme>,
    /// Agent-level request defaults (model name etc.); task params win on
    /// conflict.
    defaults: Map<String, Value>,
}

impl ChatCompletionAgent {
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
            defaults: definition.params.clone(),
        })
    }

    /// Build the request body: defaults ∪ params, with `messages` synthesized
    /// from `prompt` when not given explicitly.
    fn build_body(&self, params: &Map<String, Value>) -> Map<String, Value> {
        let mut body = self.defaults.clone();
        for (key, value) in params {
            body.insert(key.clone(), value.clone());
        }

        if !body.contains_key("messages") {
            if let Some(prompt) = body.remove("prompt") {
                body.insert(
                    "messages".to_string(),
                    json!([{ "role": "user", "content": prompt }]),
                );
            }
        }

        body
    }
}

/// Pull `choices[0].message.content` out of a chat-completion response body.
fn first_choice_content(body: &Value) -> Option<&str> {
    body.get("choices")?
        .get(0)?
        .get("message")?
        .get("content")?
        .as_str()
}

#[async_trait]
impl AgentInvoker for ChatCompletionAgent {
    async fn invoke_raw(
        &self,
        action: &str,
        params: &Map<String, Value>,
    ) -> Result<InvokeOutput, InvokeError> {
        let body = self.build_body(params);

        tracing::debug!(agent = %self.name, %action, "Posting chat completion request");

        let response = apply_auth(self.client.post(&self.endpoint), self.auth.as_ref())
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_error(&self.name, e))?;

        let status = response.status().as_u16();
        let text = response.text().await.unwrap_or_default();

        if !(200..300).contains(&status) {
            return Err(status_error(status, &text));
        }

        let parsed: Value = serde_json::from_str(&text).map_err(|e| InvokeError::Transport {
            reason: format!("{}: invalid JSON in response: {e}", self.name),
        })?;

        let mut output = if action == "chat_completion" {
            // Lift the assistant's text to the top level; keep the rest of
            // the envelope in metadata.
            match first_choice_content(&parsed) {
                Some(content) => {
                    let mut output = InvokeOutput::from_payload(Value::String(content.to_string()));
                    if let Some(model) = parsed.get("model") {
                        output = output.with_metadata("model", model.clone());
                    }
                    if let Some(usage) = parsed.get("usage") {
                        output = output.with_metadata("usage", usage.clone());
                    }
                    output
                }
                None => InvokeOutput::from_payload(parsed),
            }
        } else {
            InvokeOutput::from_payload(parsed)
        };

        output = output.with_metadata("status_code", status);
        Ok(output)
    }
}
