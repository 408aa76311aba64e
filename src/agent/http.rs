//! Generic HTTP agent client.
//!
//! Drives an arbitrary REST API. The task params describe the request:
//! `method` (default POST), `endpoint` (path appended to the agent's base
//! URL), `body` (JSON, sent for POST/PUT/PATCH), `query` (string map), and
//! `headers` (string map, merged after the auth scheme).

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::agent::{apply_auth, status_error, transport_error, AgentInvoker, InvokeOutput};
use crate::error::{ConfigError, InvokeError};
use crate::workflow::{AgentDefinition, AuthScheme};

pub struct HttpApiAgent {
    name: String,
    client: reqwest::Client,
    base_url: String,
    auth: Option<AuthScheme>,
}

impl HttpApiAgent {
    pub fn new(client: reqwest::Client, definition: &AgentDefinition) -> Result<Self, ConfigError> {
        let base_url = definition
            .endpoint
            .clone()
            .ok_or_else(|| ConfigError::MissingEndpoint {
                agent: definition.name.clone(),
                kind: definition.kind.to_string(),
            })?;

        Ok(Self {
            name: definition.name.clone(),
            client,
            base_url,
            auth: definition.authentication.clone(),
        })
    }
}

/// Render a JSON scalar as a query-string value.
fn query_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[async_trait]
impl AgentInvoker for HttpApiAgent {
    async fn invoke_raw(
        &self,
        _action: &str,
        params: &Map<String, Value>,
    ) -> Result<InvokeOutput, InvokeError> {
        let method_str = params
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or("POST")
            .to_ascii_uppercase();
        let method: reqwest::Method =
            method_str
                .parse()
                .map_err(|_| InvokeError::Rejected {
                    status: None,
                    reason: format!("invalid HTTP method '{method_str}'"),
                })?;

        let path = params
            .get("endpoint")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let url = format!("{}{}", self.base_url, path);

        let mut request = apply_auth(self.client.request(method.clone(), &url), self.auth.as_ref());

        if let Some(Value::Object(query)) = params.get("query") {
            let pairs: Vec<(String, String)> = query
                .iter()
                .map(|(k, v)| (k.clone(), query_value(v)))
                .collect();
            request = request.query(&pairs);
        }

        if let Some(Value::Object(headers)) = params.get("headers") {
            for (name, value) in headers {
                if let Some(value) = value.as_str() {
                    request = request.header(name.as_str(), value);
                }
            }
        }

        let has_body = method == reqwest::Method::POST
            || method == reqwest::Method::PUT
            || method == reqwest::Method::PATCH;
        if has_body {
            if let Some(body) = params.get("body") {
                request = request.json(body);
            }
        }

        tracing::debug!(agent = %self.name, %method_str, %url, "Sending HTTP request");

        let response = request
            .send()
            .await
            .map_err(|e| transport_error(&self.name, e))?;

        let status = response.status().as_u16();
        let final_url = response.url().to_string();
        let is_json = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|ct| ct.contains("json"))
            .unwrap_or(false);
        let text = response.text().await.unwrap_or_default();

        if !(200..300).contains(&status) {
            return Err(status_error(status, &text));
        }

        // JSON bodies are parsed; anything else is handed back verbatim.
        let payload = if is_json {
            serde_json::from_str(&text).unwrap_or(Value::String(text))
        } else {
            Value::String(text)
        };

        Ok(InvokeOutput::from_payload(payload)
            .with_metadata("status_code", status)
            .with_metadata("method", method_str)
            .with_metadata("url", final_url))
    }
}
