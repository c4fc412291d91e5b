//! Client for the external text-generation service
//!
//! [`GenerationClient`] is the seam the retry layer wraps. The HTTP
//! implementation speaks a messages-style JSON API.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::debug;

use crate::config::GenerationConfig;
use crate::error::{ServerError, ServerResult};

/// Parameters of one generation call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    /// User prompt
    pub prompt: String,
    /// Optional system prompt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    /// Upper bound on generated tokens
    pub max_tokens: u32,
    /// Sampling temperature
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    /// Model override; the client default is used when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl GenerationRequest {
    /// Request with just a prompt and a token budget
    pub fn new(prompt: impl Into<String>, max_tokens: u32) -> Self {
        Self {
            prompt: prompt.into(),
            system: None,
            max_tokens,
            temperature: None,
            model: None,
        }
    }
}

/// Token accounting reported by the service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Usage {
    /// Prompt tokens
    pub input_tokens: u32,
    /// Generated tokens
    pub output_tokens: u32,
}

/// Result of one generation call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationResponse {
    /// Generated text
    pub text: String,
    /// Model that produced the text
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Token usage
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

/// Failure of one generation call
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{message}")]
pub struct GenerationError {
    /// HTTP-like status, when the service answered
    pub status: Option<u16>,
    /// Machine-readable error code
    pub code: Option<String>,
    /// Human-readable description
    pub message: String,
}

impl GenerationError {
    /// Error with only a message
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            status: None,
            code: None,
            message: message.into(),
        }
    }

    /// Set the status
    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    /// Set the error code
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// The attempt did not finish in time
    pub fn timeout(after_ms: u64) -> Self {
        Self::new(format!("Generation attempt timed out after {}ms", after_ms)).with_code("timeout")
    }

    /// The service reported success but returned no text
    pub fn empty_response() -> Self {
        Self::new("Generation service returned an empty response").with_code("empty_response")
    }

    /// The request never got an answer
    pub fn transport(detail: impl Into<String>) -> Self {
        Self::new(format!("Transport error: {}", detail.into())).with_code("temporary_failure")
    }
}

/// A text-generation backend
#[async_trait]
pub trait GenerationClient: Send + Sync {
    /// Run one generation call
    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationResponse, GenerationError>;
}

/// [`GenerationClient`] over HTTP
pub struct HttpGenerationClient {
    http: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    api_version: String,
    default_model: String,
    request_timeout_ms: u64,
}

impl HttpGenerationClient {
    /// Build a client from configuration
    pub fn new(config: &GenerationConfig) -> ServerResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .map_err(|e| ServerError::ConfigError(format!("Invalid HTTP client settings: {}", e)))?;

        Ok(Self {
            http,
            endpoint: format!("{}/v1/messages", config.base_url.trim_end_matches('/')),
            api_key: config.api_key.clone(),
            api_version: config.api_version.clone(),
            default_model: config.model.clone(),
            request_timeout_ms: config.request_timeout_ms,
        })
    }

    fn body(&self, request: &GenerationRequest) -> Value {
        let mut body = json!({
            "model": request.model.as_deref().unwrap_or(&self.default_model),
            "max_tokens": request.max_tokens,
            "messages": [{ "role": "user", "content": request.prompt }],
        });
        if let Some(system) = &request.system {
            body["system"] = json!(system);
        }
        if let Some(temperature) = request.temperature {
            body["temperature"] = json!(temperature);
        }
        body
    }

    fn map_transport_error(&self, err: reqwest::Error) -> GenerationError {
        if err.is_timeout() {
            GenerationError::timeout(self.request_timeout_ms)
        } else {
            GenerationError::transport(err.to_string())
        }
    }
}

#[derive(Deserialize)]
struct MessagesReply {
    #[serde(default)]
    content: Vec<ContentBlock>,
    model: Option<String>,
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

/// Turn a non-2xx answer into a [`GenerationError`]
///
/// Understands `{"error": {"type": ..., "message": ...}}` bodies and falls
/// back to the raw body text.
pub fn error_from_response(status: u16, body: &str) -> GenerationError {
    let parsed: Option<Value> = serde_json::from_str(body).ok();
    let detail = parsed.as_ref().and_then(|v| v.get("error"));

    let code = detail
        .and_then(|e| e.get("type").or_else(|| e.get("code")))
        .and_then(Value::as_str)
        .map(str::to_string);
    let message = detail
        .and_then(|e| e.get("message"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| {
            if body.trim().is_empty() {
                format!("Generation service returned status {}", status)
            } else {
                body.trim().to_string()
            }
        });

    GenerationError {
        status: Some(status),
        code,
        message,
    }
}

#[async_trait]
impl GenerationClient for HttpGenerationClient {
    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationResponse, GenerationError> {
        let mut call = self
            .http
            .post(&self.endpoint)
            .header("anthropic-version", &self.api_version)
            .json(&self.body(request));
        if let Some(key) = &self.api_key {
            call = call.header("x-api-key", key);
        }

        let response = call.send().await.map_err(|e| self.map_transport_error(e))?;
        let status = response.status();
        let text = response.text().await.map_err(|e| self.map_transport_error(e))?;

        if !status.is_success() {
            debug!(status = status.as_u16(), "Generation service returned an error");
            return Err(error_from_response(status.as_u16(), &text));
        }

        let reply: MessagesReply = serde_json::from_str(&text).map_err(|e| {
            GenerationError::new(format!("Malformed generation response: {}", e))
                .with_status(status.as_u16())
                .with_code("invalid_response")
        })?;

        let text: String = reply
            .content
            .iter()
            .filter(|block| block.kind == "text")
            .filter_map(|block| block.text.as_deref())
            .collect();

        Ok(GenerationResponse {
            text,
            model: reply.model,
            usage: reply.usage,
        })
    }
}
