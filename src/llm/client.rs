//! HTTP invoker for OpenAI-compatible chat completion APIs.
//!
//! Performs a single non-streaming request per call. Retries live in
//! [`super::invoker::RetryingInvoker`].

use super::invoker::Invoker;
use super::request::{CompletionRequest, CompletionResponse, ToolDefinition, Usage};
use crate::config::LlmConfig;
use crate::error::InvokeError;
use crate::util::truncate;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use url::Url;

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
    stream: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<WireTool<'a>>,
}

#[derive(Serialize)]
struct WireMessage<'a> {
    role: &'a str,
    content: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<&'a str>,
}

#[derive(Serialize)]
struct WireTool<'a> {
    #[serde(rename = "type")]
    tool_type: &'static str,
    function: &'a ToolDefinition,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct Choice {
    message: MessageContent,
}

#[derive(Deserialize)]
struct MessageContent {
    /// Content can be null in some API responses (e.g., when refusal or error occurs)
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    refusal: Option<String>,
}

/// Some gateways return errors with a 200 status.
#[derive(Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Deserialize)]
struct ErrorBody {
    message: String,
    #[serde(default)]
    code: Option<u16>,
}

pub struct HttpInvoker {
    client: reqwest::Client,
    endpoint: Url,
    /// Without a key every call fails with [`InvokeError::NotConfigured`].
    api_key: Option<String>,
    api_key_env: String,
}

impl HttpInvoker {
    pub fn new(config: &LlmConfig, api_key: Option<String>) -> anyhow::Result<Self> {
        let mut base = Url::parse(&config.base_url)
            .map_err(|e| anyhow::anyhow!("Invalid LLM base URL `{}`: {}", config.base_url, e))?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let endpoint = base.join("chat/completions")?;
        Ok(Self {
            client: create_http_client(config.timeout_secs)?,
            endpoint,
            api_key,
            api_key_env: config.api_key_env.clone(),
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    async fn send(&self, request: &CompletionRequest) -> Result<CompletionResponse, InvokeError> {
        let api_key = self.api_key.as_deref().ok_or_else(|| {
            InvokeError::NotConfigured(format!(
                "no API key found; set {} (or ATLAS_API_KEY)",
                self.api_key_env
            ))
        })?;
        let body = build_body(request);
        let response = self
            .client
            .post(self.endpoint.clone())
            .header("Content-Type", "application/json")
            .header("X-Title", "atlas")
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await
            .map_err(map_network_error)?;

        let status = response.status();
        let text = response.text().await.map_err(map_network_error)?;
        parse_response(status.as_u16(), &text)
    }
}

impl Invoker for HttpInvoker {
    fn complete<'a>(
        &'a self,
        request: &'a CompletionRequest,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<CompletionResponse, InvokeError>> {
        Box::pin(async move {
            tokio::select! {
                _ = cancel.cancelled() => Err(InvokeError::Cancelled),
                result = self.send(request) => result,
            }
        })
    }
}

/// Create a configured HTTP client for model requests
pub(crate) fn create_http_client(timeout_secs: u64) -> anyhow::Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| anyhow::anyhow!("Failed to create HTTP client: {}", e))
}

fn build_body(request: &CompletionRequest) -> ChatRequest<'_> {
    let mut messages = Vec::with_capacity(request.messages.len() + 1);
    if !request.system_prompt.trim().is_empty() {
        messages.push(WireMessage {
            role: "system",
            content: &request.system_prompt,
            tool_call_id: None,
        });
    }
    messages.extend(request.messages.iter().map(|m| WireMessage {
        role: &m.role,
        content: &m.content,
        tool_call_id: m.tool_call_id.as_deref(),
    }));

    ChatRequest {
        model: &request.model,
        messages,
        max_tokens: request.max_tokens,
        temperature: request.temperature,
        stream: false,
        tools: request
            .tools
            .iter()
            .map(|function| WireTool {
                tool_type: "function",
                function,
            })
            .collect(),
    }
}

fn map_network_error(err: reqwest::Error) -> InvokeError {
    if err.is_timeout() {
        InvokeError::Network(format!("request timed out: {}", err))
    } else {
        InvokeError::Network(err.to_string())
    }
}

fn parse_response(status: u16, text: &str) -> Result<CompletionResponse, InvokeError> {
    if status == 429 {
        return Err(InvokeError::RateLimited(truncate(text, 200)));
    }
    if !(200..300).contains(&status) {
        return Err(InvokeError::Status {
            status,
            body: truncate(text, 200),
        });
    }

    if let Ok(envelope) = serde_json::from_str::<ErrorEnvelope>(text) {
        return Err(match envelope.error.code {
            Some(429) => InvokeError::RateLimited(envelope.error.message),
            Some(code) => InvokeError::Status {
                status: code,
                body: truncate(&envelope.error.message, 200),
            },
            None => InvokeError::Status {
                status: 502,
                body: truncate(&envelope.error.message, 200),
            },
        });
    }

    let parsed: ChatResponse =
        serde_json::from_str(text).map_err(|e| InvokeError::Malformed(e.to_string()))?;
    let message = parsed
        .choices
        .into_iter()
        .next()
        .map(|c| c.message)
        .ok_or_else(|| InvokeError::Malformed("response has no choices".to_string()))?;

    match message.content {
        Some(content) if !content.trim().is_empty() => Ok(CompletionResponse {
            content,
            usage: parsed.usage,
            cached: false,
        }),
        _ => Err(InvokeError::Malformed(match message.refusal {
            Some(refusal) => format!("model refused: {}", truncate(&refusal, 200)),
            None => "response content is empty".to_string(),
        })),
    }
}
