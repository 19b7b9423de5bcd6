//! Ollama provider over its native `/api/chat` endpoint.

use async_trait::async_trait;
use grimoire_core::error::{BackendError, GrimoireError};
use grimoire_core::provider::Provider;
use grimoire_core::types::*;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;

/// Where a stock Ollama install listens.
pub const DEFAULT_OLLAMA_BASE: &str = "http://localhost:11434";

/// Provider for a local or remote Ollama server. Needs no API key.
#[derive(Debug, Clone)]
pub struct OllamaProvider {
    client: reqwest::Client,
    api_base: String,
    info: Arc<ProviderInfo>,
}

impl Default for OllamaProvider {
    fn default() -> Self {
        Self::new(DEFAULT_OLLAMA_BASE)
    }
}

impl OllamaProvider {
    pub fn new(api_base: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), api_base)
    }

    /// Use a preconfigured client, e.g. one with a request timeout.
    pub fn with_client(client: reqwest::Client, api_base: impl Into<String>) -> Self {
        Self {
            client,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            info: Arc::new(ProviderInfo {
                id: "ollama".to_string(),
                name: "Ollama".to_string(),
            }),
        }
    }

    /// Build a provider whose HTTP requests give up after `timeout`.
    pub fn with_timeout(
        api_base: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, GrimoireError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GrimoireError::configuration(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self::with_client(client, api_base))
    }

    pub fn api_base(&self) -> &str {
        &self.api_base
    }

    fn chat_url(&self) -> String {
        format!("{}/api/chat", self.api_base)
    }
}

#[derive(Debug, Serialize)]
struct OllamaChatRequest<'a> {
    model: &'a str,
    messages: Vec<OllamaMessage>,
    stream: bool,
    #[serde(skip_serializing_if = "Map::is_empty")]
    options: Map<String, Value>,
}

#[derive(Debug, Serialize, Deserialize)]
struct OllamaMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct OllamaChatResponse {
    model: String,
    #[serde(default)]
    created_at: Option<String>,
    message: OllamaMessage,
    #[serde(default)]
    done_reason: Option<String>,
    #[serde(default)]
    prompt_eval_count: Option<u32>,
    #[serde(default)]
    eval_count: Option<u32>,
}

fn build_request(req: &ChatCompletionRequest) -> OllamaChatRequest<'_> {
    let mut options = Map::new();
    if let Some(temperature) = req.temperature {
        options.insert("temperature".into(), Value::from(temperature));
    }
    if let Some(top_p) = req.top_p {
        options.insert("top_p".into(), Value::from(top_p));
    }
    if let Some(max_tokens) = req.max_tokens {
        options.insert("num_predict".into(), Value::from(max_tokens));
    }
    if let Some(stop) = &req.stop {
        options.insert("stop".into(), Value::from(stop.clone()));
    }
    for (key, value) in &req.extra {
        options.insert(key.clone(), value.clone());
    }

    OllamaChatRequest {
        model: &req.model,
        messages: req
            .messages
            .iter()
            .map(|m| OllamaMessage {
                role: m.role.as_str().to_string(),
                content: m.content.clone(),
            })
            .collect(),
        stream: false,
        options,
    }
}

fn convert_response(response: OllamaChatResponse) -> ChatCompletionResponse {
    let finish_reason = match response.done_reason.as_deref() {
        None | Some("stop") => FinishReason::Stop,
        Some("length") => FinishReason::Length,
        Some(other) => FinishReason::Other(other.to_string()),
    };
    let prompt_tokens = response.prompt_eval_count.unwrap_or_default();
    let completion_tokens = response.eval_count.unwrap_or_default();

    ChatCompletionResponse {
        id: response
            .created_at
            .map(|at| format!("ollama-{at}"))
            .unwrap_or_else(|| "ollama".to_string()),
        model: response.model,
        choices: vec![Choice {
            index: 0,
            message: ChatMessage::assistant(response.message.content),
            finish_reason,
        }],
        usage: Usage {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        },
        created: None,
    }
}

#[async_trait]
impl Provider for OllamaProvider {
    fn info(&self) -> Arc<ProviderInfo> {
        self.info.clone()
    }

    async fn chat_completion(
        &self,
        req: ChatCompletionRequest,
    ) -> Result<ChatCompletionResponse, GrimoireError> {
        let body = build_request(&req);
        let response = self
            .client
            .post(self.chat_url())
            .json(&body)
            .send()
            .await
            .map_err(BackendError::from)?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(BackendError::from_status(status.as_u16(), text).into());
        }

        let parsed: OllamaChatResponse = response.json().await.map_err(|e| {
            GrimoireError::provider(format!("Unexpected Ollama response: {e}"))
        })?;
        Ok(convert_response(parsed))
    }
}
