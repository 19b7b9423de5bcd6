//! Client for OpenAI and OpenAI-compatible chat endpoints.
//!
//! DeepSeek, vLLM and LM Studio speak the same protocol; point the builder
//! at their base URL with [`OpenAiBuilder::api_base`].

use async_openai::config::OpenAIConfig;
use async_openai::error::{ApiError, OpenAIError};
use async_openai::types::{
    ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
    ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
    CreateChatCompletionRequest, CreateChatCompletionRequestArgs, CreateChatCompletionResponse,
    FinishReason as WireFinishReason, Role as WireRole,
};
use async_openai::Client;
use async_trait::async_trait;
use grimoire_core::error::{BackendError, GrimoireError};
use grimoire_core::provider::Provider;
use grimoire_core::types::*;
use std::sync::Arc;

#[derive(Clone)]
pub struct OpenAiProvider {
    client: Client<OpenAIConfig>,
    info: Arc<ProviderInfo>,
}

impl std::fmt::Debug for OpenAiProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // the client config holds the key
        f.debug_struct("OpenAiProvider")
            .field("id", &self.info.id)
            .finish_non_exhaustive()
    }
}

impl OpenAiProvider {
    /// The public OpenAI endpoint with the given key.
    pub fn new(api_key: impl Into<String>) -> Self {
        Self::from_parts(
            "openai",
            "OpenAI",
            OpenAIConfig::new().with_api_key(api_key),
        )
    }

    /// Start configuring a provider registered under `id`.
    pub fn builder(id: impl Into<String>) -> OpenAiBuilder {
        OpenAiBuilder::new(id)
    }

    fn from_parts(id: impl Into<String>, name: impl Into<String>, config: OpenAIConfig) -> Self {
        Self {
            client: Client::with_config(config),
            info: Arc::new(ProviderInfo {
                id: id.into(),
                name: name.into(),
            }),
        }
    }

    #[allow(deprecated)]
    fn build_request(
        &self,
        req: &ChatCompletionRequest,
    ) -> Result<CreateChatCompletionRequest, GrimoireError> {
        let messages = req
            .messages
            .iter()
            .map(wire_message)
            .collect::<Result<Vec<_>, _>>()?;

        let mut args = CreateChatCompletionRequestArgs::default();
        args.model(&req.model).messages(messages);
        if let Some(temperature) = req.temperature {
            args.temperature(temperature);
        }
        if let Some(top_p) = req.top_p {
            args.top_p(top_p);
        }
        if let Some(max_tokens) = req.max_tokens {
            args.max_tokens(max_tokens);
        }
        if let Some(stop) = &req.stop {
            args.stop(stop.clone());
        }
        if !req.extra.is_empty() {
            tracing::debug!(
                provider = %self.info.id,
                ignored = ?req.extra.keys().collect::<Vec<_>>(),
                "extra parameters are not sent to OpenAI-compatible endpoints"
            );
        }

        args.build().map_err(|e| {
            GrimoireError::invalid_request(format!("Invalid chat request for {}: {e}", req.model))
        })
    }
}

fn wire_message(msg: &ChatMessage) -> Result<ChatCompletionRequestMessage, GrimoireError> {
    let invalid = |e: OpenAIError| {
        GrimoireError::invalid_request(format!("Invalid {} message: {e}", msg.role.as_str()))
    };
    let content = msg.content.clone();

    Ok(match msg.role {
        Role::System => ChatCompletionRequestSystemMessageArgs::default()
            .content(content)
            .build()
            .map_err(invalid)?
            .into(),
        Role::User => ChatCompletionRequestUserMessageArgs::default()
            .content(content)
            .build()
            .map_err(invalid)?
            .into(),
        Role::Assistant => ChatCompletionRequestAssistantMessageArgs::default()
            .content(content)
            .build()
            .map_err(invalid)?
            .into(),
    })
}

fn finish_reason(reason: Option<WireFinishReason>) -> FinishReason {
    match reason {
        None | Some(WireFinishReason::Stop) => FinishReason::Stop,
        Some(WireFinishReason::Length) => FinishReason::Length,
        Some(WireFinishReason::ContentFilter) => FinishReason::ContentFilter,
        Some(other) => FinishReason::Other(format!("{other:?}").to_lowercase()),
    }
}

fn from_wire(response: CreateChatCompletionResponse) -> ChatCompletionResponse {
    let choices = response
        .choices
        .into_iter()
        .map(|choice| {
            let role = match choice.message.role {
                WireRole::System => Role::System,
                WireRole::User => Role::User,
                _ => Role::Assistant,
            };
            Choice {
                index: choice.index,
                message: ChatMessage::new(role, choice.message.content.unwrap_or_default()),
                finish_reason: finish_reason(choice.finish_reason),
            }
        })
        .collect();

    let usage = response
        .usage
        .map(|u| Usage {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
            total_tokens: u.total_tokens,
        })
        .unwrap_or_default();

    ChatCompletionResponse {
        id: response.id,
        model: response.model,
        choices,
        usage,
        created: Some(response.created as u64),
    }
}

/// Classify an async-openai failure so retry decisions can be made on it.
fn map_openai_error(err: OpenAIError) -> GrimoireError {
    let backend = match err {
        OpenAIError::Reqwest(e) => {
            if e.is_timeout() {
                BackendError::Timeout(e.to_string())
            } else if let Some(status) = e.status() {
                BackendError::from_status(status.as_u16(), e.to_string())
            } else {
                BackendError::Network(e.to_string())
            }
        }
        OpenAIError::ApiError(api) => classify_api_error(&api),
        other => BackendError::Provider(other.to_string()),
    };
    GrimoireError::Backend(backend)
}

fn classify_api_error(api: &ApiError) -> BackendError {
    let kind = api.r#type.as_deref().unwrap_or_default().to_ascii_lowercase();
    let message = api.message.clone();

    if kind.contains("rate_limit") || kind == "requests" || kind == "tokens" {
        BackendError::RateLimited(message)
    } else if kind.contains("server") || kind.contains("overloaded") {
        BackendError::Server {
            status: 500,
            message,
        }
    } else if kind.contains("auth") || kind.contains("permission") {
        BackendError::Authentication(message)
    } else {
        BackendError::InvalidRequest(message)
    }
}

#[async_trait]
impl Provider for OpenAiProvider {
    fn info(&self) -> Arc<ProviderInfo> {
        self.info.clone()
    }

    async fn chat_completion(
        &self,
        req: ChatCompletionRequest,
    ) -> Result<ChatCompletionResponse, GrimoireError> {
        let request = self.build_request(&req)?;
        let response = self
            .client
            .chat()
            .create(request)
            .await
            .map_err(map_openai_error)?;
        Ok(from_wire(response))
    }
}

/// Configures one OpenAI-compatible endpoint.
pub struct OpenAiBuilder {
    id: String,
    name: Option<String>,
    api_key: Option<String>,
    api_base: Option<String>,
    org_id: Option<String>,
}

impl OpenAiBuilder {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            api_key: None,
            api_base: None,
            org_id: None,
        }
    }

    /// Display name; defaults to the id.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = Some(api_base.into());
        self
    }

    pub fn organization(mut self, org_id: impl Into<String>) -> Self {
        self.org_id = Some(org_id.into());
        self
    }

    /// Fails with a configuration error when no key was given. Pass an
    /// empty key for endpoints that accept anonymous requests.
    pub fn build(self) -> Result<OpenAiProvider, GrimoireError> {
        let api_key = self.api_key.ok_or_else(|| {
            GrimoireError::configuration(format!("provider {} needs an API key", self.id))
        })?;

        let mut config = OpenAIConfig::new().with_api_key(api_key);
        if let Some(api_base) = self.api_base {
            config = config.with_api_base(api_base);
        }
        if let Some(org_id) = self.org_id {
            config = config.with_org_id(org_id);
        }

        let name = self.name.unwrap_or_else(|| self.id.clone());
        Ok(OpenAiProvider::from_parts(self.id, name, config))
    }
}
