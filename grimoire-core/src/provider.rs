//! Provider trait for remote generation backends.

use crate::error::GrimoireError;
use crate::types::*;
use async_trait::async_trait;
use std::fmt::Debug;
use std::sync::Arc;

/// Core provider trait for hosted AI services.
///
/// Providers implement the chat completion call; the dispatcher only needs
/// the generated text, which [`Provider::complete`] extracts.
#[async_trait]
pub trait Provider: Send + Sync + Debug + 'static {
    /// Get provider information
    fn info(&self) -> Arc<ProviderInfo>;

    /// Chat completion (non-streaming)
    async fn chat_completion(
        &self,
        req: ChatCompletionRequest,
    ) -> Result<ChatCompletionResponse, GrimoireError>;

    /// Generate a reply for `messages` and return its text.
    async fn complete(
        &self,
        model: &str,
        messages: Vec<ChatMessage>,
        params: &ModelParameters,
    ) -> Result<String, GrimoireError> {
        let req = ChatCompletionRequest::new(model, messages).with_parameters(params);
        let response = self.chat_completion(req).await?;

        response
            .text()
            .map(str::to_string)
            .ok_or_else(|| GrimoireError::provider("No choices in response"))
    }
}

#[async_trait]
impl<P: Provider + ?Sized> Provider for Arc<P> {
    fn info(&self) -> Arc<ProviderInfo> {
        (**self).info()
    }

    async fn chat_completion(
        &self,
        req: ChatCompletionRequest,
    ) -> Result<ChatCompletionResponse, GrimoireError> {
        (**self).chat_completion(req).await
    }

    async fn complete(
        &self,
        model: &str,
        messages: Vec<ChatMessage>,
        params: &ModelParameters,
    ) -> Result<String, GrimoireError> {
        (**self).complete(model, messages, params).await
    }
}
