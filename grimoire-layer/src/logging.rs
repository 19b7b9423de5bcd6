//! Logging layer for provider operations.

use async_trait::async_trait;
use grimoire_core::error::GrimoireError;
use grimoire_core::impl_layered_provider;
use grimoire_core::layer::{Layer, LayeredProvider};
use grimoire_core::provider::Provider;
use grimoire_core::types::*;
use std::time::Instant;

/// Logging layer that logs provider operations.
#[derive(Debug, Clone)]
pub struct LoggingLayer {
    target: String,
}

impl LoggingLayer {
    /// Create a new logging layer
    pub fn new() -> Self {
        Self {
            target: "provider".to_string(),
        }
    }

    /// Label carried in the `component` field of every event
    pub fn with_target(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
        }
    }
}

impl Default for LoggingLayer {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: Provider> Layer<P> for LoggingLayer {
    type LayeredProvider = LoggingProvider<P>;

    fn layer(&self, inner: P) -> Self::LayeredProvider {
        LoggingProvider {
            inner,
            target: self.target.clone(),
        }
    }
}

/// Provider wrapped with logging
#[derive(Debug)]
pub struct LoggingProvider<P> {
    inner: P,
    target: String,
}

#[async_trait]
impl<P: Provider> LayeredProvider for LoggingProvider<P> {
    type Inner = P;

    fn inner(&self) -> &Self::Inner {
        &self.inner
    }

    async fn layered_chat_completion(
        &self,
        req: ChatCompletionRequest,
    ) -> Result<ChatCompletionResponse, GrimoireError> {
        let provider = self.inner.info().id.clone();
        let model = req.model.clone();
        tracing::debug!(
            component = %self.target,
            provider = %provider,
            model = %model,
            messages = req.messages.len(),
            "chat_completion request"
        );

        let start = Instant::now();
        let result = self.inner.chat_completion(req).await;
        let elapsed_ms = start.elapsed().as_millis() as u64;

        match &result {
            Ok(response) => {
                tracing::debug!(
                    component = %self.target,
                    provider = %provider,
                    model = %model,
                    response_id = %response.id,
                    total_tokens = response.usage.total_tokens,
                    elapsed_ms,
                    "chat_completion success"
                );
            }
            Err(e) => {
                tracing::error!(
                    component = %self.target,
                    provider = %provider,
                    model = %model,
                    error_kind = e.kind(),
                    error = %e,
                    elapsed_ms,
                    "chat_completion error"
                );
            }
        }

        result
    }
}

impl_layered_provider!(impl<P> for LoggingProvider<P>);
