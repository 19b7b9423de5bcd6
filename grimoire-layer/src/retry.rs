//! Retry layer with exponential backoff.

use async_trait::async_trait;
use grimoire_core::concurrency::{retry, RetryError, RetryPolicy};
use grimoire_core::error::GrimoireError;
use grimoire_core::impl_layered_provider;
use grimoire_core::layer::{Layer, LayeredProvider};
use grimoire_core::provider::Provider;
use grimoire_core::types::*;
use std::time::Duration;

/// Retry layer configuration
#[derive(Debug, Clone, Default)]
pub struct RetryLayer {
    policy: RetryPolicy,
}

impl RetryLayer {
    /// Create a new retry layer with default settings
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_policy(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    /// Total attempts, the first call included
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.policy.max_attempts = max_attempts.max(1);
        self
    }

    /// Set initial delay
    pub fn with_initial_delay(mut self, initial_delay: Duration) -> Self {
        self.policy.initial_delay = initial_delay;
        self
    }

    /// Set maximum delay
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.policy = self.policy.with_max_delay(max_delay);
        self
    }

    pub fn with_max_jitter(mut self, max_jitter: Duration) -> Self {
        self.policy = self.policy.with_max_jitter(max_jitter);
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }
}

impl<P: Provider> Layer<P> for RetryLayer {
    type LayeredProvider = RetryProvider<P>;

    fn layer(&self, inner: P) -> Self::LayeredProvider {
        RetryProvider {
            inner,
            policy: self.policy.clone(),
        }
    }
}

/// Provider wrapped with retry logic
#[derive(Debug)]
pub struct RetryProvider<P> {
    inner: P,
    policy: RetryPolicy,
}

#[async_trait]
impl<P: Provider> LayeredProvider for RetryProvider<P> {
    type Inner = P;

    fn inner(&self) -> &Self::Inner {
        &self.inner
    }

    async fn layered_chat_completion(
        &self,
        req: ChatCompletionRequest,
    ) -> Result<ChatCompletionResponse, GrimoireError> {
        let req = &req;
        let inner = &self.inner;
        let result = retry(&self.policy, GrimoireError::is_retryable, move || {
            inner.chat_completion(req.clone())
        })
        .await;

        result.map_err(|err| match err {
            RetryError::Exhausted { attempts, last } if attempts > 1 => {
                tracing::warn!(
                    provider = %inner.info().id,
                    attempts,
                    error = %last,
                    "giving up after retries"
                );
                GrimoireError::RetryExhausted {
                    attempts,
                    last: Box::new(last),
                }
            }
            other => other.into_inner(),
        })
    }
}

impl_layered_provider!(impl<P> for RetryProvider<P>);
