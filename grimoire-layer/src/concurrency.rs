//! Concurrency limit layer.

use async_trait::async_trait;
use grimoire_core::concurrency::Semaphore;
use grimoire_core::error::GrimoireError;
use grimoire_core::impl_layered_provider;
use grimoire_core::layer::{Layer, LayeredProvider};
use grimoire_core::provider::Provider;
use grimoire_core::types::*;

/// Caps how many requests may be in flight to the wrapped provider.
///
/// Requests beyond the limit wait for a slot; the slot is released when the
/// request finishes, fails or is dropped.
#[derive(Debug, Clone)]
pub struct ConcurrencyLayer {
    max_concurrent: usize,
}

impl ConcurrencyLayer {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            max_concurrent: max_concurrent.max(1),
        }
    }
}

impl<P: Provider> Layer<P> for ConcurrencyLayer {
    type LayeredProvider = ConcurrencyProvider<P>;

    fn layer(&self, inner: P) -> Self::LayeredProvider {
        ConcurrencyProvider {
            inner,
            semaphore: Semaphore::new(self.max_concurrent),
        }
    }
}

/// Provider wrapped with an admission gate
#[derive(Debug)]
pub struct ConcurrencyProvider<P> {
    inner: P,
    semaphore: Semaphore,
}

impl<P> ConcurrencyProvider<P> {
    /// Slots currently free
    pub fn available(&self) -> usize {
        self.semaphore.available()
    }
}

#[async_trait]
impl<P: Provider> LayeredProvider for ConcurrencyProvider<P> {
    type Inner = P;

    fn inner(&self) -> &Self::Inner {
        &self.inner
    }

    async fn layered_chat_completion(
        &self,
        req: ChatCompletionRequest,
    ) -> Result<ChatCompletionResponse, GrimoireError> {
        if self.semaphore.available() == 0 {
            tracing::debug!(
                provider = %self.inner.info().id,
                limit = self.semaphore.max_concurrent(),
                "waiting for a request slot"
            );
        }
        let _permit = self.semaphore.acquire().await;
        self.inner.chat_completion(req).await
    }
}

impl_layered_provider!(impl<P> for ConcurrencyProvider<P>);
