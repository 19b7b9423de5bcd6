use async_trait::async_trait;
use grimoire_core::error::GrimoireError;
use grimoire_core::provider::Provider;
use grimoire_core::types::*;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Answers "ok" after `delay`, after first returning any scripted errors.
#[derive(Debug, Default)]
pub struct MockProvider {
    pub delay: Duration,
    pub errors: Mutex<VecDeque<GrimoireError>>,
    pub calls: AtomicUsize,
    pub in_flight: AtomicUsize,
    pub peak_in_flight: AtomicUsize,
}

impl MockProvider {
    pub fn with_errors(errors: Vec<GrimoireError>) -> Self {
        Self {
            errors: Mutex::new(errors.into()),
            ..Default::default()
        }
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Default::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Provider for MockProvider {
    fn info(&self) -> Arc<ProviderInfo> {
        Arc::new(ProviderInfo {
            id: "mock".to_string(),
            name: "Mock".to_string(),
        })
    }

    async fn chat_completion(
        &self,
        req: ChatCompletionRequest,
    ) -> Result<ChatCompletionResponse, GrimoireError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);

        tokio::time::sleep(self.delay).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let scripted = self.errors.lock().unwrap().pop_front();
        if let Some(err) = scripted {
            return Err(err);
        }

        Ok(ChatCompletionResponse {
            id: "mock-1".to_string(),
            model: req.model,
            choices: vec![Choice {
                index: 0,
                message: ChatMessage::assistant("ok"),
                finish_reason: FinishReason::Stop,
            }],
            usage: Usage::default(),
            created: None,
        })
    }
}
