//! The orchestration API.
//!
//! A [`Dispatcher`] owns the conversation store and turns each incoming
//! message into one backend call:
//!
//! ```text
//! process_message
//!   -> turn lock -> append user message
//!   -> rate limit -> resolve model
//!   -> remote provider (retried) | local process (gated per model)
//!   -> append assistant message, or a system error record
//! ```

use super::conversation::{Conversation, ConversationStore, ConversationSummary};
use crate::clock::{Clock, SystemClock};
use crate::concurrency::{retry_cancellable, RetryError, RetryPolicy};
use crate::config::DispatcherConfig;
use crate::error::GrimoireError;
use crate::process::{render_prompt, LocalProcessRunner};
use crate::provider::Provider;
use crate::rate_limit::{RateLimitDecision, RateLimiters, GENERATION};
use crate::registry::{Backend, BackendKind, ModelDescriptor, ModelRegistry, Readiness};
use crate::types::{estimate_tokens, ChatMessage, Metadata, ModelParameters, Role};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Per-call options of [`Dispatcher::process_message`].
#[derive(Debug, Clone, Default)]
pub struct GenerationOptions {
    /// Rate limit key; anonymous when unset
    pub caller: Option<String>,
    /// Overrides on top of the model's default parameters
    pub parameters: ModelParameters,
    /// Overrides the configured request timeout
    pub timeout: Option<Duration>,
    /// Fires to abandon the call
    pub cancel: Option<CancellationToken>,
    /// Attached to the recorded user message
    pub metadata: Metadata,
}

impl GenerationOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_caller(mut self, caller: impl Into<String>) -> Self {
        self.caller = Some(caller.into());
        self
    }

    pub fn with_parameters(mut self, parameters: ModelParameters) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Outcome of a successful generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationResult {
    pub conversation_id: String,
    /// Id of the recorded assistant message
    pub message_id: String,
    pub response: String,
    pub timestamp: DateTime<Utc>,
    pub metadata: Metadata,
}

/// Public view of a registered model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSummary {
    pub id: String,
    pub name: String,
    pub backend: BackendKind,
    pub ready: bool,
    pub readiness: Readiness,
    pub parameters: ModelParameters,
}

impl From<&ModelDescriptor> for ModelSummary {
    fn from(descriptor: &ModelDescriptor) -> Self {
        Self {
            id: descriptor.id.clone(),
            name: descriptor.name.clone(),
            backend: descriptor.kind(),
            ready: descriptor.is_ready(),
            readiness: descriptor.readiness.clone(),
            parameters: descriptor.parameters.clone(),
        }
    }
}

/// Builder for [`Dispatcher`].
///
/// Remote calls are already retried with the configured policy, so
/// providers should not also be wrapped in a retry layer.
///
/// ```ignore
/// let dispatcher = Dispatcher::builder(registry)
///     .provider("openai", OpenAiProvider::new(key).with(LoggingLayer::new()))
///     .config(catalog.dispatcher.clone())
///     .finish();
/// ```
pub struct DispatcherBuilder {
    registry: ModelRegistry,
    providers: HashMap<String, Arc<dyn Provider>>,
    clock: Arc<dyn Clock>,
    config: DispatcherConfig,
}

impl DispatcherBuilder {
    pub fn new(registry: ModelRegistry) -> Self {
        Self {
            registry,
            providers: HashMap::new(),
            clock: Arc::new(SystemClock),
            config: DispatcherConfig::default(),
        }
    }

    /// Register the client behind remote models naming `name` as provider.
    pub fn provider<P: Provider>(self, name: impl Into<String>, provider: P) -> Self {
        self.shared_provider(name, Arc::new(provider))
    }

    pub fn shared_provider(mut self, name: impl Into<String>, provider: Arc<dyn Provider>) -> Self {
        self.providers.insert(name.into(), provider);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(mut self, config: DispatcherConfig) -> Self {
        self.config = config;
        self
    }

    pub fn finish(self) -> Dispatcher {
        for descriptor in self.registry.list_models() {
            if let Backend::Remote { provider, .. } = &descriptor.backend {
                if !self.providers.contains_key(provider) {
                    tracing::warn!(
                        model = %descriptor.id,
                        provider = %provider,
                        "no client registered for provider; requests will fail"
                    );
                }
            }
        }

        let runner = LocalProcessRunner::new().with_grace_period(self.config.process_grace_period());
        let limiters = RateLimiters::from_configs(&self.config.rate_limits, self.clock.clone());

        Dispatcher {
            registry: Arc::new(self.registry),
            store: Arc::new(ConversationStore::new(self.clock)),
            providers: self.providers,
            runner,
            limiters,
            config: self.config,
            sweeper: Mutex::new(None),
        }
    }
}

#[derive(Debug)]
struct Sweeper {
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

/// Conversation and generation orchestrator.
#[derive(Debug)]
pub struct Dispatcher {
    registry: Arc<ModelRegistry>,
    store: Arc<ConversationStore>,
    providers: HashMap<String, Arc<dyn Provider>>,
    runner: LocalProcessRunner,
    limiters: RateLimiters,
    config: DispatcherConfig,
    sweeper: Mutex<Option<Sweeper>>,
}

impl Dispatcher {
    pub fn builder(registry: ModelRegistry) -> DispatcherBuilder {
        DispatcherBuilder::new(registry)
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<ConversationStore> {
        &self.store
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Start a conversation on `model_id`, or on the default model.
    pub fn create_conversation(
        &self,
        model_id: Option<&str>,
        metadata: Metadata,
    ) -> Result<ConversationSummary, GrimoireError> {
        let model_id = model_id.unwrap_or_else(|| self.registry.default_model());
        let descriptor = self.registry.resolve(model_id)?;
        let conversation = self.store.create(descriptor.id.clone(), metadata);
        tracing::info!(
            conversation_id = %conversation.id,
            model = %descriptor.id,
            "conversation created"
        );
        Ok(conversation.summary())
    }

    pub fn get_conversation(&self, conversation_id: &str) -> Result<Conversation, GrimoireError> {
        self.store.get(conversation_id)
    }

    pub fn delete_conversation(&self, conversation_id: &str) -> Result<(), GrimoireError> {
        if self.store.delete(conversation_id) {
            Ok(())
        } else {
            Err(GrimoireError::ConversationNotFound(conversation_id.to_string()))
        }
    }

    /// Most recently updated first.
    pub fn list_conversations(&self, limit: usize) -> Vec<ConversationSummary> {
        self.store.list(limit)
    }

    pub fn list_models(&self) -> Vec<ModelSummary> {
        self.registry
            .list_models()
            .iter()
            .map(|descriptor| ModelSummary::from(descriptor.as_ref()))
            .collect()
    }

    /// Spend a point of `category` for `caller`, for callers gating work
    /// outside generation.
    pub fn check_rate_limit(
        &self,
        category: &str,
        caller: Option<&str>,
    ) -> Result<Option<RateLimitDecision>, GrimoireError> {
        let caller = caller.unwrap_or(&self.config.anonymous_caller);
        self.limiters.check(category, caller)
    }

    /// Record `text` as a user turn and generate the reply.
    ///
    /// Calls on the same conversation run one after another. Every call
    /// that gets past the lookup appends exactly two messages: the user
    /// message and then either the reply or a `system` error record.
    pub async fn process_message(
        &self,
        conversation_id: &str,
        text: &str,
        options: GenerationOptions,
    ) -> Result<GenerationResult, GrimoireError> {
        let slot = self.store.slot(conversation_id)?;
        let _turn = slot.lock_turn().await;
        // deleted or swept while this call waited for its turn
        if !self.store.is_current(conversation_id, &slot) {
            return Err(GrimoireError::ConversationNotFound(
                conversation_id.to_string(),
            ));
        }

        let started_at = Instant::now();
        slot.append(
            self.store
                .message(Role::User, text, options.metadata.clone()),
        );
        let conversation = slot.snapshot();

        match self.generate(&conversation, &options).await {
            Ok((reply, descriptor)) => {
                let elapsed_ms = started_at.elapsed().as_millis() as u64;
                let mut metadata = Metadata::new();
                metadata.insert("processing_time_ms".into(), json!(elapsed_ms));
                metadata.insert("estimated_tokens".into(), json!(estimate_tokens(&reply)));
                metadata.insert("model_id".into(), json!(descriptor.id));
                metadata.insert("backend".into(), json!(descriptor.kind().as_str()));

                let message = self
                    .store
                    .message(Role::Assistant, reply, metadata);
                slot.append(message.clone());

                tracing::info!(
                    conversation_id = %conversation.id,
                    model = %descriptor.id,
                    backend = %descriptor.kind(),
                    duration_ms = elapsed_ms,
                    "generation completed"
                );

                Ok(GenerationResult {
                    conversation_id: conversation.id,
                    message_id: message.id,
                    response: message.content,
                    timestamp: message.timestamp,
                    metadata: message.metadata,
                })
            }
            Err(err) => {
                let elapsed_ms = started_at.elapsed().as_millis() as u64;
                let mut metadata = Metadata::new();
                metadata.insert("is_error".into(), json!(true));
                metadata.insert("error_kind".into(), json!(err.kind()));
                metadata.insert("model_id".into(), json!(conversation.model_id));
                metadata.insert("processing_time_ms".into(), json!(elapsed_ms));
                slot.append(
                    self.store
                        .message(Role::System, err.to_string(), metadata),
                );

                tracing::warn!(
                    conversation_id = %conversation.id,
                    model = %conversation.model_id,
                    error_kind = err.kind(),
                    error = %err,
                    duration_ms = elapsed_ms,
                    "generation failed"
                );
                Err(err)
            }
        }
    }

    async fn generate(
        &self,
        conversation: &Conversation,
        options: &GenerationOptions,
    ) -> Result<(String, Arc<ModelDescriptor>), GrimoireError> {
        let caller = options
            .caller
            .as_deref()
            .unwrap_or(&self.config.anonymous_caller);
        self.limiters.check(GENERATION, caller)?;

        let descriptor = self.registry.resolve(&conversation.model_id)?;

        let timeout = options
            .timeout
            .or(match &descriptor.backend {
                Backend::LocalProcess(spec) => spec.timeout,
                Backend::Remote { .. } => None,
            })
            .unwrap_or_else(|| self.config.request_timeout());

        let cancel = options
            .cancel
            .as_ref()
            .map(CancellationToken::child_token)
            .unwrap_or_default();

        // the call borrows the descriptor; it must be gone before we return it
        let reply = {
            let call = self.call_backend(
                &descriptor,
                conversation.transcript(),
                &options.parameters,
                &cancel,
            );
            tokio::pin!(call);

            tokio::select! {
                result = &mut call => result,
                _ = tokio::time::sleep(timeout) => {
                    cancel.cancel();
                    // let the backend release its process or connection first
                    let _ = call.await;
                    Err(GrimoireError::cancelled(format!(
                        "generation timed out after {}ms",
                        timeout.as_millis()
                    )))
                }
            }
        }?;

        Ok((reply, descriptor))
    }

    async fn call_backend(
        &self,
        descriptor: &ModelDescriptor,
        transcript: Vec<ChatMessage>,
        overrides: &ModelParameters,
        cancel: &CancellationToken,
    ) -> Result<String, GrimoireError> {
        match &descriptor.backend {
            Backend::Remote { provider, model } => {
                let client = self.providers.get(provider).ok_or_else(|| {
                    GrimoireError::configuration(format!(
                        "no client registered for provider '{provider}'"
                    ))
                })?;
                let params = descriptor.parameters.merged(overrides);
                let params = &params;
                let transcript = &transcript;

                let result = retry_cancellable(
                    &self.config.retry,
                    cancel,
                    GrimoireError::is_retryable,
                    move || async move {
                        tokio::select! {
                            biased;
                            _ = cancel.cancelled() => {
                                Err(GrimoireError::cancelled("remote generation was cancelled"))
                            }
                            reply = client.complete(model, transcript.clone(), params) => reply,
                        }
                    },
                )
                .await;
                flatten_retry(result)
            }
            Backend::LocalProcess(_) => {
                let prompt = render_prompt(&transcript);
                let prompt = prompt.as_str();
                let runner = &self.runner;
                let policy = RetryPolicy {
                    max_attempts: self.config.local_max_attempts.max(1),
                    ..self.config.retry.clone()
                };

                let result = retry_cancellable(
                    &policy,
                    cancel,
                    GrimoireError::is_retryable,
                    move || runner.run(descriptor, prompt, overrides, cancel),
                )
                .await;
                flatten_retry(result)
            }
        }
    }

    /// Remove conversations idle longer than `max_age`.
    pub fn cleanup_old_conversations(&self, max_age: Duration) -> usize {
        let removed = self.store.cleanup_older_than(max_age);
        if removed > 0 {
            tracing::info!(removed, remaining = self.store.len(), "stale conversations removed");
        }
        removed
    }

    /// Start the periodic sweep of stale conversations and idle rate limit
    /// keys. Does nothing if it is already running.
    pub fn spawn_cleanup(&self) {
        let mut sweeper = self.sweeper.lock().unwrap_or_else(|e| e.into_inner());
        if sweeper.is_some() {
            return;
        }

        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let store = self.store.clone();
        let limiters = self.limiters.clone();
        let interval = self.config.cleanup_interval();
        let max_age = self.config.conversation_max_age();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            tracing::info!(interval_secs = interval.as_secs(), "conversation sweeper started");

            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = store.cleanup_older_than(max_age);
                        let pruned = limiters.prune();
                        tracing::debug!(removed, pruned, remaining = store.len(), "sweep finished");
                    }
                }
            }

            tracing::info!("conversation sweeper stopped");
        });

        *sweeper = Some(Sweeper { shutdown, handle });
    }

    /// Stop the periodic sweep and wait for it to exit.
    pub async fn shutdown(&self) {
        let sweeper = self
            .sweeper
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(sweeper) = sweeper {
            sweeper.shutdown.cancel();
            if let Err(err) = sweeper.handle.await {
                tracing::warn!(error = %err, "conversation sweeper ended abnormally");
            }
        }
    }
}

/// A single failed attempt surfaces as itself; repeated failures are
/// wrapped with the attempt count.
fn flatten_retry(result: Result<String, RetryError<GrimoireError>>) -> Result<String, GrimoireError> {
    result.map_err(|err| match err {
        RetryError::Exhausted { attempts, last } if attempts > 1 => GrimoireError::RetryExhausted {
            attempts,
            last: Box::new(last),
        },
        other => other.into_inner(),
    })
}
