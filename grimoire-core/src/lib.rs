//! # Grimoire Core
//!
//! Core abstractions and runtime for the Grimoire orchestration engine.
//!
//! A message comes in through the [`Dispatcher`], is recorded in its
//! conversation and is answered by one of several interchangeable backends:
//! a hosted model behind a [`Provider`], or an inference binary spawned by
//! the [`LocalProcessRunner`]. Rate limits, per-model admission and retries
//! are enforced on the way.

pub mod clock;
pub mod concurrency;
pub mod config;
pub mod error;
pub mod layer;
pub mod process;
pub mod provider;
pub mod rate_limit;
pub mod registry;
pub mod runtime;
pub mod types;

// Re-exports
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{DispatcherConfig, ModelCatalog, ModelConfig, ProviderKind, ProviderSettings};
pub use error::{BackendError, GrimoireError};
pub use layer::{Layer, LayeredProvider, ProviderExt};
pub use process::LocalProcessRunner;
pub use provider::Provider;
pub use rate_limit::{RateLimitConfig, RateLimitDecision, RateLimiter, RateLimiters};
pub use registry::{
    Backend, BackendKind, CredentialStore, EnvCredentials, LocalProcessSpec, ModelDescriptor,
    ModelRegistry, Readiness, StaticCredentials,
};
pub use runtime::{
    Conversation, ConversationStore, ConversationSummary, Dispatcher, DispatcherBuilder,
    GenerationOptions, GenerationResult, Message, ModelSummary,
};
pub use types::*;

/// Result type alias for Grimoire operations
pub type Result<T> = std::result::Result<T, GrimoireError>;
