//! Conversation state and the orchestration entry point.
//!
//! The [`Dispatcher`] sits between the caller and the generation backends:
//! it records every turn in the [`ConversationStore`], applies rate limits,
//! resolves the conversation's model and routes the call to either a remote
//! provider or a local process.

pub mod conversation;
pub mod dispatcher;

pub use conversation::{Conversation, ConversationStore, ConversationSummary, Message};
pub use dispatcher::{
    Dispatcher, DispatcherBuilder, GenerationOptions, GenerationResult, ModelSummary,
};
