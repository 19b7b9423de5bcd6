//! # Grimoire
//!
//! Request orchestration across interchangeable generation backends.
//!
//! Grimoire accepts a conversational message, resolves the conversation's
//! model to a hosted API or a locally installed inference binary, and
//! returns the reply while enforcing rate limits, per-model concurrency and
//! retries. Every turn, successful or not, is recorded in the conversation.
//!
//! ## Quick Start
//!
//! ```toml
//! [dependencies]
//! grimoire = { version = "0.1", features = ["openai", "layers"] }
//! ```
//!
//! ```ignore
//! use grimoire::prelude::*;
//!
//! # async fn example() -> Result<()> {
//! let dispatcher = grimoire::bootstrap_from_path("models.toml")?;
//! dispatcher.spawn_cleanup();
//!
//! let conversation = dispatcher.create_conversation(None, Metadata::new())?;
//! let reply = dispatcher
//!     .process_message(&conversation.id, "What is Rust?", GenerationOptions::new())
//!     .await?;
//! println!("{}", reply.response);
//!
//! dispatcher.shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Feature Flags
//!
//! - `default`: `openai` and `layers`
//! - `openai`: OpenAI-compatible providers and catalog bootstrap
//! - `providers`: All available providers
//! - `layers`: Built-in provider layers (logging, retry, concurrency)
//! - `full`: All features enabled

// Re-export core types and traits
pub use grimoire_core::*;

#[cfg(feature = "grimoire-provider")]
mod bootstrap;

#[cfg(feature = "grimoire-provider")]
pub use bootstrap::{bootstrap, bootstrap_from_path};

// Re-export providers under `provider` module
#[cfg(feature = "grimoire-provider")]
pub mod providers {
    //! Remote provider clients.
    pub use grimoire_provider::*;
}

// Re-export layers under `layers` module
#[cfg(feature = "grimoire-layer")]
pub mod layers {
    //! Built-in provider layers.
    pub use grimoire_layer::*;
}

/// Prelude module for convenient imports
pub mod prelude {
    //! Prelude module containing the most commonly used types and traits.
    //!
    //! ```
    //! use grimoire::prelude::*;
    //! ```

    pub use crate::{
        ChatMessage, Dispatcher, GenerationOptions, GenerationResult, GrimoireError, Layer,
        Metadata, ModelCatalog, ModelParameters, Provider, ProviderExt, Result, Role,
    };

    #[cfg(feature = "grimoire-provider")]
    pub use crate::providers::*;

    #[cfg(feature = "grimoire-layer")]
    pub use crate::layers::*;
}
