//! # Grimoire Providers
//!
//! Clients for hosted and self-hosted generation services.

pub mod ollama;
pub mod openai;

// Re-exports
pub use ollama::{OllamaProvider, DEFAULT_OLLAMA_BASE};
pub use openai::{OpenAiBuilder, OpenAiProvider};

use grimoire_core::error::GrimoireError;

/// Default endpoint of DeepSeek's OpenAI-compatible API.
pub const DEEPSEEK_API_BASE: &str = "https://api.deepseek.com/v1";

/// Create a DeepSeek provider (OpenAI-compatible)
///
/// DeepSeek uses the OpenAI API protocol but with a different endpoint.
/// This is a convenience function that creates an OpenAI provider configured
/// for DeepSeek's API endpoint.
///
/// # Example
///
/// ```ignore
/// use grimoire_provider::deepseek;
///
/// let provider = deepseek("your-api-key")?;
/// ```
pub fn deepseek(api_key: impl Into<String>) -> Result<OpenAiProvider, GrimoireError> {
    OpenAiProvider::builder("deepseek")
        .name("DeepSeek")
        .api_key(api_key)
        .api_base(DEEPSEEK_API_BASE)
        .build()
}
