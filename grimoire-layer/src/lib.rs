//! # Grimoire Layers
//!
//! Built-in layers for Grimoire providers.
//!
//! - `LoggingLayer`: structured logs for each completion with timing
//! - `RetryLayer`: exponential backoff with jitter for transient failures
//! - `ConcurrencyLayer`: caps in-flight requests to one provider
//!
//! ## Usage
//!
//! ```ignore
//! use grimoire_core::ProviderExt;
//! use grimoire_layer::{ConcurrencyLayer, LoggingLayer, RetryLayer};
//!
//! let provider = OpenAiProvider::new(api_key)
//!     .with(RetryLayer::new().with_max_attempts(3))
//!     .with(ConcurrencyLayer::new(8))
//!     .with(LoggingLayer::new());
//! ```
//!
//! A `Dispatcher` already retries remote calls with its own policy; only
//! use `RetryLayer` for providers called directly.

pub mod concurrency;
pub mod logging;
pub mod retry;

#[cfg(test)]
pub(crate) mod mock;

// Re-exports
pub use concurrency::ConcurrencyLayer;
pub use logging::LoggingLayer;
pub use retry::RetryLayer;
