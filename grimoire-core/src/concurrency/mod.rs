//! Concurrency toolkit.
//!
//! Generic async primitives used by the dispatcher and the process runner:
//! - [`Semaphore`]: bounded admission with RAII permits
//! - [`retry`]: exponential backoff with bounded jitter
//! - [`parallel_limit`]: ordered, bounded fan-out
//! - [`Debounce`], [`Throttle`], [`Memoize`]: call coalescing and caching

pub mod debounce;
pub mod memoize;
pub mod parallel;
pub mod retry;
pub mod semaphore;
pub mod throttle;

pub use debounce::Debounce;
pub use memoize::Memoize;
pub use parallel::parallel_limit;
pub use retry::{retry, retry_cancellable, RetryError, RetryPolicy};
pub use semaphore::{Permit, Semaphore};
pub use throttle::Throttle;
