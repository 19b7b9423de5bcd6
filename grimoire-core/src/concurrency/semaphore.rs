//! Counting semaphore with RAII permits.

use crate::error::GrimoireError;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Bounded admission gate.
///
/// Waiters are queued in FIFO order and suspend until a slot frees up.
/// A slot is returned when the [`Permit`] is released or dropped, which
/// covers success, error, panic unwinding and a dropped future alike.
#[derive(Debug, Clone)]
pub struct Semaphore {
    inner: Arc<tokio::sync::Semaphore>,
    max_concurrent: usize,
}

/// A held slot of a [`Semaphore`].
#[derive(Debug)]
#[must_use = "the slot is released as soon as the permit is dropped"]
pub struct Permit {
    _permit: tokio::sync::OwnedSemaphorePermit,
}

impl Permit {
    /// Give the slot back.
    pub fn release(self) {}
}

impl Semaphore {
    /// Create a semaphore with `max_concurrent` slots (at least one).
    pub fn new(max_concurrent: usize) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            inner: Arc::new(tokio::sync::Semaphore::new(max_concurrent)),
            max_concurrent,
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Slots currently free.
    pub fn available(&self) -> usize {
        self.inner.available_permits()
    }

    /// Wait for a free slot.
    pub async fn acquire(&self) -> Permit {
        let permit = self
            .inner
            .clone()
            .acquire_owned()
            .await
            .expect("semaphore is never closed");
        Permit { _permit: permit }
    }

    /// Wait for a free slot unless `cancel` fires first.
    pub async fn acquire_cancellable(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Permit, GrimoireError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(GrimoireError::cancelled("cancelled while waiting for a slot")),
            permit = self.acquire() => Ok(permit),
        }
    }

    /// Take a slot without waiting, if one is free.
    pub fn try_acquire(&self) -> Option<Permit> {
        self.inner
            .clone()
            .try_acquire_owned()
            .ok()
            .map(|permit| Permit { _permit: permit })
    }

    /// Run `task` while holding a slot.
    pub async fn run<F, T>(&self, task: F) -> T
    where
        F: Future<Output = T>,
    {
        let _permit = self.acquire().await;
        task.await
    }
}
