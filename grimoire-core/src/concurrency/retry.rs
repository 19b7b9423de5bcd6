//! Retry with exponential backoff and bounded jitter.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Retry configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    /// Base delay after the first failure
    #[serde(with = "millis")]
    pub initial_delay: Duration,
    /// Upper bound of the uniform random delay added to every backoff
    #[serde(with = "millis")]
    pub max_jitter: Duration,
    /// Cap on the exponential part of the delay
    #[serde(with = "opt_millis")]
    pub max_delay: Option<Duration>,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay,
            max_jitter: Duration::from_millis(1000),
            max_delay: None,
        }
    }

    /// A policy that makes a single attempt.
    pub fn none() -> Self {
        Self::new(1, Duration::ZERO)
    }

    /// Set maximum jitter
    pub fn with_max_jitter(mut self, max_jitter: Duration) -> Self {
        self.max_jitter = max_jitter;
        self
    }

    /// Set maximum delay
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = Some(max_delay);
        self
    }

    /// Exponential part of the delay after failed attempt `attempt` (1-based).
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        let delay = self.initial_delay.saturating_mul(1u32 << exp);
        match self.max_delay {
            Some(max) => delay.min(max),
            None => delay,
        }
    }

    /// Full delay after failed attempt `attempt`, jitter included.
    fn delay(&self, attempt: u32) -> Duration {
        let jitter_ms = self.max_jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_ms)
        };
        self.base_delay(attempt) + Duration::from_millis(jitter)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(1000))
    }
}

/// Why [`retry`] gave up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryError<E> {
    /// `should_retry` rejected the error, or the retry was cancelled
    Aborted { attempts: u32, error: E },
    /// Every attempt failed
    Exhausted { attempts: u32, last: E },
}

impl<E> RetryError<E> {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Aborted { attempts, .. } | RetryError::Exhausted { attempts, .. } => {
                *attempts
            }
        }
    }

    /// The last error seen.
    pub fn into_inner(self) -> E {
        match self {
            RetryError::Aborted { error, .. } => error,
            RetryError::Exhausted { last, .. } => last,
        }
    }
}

/// Run `task` until it succeeds, `should_retry` says stop, or the policy runs
/// out of attempts.
pub async fn retry<T, E, F, Fut, P>(
    policy: &RetryPolicy,
    should_retry: P,
    task: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
{
    retry_inner(policy, should_retry, task, None).await
}

/// Like [`retry`], but stops with the last error if `cancel` fires during a
/// backoff sleep.
pub async fn retry_cancellable<T, E, F, Fut, P>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    should_retry: P,
    task: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
{
    retry_inner(policy, should_retry, task, Some(cancel)).await
}

async fn retry_inner<T, E, F, Fut, P>(
    policy: &RetryPolicy,
    should_retry: P,
    mut task: F,
    cancel: Option<&CancellationToken>,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        let error = match task().await {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };

        if !should_retry(&error) {
            return Err(RetryError::Aborted {
                attempts: attempt,
                error,
            });
        }
        if attempt >= max_attempts {
            return Err(RetryError::Exhausted {
                attempts: attempt,
                last: error,
            });
        }

        let delay = policy.delay(attempt);
        tracing::debug!(
            attempt,
            max_attempts,
            delay_ms = delay.as_millis() as u64,
            "retrying after backoff"
        );

        match cancel {
            Some(token) => {
                tokio::select! {
                    _ = token.cancelled() => {
                        return Err(RetryError::Aborted { attempts: attempt, error });
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            None => tokio::time::sleep(delay).await,
        }
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

mod opt_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(d).map(|ms| ms.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};
    use tokio::time::Instant;

    #[tokio::test(start_paused = true)]
    async fn succeeds_on_third_attempt_with_backoff() {
        let policy = RetryPolicy::new(3, Duration::from_millis(100));
        let starts = Arc::new(Mutex::new(Vec::new()));

        let result = retry(&policy, |_: &&str| true, || {
            let starts = starts.clone();
            async move {
                let mut starts = starts.lock().unwrap();
                starts.push(Instant::now());
                if starts.len() < 3 {
                    Err("transient")
                } else {
                    Ok(starts.len())
                }
            }
        })
        .await;

        assert_eq!(result, Ok(3));
        let starts = starts.lock().unwrap();
        assert!(starts[1] - starts[0] >= Duration::from_millis(100));
        assert!(starts[2] - starts[1] >= Duration::from_millis(200));
        // jitter is bounded to one second
        assert!(starts[1] - starts[0] <= Duration::from_millis(1100));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_returns_last_error() {
        let policy = RetryPolicy::new(3, Duration::from_millis(10));
        let calls = &AtomicU32::new(0);

        let result: Result<(), _> = retry(&policy, |_| true, move || async move {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            Err(format!("failure {n}"))
        })
        .await;

        assert_eq!(
            result,
            Err(RetryError::Exhausted {
                attempts: 3,
                last: "failure 3".to_string()
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_stops_immediately() {
        let policy = RetryPolicy::new(5, Duration::from_millis(10));
        let calls = &AtomicU32::new(0);

        let result: Result<(), _> = retry(&policy, |e: &&str| *e != "fatal", move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err("fatal")
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(result.unwrap_err().into_inner(), "fatal");
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_backoff() {
        let policy = RetryPolicy::new(5, Duration::from_secs(60));
        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            canceller.cancel();
        });

        let started = Instant::now();
        let result: Result<(), _> =
            retry_cancellable(&policy, &token, |_| true, || async { Err("down") }).await;

        assert!(matches!(result, Err(RetryError::Aborted { attempts: 1, .. })));
        assert!(started.elapsed() < Duration::from_secs(60));
    }

    #[test]
    fn base_delay_doubles_and_caps() {
        let policy =
            RetryPolicy::new(10, Duration::from_millis(100)).with_max_delay(Duration::from_millis(500));
        assert_eq!(policy.base_delay(1), Duration::from_millis(100));
        assert_eq!(policy.base_delay(2), Duration::from_millis(200));
        assert_eq!(policy.base_delay(3), Duration::from_millis(400));
        assert_eq!(policy.base_delay(4), Duration::from_millis(500));
    }
}
