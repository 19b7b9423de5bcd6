//! Debounce: coalesce bursts of calls into one invocation.

use futures::future::BoxFuture;
use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;

type DebouncedFn<A, T, E> = Arc<dyn Fn(A) -> BoxFuture<'static, Result<T, E>> + Send + Sync>;

/// Result of one invocation; `Err` carries the panic message.
type Outcome<T, E> = Result<Result<T, E>, String>;

struct Pending<A, T, E> {
    generation: u64,
    args: Option<A>,
    waiters: Vec<oneshot::Sender<Outcome<T, E>>>,
}

/// Invokes the wrapped function once `wait` has passed without a new call.
///
/// The invocation uses the arguments of the latest call, and every caller
/// that arrived during the burst receives a clone of its result. The
/// invocation runs on its own task, so a caller dropping its future does not
/// strand the others.
pub struct Debounce<A, T, E> {
    wait: Duration,
    f: DebouncedFn<A, T, E>,
    pending: Arc<Mutex<Pending<A, T, E>>>,
}

impl<A, T, E> Debounce<A, T, E>
where
    A: Send + 'static,
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    pub fn new<F, Fut>(wait: Duration, f: F) -> Self
    where
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        Self {
            wait,
            f: Arc::new(move |args| f(args).boxed()),
            pending: Arc::new(Mutex::new(Pending {
                generation: 0,
                args: None,
                waiters: Vec::new(),
            })),
        }
    }

    /// Schedule an invocation with `args` and wait for its result.
    ///
    /// # Panics
    ///
    /// If the wrapped function panics, every caller of that burst panics
    /// with the same message.
    pub async fn call(&self, args: A) -> Result<T, E> {
        let (tx, rx) = oneshot::channel();
        let generation = {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            pending.generation += 1;
            pending.args = Some(args);
            pending.waiters.push(tx);
            pending.generation
        };

        let pending = self.pending.clone();
        let f = self.f.clone();
        let wait = self.wait;
        tokio::spawn(async move {
            tokio::time::sleep(wait).await;

            let (args, waiters) = {
                let mut pending = pending.lock().unwrap_or_else(|e| e.into_inner());
                if pending.generation != generation {
                    return;
                }
                (pending.args.take(), std::mem::take(&mut pending.waiters))
            };
            let Some(args) = args else { return };

            tracing::trace!(callers = waiters.len(), "debounced invocation");
            let outcome = AssertUnwindSafe(async move { f(args).await })
                .catch_unwind()
                .await
                .map_err(|payload| panic_message(payload.as_ref()));
            for waiter in waiters {
                let _ = waiter.send(outcome.clone());
            }
        });

        match rx.await {
            Ok(Ok(result)) => result,
            Ok(Err(message)) => std::panic::resume_unwind(Box::new(message)),
            // the invocation task was torn down with its runtime
            Err(_) => std::panic::resume_unwind(Box::new(
                "debounced invocation was dropped before completing".to_string(),
            )),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "debounced function panicked".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn burst_shares_one_invocation() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let debounce = Arc::new(Debounce::new(Duration::from_millis(50), move |n: u32| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, String>(n * 10)
            }
        }));

        let mut handles = Vec::new();
        for n in 1..=3 {
            let debounce = debounce.clone();
            handles.push(tokio::spawn(async move { debounce.call(n).await }));
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap(), Ok(30));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn panic_reaches_every_caller() {
        let debounce = Arc::new(Debounce::new(Duration::from_millis(20), |explode: bool| async move {
            if explode {
                panic!("model exploded");
            }
            Ok::<(), String>(())
        }));

        let a = tokio::spawn({
            let debounce = debounce.clone();
            async move { debounce.call(true).await }
        });
        let b = tokio::spawn({
            let debounce = debounce.clone();
            async move { debounce.call(true).await }
        });

        let err = a.await.unwrap_err();
        assert!(err.is_panic());
        let payload = err.into_panic();
        assert_eq!(
            payload.downcast_ref::<String>().map(String::as_str),
            Some("model exploded")
        );
        assert!(b.await.unwrap_err().is_panic());
    }

    #[tokio::test(start_paused = true)]
    async fn error_reaches_every_caller() {
        let debounce = Arc::new(Debounce::new(Duration::from_millis(20), |_: ()| async {
            Err::<(), _>("backend down".to_string())
        }));

        let a = tokio::spawn({
            let debounce = debounce.clone();
            async move { debounce.call(()).await }
        });
        let b = tokio::spawn({
            let debounce = debounce.clone();
            async move { debounce.call(()).await }
        });

        assert_eq!(a.await.unwrap(), Err("backend down".to_string()));
        assert_eq!(b.await.unwrap(), Err("backend down".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn separated_calls_invoke_separately() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let debounce = Debounce::new(Duration::from_millis(20), move |_: ()| {
            let counter = counter.clone();
            async move { Ok::<_, String>(counter.fetch_add(1, Ordering::SeqCst)) }
        });

        assert_eq!(debounce.call(()).await, Ok(0));
        assert_eq!(debounce.call(()).await, Ok(1));
    }
}
