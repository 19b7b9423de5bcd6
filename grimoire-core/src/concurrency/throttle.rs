//! Throttle: at most one invocation per time window.

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

type ThrottledFn<T, E> = Arc<dyn Fn() -> BoxFuture<'static, Result<T, E>> + Send + Sync>;

struct Window<T, E> {
    started: Option<Instant>,
    generation: u64,
    in_flight: Option<Shared<BoxFuture<'static, Result<T, E>>>>,
    last: Option<(u64, Result<T, E>)>,
}

/// Starts at most one invocation per `limit` window.
///
/// Callers inside a window get the most recent completed result. When
/// nothing has completed yet they join the in-flight invocation instead.
pub struct Throttle<T, E> {
    limit: Duration,
    f: ThrottledFn<T, E>,
    window: Mutex<Window<T, E>>,
}

impl<T, E> Throttle<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    pub fn new<F, Fut>(limit: Duration, f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        Self {
            limit,
            f: Arc::new(move || f().boxed()),
            window: Mutex::new(Window {
                started: None,
                generation: 0,
                in_flight: None,
                last: None,
            }),
        }
    }

    pub async fn call(&self) -> Result<T, E> {
        let (generation, invocation) = {
            let mut window = self.window.lock().unwrap_or_else(|e| e.into_inner());
            let now = Instant::now();
            let open = window
                .started
                .map_or(true, |started| now.duration_since(started) >= self.limit);

            let joined = if open {
                None
            } else if let Some((_, last)) = &window.last {
                return last.clone();
            } else {
                window.in_flight.clone().map(|f| (window.generation, f))
            };

            match joined {
                Some(joined) => joined,
                None => {
                    window.started = Some(now);
                    window.generation += 1;
                    let invocation = (self.f)().shared();
                    window.in_flight = Some(invocation.clone());
                    (window.generation, invocation)
                }
            }
        };

        let result = invocation.await;

        let mut window = self.window.lock().unwrap_or_else(|e| e.into_inner());
        let newer_known = matches!(&window.last, Some((seen, _)) if *seen > generation);
        if !newer_known {
            window.last = Some((generation, result.clone()));
        }
        result
    }
}
