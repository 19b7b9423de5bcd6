//! Bounded parallel execution.

use futures::stream::{self, StreamExt};
use std::future::Future;

/// Run `tasks` with at most `concurrency` in flight.
///
/// Results come back in input order regardless of completion order.
pub async fn parallel_limit<I, Fut>(tasks: I, concurrency: usize) -> Vec<Fut::Output>
where
    I: IntoIterator<Item = Fut>,
    Fut: Future,
{
    stream::iter(tasks)
        .buffered(concurrency.max(1))
        .collect()
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn preserves_input_order() {
        let delays = [30u64, 10, 20, 5];
        let tasks = delays.iter().enumerate().map(|(i, ms)| async move {
            tokio::time::sleep(Duration::from_millis(*ms)).await;
            i
        });

        let results = parallel_limit(tasks, 2).await;
        assert_eq!(results, vec![0, 1, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn never_exceeds_limit() {
        let in_flight = &AtomicUsize::new(0);
        let peak = &AtomicUsize::new(0);

        let tasks = (0..8).map(|_| async move {
            let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            in_flight.fetch_sub(1, Ordering::SeqCst);
        });

        parallel_limit(tasks, 3).await;
        assert_eq!(peak.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn zero_concurrency_still_runs() {
        let results = parallel_limit((0..3).map(|i| async move { i * 2 }), 0).await;
        assert_eq!(results, vec![0, 2, 4]);
    }
}
