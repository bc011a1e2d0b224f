//! Watch mode: repeat runs on an interval until shutdown.

use rand::Rng;
use std::future::Future;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Result of a single polling iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterationResult {
    /// Something was loaded.
    ProcessedItems,
    /// Nothing new was found.
    NoItems,
    /// Shutdown was requested during the iteration.
    Shutdown,
}

/// Random delay between zero and `max_secs` seconds.
pub fn random_jitter(max_secs: u64) -> Duration {
    if max_secs > 0 {
        Duration::from_millis(rand::rng().random_range(0..max_secs * 1000))
    } else {
        Duration::ZERO
    }
}

/// Run `iteration` until shutdown, waiting `poll_interval` (plus jitter) in between.
///
/// An iteration is never interrupted from here; it is expected to watch
/// `shutdown` itself and stop between files. Returns the number of
/// iterations run.
pub async fn run_polling_loop<F, Fut>(
    mut iteration: F,
    poll_interval: Duration,
    poll_jitter_secs: u64,
    shutdown: CancellationToken,
    name: &str,
) -> usize
where
    F: FnMut() -> Fut,
    Fut: Future<Output = IterationResult>,
{
    let mut iterations = 0;

    loop {
        if shutdown.is_cancelled() {
            info!(target = name, "Shutdown requested before iteration");
            break;
        }

        let iteration_start = Instant::now();
        let result = iteration().await;
        iterations += 1;

        match result {
            IterationResult::Shutdown => break,
            IterationResult::NoItems => debug!(
                target = name,
                "No new snapshots after {:?}, waiting {}s before next poll",
                iteration_start.elapsed(),
                poll_interval.as_secs()
            ),
            IterationResult::ProcessedItems => debug!(
                target = name,
                "Iteration complete in {:?}, waiting {}s before next poll",
                iteration_start.elapsed(),
                poll_interval.as_secs()
            ),
        }

        let sleep_duration = poll_interval + random_jitter(poll_jitter_secs);
        if shutdown
            .run_until_cancelled(tokio::time::sleep(sleep_duration))
            .await
            .is_none()
        {
            info!(target = name, "Shutdown requested during poll wait");
            break;
        }
    }

    iterations
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_random_jitter_bounds() {
        assert_eq!(random_jitter(0), Duration::ZERO);
        for _ in 0..100 {
            assert!(random_jitter(2) < Duration::from_secs(2));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_repeats_until_shutdown() {
        let shutdown = CancellationToken::new();
        let count = Arc::new(AtomicUsize::new(0));

        let iterations = {
            let shutdown_after_three = shutdown.clone();
            let count = count.clone();
            run_polling_loop(
                move || {
                    let count = count.clone();
                    let shutdown = shutdown_after_three.clone();
                    async move {
                        if count.fetch_add(1, Ordering::SeqCst) + 1 == 3 {
                            shutdown.cancel();
                        }
                        IterationResult::NoItems
                    }
                },
                Duration::from_secs(60),
                0,
                shutdown.clone(),
                "test",
            )
            .await
        };

        assert_eq!(iterations, 3);
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_iteration_stops_loop() {
        let iterations = run_polling_loop(
            || async { IterationResult::Shutdown },
            Duration::from_secs(60),
            0,
            CancellationToken::new(),
            "test",
        )
        .await;
        assert_eq!(iterations, 1);
    }
}
