//! Signal handling for graceful shutdown.

use std::future::Future;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Wait for a shutdown signal (SIGINT, SIGTERM, or SIGQUIT on Unix).
#[cfg(unix)]
pub async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let (Ok(mut sigint), Ok(mut sigterm), Ok(mut sigquit)) = (
        signal(SignalKind::interrupt()),
        signal(SignalKind::terminate()),
        signal(SignalKind::quit()),
    ) else {
        warn!("Failed to install signal handlers, only Ctrl-C will stop the run");
        ctrl_c().await;
        return;
    };

    tokio::select! {
        _ = sigint.recv() => {
            info!(message = "Signal received.", signal = "SIGINT");
        }
        _ = sigterm.recv() => {
            info!(message = "Signal received.", signal = "SIGTERM");
        }
        _ = sigquit.recv() => {
            info!(message = "Signal received.", signal = "SIGQUIT");
        }
    }
}

#[cfg(not(unix))]
pub async fn shutdown_signal() {
    ctrl_c().await;
}

async fn ctrl_c() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!(message = "Signal received.", signal = "Ctrl-C"),
        Err(e) => {
            warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

/// Cancel `shutdown` when a shutdown signal arrives.
pub fn cancel_on_signal(shutdown: &CancellationToken) {
    cancel_when(shutdown_signal(), shutdown);
}

fn cancel_when<F>(signal: F, shutdown: &CancellationToken) -> JoinHandle<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let shutdown = shutdown.clone();
    tokio::spawn(async move {
        signal.await;
        shutdown.cancel();
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn test_signal_cancels_every_clone() {
        let shutdown = CancellationToken::new();
        let observer = shutdown.clone();
        let (tx, rx) = oneshot::channel::<()>();

        let handle = cancel_when(
            async move {
                let _ = rx.await;
            },
            &shutdown,
        );

        tokio::task::yield_now().await;
        assert!(!observer.is_cancelled());

        tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_millis(100), handle)
            .await
            .expect("task should complete quickly")
            .expect("task should not panic");
        assert!(shutdown.is_cancelled());
        assert!(observer.is_cancelled());
    }

    #[tokio::test]
    async fn test_no_signal_leaves_token_alone() {
        let shutdown = CancellationToken::new();
        let handle = cancel_when(std::future::pending(), &shutdown);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!shutdown.is_cancelled());
        handle.abort();
    }
}
