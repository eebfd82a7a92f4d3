//! Shutdown on SIGINT/SIGTERM.
//!
//! The conversation token is cancelled first, so handlers waiting on email
//! delivery give up right away. Only then is the dispatcher asked to stop,
//! which waits for the handlers still in flight.

use std::future::Future;

use tokio_util::sync::CancellationToken;

/// Resolves on Ctrl+C or, on unix, SIGTERM.
pub async fn signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                log::info!("Received SIGINT, shutting down");
            }
            _ = sigterm.recv() => log::info!("Received SIGTERM, shutting down"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        log::info!("Received Ctrl+C, shutting down");
    }

    Ok(())
}

/// Waits for `signal`, cancels `shutdown`, then runs `stop`.
///
/// A failed signal listener leaves everything running.
pub async fn cancel_then_stop<S, F, Fut>(signal: S, shutdown: CancellationToken, stop: F)
where
    S: Future<Output = std::io::Result<()>>,
    F: FnOnce() -> Fut,
    Fut: Future<Output = ()>,
{
    if let Err(e) = signal.await {
        log::error!("Failed to listen for shutdown signals: {e}");
        return;
    }
    shutdown.cancel();
    stop().await;
}
