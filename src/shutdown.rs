//! Graceful shutdown on SIGINT/SIGTERM.
//!
//! The returned token is threaded through scheduler, director, and
//! dispatcher. A sweep in progress finishes its in-flight dispatches.

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Spawn a task that cancels the returned token on Ctrl+C or SIGTERM.
pub fn install_signal_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();

    tokio::spawn(async move {
        wait_for_signal().await;
        trigger.cancel();
    });

    token
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "Failed to install SIGTERM handler, Ctrl+C only");
            let _ = tokio::signal::ctrl_c().await;
            info!("Received Ctrl+C, shutting down");
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Received Ctrl+C, shutting down"),
        _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("Received Ctrl+C, shutting down");
}
