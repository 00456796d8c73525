//! Shutdown signal handling.

use std::convert::Infallible;

use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Cancel the token on SIGINT or SIGTERM so the accept loop can drain.
/// Runs for the lifetime of the process.
pub async fn handle_signals(cancellation_token: CancellationToken) -> anyhow::Result<Infallible> {
    let mut term = signal(SignalKind::terminate())?;
    let mut int = signal(SignalKind::interrupt())?;

    loop {
        tokio::select! {
            _ = term.recv() => {
                info!("received SIGTERM, shutting down");
                cancellation_token.cancel();
            }
            _ = int.recv() => {
                info!("received SIGINT, shutting down");
                cancellation_token.cancel();
            }
        }
    }
}
