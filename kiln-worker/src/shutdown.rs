use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;

/// Cancels the returned token on SIGTERM or SIGINT
///
/// A build in progress is interrupted, its result reported once and the
/// worker unregistered.
pub fn install_shutdown_handler() -> std::io::Result<CancellationToken> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    let token = CancellationToken::new();
    let token_clone = token.clone();

    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => tracing::info!("Received SIGTERM, stopping worker"),
            _ = sigint.recv() => tracing::info!("Received SIGINT, stopping worker"),
        }

        token_clone.cancel();
    });

    Ok(token)
}
