use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Cancels `token` when SIGTERM or SIGINT arrives. The platform sends
/// SIGTERM when it reaps a container, so every long-lived task must hang
/// off this token.
pub async fn listen_shutdown(token: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let sigterm = signal(SignalKind::terminate());
        let sigint = signal(SignalKind::interrupt());

        let (mut sigterm, mut sigint) = match (sigterm, sigint) {
            (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
            (term, int) => {
                if let Err(err) = term.and(int) {
                    warn!("failed to install signal handlers: error={err}");
                }
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("shutdown signal received: SIGINT");
                    token.cancel();
                }
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => warn!("shutdown signal received: SIGTERM"),
            _ = sigint.recv() => warn!("shutdown signal received: SIGINT"),
        }

        token.cancel();
        return;
    }

    #[cfg(not(unix))]
    if tokio::signal::ctrl_c().await.is_ok() {
        warn!("shutdown signal received: SIGINT");
        token.cancel();
    }
}
