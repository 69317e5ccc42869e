use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Installs a handler for SIGTERM and SIGINT.
///
/// Returns a `CancellationToken` that fires when either signal arrives. The
/// controller checks it between jobs, so the job being executed finishes and
/// records its terminal state before the process exits.
pub fn install_shutdown_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let signal_token = token.clone();

    tokio::spawn(async move {
        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");

        let name = tokio::select! {
            _ = sigterm.recv() => "SIGTERM",
            _ = sigint.recv() => "SIGINT",
        };
        tracing::info!(signal = name, "shutdown signal received");
        signal_token.cancel();
    });

    token
}
