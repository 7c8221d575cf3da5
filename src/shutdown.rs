use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Exit status used when a second signal cuts the disconnect path short.
const FORCED_EXIT_CODE: i32 = 130;

/// Cancel the returned token on the first SIGTERM or SIGINT.
///
/// The broker and worker loops watch this token and run their disconnect
/// path (DISCONNECT to peers, supervisors reaped). A second signal while
/// that is still running exits the process immediately.
pub fn install_shutdown_handler(role: &'static str) -> std::io::Result<CancellationToken> {
    let token = CancellationToken::new();
    let cancel = token.clone();

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::spawn(async move {
        let name = tokio::select! {
            _ = sigterm.recv() => "SIGTERM",
            _ = sigint.recv() => "SIGINT",
        };
        tracing::info!(role, signal = name, "Shutting down, disconnecting peers");
        cancel.cancel();

        tokio::select! {
            _ = sigterm.recv() => {}
            _ = sigint.recv() => {}
        }
        tracing::warn!(role, "Second signal, exiting without waiting for cleanup");
        std::process::exit(FORCED_EXIT_CODE);
    });

    Ok(token)
}
