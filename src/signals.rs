//! Optional hookup of OS shutdown signals to a locker stop request.

/// Resolves when the process receives a shutdown-ish signal. Failure to
/// install a handler is logged and that signal is simply never observed.
#[cfg(unix)]
pub(crate) async fn os_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    async fn wait_for(kind: SignalKind) {
        match signal(kind) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install shutdown signal handler");
                std::future::pending::<()>().await;
            }
        }
    }

    tokio::select! {
        _ = wait_for(SignalKind::interrupt()) => (),
        _ = wait_for(SignalKind::terminate()) => (),
        _ = wait_for(SignalKind::hangup()) => (),
    }
}

#[cfg(not(unix))]
pub(crate) async fn os_shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to install shutdown signal handler");
        std::future::pending::<()>().await;
    }
}
