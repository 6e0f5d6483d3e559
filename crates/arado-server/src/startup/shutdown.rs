//! Signal handling for orderly shutdown.

use tracing::warn;

/// Wait for an interrupt or terminate signal and report which one arrived.
pub async fn wait_for_signal() -> &'static str {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install interrupt handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install terminate handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => "interrupt",
        _ = terminate => "terminate",
    }
}

/// Arm a watchdog that exits the process if a second signal arrives while
/// the orderly shutdown is still draining.
pub fn abort_on_second_signal() {
    tokio::spawn(async {
        wait_for_signal().await;
        warn!("second signal received, aborting");
        std::process::exit(1);
    });
}
