//! Signal handling for graceful shutdown.
//!
//! The first SIGINT/SIGTERM stops the tick loop; the application installs a
//! second, silent handler afterwards that exits immediately.

use crate::shutdown::ShutdownState;
use tokio::signal;
use tracing::info;

/// Waits for a termination signal and returns the initiated shutdown state.
pub async fn setup_signal_handlers() -> Result<ShutdownState, Box<dyn std::error::Error>> {
    let shutdown_state = setup_signal_handlers_silent().await?;
    info!("📡 Received shutdown signal - initiating graceful shutdown");
    Ok(shutdown_state)
}

pub async fn setup_signal_handlers_silent() -> Result<ShutdownState, Box<dyn std::error::Error>> {
    let shutdown_state = ShutdownState::new();
    wait_for_signal().await?;
    shutdown_state.initiate_shutdown();
    Ok(shutdown_state)
}

async fn wait_for_signal() -> Result<(), Box<dyn std::error::Error>> {
    #[cfg(unix)]
    {
        use signal::unix::{signal, SignalKind};

        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = sigint.recv() => (),
            _ = sigterm.recv() => ()
        }
    }

    #[cfg(windows)]
    signal::ctrl_c().await?;

    Ok(())
}
