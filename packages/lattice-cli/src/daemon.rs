//! Heartbeat daemon mode.
//!
//! Keeps the host's liveness reported to Lattice Cloud and exits when
//! the session dies or a shutdown signal arrives. Daemonization itself
//! is left to systemd; this always runs in the foreground.

use anyhow::Result;
use lattice_core::auth::SessionManager;
use lattice_core::heartbeat::LivenessReporter;
use std::time::Duration;

/// Run the heartbeat daemon until shutdown or disconnect.
pub async fn run_daemon(session: &SessionManager, interval_secs: u64) -> Result<()> {
    // Check authentication first
    let status = session.status_check().await;
    if !status.authenticated {
        eprintln!("Error: Not signed in to Lattice Cloud.");
        eprintln!("Run 'lattice login' first to authenticate.");
        std::process::exit(1);
    }

    let identity = session
        .identity()
        .expect("authenticated session always has an identity");
    let client = session.authenticated_client()?;

    tracing::info!(
        "Starting heartbeat daemon for '{}' every {}s",
        identity.display_name,
        interval_secs
    );

    let mut reporter = LivenessReporter::start_with_interval(
        client,
        identity,
        Duration::from_secs(interval_secs.max(1)),
    );
    let mut disconnect = reporter.disconnect_signal();

    tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("Shutdown signal received, stopping daemon");
        }
        _ = disconnect.changed() => {
            tracing::error!("Lost connection to Lattice Cloud, stopping daemon");
            reporter.stop().await;
            eprintln!("Heartbeat failed repeatedly. Check connectivity, then run 'lattice run' again.");
            std::process::exit(1);
        }
    }

    reporter.stop().await;
    tracing::info!("Daemon stopped");
    Ok(())
}

/// Resolve when SIGTERM (Unix) or Ctrl+C arrives.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm =
            signal(SignalKind::terminate()).expect("Failed to register SIGTERM handler");
        tokio::select! {
            _ = sigterm.recv() => tracing::info!("Received SIGTERM"),
            _ = tokio::signal::ctrl_c() => tracing::info!("Received Ctrl+C"),
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("Received Ctrl+C");
    }
}
