//! OS signal handling.
//!
//! # Responsibilities
//! - Translate SIGTERM/SIGINT into a shutdown trigger
//! - Translate SIGHUP into a certificate reload
//!
//! # Design Decisions
//! - Uses Tokio's signal handling (async-safe)
//! - SIGHUP triggers a reload, not shutdown

use std::sync::Arc;

use crate::lifecycle::Shutdown;
use crate::net::CertificateWatcher;

/// Wait for ctrl-c (or SIGTERM on unix), then fire `shutdown`.
pub async fn shutdown_on_signal(shutdown: Arc<Shutdown>) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(e) => {
                tracing::warn!(error = %e, "SIGTERM handler unavailable, listening for ctrl-c only");
                let _ = tokio::signal::ctrl_c().await;
                shutdown.trigger();
                return;
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => tracing::info!("Received ctrl-c"),
            _ = term.recv() => tracing::info!("Received SIGTERM"),
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("Received ctrl-c");
    }

    shutdown.trigger();
}

/// Reload the certificate every time the process receives SIGHUP.
///
/// Returns when `shutdown` fires.
#[cfg(unix)]
pub async fn reload_on_sighup(watcher: Arc<CertificateWatcher>, shutdown: Arc<Shutdown>) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut stop = shutdown.subscribe();
    let mut hup = match signal(SignalKind::hangup()) {
        Ok(hup) => hup,
        Err(e) => {
            tracing::warn!(error = %e, "SIGHUP handler unavailable, manual reload disabled");
            return;
        }
    };

    loop {
        tokio::select! {
            _ = stop.recv() => return,
            received = hup.recv() => {
                if received.is_none() {
                    return;
                }
                tracing::info!("Received SIGHUP, reloading certificate");
                // Failures are logged and counted by the watcher.
                let _ = watcher.reload().await;
            }
        }
    }
}

#[cfg(not(unix))]
pub async fn reload_on_sighup(_watcher: Arc<CertificateWatcher>, shutdown: Arc<Shutdown>) {
    shutdown.subscribe().recv().await;
}
