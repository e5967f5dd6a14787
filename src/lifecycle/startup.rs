//! Startup orchestration.
//!
//! # Responsibilities
//! - Bind the base listener
//! - Layer the connection limiter and TLS terminator as configured
//! - Start the SIGHUP reload task when TLS is enabled
//! - Run the echo service until shutdown
//!
//! # Design Decisions
//! - Fail fast: any startup error is fatal
//! - The limiter sits under TLS, so a slot is held before the TCP accept

use std::sync::Arc;

use crate::config::EdgeConfig;
use crate::echo::EchoServer;
use crate::lifecycle::{signals, Shutdown};
use crate::net::{ConnectionLimiter, Listener, ListenerError, TcpAcceptor, TlsListener};

/// Build the listener stack described by `config` and serve until `shutdown` fires.
pub async fn run(config: &EdgeConfig, shutdown: Arc<Shutdown>) -> Result<(), ListenerError> {
    let listener_config = &config.listener;
    let base = TcpAcceptor::bind(&listener_config.bind_address).await?;

    match (listener_config.max_connections, &listener_config.tls) {
        (Some(limit), Some(tls)) => {
            let listener = TlsListener::from_config(ConnectionLimiter::new(base, limit)?, tls)?;
            spawn_reload_on_sighup(&listener, &shutdown);
            serve(listener, &shutdown).await
        }
        (None, Some(tls)) => {
            let listener = TlsListener::from_config(base, tls)?;
            spawn_reload_on_sighup(&listener, &shutdown);
            serve(listener, &shutdown).await
        }
        (Some(limit), None) => serve(ConnectionLimiter::new(base, limit)?, &shutdown).await,
        (None, None) => serve(base, &shutdown).await,
    }
}

async fn serve<L: Listener>(listener: L, shutdown: &Shutdown) -> Result<(), ListenerError> {
    EchoServer::new(listener).run(shutdown).await;
    Ok(())
}

fn spawn_reload_on_sighup<L: Listener>(listener: &TlsListener<L>, shutdown: &Arc<Shutdown>) {
    tokio::spawn(signals::reload_on_sighup(
        Arc::clone(listener.watcher()),
        Arc::clone(shutdown),
    ));
}
