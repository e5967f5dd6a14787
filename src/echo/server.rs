//! Accept loop and per-connection echo handler.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::lifecycle::Shutdown;
use crate::net::{Listener, ListenerError};

/// Pause after an OS-level accept failure (e.g. out of file descriptors).
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Serves an echo protocol on any [`Listener`].
pub struct EchoServer<L> {
    listener: Arc<L>,
}

impl<L: Listener> EchoServer<L> {
    pub fn new(listener: L) -> Self {
        Self {
            listener: Arc::new(listener),
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until `shutdown` fires, then close the listener.
    pub async fn run(self, shutdown: &Shutdown) {
        let mut stop = shutdown.subscribe();
        let closer = {
            let listener = Arc::clone(&self.listener);
            tokio::spawn(async move {
                stop.recv().await;
                if let Err(e) = listener.close().await {
                    tracing::warn!(error = %e, "Error closing listener");
                }
            })
        };

        if let Ok(addr) = self.listener.local_addr() {
            tracing::info!(address = %addr, "Echo server accepting connections");
        }

        loop {
            match self.listener.accept().await {
                Ok((conn, peer)) => {
                    tokio::spawn(handle_connection(conn, peer));
                }
                Err(ListenerError::Closed) => break,
                Err(ListenerError::Accept(e)) => {
                    tracing::warn!(error = %e, "Accept failed");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
                Err(e) => tracing::debug!(error = %e, "Connection rejected"),
            }
        }

        closer.abort();
        tracing::info!("Echo server stopped");
    }
}

async fn handle_connection<C>(mut conn: C, peer: SocketAddr)
where
    C: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; 8 * 1024];
    let mut echoed = 0usize;

    loop {
        let n = match conn.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                tracing::debug!(peer_addr = %peer, error = %e, "Connection read failed");
                break;
            }
        };
        if let Err(e) = conn.write_all(&buf[..n]).await {
            tracing::debug!(peer_addr = %peer, error = %e, "Connection write failed");
            break;
        }
        echoed += n;
    }

    let _ = conn.shutdown().await;
    tracing::debug!(peer_addr = %peer, bytes = echoed, "Connection closed");
}
