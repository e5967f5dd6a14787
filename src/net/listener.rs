//! Listener capability and the plain TCP base listener.
//!
//! # Responsibilities
//! - Define the accept/close/address capability every decorator presents
//! - Bind to configured address
//! - Accept incoming TCP connections
//! - Make `close` unblock tasks parked in `accept`

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;

use crate::lifecycle::CloseSignal;
use crate::net::certificate::CertificateError;

/// Error type for listener operations.
#[derive(Debug, Error)]
pub enum ListenerError {
    /// The listener was closed before or while waiting to accept.
    #[error("listener closed")]
    Closed,
    /// Failed to bind to address.
    #[error("failed to bind: {0}")]
    Bind(#[source] io::Error),
    /// Failed to accept connection.
    #[error("failed to accept: {0}")]
    Accept(#[source] io::Error),
    /// A connection limit of zero can never admit anything.
    #[error("connection limit must be at least 1, got {0}")]
    InvalidLimit(usize),
    /// TLS negotiation with a single peer failed.
    #[error("tls handshake failed: {0}")]
    Handshake(#[source] io::Error),
    /// Certificate selection failed for a single handshake.
    #[error(transparent)]
    Certificate(#[from] CertificateError),
    /// The TLS server configuration could not be built.
    #[error("tls configuration: {0}")]
    Tls(#[from] rustls::Error),
}

impl ListenerError {
    /// Classify an I/O error surfaced by a TLS handshake.
    pub(crate) fn from_handshake(err: io::Error) -> Self {
        let unavailable = err
            .get_ref()
            .and_then(|inner| inner.downcast_ref::<CertificateError>())
            .is_some_and(|inner| matches!(inner, CertificateError::Unavailable));

        if unavailable {
            ListenerError::Certificate(CertificateError::Unavailable)
        } else {
            ListenerError::Handshake(err)
        }
    }
}

/// Accept/close/address capability shared by the base listener and every
/// decorator, so they nest in any order.
#[async_trait]
pub trait Listener: Send + Sync + 'static {
    type Conn: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Wait for the next connection.
    async fn accept(&self) -> Result<(Self::Conn, SocketAddr), ListenerError>;

    /// Stop accepting. Safe to call any number of times from any task.
    async fn close(&self) -> Result<(), ListenerError>;

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

#[async_trait]
impl<L: Listener> Listener for Arc<L> {
    type Conn = L::Conn;

    async fn accept(&self) -> Result<(Self::Conn, SocketAddr), ListenerError> {
        (**self).accept().await
    }

    async fn close(&self) -> Result<(), ListenerError> {
        (**self).close().await
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        (**self).local_addr()
    }
}

/// The base listener: a tokio `TcpListener` that can be closed while other
/// tasks are blocked accepting on it.
pub struct TcpAcceptor {
    /// `None` once closed; the socket is dropped with it.
    inner: RwLock<Option<TcpListener>>,
    local_addr: SocketAddr,
    closed: CloseSignal,
}

impl TcpAcceptor {
    /// Bind to the given address.
    pub async fn bind(address: &str) -> Result<Self, ListenerError> {
        let addr: SocketAddr = address
            .parse()
            .map_err(|e| ListenerError::Bind(io::Error::new(io::ErrorKind::InvalidInput, e)))?;

        let listener = TcpListener::bind(addr).await.map_err(ListenerError::Bind)?;
        Self::from_listener(listener)
    }

    /// Wrap an already bound tokio listener.
    pub fn from_listener(listener: TcpListener) -> Result<Self, ListenerError> {
        let local_addr = listener.local_addr().map_err(ListenerError::Bind)?;

        tracing::info!(address = %local_addr, "Listener bound");

        Ok(Self {
            inner: RwLock::new(Some(listener)),
            local_addr,
            closed: CloseSignal::new(),
        })
    }
}

#[async_trait]
impl Listener for TcpAcceptor {
    type Conn = TcpStream;

    async fn accept(&self) -> Result<(TcpStream, SocketAddr), ListenerError> {
        if self.closed.is_triggered() {
            return Err(ListenerError::Closed);
        }

        let guard = self.inner.read().await;
        let listener = guard.as_ref().ok_or(ListenerError::Closed)?;

        tokio::select! {
            biased;
            _ = self.closed.triggered() => Err(ListenerError::Closed),
            accepted = listener.accept() => accepted.map_err(ListenerError::Accept),
        }
    }

    async fn close(&self) -> Result<(), ListenerError> {
        if self.closed.trigger() {
            // Pending accepts release their read guards once they see the signal.
            let socket = self.inner.write().await.take();
            drop(socket);
            tracing::info!(address = %self.local_addr, "Listener closed");
        }
        Ok(())
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.local_addr)
    }
}
