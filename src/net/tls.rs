//! TLS termination with live certificate rotation.
//!
//! # Responsibilities
//! - Wrap any [`Listener`] and terminate TLS on its connections
//! - Select the certificate per handshake from a [`CertificateWatcher`]
//! - Keep handshakes off the accept path
//!
//! # Handshake
//! ```text
//! Hello ──▶ Negotiating ──▶ Ready
//!   │            │
//!   └────────────┴──▶ Failed
//! ```
//! The ClientHello is read first. A connection that arrives while no
//! certificate is loaded fails there with `CertificateError::Unavailable`;
//! every later failure is an ordinary handshake error.

use std::fmt;
use std::future::{poll_fn, Future};
use std::io;
use std::net::SocketAddr;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use async_trait::async_trait;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::server::Acceptor;
use rustls::ServerConfig;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_rustls::server::TlsStream;
use tokio_rustls::{Accept, LazyConfigAcceptor, StartHandshake};

use crate::config::TlsConfig;
use crate::lifecycle::CloseSignal;
use crate::net::certificate::CertificateWatcher;
use crate::net::listener::{Listener, ListenerError};
use crate::observability::metrics;

/// Certificate selection callback handed to rustls.
struct WatchedCertResolver {
    watcher: Arc<CertificateWatcher>,
}

impl fmt::Debug for WatchedCertResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchedCertResolver")
            .field("cert_path", &self.watcher.cert_path())
            .finish()
    }
}

impl ResolvesServerCert for WatchedCertResolver {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        self.watcher.current_certificate().ok()
    }
}

/// A listener decorator that terminates TLS using certificates reloaded
/// from disk as they change.
pub struct TlsListener<L> {
    inner: L,
    config: Arc<ServerConfig>,
    watcher: Arc<CertificateWatcher>,
    closed: CloseSignal,
}

impl<L: Listener> TlsListener<L> {
    /// Wrap `inner`, serving the certificate at `cert_path` with the key at `key_path`.
    ///
    /// Must be called inside a tokio runtime: the certificate watcher starts
    /// immediately in the background.
    pub fn new(
        inner: L,
        cert_path: impl AsRef<Path>,
        key_path: impl AsRef<Path>,
    ) -> Result<Self, ListenerError> {
        Self::build(inner, cert_path.as_ref(), key_path.as_ref(), Vec::new())
    }

    /// Wrap `inner` using a listener's TLS configuration.
    pub fn from_config(inner: L, config: &TlsConfig) -> Result<Self, ListenerError> {
        let alpn = config
            .alpn_protocols
            .iter()
            .map(|protocol| protocol.as_bytes().to_vec())
            .collect();
        Self::build(
            inner,
            Path::new(&config.cert_path),
            Path::new(&config.key_path),
            alpn,
        )
    }

    fn build(
        inner: L,
        cert_path: &Path,
        key_path: &Path,
        alpn_protocols: Vec<Vec<u8>>,
    ) -> Result<Self, ListenerError> {
        let watcher = CertificateWatcher::new(cert_path, key_path);
        let resolver = Arc::new(WatchedCertResolver {
            watcher: Arc::clone(&watcher),
        });

        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let mut config = ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_cert_resolver(resolver);
        config.alpn_protocols = alpn_protocols;

        watcher.start();

        Ok(Self {
            inner,
            config: Arc::new(config),
            watcher,
            closed: CloseSignal::new(),
        })
    }

    pub fn watcher(&self) -> &Arc<CertificateWatcher> {
        &self.watcher
    }

    pub fn get_ref(&self) -> &L {
        &self.inner
    }
}

#[async_trait]
impl<L: Listener> Listener for TlsListener<L> {
    type Conn = TlsConnection<L::Conn>;

    async fn accept(&self) -> Result<(Self::Conn, SocketAddr), ListenerError> {
        if self.closed.is_triggered() {
            return Err(ListenerError::Closed);
        }

        let (conn, peer) = self.inner.accept().await?;
        let hello = LazyConfigAcceptor::new(Acceptor::default(), conn);
        let conn = TlsConnection::new(
            hello,
            Arc::clone(&self.config),
            Arc::clone(&self.watcher),
            peer,
        );
        Ok((conn, peer))
    }

    async fn close(&self) -> Result<(), ListenerError> {
        let result = self.inner.close().await;
        if self.closed.trigger() {
            self.watcher.close();
            tracing::debug!("TLS listener closed");
        }
        result
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }
}

impl<L> Drop for TlsListener<L> {
    fn drop(&mut self) {
        self.watcher.close();
    }
}

enum HandshakeState<C> {
    Hello(LazyConfigAcceptor<C>),
    Negotiating(Accept<C>),
    Ready(Box<TlsStream<C>>),
    Failed,
    Closed,
}

/// A connection whose TLS handshake runs on first use.
///
/// Call [`TlsConnection::handshake`] to drive it explicitly, or just read
/// and write. A failed handshake affects only this connection.
pub struct TlsConnection<C> {
    state: HandshakeState<C>,
    config: Arc<ServerConfig>,
    watcher: Arc<CertificateWatcher>,
    peer: SocketAddr,
}

impl<C> TlsConnection<C>
where
    C: AsyncRead + AsyncWrite + Unpin,
{
    fn new(
        hello: LazyConfigAcceptor<C>,
        config: Arc<ServerConfig>,
        watcher: Arc<CertificateWatcher>,
        peer: SocketAddr,
    ) -> Self {
        Self {
            state: HandshakeState::Hello(hello),
            config,
            watcher,
            peer,
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn is_established(&self) -> bool {
        matches!(self.state, HandshakeState::Ready(_))
    }

    /// The negotiated stream, once the handshake has completed.
    pub fn get_ref(&self) -> Option<&TlsStream<C>> {
        match &self.state {
            HandshakeState::Ready(stream) => Some(stream.as_ref()),
            _ => None,
        }
    }

    /// Complete the TLS handshake.
    pub async fn handshake(&mut self) -> Result<(), ListenerError> {
        poll_fn(|cx| self.poll_handshake(cx))
            .await
            .map_err(ListenerError::from_handshake)
    }

    fn poll_handshake(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        loop {
            match &mut self.state {
                HandshakeState::Ready(_) => return Poll::Ready(Ok(())),
                HandshakeState::Failed => {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::NotConnected,
                        "tls handshake previously failed",
                    )))
                }
                HandshakeState::Closed => {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::NotConnected,
                        "connection closed before tls handshake",
                    )))
                }
                HandshakeState::Hello(hello) => {
                    let result = ready!(Pin::new(hello).poll(cx));
                    if let Err(e) = self.on_client_hello(result) {
                        return Poll::Ready(Err(e));
                    }
                }
                HandshakeState::Negotiating(accept) => {
                    let result = ready!(Pin::new(accept).poll(cx));
                    return Poll::Ready(self.on_negotiated(result));
                }
            }
        }
    }

    fn on_client_hello(&mut self, result: io::Result<StartHandshake<C>>) -> io::Result<()> {
        let start = match result {
            Ok(start) => start,
            Err(e) => return Err(self.fail("handshake", e)),
        };

        // The stored certificate is never cleared, so once present here the
        // resolver will find it too.
        if let Err(unavailable) = self.watcher.current_certificate() {
            drop(start);
            return Err(self.fail("certificate_unavailable", io::Error::other(unavailable)));
        }

        self.state = HandshakeState::Negotiating(start.into_stream(Arc::clone(&self.config)));
        Ok(())
    }

    fn on_negotiated(&mut self, result: io::Result<TlsStream<C>>) -> io::Result<()> {
        match result {
            Ok(stream) => {
                self.state = HandshakeState::Ready(Box::new(stream));
                tracing::debug!(peer_addr = %self.peer, "TLS handshake completed");
                Ok(())
            }
            Err(e) => Err(self.fail("handshake", e)),
        }
    }

    fn fail(&mut self, reason: &'static str, e: io::Error) -> io::Error {
        self.state = HandshakeState::Failed;
        metrics::record_handshake_failure(reason);
        tracing::debug!(peer_addr = %self.peer, reason, error = %e, "TLS handshake failed");
        e
    }

    fn poll_stream(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<&mut TlsStream<C>>> {
        ready!(self.poll_handshake(cx))?;
        match &mut self.state {
            HandshakeState::Ready(stream) => Poll::Ready(Ok(stream.as_mut())),
            _ => Poll::Ready(Err(io::ErrorKind::NotConnected.into())),
        }
    }
}

impl<C> fmt::Debug for TlsConnection<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.state {
            HandshakeState::Hello(_) => "hello",
            HandshakeState::Negotiating(_) => "negotiating",
            HandshakeState::Ready(_) => "ready",
            HandshakeState::Failed => "failed",
            HandshakeState::Closed => "closed",
        };
        f.debug_struct("TlsConnection")
            .field("peer", &self.peer)
            .field("state", &state)
            .finish()
    }
}

impl<C> AsyncRead for TlsConnection<C>
where
    C: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let stream = ready!(self.get_mut().poll_stream(cx))?;
        Pin::new(stream).poll_read(cx, buf)
    }
}

impl<C> AsyncWrite for TlsConnection<C>
where
    C: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let stream = ready!(self.get_mut().poll_stream(cx))?;
        Pin::new(stream).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let stream = ready!(self.get_mut().poll_stream(cx))?;
        Pin::new(stream).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match &mut this.state {
            HandshakeState::Ready(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
            // Dropping the half-finished handshake closes the inner connection.
            HandshakeState::Hello(_)
            | HandshakeState::Negotiating(_)
            | HandshakeState::Failed => {
                this.state = HandshakeState::Closed;
                Poll::Ready(Ok(()))
            }
            HandshakeState::Closed => Poll::Ready(Ok(())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::TcpAcceptor;

    #[tokio::test]
    async fn closing_stops_the_watcher() {
        let dir = tempfile::tempdir().unwrap();
        let base = TcpAcceptor::bind("127.0.0.1:0").await.unwrap();
        let listener =
            TlsListener::new(base, dir.path().join("tls.crt"), dir.path().join("tls.key")).unwrap();
        let watcher = Arc::clone(listener.watcher());

        listener.close().await.unwrap();
        listener.close().await.unwrap();

        tokio::time::timeout(std::time::Duration::from_secs(2), watcher.stopped())
            .await
            .expect("watch loop should observe the close");
        assert!(matches!(listener.accept().await, Err(ListenerError::Closed)));
    }

    #[tokio::test]
    async fn dropping_the_listener_stops_the_watcher() {
        let dir = tempfile::tempdir().unwrap();
        let base = TcpAcceptor::bind("127.0.0.1:0").await.unwrap();
        let listener =
            TlsListener::new(base, dir.path().join("tls.crt"), dir.path().join("tls.key")).unwrap();
        let watcher = Arc::clone(listener.watcher());

        drop(listener);

        tokio::time::timeout(std::time::Duration::from_secs(2), watcher.stopped())
            .await
            .expect("watch loop should stop once its listener is gone");
    }

    #[tokio::test]
    async fn garbage_before_first_load_is_a_handshake_error() {
        use tokio::io::AsyncWriteExt;

        let dir = tempfile::tempdir().unwrap();
        let base = TcpAcceptor::bind("127.0.0.1:0").await.unwrap();
        let listener =
            TlsListener::new(base, dir.path().join("tls.crt"), dir.path().join("tls.key")).unwrap();
        let addr = listener.local_addr().unwrap();

        let mut client = tokio::net::TcpStream::connect(addr).await.unwrap();
        client.write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n").await.unwrap();

        let (mut conn, _) = listener.accept().await.unwrap();
        let err = conn.handshake().await.unwrap_err();
        assert!(matches!(err, ListenerError::Handshake(_)), "got {err:?}");
        assert!(!conn.is_established());
        listener.close().await.unwrap();
    }

    #[tokio::test]
    async fn alpn_protocols_come_from_config() {
        let dir = tempfile::tempdir().unwrap();
        let base = TcpAcceptor::bind("127.0.0.1:0").await.unwrap();
        let config = TlsConfig {
            cert_path: dir.path().join("tls.crt").display().to_string(),
            key_path: dir.path().join("tls.key").display().to_string(),
            alpn_protocols: vec!["h2".into()],
        };

        let listener = TlsListener::from_config(base, &config).unwrap();
        assert!(listener.watcher().cert_path().ends_with("tls.crt"));
        listener.close().await.unwrap();
    }
}
