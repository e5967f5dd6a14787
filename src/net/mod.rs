//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → listener.rs (TcpAcceptor, the base listener)
//!     → limit.rs (admission slot acquired before accepting)
//!     → tls.rs (lazy TLS handshake, certificate from certificate.rs)
//!     → connection.rs (slot released on first close)
//!     → Hand off to the connection handler
//! ```
//!
//! # Design Decisions
//! - Every layer implements [`Listener`], so decorators nest in either order
//! - `close` is idempotent on every layer and wakes blocked acceptors
//! - TLS is optional and handled transparently

pub mod certificate;
pub mod connection;
pub mod limit;
pub mod listener;
pub mod tls;

pub use certificate::{CertificateError, CertificateWatcher, WatchState};
pub use connection::{AdmissionSlot, ConnectionId, LimitedConnection};
pub use limit::ConnectionLimiter;
pub use listener::{Listener, ListenerError, TcpAcceptor};
pub use tls::{TlsConnection, TlsListener};
