//! Listener decorators: bounded connection admission and TLS termination
//! with certificates reloaded from disk while serving.

pub mod config;
pub mod echo;
pub mod lifecycle;
pub mod net;
pub mod observability;

pub use config::EdgeConfig;
pub use lifecycle::Shutdown;
pub use net::{CertificateWatcher, ConnectionLimiter, Listener, ListenerError, TcpAcceptor, TlsListener};
