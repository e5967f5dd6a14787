//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs):
//!     Config → TcpAcceptor → [ConnectionLimiter] → [TlsListener] → accept loop
//!
//! Shutdown (shutdown.rs):
//!     Signal received (latched) → close listener stack → accept loop exits
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Trigger shutdown
//!     SIGHUP → Trigger certificate reload
//! ```

pub mod shutdown;
pub mod signals;
pub mod startup;

pub use shutdown::{CloseSignal, Shutdown, ShutdownReceiver};
