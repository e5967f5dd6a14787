//! Echo service used by the `edge-listener` binary.
//!
//! # Data Flow
//! ```text
//! Listener stack (any nesting of net decorators)
//!     → server.rs (accept loop, one task per connection)
//!     → bytes echoed back until the peer closes
//! ```

pub mod server;

pub use server::EchoServer;
