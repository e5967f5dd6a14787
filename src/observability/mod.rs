//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! net layer produces:
//!     → logging.rs (structured log events via tracing)
//!     → metrics.rs (admission, reload and handshake counters)
//!
//! Consumers:
//!     → Log aggregation (stdout)
//!     → Metrics endpoint (Prometheus scrape)
//! ```

pub mod logging;
pub mod metrics;
