//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! Stubs, listeners and channels produce:
//!     → logging.rs (structured log events)
//!     → metrics.rs (counters, gauges)
//!
//! Consumers:
//!     → whatever subscriber / recorder the embedding application installs
//! ```
//!
//! # Design Decisions
//! - State changes log at info, transient noise at debug/trace
//! - Repeated identical failures are suppressed (see `resilience::ErrorLogGate`)

pub mod logging;
pub mod metrics;
