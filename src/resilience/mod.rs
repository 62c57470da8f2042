//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Socket operation:
//!     → timeouts.rs (deadline + cancellation race)
//!     → On failure: backoff.rs (jittered delay before the next attempt)
//!     → retries.rs (log the failure once, suppress repeats)
//! ```
//!
//! # Design Decisions
//! - Every connect has a deadline; every wait observes cancellation
//! - Jittered backoff prevents synchronized rebinding across ports and shards
//! - Listener and receive loops self-heal instead of surfacing errors

pub mod backoff;
pub mod retries;
pub mod timeouts;

pub use backoff::{bind_retry_delay, listener_retry_delay};
pub use retries::ErrorLogGate;
pub use timeouts::run_with_deadline;
