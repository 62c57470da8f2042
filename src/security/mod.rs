//! Security subsystem.
//!
//! # Data Flow
//! ```text
//! Accepted TCP socket (source address known only now):
//!     → rate_limit.rs (exempt? deny? concurrency cap? token bucket?)
//!     → admitted: permit travels with the connection, released on close
//!     → rejected: socket closed, accept loop continues immediately
//! ```
//!
//! # Design Decisions
//! - Limiters are named profiles from configuration, shared per name
//! - Rejection is not an error; it only shows up in debug logs and metrics

pub mod rate_limit;

pub use rate_limit::{
    AdmitPermit, ConnectionRateLimiter, RateLimiterRegistry, SourceRateLimiter,
};
