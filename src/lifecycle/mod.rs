//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Listener / stub owns a Shutdown
//!     → child nodes for ports, receive instances, accepted sockets
//!     → trigger(): stop accepting → disconnect channels → tasks exit
//!     → connections.rs: wait until every accepted-connection handler returned
//! ```
//!
//! # Design Decisions
//! - Cancellation is explicit: every task receives the node it obeys
//! - Links between nodes are weak, so cancellation never keeps objects alive
//! - Hooks run once, in the triggering thread, outside the node's locks

pub mod connections;
pub mod shutdown;

pub use connections::{ConnectionGuard, ConnectionId, ConnectionTracker};
pub use shutdown::Shutdown;
