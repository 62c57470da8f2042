//! Error types for the network core.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

/// Convenience alias used across the crate.
pub type Result<T, E = NetError> = std::result::Result<T, E>;

/// Errors that can occur in protocol layers, listeners and channels.
#[derive(Debug, Error)]
pub enum NetError {
    /// The call is not valid in the current state of the object
    /// (e.g. `connect` on a listening stub). Never retried.
    #[error("invalid operation: {0}")]
    InvalidState(&'static str),

    /// Configuration could not be resolved (unknown profile, bad value).
    #[error("configuration error: {0}")]
    Config(String),

    /// An operating system socket call failed.
    #[error("{op} failed: {source}")]
    Io {
        op: &'static str,
        #[source]
        source: io::Error,
    },

    /// Binding a local endpoint failed.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// The operation did not finish in time.
    #[error("{0} timed out after {1:?}")]
    Timeout(&'static str, Duration),

    /// The operation was cancelled by its owner.
    #[error("{0} cancelled")]
    Cancelled(&'static str),

    /// The channel the operation relies on has been disconnected.
    #[error("channel disconnected")]
    Disconnected,

    /// A channel end already carries an attachment.
    #[error("channel end already attached")]
    AlreadyAttached,

    /// The byte stream of a channel end was already handed out.
    #[error("channel stream already taken")]
    StreamTaken,

    /// No free port could be bound within the configured budget.
    #[error("no random port could be bound after {0} attempts")]
    RandomPortExhausted(usize),

    /// Host name resolution failed.
    #[error("cannot resolve {host}: {reason}")]
    Dns { host: String, reason: String },

    /// TLS setup or handshake failed.
    #[error("TLS error: {0}")]
    Tls(String),
}

impl NetError {
    /// Wrap an I/O error with the name of the failing operation.
    pub fn io(op: &'static str, source: io::Error) -> Self {
        NetError::Io { op, source }
    }

    /// True for cancellation and disconnection, which are expected on shutdown.
    pub fn is_shutdown(&self) -> bool {
        matches!(self, NetError::Cancelled(_) | NetError::Disconnected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_error_keeps_operation_name() {
        let err = NetError::io("accept", io::Error::from(io::ErrorKind::ConnectionReset));
        assert!(err.to_string().starts_with("accept failed"));
        assert!(!err.is_shutdown());
        assert!(NetError::Cancelled("connect").is_shutdown());
    }
}
