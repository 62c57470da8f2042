//! Timeout enforcement.
//!
//! # Responsibilities
//! - Race socket operations against a deadline and a cancellation context
//! - Drop the losing future so the socket it owns is closed
//!
//! # Design Decisions
//! - Uses Tokio's timeout facilities
//! - Timeout and cancellation map to distinct error variants

use std::future::Future;
use std::time::Duration;

use crate::error::{NetError, Result};
use crate::lifecycle::Shutdown;

/// Run `future` until it completes, `timeout` elapses or `shutdown` fires.
///
/// A `None` timeout waits indefinitely (still cancelable).
pub async fn run_with_deadline<F, T>(
    op: &'static str,
    timeout: Option<Duration>,
    shutdown: &Shutdown,
    future: F,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    if shutdown.is_triggered() {
        return Err(NetError::Cancelled(op));
    }

    let bounded = async {
        match timeout {
            Some(limit) => match tokio::time::timeout(limit, future).await {
                Ok(result) => result,
                Err(_) => Err(NetError::Timeout(op, limit)),
            },
            None => future.await,
        }
    };

    tokio::select! {
        biased;
        _ = shutdown.triggered() => Err(NetError::Cancelled(op)),
        result = bounded => result,
    }
}
