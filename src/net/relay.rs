//! Byte relay between a transport and the pipe above it.

use tokio::io::{AsyncRead, AsyncWrite};

use crate::channel::{LayerId, PipeEnd};
use crate::error::NetError;
use crate::lifecycle::Shutdown;

/// Copy bytes both ways between `transport` and `pipe` until either side
/// closes or `shutdown` fires, then cancel the layer.
///
/// I/O failures are recorded as exceptions on `end`.
pub(crate) fn spawn_relay<T, P>(
    op: &'static str,
    layer: LayerId,
    mut transport: T,
    mut pipe: P,
    shutdown: Shutdown,
    end: PipeEnd,
) where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    P: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let outcome = tokio::select! {
            biased;
            _ = shutdown.triggered() => None,
            result = tokio::io::copy_bidirectional(&mut transport, &mut pipe) => Some(result),
        };

        match outcome {
            Some(Ok((to_pipe, to_transport))) => {
                tracing::trace!(%layer, op, to_pipe, to_transport, "Relay finished");
            }
            Some(Err(e)) => {
                tracing::debug!(%layer, op, error = %e, "Relay failed");
                end.add_exception(NetError::io(op, e));
            }
            None => {
                tracing::trace!(%layer, op, "Relay cancelled");
            }
        }
        shutdown.trigger();
    });
}
