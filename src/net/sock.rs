//! Application-facing socket objects.
//!
//! # Responsibilities
//! - [`ConnSock`]: a connected stack of layers (TCP, optionally TLS on top)
//! - [`SockStream`]: the attached byte stream of a stack's top layer
//! - [`UdpSock`]: the datagram view of a UDP stub

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use rustls::{ClientConfig, ServerConfig};
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};

use crate::channel::{Datagram, LayerId, LayerInfo, PipeAttach, PipeEnd, TlsInfo};
use crate::config::{NetConfig, PipeConfig, TcpConfig};
use crate::error::{NetError, Result};
use crate::layer::Stack;
use crate::lifecycle::Shutdown;
use crate::net::dns::{DnsResolver, IpVersion};
use crate::net::tcp::TcpStub;
use crate::net::tls::TlsStack;
use crate::security::AdmitPermit;

/// A connected stack, bottom layer first.
///
/// Dropping it tears the stack down from the top.
pub struct ConnSock {
    bottom: Stack,
    upper: Vec<Stack>,
    tcp: TcpConfig,
    pipe: PipeConfig,
    _permit: Option<AdmitPermit>,
}

impl ConnSock {
    pub(crate) fn new(bottom: Stack, permit: Option<AdmitPermit>) -> Self {
        let (tcp, pipe) = match &bottom {
            Stack::Tcp(stub) => {
                let (tcp, pipe) = stub.configs();
                (tcp.clone(), pipe.clone())
            }
            _ => (TcpConfig::default(), PipeConfig::default()),
        };
        Self {
            bottom,
            upper: Vec::new(),
            tcp,
            pipe,
            _permit: permit,
        }
    }

    /// Open a TCP connection to `remote`.
    pub async fn connect(config: &NetConfig, remote: SocketAddr, timeout: Option<Duration>) -> Result<Self> {
        let stub = TcpStub::new(config.tcp.clone(), config.pipe.clone())?;
        stub.connect(remote, timeout).await?;
        Ok(Self::new(Stack::Tcp(stub), None))
    }

    /// Resolve `host` and open a TCP connection to it.
    pub async fn connect_host(
        config: &NetConfig,
        host: &str,
        port: u16,
        family: Option<IpVersion>,
        timeout: Option<Duration>,
        resolver: &dyn DnsResolver,
    ) -> Result<Self> {
        let stub = TcpStub::new(config.tcp.clone(), config.pipe.clone())?;
        stub.connect_host(host, port, family, timeout, resolver).await?;
        Ok(Self::new(Stack::Tcp(stub), None))
    }

    fn top(&self) -> &Stack {
        self.upper.last().unwrap_or(&self.bottom)
    }

    /// Layers from bottom to top.
    pub fn stacks(&self) -> impl Iterator<Item = &Stack> {
        std::iter::once(&self.bottom).chain(self.upper.iter())
    }

    /// The consumer end of the top layer.
    pub fn consumer_end(&self) -> PipeEnd {
        self.top().consumer_end()
    }

    pub fn layer_info(&self) -> LayerInfo {
        self.consumer_end().layer_info()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.layer_info().local_addr()
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.layer_info().remote_addr()
    }

    pub fn tls_info(&self) -> Option<TlsInfo> {
        self.layer_info().tls
    }

    /// Attach to the top layer and take its byte stream.
    ///
    /// Succeeds once; the stream stays valid while this socket lives.
    pub fn stream(&self) -> Result<SockStream> {
        let attach = self.consumer_end().attach(LayerId::new(), false)?;
        let inner = attach.take_stream()?;
        Ok(SockStream {
            _attach: attach,
            inner,
        })
    }

    /// Terminate TLS as a server on top of the current stack.
    pub async fn start_tls_server(
        &mut self,
        config: Arc<ServerConfig>,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let timeout = timeout.or(Some(self.tcp.tls_handshake_timeout()));
        let tls = TlsStack::accept(&self.consumer_end(), config, timeout, &self.pipe).await?;
        self.upper.push(Stack::Tls(tls));
        Ok(())
    }

    /// Start TLS as a client on top of the current stack.
    pub async fn start_tls_client(
        &mut self,
        config: Arc<ClientConfig>,
        server_name: &str,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let timeout = timeout.or(Some(self.tcp.tls_handshake_timeout()));
        let tls =
            TlsStack::connect(&self.consumer_end(), config, server_name, timeout, &self.pipe).await?;
        self.upper.push(Stack::Tls(tls));
        Ok(())
    }

    /// Cancellation context of the bottom layer; triggering it tears down
    /// the whole stack.
    pub fn shutdown(&self) -> &Shutdown {
        self.bottom.core().shutdown()
    }

    pub fn disconnect(&self) {
        for stack in self.upper.iter().rev() {
            stack.cancel();
        }
        self.bottom.cancel();
    }

    pub fn is_disconnected(&self) -> bool {
        self.consumer_end().is_disconnected()
    }

    /// Wait until the stack is torn down.
    pub async fn closed(&self) {
        self.consumer_end().disconnected().await
    }
}

impl Drop for ConnSock {
    fn drop(&mut self) {
        while let Some(stack) = self.upper.pop() {
            drop(stack);
        }
    }
}

impl std::fmt::Debug for ConnSock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnSock")
            .field("layers", &self.stacks().map(Stack::kind).collect::<Vec<_>>())
            .field("local", &self.local_addr())
            .field("remote", &self.remote_addr())
            .finish()
    }
}

/// Byte stream of a [`ConnSock`]'s top layer.
pub struct SockStream {
    _attach: PipeAttach,
    inner: DuplexStream,
}

impl AsyncRead for SockStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for SockStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Datagram view of a UDP stub.
#[derive(Debug)]
pub struct UdpSock {
    attach: PipeAttach,
}

impl UdpSock {
    pub(crate) fn attach(end: &PipeEnd) -> Result<Self> {
        Ok(Self {
            attach: end.attach(LayerId::new(), false)?,
        })
    }

    fn end(&self) -> &PipeEnd {
        self.attach.end()
    }

    pub fn layer_info(&self) -> LayerInfo {
        self.end().layer_info()
    }

    pub fn is_disconnected(&self) -> bool {
        self.end().is_disconnected()
    }

    /// Send `data` to `remote` from whichever local endpoint fits.
    pub async fn send_to(&self, data: impl Into<Bytes>, remote: SocketAddr) -> Result<()> {
        self.send(Datagram::new(data, remote)).await
    }

    /// Send one datagram; `local` selects the outgoing endpoint.
    pub async fn send(&self, datagram: Datagram) -> Result<()> {
        self.send_batch(vec![datagram]).await.map(|_| ())
    }

    /// Queue a batch, waiting while the outgoing queue is full.
    pub async fn send_batch(&self, batch: Vec<Datagram>) -> Result<usize> {
        self.end()
            .datagram_writer()
            .enqueue_waiting(batch, self.end().shutdown())
            .await
    }

    /// Receive up to `max` datagrams.
    ///
    /// Returns an empty batch when `timeout` elapses first.
    pub async fn recv_batch(&self, max: usize, timeout: Option<Duration>) -> Result<Vec<Datagram>> {
        let reader = self.end().datagram_reader();
        if !reader.is_ready_to_read() {
            let ready = reader
                .wait_ready_to_read(timeout, self.end().shutdown())
                .await
                .map_err(|e| if e.is_shutdown() { NetError::Disconnected } else { e })?;
            if !ready {
                return Ok(Vec::new());
            }
        }
        Ok(reader.dequeue_all(max))
    }
}
