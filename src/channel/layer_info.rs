//! Metadata published by protocol layers into the channels they own.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

static LAYER_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier of a protocol layer (or any other channel owner).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LayerId(u64);

impl LayerId {
    /// Generate a new unique layer ID.
    pub fn new() -> Self {
        Self(LAYER_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for LayerId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for LayerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "layer-{}", self.0)
    }
}

/// Endpoint metadata of a TCP stub.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpInfo {
    pub owner: LayerId,
    pub local: SocketAddr,
    pub remote: Option<SocketAddr>,
    pub listening: bool,
}

/// Metadata of a UDP stub.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpInfo {
    pub owner: LayerId,
    /// Client socket endpoint, `None` in server mode.
    pub client_local: Option<SocketAddr>,
    pub num_cpus: usize,
}

/// Result of a completed TLS handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsInfo {
    pub owner: LayerId,
    pub is_server: bool,
    pub server_name: Option<String>,
    pub alpn_protocol: Option<Vec<u8>>,
    pub protocol_version: Option<String>,
}

/// One piece of metadata, as published by a single layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayerInfoPart {
    Tcp(TcpInfo),
    Udp(UdpInfo),
    Tls(TlsInfo),
}

impl LayerInfoPart {
    fn set_owner(&mut self, owner: LayerId) {
        match self {
            LayerInfoPart::Tcp(info) => info.owner = owner,
            LayerInfoPart::Udp(info) => info.owner = owner,
            LayerInfoPart::Tls(info) => info.owner = owner,
        }
    }
}

/// Everything the layers of one stack published so far.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LayerInfo {
    pub tcp: Option<TcpInfo>,
    pub udp: Option<UdpInfo>,
    pub tls: Option<TlsInfo>,
}

impl LayerInfo {
    pub(crate) fn apply(&mut self, mut part: LayerInfoPart, owner: LayerId) {
        part.set_owner(owner);
        match part {
            LayerInfoPart::Tcp(info) => self.tcp = Some(info),
            LayerInfoPart::Udp(info) => self.udp = Some(info),
            LayerInfoPart::Tls(info) => self.tls = Some(info),
        }
    }

    /// Copy every part `other` carries into `self`.
    pub(crate) fn merge_from(&mut self, other: &LayerInfo) {
        if other.tcp.is_some() {
            self.tcp = other.tcp.clone();
        }
        if other.udp.is_some() {
            self.udp = other.udp.clone();
        }
        if other.tls.is_some() {
            self.tls = other.tls.clone();
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.tcp.as_ref().map(|tcp| tcp.local)
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.tcp.as_ref().and_then(|tcp| tcp.remote)
    }
}
