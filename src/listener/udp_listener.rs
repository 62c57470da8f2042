//! UDP listener: listener-style endpoints over one server-mode UDP stub.

use std::collections::BTreeSet;
use std::net::IpAddr;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::NetConfig;
use crate::error::{NetError, Result};
use crate::listener::endpoint_keys;
use crate::listener::port::ListenerPortKey;
use crate::net::dns::IpVersion;
use crate::net::interfaces::HostInterfaces;
use crate::net::sock::UdpSock;
use crate::net::udp::UdpStub;

/// Each endpoint becomes a bind point on every CPU shard.
pub struct UdpListener {
    stub: UdpStub,
    endpoints: Mutex<BTreeSet<ListenerPortKey>>,
}

impl UdpListener {
    pub fn new(config: &NetConfig, interfaces: Arc<dyn HostInterfaces>) -> Result<Self> {
        Ok(Self {
            stub: UdpStub::server(config, interfaces)?,
            endpoints: Mutex::new(BTreeSet::new()),
        })
    }

    /// Serve `port`; address and version default like [`TcpListener::add`](super::TcpListener::add).
    pub fn add(
        &self,
        port: u16,
        version: Option<IpVersion>,
        address: Option<IpAddr>,
    ) -> Result<Vec<ListenerPortKey>> {
        if port == 0 {
            return Err(NetError::Config("UDP listener port must not be 0".to_string()));
        }
        let keys = endpoint_keys(port, version, address)?;
        let mut endpoints = self.endpoints.lock();
        for key in &keys {
            if !endpoints.contains(key) {
                self.stub.add_bind_point_all(key.endpoint())?;
                endpoints.insert(*key);
                tracing::debug!(address = %key, "UDP listener endpoint added");
            }
        }
        Ok(keys)
    }

    /// Returns how many endpoints were removed.
    pub fn delete(&self, port: u16, version: Option<IpVersion>, address: Option<IpAddr>) -> Result<usize> {
        let keys = endpoint_keys(port, version, address)?;
        let mut endpoints = self.endpoints.lock();
        let mut removed = 0;
        for key in &keys {
            if endpoints.remove(key) {
                self.stub.delete_bind_point_all(key.endpoint())?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    pub fn endpoints(&self) -> Vec<ListenerPortKey> {
        self.endpoints.lock().iter().copied().collect()
    }

    pub fn stub(&self) -> &UdpStub {
        &self.stub
    }

    /// Attach the application view of the underlying stub.
    pub fn socket(&self) -> Result<UdpSock> {
        self.stub.socket()
    }

    pub fn stop(&self) {
        self.stub.core().cancel();
    }
}

impl std::fmt::Debug for UdpListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpListener")
            .field("endpoints", &self.endpoints())
            .field("stub", &self.stub)
            .finish()
    }
}
