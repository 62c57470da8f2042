//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the network core.
//! All types derive Serde traits for deserialization from config files.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root configuration for the network core.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct NetConfig {
    /// TCP stub and listener settings.
    pub tcp: TcpConfig,

    /// UDP stub settings.
    pub udp: UdpConfig,

    /// Range served by the random port assigner.
    pub random_ports: RandomPortConfig,

    /// Duplex channel buffer sizes.
    pub pipe: PipeConfig,

    /// Named connection rate limit profiles.
    pub rate_limits: BTreeMap<String, RateLimitConfig>,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// TCP stub and listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TcpConfig {
    /// Connect timeout in milliseconds.
    pub connect_timeout_ms: u64,

    /// Backlog passed to `listen(2)`. The kernel clamps it to its own maximum.
    pub listen_backlog: u32,

    /// Base listener retry interval; multiplied by the consecutive failure count.
    pub retry_interval_standard_ms: u64,

    /// Upper bound for the listener retry interval.
    pub retry_interval_max_ms: u64,

    /// Candidate ports tried before `add_random` gives up.
    pub random_port_attempts: usize,

    /// TLS handshake timeout in milliseconds.
    pub tls_handshake_timeout_ms: u64,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 15_000,
            listen_backlog: 65_535,
            retry_interval_standard_ms: 1_000,
            retry_interval_max_ms: 30_000,
            random_port_attempts: 100,
            tls_handshake_timeout_ms: 15_000,
        }
    }
}

impl TcpConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn retry_interval_standard(&self) -> Duration {
        Duration::from_millis(self.retry_interval_standard_ms)
    }

    pub fn retry_interval_max(&self) -> Duration {
        Duration::from_millis(self.retry_interval_max_ms)
    }

    pub fn tls_handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.tls_handshake_timeout_ms)
    }
}

/// UDP stub configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct UdpConfig {
    /// Number of CPU shards. `None` uses the available parallelism.
    pub num_cpus: Option<usize>,

    /// Period of the endpoint reconciliation loop in milliseconds.
    pub poll_interval_ms: u64,

    /// Base delay between bind attempts of one receive instance.
    pub bind_retry_base_ms: u64,

    /// Cap for the bind retry delay.
    pub bind_retry_max_ms: u64,

    /// Maximum datagrams read from a socket before handing a batch upward.
    pub recv_batch: usize,

    /// Maximum datagrams a send instance dequeues per cycle.
    pub send_batch: usize,

    /// Receive buffer size; larger datagrams are truncated by the kernel.
    pub max_datagram_size: usize,
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self {
            num_cpus: None,
            poll_interval_ms: 1_000,
            bind_retry_base_ms: 100,
            bind_retry_max_ms: 30_000,
            recv_batch: 64,
            send_batch: 256,
            max_datagram_size: 65_535,
        }
    }
}

impl UdpConfig {
    /// Resolve the effective number of CPU shards (at least one).
    pub fn effective_cpus(&self) -> usize {
        self.num_cpus
            .unwrap_or_else(|| {
                std::thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(1)
            })
            .max(1)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn bind_retry_base(&self) -> Duration {
        Duration::from_millis(self.bind_retry_base_ms)
    }

    pub fn bind_retry_max(&self) -> Duration {
        Duration::from_millis(self.bind_retry_max_ms)
    }
}

/// Range of ports handed out by the random port assigner.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RandomPortConfig {
    pub first: u16,
    pub last: u16,
}

impl Default for RandomPortConfig {
    fn default() -> Self {
        Self {
            first: 20_000,
            last: 29_999,
        }
    }
}

/// Duplex channel sizing.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PipeConfig {
    /// Capacity of the in-memory byte stream, per direction.
    pub stream_buffer_bytes: usize,

    /// Datagrams a single inbox holds before writers see backpressure.
    pub datagram_queue_capacity: usize,
}

impl Default for PipeConfig {
    fn default() -> Self {
        Self {
            stream_buffer_bytes: 64 * 1024,
            datagram_queue_capacity: 8_192,
        }
    }
}

/// A named connection rate limit profile.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Sustained new connections per second per source address.
    pub requests_per_second: u32,

    /// Burst capacity per source address.
    pub burst_size: u32,

    /// Concurrent admitted connections per source address (0 = unlimited).
    pub max_concurrent_per_source: usize,

    /// Networks (CIDR) that are always rejected.
    pub deny: Vec<String>,

    /// Networks (CIDR) that bypass all limits.
    pub exempt: Vec<String>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_second: 100,
            burst_size: 50,
            max_concurrent_per_source: 0,
            deny: Vec::new(),
            exempt: Vec::new(),
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error) or a full filter directive.
    pub log_level: String,

    /// Emit JSON lines instead of human readable output.
    pub json: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json: false,
        }
    }
}
