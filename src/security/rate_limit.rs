//! Per-source admission control for accepted TCP connections.

use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use ipnet::IpNet;
use parking_lot::Mutex;

use crate::config::{NetConfig, RateLimitConfig};
use crate::error::{NetError, Result};
use crate::observability::metrics;

/// Decides whether a connection from a source address may be delivered.
pub trait ConnectionRateLimiter: Send + Sync {
    /// `None` rejects the connection. The permit is held for the
    /// connection's lifetime.
    fn try_enter(&self, source: IpAddr) -> Option<AdmitPermit>;
}

/// Admission of one connection. Releases its slot when dropped.
pub struct AdmitPermit {
    release: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl AdmitPermit {
    /// A permit with nothing to release.
    pub fn unlimited() -> Self {
        Self { release: None }
    }

    pub fn with_release<F>(release: F) -> Self
    where
        F: FnOnce() + Send + Sync + 'static,
    {
        Self {
            release: Some(Box::new(release)),
        }
    }
}

impl Drop for AdmitPermit {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl fmt::Debug for AdmitPermit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdmitPermit")
            .field("releases", &self.release.is_some())
            .finish()
    }
}

/// A simple token bucket.
struct TokenBucket {
    tokens: f64,
    last_update: Instant,
}

impl TokenBucket {
    fn new(capacity: f64) -> Self {
        Self {
            tokens: capacity,
            last_update: Instant::now(),
        }
    }

    fn try_acquire(&mut self, capacity: f64, refill_rate: f64) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_update).as_secs_f64();

        self.tokens = (self.tokens + elapsed * refill_rate).min(capacity);
        self.last_update = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Map size at which `try_enter` first sweeps idle sources.
const SWEEP_THRESHOLD: usize = 1024;

struct SourceState {
    bucket: TokenBucket,
    active: usize,
}

impl SourceState {
    /// No open connections and a bucket that has refilled to `burst`.
    fn is_idle(&self, rps: f64, burst: f64) -> bool {
        let refilled = self.bucket.tokens + self.bucket.last_update.elapsed().as_secs_f64() * rps;
        self.active == 0 && refilled >= burst
    }
}

/// Token bucket and concurrency cap per source address, with deny and
/// exempt network lists.
pub struct SourceRateLimiter {
    name: String,
    rps: f64,
    burst: f64,
    max_concurrent: usize,
    deny: Vec<IpNet>,
    exempt: Vec<IpNet>,
    sources: Arc<Mutex<HashMap<IpAddr, SourceState>>>,
    next_sweep: AtomicUsize,
}

impl SourceRateLimiter {
    pub fn from_config(name: &str, config: &RateLimitConfig) -> Result<Self> {
        Ok(Self {
            name: name.to_string(),
            rps: f64::from(config.requests_per_second),
            burst: f64::from(config.burst_size.max(1)),
            max_concurrent: config.max_concurrent_per_source,
            deny: parse_networks(name, "deny", &config.deny)?,
            exempt: parse_networks(name, "exempt", &config.exempt)?,
            sources: Arc::new(Mutex::new(HashMap::new())),
            next_sweep: AtomicUsize::new(SWEEP_THRESHOLD),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of sources currently holding state.
    pub fn tracked_sources(&self) -> usize {
        self.sources.lock().len()
    }

    /// Forget idle sources. Returns how many were removed.
    pub fn prune_idle(&self) -> usize {
        let mut sources = self.sources.lock();
        self.sweep(&mut sources)
    }

    fn sweep(&self, sources: &mut HashMap<IpAddr, SourceState>) -> usize {
        let before = sources.len();
        sources.retain(|_, state| !state.is_idle(self.rps, self.burst));
        // amortized: the next sweep waits until the map doubles again
        self.next_sweep
            .store((sources.len() * 2).max(SWEEP_THRESHOLD), Ordering::Relaxed);
        before - sources.len()
    }

    fn reject(&self, source: IpAddr, reason: &'static str) -> Option<AdmitPermit> {
        tracing::debug!(limiter = %self.name, %source, reason, "Connection rejected");
        metrics::record_rate_limited(reason);
        None
    }
}

impl ConnectionRateLimiter for SourceRateLimiter {
    fn try_enter(&self, source: IpAddr) -> Option<AdmitPermit> {
        let source = canonical(source);
        if self.exempt.iter().any(|net| net.contains(&source)) {
            return Some(AdmitPermit::unlimited());
        }
        if self.deny.iter().any(|net| net.contains(&source)) {
            return self.reject(source, "denied");
        }

        {
            let mut sources = self.sources.lock();
            if sources.len() >= self.next_sweep.load(Ordering::Relaxed) {
                let removed = self.sweep(&mut sources);
                tracing::trace!(limiter = %self.name, removed, "Swept idle sources");
            }
            let state = sources.entry(source).or_insert_with(|| SourceState {
                bucket: TokenBucket::new(self.burst),
                active: 0,
            });
            if self.max_concurrent > 0 && state.active >= self.max_concurrent {
                drop(sources);
                return self.reject(source, "concurrency");
            }
            if !state.bucket.try_acquire(self.burst, self.rps) {
                drop(sources);
                return self.reject(source, "rate");
            }
            state.active += 1;
        }

        let sources = Arc::clone(&self.sources);
        let (rps, burst) = (self.rps, self.burst);
        Some(AdmitPermit::with_release(move || {
            let mut sources = sources.lock();
            if let Some(state) = sources.get_mut(&source) {
                state.active = state.active.saturating_sub(1);
                if state.is_idle(rps, burst) {
                    sources.remove(&source);
                }
            }
        }))
    }
}

impl fmt::Debug for SourceRateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceRateLimiter")
            .field("name", &self.name)
            .field("rps", &self.rps)
            .field("burst", &self.burst)
            .field("max_concurrent", &self.max_concurrent)
            .finish()
    }
}

fn canonical(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6
            .to_ipv4_mapped()
            .map(IpAddr::V4)
            .unwrap_or(IpAddr::V6(v6)),
        v4 => v4,
    }
}

fn parse_networks(profile: &str, field: &str, entries: &[String]) -> Result<Vec<IpNet>> {
    entries
        .iter()
        .map(|entry| parse_network(entry).ok_or_else(|| {
            NetError::Config(format!(
                "rate limit profile '{profile}': invalid {field} entry '{entry}'"
            ))
        }))
        .collect()
}

/// Parse a CIDR block or a bare address (as a host route).
pub fn parse_network(entry: &str) -> Option<IpNet> {
    entry
        .parse::<IpNet>()
        .ok()
        .or_else(|| entry.parse::<IpAddr>().ok().map(IpNet::from))
}

/// Shared limiter instances, built on first use from named profiles.
#[derive(Default)]
pub struct RateLimiterRegistry {
    profiles: HashMap<String, RateLimitConfig>,
    limiters: DashMap<String, Arc<SourceRateLimiter>>,
}

impl RateLimiterRegistry {
    pub fn new<I>(profiles: I) -> Self
    where
        I: IntoIterator<Item = (String, RateLimitConfig)>,
    {
        Self {
            profiles: profiles.into_iter().collect(),
            limiters: DashMap::new(),
        }
    }

    /// Registry over the `rate_limits` profiles of a loaded config.
    pub fn from_config(config: &NetConfig) -> Self {
        Self::new(
            config
                .rate_limits
                .iter()
                .map(|(name, profile)| (name.clone(), profile.clone())),
        )
    }

    /// The limiter for `name`. Unknown names are a configuration error.
    pub fn get(&self, name: &str) -> Result<Arc<SourceRateLimiter>> {
        if let Some(limiter) = self.limiters.get(name) {
            return Ok(Arc::clone(limiter.value()));
        }
        let config = self
            .profiles
            .get(name)
            .ok_or_else(|| NetError::Config(format!("unknown rate limit profile '{name}'")))?;
        let limiter = Arc::new(SourceRateLimiter::from_config(name, config)?);
        Ok(Arc::clone(
            self.limiters
                .entry(name.to_string())
                .or_insert(limiter)
                .value(),
        ))
    }

    pub fn profile_names(&self) -> Vec<&str> {
        self.profiles.keys().map(String::as_str).collect()
    }
}

impl fmt::Debug for RateLimiterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiterRegistry")
            .field("profiles", &self.profiles.keys().collect::<Vec<_>>())
            .finish()
    }
}
