//! Admission control
//!
//! Named policies `{limit, window}` are enforced per key (connection id or
//! user id) by interchangeable backends:
//!
//! - `memory` - sharded fixed-window counters, process-local
//! - `redis` - atomic increment-with-expiry script, shared across gateways
//!
//! Which backend serves which policy is a deployment choice (see
//! `LimiterBackend`). The socket read path defaults to memory for latency.

mod memory;

pub use memory::{MemoryRateLimiter, spawn_sweeper};

#[cfg(feature = "redis")]
mod redis;

#[cfg(feature = "redis")]
pub use self::redis::RedisRateLimiter;

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

/// A named admission rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitPolicy {
    pub name: String,
    /// Calls allowed per window
    pub limit: u32,
    pub window: Duration,
    pub backend: LimiterBackend,
}

impl RateLimitPolicy {
    pub fn new(name: &str, limit: u32, window: Duration) -> Self {
        Self {
            name: name.to_string(),
            limit,
            window,
            backend: LimiterBackend::Memory,
        }
    }

    pub fn with_backend(mut self, backend: LimiterBackend) -> Self {
        self.backend = backend;
        self
    }
}

/// Storage behind a policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimiterBackend {
    Memory,
    Redis,
}

impl FromStr for LimiterBackend {
    type Err = PolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(LimiterBackend::Memory),
            "redis" => Ok(LimiterBackend::Redis),
            other => Err(PolicyError::UnknownBackend(other.to_string())),
        }
    }
}

/// What a socket's inbound frames are counted against
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitScope {
    Connection,
    User,
}

impl FromStr for RateLimitScope {
    type Err = PolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "connection" => Ok(RateLimitScope::Connection),
            "user" => Ok(RateLimitScope::User),
            other => Err(PolicyError::Malformed(other.to_string())),
        }
    }
}

/// Rate limiter backend trait
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Count one call for `key`; `false` means the call must be rejected
    async fn allow(&self, key: &str) -> anyhow::Result<bool>;

    /// Policy this limiter enforces
    fn policy(&self) -> &RateLimitPolicy;
}

/// Limiters by policy name, built once at startup
#[derive(Default, Clone)]
pub struct Limiters {
    limiters: HashMap<String, Arc<dyn RateLimiter>>,
}

impl Limiters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, limiter: Arc<dyn RateLimiter>) {
        self.limiters
            .insert(limiter.policy().name.clone(), limiter);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn RateLimiter>> {
        self.limiters.get(name).cloned()
    }
}

impl std::fmt::Debug for Limiters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Limiters")
            .field("policies", &self.limiters.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Parse a policy table: `name=limit/window[@backend]` entries separated by `;`
///
/// Windows accept `ms`, `s` and `m` suffixes, e.g. `ws_inbound=20/1s;push_rpc=100/1s@redis`.
pub fn parse_policies(table: &str) -> Result<Vec<RateLimitPolicy>, PolicyError> {
    table
        .split(';')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(parse_policy)
        .collect()
}

fn parse_policy(entry: &str) -> Result<RateLimitPolicy, PolicyError> {
    let malformed = || PolicyError::Malformed(entry.to_string());

    let (name, rule) = entry.split_once('=').ok_or_else(malformed)?;
    let (rule, backend) = match rule.split_once('@') {
        Some((rule, backend)) => (rule, backend.parse()?),
        None => (rule, LimiterBackend::Memory),
    };
    let (limit, window) = rule.split_once('/').ok_or_else(malformed)?;

    let name = name.trim();
    if name.is_empty() {
        return Err(malformed());
    }
    let limit: u32 = limit.trim().parse().map_err(|_| malformed())?;
    let window = parse_window(window.trim()).ok_or_else(malformed)?;

    Ok(RateLimitPolicy {
        name: name.to_string(),
        limit,
        window,
        backend,
    })
}

fn parse_window(s: &str) -> Option<Duration> {
    let (digits, unit) = if let Some(d) = s.strip_suffix("ms") {
        (d, 1)
    } else if let Some(d) = s.strip_suffix('s') {
        (d, 1_000)
    } else if let Some(d) = s.strip_suffix('m') {
        (d, 60_000)
    } else {
        return None;
    };

    let n: u64 = digits.parse().ok()?;
    if n == 0 {
        return None;
    }
    Some(Duration::from_millis(n.checked_mul(unit)?))
}

/// Policy table errors
#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    #[error("malformed rate limit policy: {0}")]
    Malformed(String),
    #[error("unknown rate limit backend: {0}")]
    UnknownBackend(String),
}
