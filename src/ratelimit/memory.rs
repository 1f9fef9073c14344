//! In-memory rate limiter using sharded fixed windows
//!
//! Single-process only. Keys are spread over a fixed number of shards, each
//! behind its own lock, so concurrent connections rarely contend.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::ratelimit::{RateLimitPolicy, RateLimiter};

/// Number of independently locked shards
const SHARD_COUNT: usize = 64;

#[derive(Debug, Clone, Copy)]
struct Window {
    started: Instant,
    count: u32,
}

/// Fixed-window counter per key
pub struct MemoryRateLimiter {
    policy: RateLimitPolicy,
    shards: Box<[Mutex<HashMap<String, Window>>]>,
}

impl MemoryRateLimiter {
    pub fn new(policy: RateLimitPolicy) -> Self {
        let shards = (0..SHARD_COUNT)
            .map(|_| Mutex::new(HashMap::new()))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self { policy, shards }
    }

    fn shard(&self, key: &str) -> &Mutex<HashMap<String, Window>> {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % self.shards.len()]
    }

    /// Count one call; returns whether it fits the current window
    pub fn check(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut shard = self.shard(key).lock();

        match shard.get_mut(key) {
            Some(window) if now.duration_since(window.started) < self.policy.window => {
                if window.count < self.policy.limit {
                    window.count += 1;
                    true
                } else {
                    false
                }
            }
            _ => {
                shard.insert(
                    key.to_string(),
                    Window {
                        started: now,
                        count: 1,
                    },
                );
                self.policy.limit > 0
            }
        }
    }

    /// Drop windows that have elapsed, returning how many were removed
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut removed = 0;

        for shard in self.shards.iter() {
            let mut shard = shard.lock();
            let before = shard.len();
            shard.retain(|_, w| now.duration_since(w.started) < self.policy.window);
            removed += before - shard.len();
        }

        removed
    }

    /// Number of keys with a live window
    pub fn tracked_keys(&self) -> usize {
        self.shards.iter().map(|s| s.lock().len()).sum()
    }
}

#[async_trait]
impl RateLimiter for MemoryRateLimiter {
    async fn allow(&self, key: &str) -> anyhow::Result<bool> {
        Ok(self.check(key))
    }

    fn policy(&self) -> &RateLimitPolicy {
        &self.policy
    }
}

/// Spawn the expired-window sweeper
pub fn spawn_sweeper(
    limiter: Arc<MemoryRateLimiter>,
    interval: Duration,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let removed = limiter.purge_expired();
                    if removed > 0 {
                        debug!(policy = %limiter.policy.name, removed, "purged rate limit windows");
                    }
                }
            }
        }
    })
}
