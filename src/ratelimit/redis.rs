//! Redis rate limiter
//!
//! Same fixed-window semantics as the memory backend, enforced with a single
//! server-side script so the limit holds across every gateway process.

use async_trait::async_trait;
use ::redis::Script;
use ::redis::aio::ConnectionManager;

use crate::ratelimit::{RateLimitPolicy, RateLimiter};

/// KEYS[1] = counter key; ARGV[1] = window in ms; ARGV[2] = limit
const ALLOW_SCRIPT: &str = r#"
local current = redis.call('INCR', KEYS[1])
if current == 1 then
    redis.call('PEXPIRE', KEYS[1], ARGV[1])
end
if current > tonumber(ARGV[2]) then
    return 0
end
return 1
"#;

/// Distributed fixed-window counter
pub struct RedisRateLimiter {
    conn: ConnectionManager,
    policy: RateLimitPolicy,
    prefix: String,
    script: Script,
}

impl RedisRateLimiter {
    pub fn new(conn: ConnectionManager, policy: RateLimitPolicy, prefix: &str) -> Self {
        Self {
            conn,
            policy,
            prefix: prefix.to_string(),
            script: Script::new(ALLOW_SCRIPT),
        }
    }

    fn counter_key(&self, key: &str) -> String {
        format!("{}:ratelimit:{}:{}", self.prefix, self.policy.name, key)
    }
}

#[async_trait]
impl RateLimiter for RedisRateLimiter {
    async fn allow(&self, key: &str) -> anyhow::Result<bool> {
        let mut conn = self.conn.clone();
        let window_ms = self.policy.window.as_millis() as u64;

        let allowed: i64 = self
            .script
            .key(self.counter_key(key))
            .arg(window_ms)
            .arg(self.policy.limit)
            .invoke_async(&mut conn)
            .await?;

        Ok(allowed == 1)
    }

    fn policy(&self) -> &RateLimitPolicy {
        &self.policy
    }
}
