//! Redis connection registry
//!
//! Each operation is one Lua script, so the detail hash and both index sets
//! change together or not at all, and the per-user cap check cannot race
//! with a concurrent registration on another gateway.
//!
//! Keys (`{p}` = configured prefix):
//! - `{p}:conn:{connection_id}` - detail hash
//! - `{p}:user:{user_id}:conns` - set of connection ids
//! - `{p}:instance:{instance_id}:conns` - set of connection ids
//!
//! Scripts reach detail keys of index members that are not declared in
//! KEYS, so the registry needs a single Redis node (or a hash-tagged prefix).

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use ::redis::aio::ConnectionManager;
use ::redis::{AsyncCommands, Script};

use crate::registry::{ConnectionRecord, ConnectionRegistry};

/// KEYS: detail, user set, instance set
/// ARGV: connection id, cap, ttl ms, detail key prefix, field/value pairs...
const CREATE_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then
    return -1
end
local live = 0
for _, id in ipairs(redis.call('SMEMBERS', KEYS[2])) do
    if redis.call('EXISTS', ARGV[4] .. id) == 1 then
        live = live + 1
    else
        redis.call('SREM', KEYS[2], id)
    end
end
if live >= tonumber(ARGV[2]) then
    return 0
end
local fields = {}
for i = 5, #ARGV do
    fields[#fields + 1] = ARGV[i]
end
redis.call('HSET', KEYS[1], unpack(fields))
redis.call('PEXPIRE', KEYS[1], ARGV[3])
redis.call('SADD', KEYS[2], ARGV[1])
redis.call('PEXPIRE', KEYS[2], ARGV[3])
redis.call('SADD', KEYS[3], ARGV[1])
redis.call('PEXPIRE', KEYS[3], ARGV[3])
return 1
"#;

/// KEYS: detail
/// ARGV: connection id, user key prefix, instance key prefix
const REMOVE_SCRIPT: &str = r#"
local owner = redis.call('HMGET', KEYS[1], 'user_id', 'instance_id')
if not owner[1] or not owner[2] then
    return 0
end
redis.call('SREM', ARGV[2] .. owner[1] .. ':conns', ARGV[1])
redis.call('SREM', ARGV[3] .. owner[2] .. ':conns', ARGV[1])
redis.call('DEL', KEYS[1])
return 1
"#;

/// KEYS: instance set
/// ARGV: detail key prefix, ttl ms, user key prefix
const REFRESH_SCRIPT: &str = r#"
local refreshed = 0
for _, id in ipairs(redis.call('SMEMBERS', KEYS[1])) do
    local key = ARGV[1] .. id
    if redis.call('PEXPIRE', key, ARGV[2]) == 1 then
        refreshed = refreshed + 1
        local user = redis.call('HGET', key, 'user_id')
        if user then
            redis.call('PEXPIRE', ARGV[3] .. user .. ':conns', ARGV[2])
        end
    else
        redis.call('SREM', KEYS[1], id)
    end
end
if refreshed > 0 then
    redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return refreshed
"#;

/// KEYS: index set
/// ARGV: detail key prefix
const LIVE_MEMBERS_SCRIPT: &str = r#"
local live = {}
for _, id in ipairs(redis.call('SMEMBERS', KEYS[1])) do
    if redis.call('EXISTS', ARGV[1] .. id) == 1 then
        live[#live + 1] = id
    end
end
return live
"#;

/// Open a managed, auto-reconnecting Redis connection
pub async fn connect_redis(url: &str) -> anyhow::Result<ConnectionManager> {
    let client = ::redis::Client::open(url).with_context(|| format!("invalid redis url {url}"))?;
    ConnectionManager::new(client)
        .await
        .with_context(|| format!("failed to connect to redis at {url}"))
}

/// Redis-backed registry shared by every gateway process
pub struct RedisRegistry {
    conn: ConnectionManager,
    prefix: String,
    ttl: Duration,
    create: Script,
    remove: Script,
    refresh: Script,
    live_members: Script,
}

impl RedisRegistry {
    pub fn new(conn: ConnectionManager, prefix: &str, ttl: Duration) -> Self {
        Self {
            conn,
            prefix: prefix.to_string(),
            ttl,
            create: Script::new(CREATE_SCRIPT),
            remove: Script::new(REMOVE_SCRIPT),
            refresh: Script::new(REFRESH_SCRIPT),
            live_members: Script::new(LIVE_MEMBERS_SCRIPT),
        }
    }

    fn detail_prefix(&self) -> String {
        format!("{}:conn:", self.prefix)
    }

    fn user_prefix(&self) -> String {
        format!("{}:user:", self.prefix)
    }

    fn instance_prefix(&self) -> String {
        format!("{}:instance:", self.prefix)
    }

    fn detail_key(&self, connection_id: &str) -> String {
        format!("{}{}", self.detail_prefix(), connection_id)
    }

    fn user_key(&self, user_id: &str) -> String {
        format!("{}{}:conns", self.user_prefix(), user_id)
    }

    fn instance_key(&self, instance_id: &str) -> String {
        format!("{}{}:conns", self.instance_prefix(), instance_id)
    }

    fn ttl_ms(&self) -> u64 {
        self.ttl.as_millis() as u64
    }

    async fn members(&self, index_key: String) -> anyhow::Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = self
            .live_members
            .key(index_key)
            .arg(self.detail_prefix())
            .invoke_async(&mut conn)
            .await?;
        Ok(ids)
    }
}

#[async_trait]
impl ConnectionRegistry for RedisRegistry {
    async fn create_connection(
        &self,
        record: &ConnectionRecord,
        max_per_user: usize,
    ) -> anyhow::Result<bool> {
        let mut conn = self.conn.clone();
        let mut invocation = self.create.key(self.detail_key(&record.connection_id));
        invocation
            .key(self.user_key(&record.user_id))
            .key(self.instance_key(&record.instance_id))
            .arg(&record.connection_id)
            .arg(max_per_user)
            .arg(self.ttl_ms())
            .arg(self.detail_prefix());

        for (field, value) in record_fields(record) {
            invocation.arg(field).arg(value);
        }

        let outcome: i64 = invocation.invoke_async(&mut conn).await?;
        match outcome {
            1 => Ok(true),
            0 => Ok(false),
            _ => anyhow::bail!("connection {} already registered", record.connection_id),
        }
    }

    async fn remove_connection(&self, connection_id: &str) -> anyhow::Result<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = self
            .remove
            .key(self.detail_key(connection_id))
            .arg(connection_id)
            .arg(self.user_prefix())
            .arg(self.instance_prefix())
            .invoke_async(&mut conn)
            .await?;
        Ok(removed == 1)
    }

    async fn get_connection(&self, connection_id: &str) -> anyhow::Result<Option<ConnectionRecord>> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = conn.hgetall(self.detail_key(connection_id)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        record_from_fields(fields).map(Some)
    }

    async fn list_connections_for_user(&self, user_id: &str) -> anyhow::Result<Vec<String>> {
        self.members(self.user_key(user_id)).await
    }

    async fn list_connections_for_instance(&self, instance_id: &str) -> anyhow::Result<Vec<String>> {
        self.members(self.instance_key(instance_id)).await
    }

    async fn refresh_instance(&self, instance_id: &str) -> anyhow::Result<usize> {
        let mut conn = self.conn.clone();
        let refreshed: i64 = self
            .refresh
            .key(self.instance_key(instance_id))
            .arg(self.detail_prefix())
            .arg(self.ttl_ms())
            .arg(self.user_prefix())
            .invoke_async(&mut conn)
            .await?;
        Ok(refreshed.max(0) as usize)
    }
}

fn record_fields(record: &ConnectionRecord) -> [(&'static str, String); 7] {
    [
        ("connection_id", record.connection_id.clone()),
        ("user_id", record.user_id.clone()),
        ("session_id", record.session_id.clone()),
        ("instance_id", record.instance_id.clone()),
        ("source_ip", record.source_ip.clone()),
        ("user_agent", record.user_agent.clone()),
        ("connected_at", record.connected_at.to_string()),
    ]
}

fn record_from_fields(mut fields: HashMap<String, String>) -> anyhow::Result<ConnectionRecord> {
    let mut take = |name: &str| {
        fields
            .remove(name)
            .with_context(|| format!("registry record missing field {name}"))
    };

    Ok(ConnectionRecord {
        connection_id: take("connection_id")?,
        user_id: take("user_id")?,
        session_id: take("session_id")?,
        instance_id: take("instance_id")?,
        source_ip: take("source_ip")?,
        user_agent: take("user_agent")?,
        connected_at: take("connected_at")?
            .parse()
            .context("registry record has invalid connected_at")?,
    })
}
