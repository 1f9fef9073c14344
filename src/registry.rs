//! Distributed connection registry
//!
//! Cross-process directory of live connections. Every registration writes
//! three structures in one atomic step:
//!
//! - the connection detail record
//! - the user -> connections index
//! - the instance -> connections index
//!
//! and removal deletes all three or none. The per-user connection cap is
//! checked inside the same atomic step, so concurrent registrations from
//! different processes can never exceed it.
//!
//! # Backends
//!
//! - `memory` - single-process directory, for development and tests
//! - `redis` - Lua scripts against a shared Redis (feature `redis`)

mod memory;

pub use memory::MemoryRegistry;

#[cfg(feature = "redis")]
mod redis;

#[cfg(feature = "redis")]
pub use self::redis::{RedisRegistry, connect_redis};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::session::ClientInfo;

/// Directory entry for one live connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionRecord {
    pub connection_id: String,
    pub user_id: String,
    pub session_id: String,
    /// Gateway process holding the socket
    pub instance_id: String,
    pub source_ip: String,
    pub user_agent: String,
    /// Unix milliseconds
    pub connected_at: i64,
}

impl ConnectionRecord {
    pub fn from_client(info: &ClientInfo, instance_id: &str) -> Self {
        Self {
            connection_id: info.connection_id.clone(),
            user_id: info.user_id.clone(),
            session_id: info.session_id.clone(),
            instance_id: instance_id.to_string(),
            source_ip: info.source_ip.clone(),
            user_agent: info.user_agent.clone(),
            connected_at: info.connected_at.timestamp_millis(),
        }
    }
}

/// Connection registry backend trait
#[async_trait]
pub trait ConnectionRegistry: Send + Sync {
    /// Atomically register a connection unless the user already holds
    /// `max_per_user` live connections. Returns whether it was accepted.
    async fn create_connection(
        &self,
        record: &ConnectionRecord,
        max_per_user: usize,
    ) -> anyhow::Result<bool>;

    /// Atomically remove a connection from all three structures.
    /// Returns whether a record existed.
    async fn remove_connection(&self, connection_id: &str) -> anyhow::Result<bool>;

    /// Fetch a live connection record
    async fn get_connection(&self, connection_id: &str) -> anyhow::Result<Option<ConnectionRecord>>;

    /// Live connection ids of a user, across all instances
    async fn list_connections_for_user(&self, user_id: &str) -> anyhow::Result<Vec<String>>;

    /// Live connection ids held by a gateway instance
    async fn list_connections_for_instance(&self, instance_id: &str) -> anyhow::Result<Vec<String>>;

    /// Extend the TTL of every record held by an instance and prune expired
    /// index members. Returns the number of records refreshed.
    async fn refresh_instance(&self, instance_id: &str) -> anyhow::Result<usize>;
}

/// Spawn the liveness heartbeat for this instance's registry rows
pub fn spawn_heartbeat(
    registry: Arc<dyn ConnectionRegistry>,
    instance_id: String,
    period: Duration,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    match registry.refresh_instance(&instance_id).await {
                        Ok(refreshed) => debug!(instance = %instance_id, refreshed, "registry heartbeat"),
                        Err(e) => error!(instance = %instance_id, error = %e, "registry heartbeat failed"),
                    }
                }
            }
        }
    })
}
