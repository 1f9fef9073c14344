//! In-memory connection registry
//!
//! Single-process only. One lock guards the detail map and both indexes, which
//! gives the same all-or-nothing semantics the Redis scripts provide.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::registry::{ConnectionRecord, ConnectionRegistry};

struct Entry {
    record: ConnectionRecord,
    expires_at: Instant,
}

#[derive(Default)]
struct State {
    details: HashMap<String, Entry>,
    by_user: HashMap<String, HashSet<String>>,
    by_instance: HashMap<String, HashSet<String>>,
}

impl State {
    fn is_live(&self, connection_id: &str, now: Instant) -> bool {
        self.details
            .get(connection_id)
            .is_some_and(|e| e.expires_at > now)
    }

    /// Remove a record and both index memberships
    fn remove(&mut self, connection_id: &str) -> Option<ConnectionRecord> {
        let entry = self.details.remove(connection_id)?;
        remove_member(&mut self.by_user, &entry.record.user_id, connection_id);
        remove_member(&mut self.by_instance, &entry.record.instance_id, connection_id);
        Some(entry.record)
    }

    /// Drop expired records reachable from a user's index
    fn prune_user(&mut self, user_id: &str, now: Instant) {
        let expired: Vec<String> = match self.by_user.get(user_id) {
            Some(ids) => ids
                .iter()
                .filter(|id| !self.is_live(id, now))
                .cloned()
                .collect(),
            None => return,
        };

        for id in expired {
            if self.remove(&id).is_none() {
                remove_member(&mut self.by_user, user_id, &id);
            }
        }
    }

    fn purge_expired(&mut self, now: Instant) {
        let expired: Vec<String> = self
            .details
            .iter()
            .filter(|(_, e)| e.expires_at <= now)
            .map(|(id, _)| id.clone())
            .collect();

        for id in expired {
            self.remove(&id);
        }
    }

    fn live_members(&self, index: &HashMap<String, HashSet<String>>, key: &str, now: Instant) -> Vec<String> {
        index
            .get(key)
            .map(|ids| {
                ids.iter()
                    .filter(|id| self.is_live(id, now))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}

fn remove_member(index: &mut HashMap<String, HashSet<String>>, key: &str, id: &str) {
    if let Some(ids) = index.get_mut(key) {
        ids.remove(id);
        if ids.is_empty() {
            index.remove(key);
        }
    }
}

/// In-memory registry with TTL-based expiry
pub struct MemoryRegistry {
    state: Mutex<State>,
    ttl: Duration,
}

impl MemoryRegistry {
    pub fn new(ttl: Duration) -> Self {
        Self {
            state: Mutex::new(State::default()),
            ttl,
        }
    }

    /// Number of live records
    pub fn len(&self) -> usize {
        let now = Instant::now();
        let state = self.state.lock();
        state.details.values().filter(|e| e.expires_at > now).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether a connection id appears in the detail map or either index
    pub fn contains_anywhere(&self, connection_id: &str) -> bool {
        let state = self.state.lock();
        state.details.contains_key(connection_id)
            || state.by_user.values().any(|ids| ids.contains(connection_id))
            || state.by_instance.values().any(|ids| ids.contains(connection_id))
    }
}

#[async_trait]
impl ConnectionRegistry for MemoryRegistry {
    async fn create_connection(
        &self,
        record: &ConnectionRecord,
        max_per_user: usize,
    ) -> anyhow::Result<bool> {
        let now = Instant::now();
        let mut state = self.state.lock();

        if state.is_live(&record.connection_id, now) {
            anyhow::bail!("connection {} already registered", record.connection_id);
        }
        // An expired record under the same id must not leave stale index entries
        state.remove(&record.connection_id);
        state.prune_user(&record.user_id, now);

        let live = state
            .by_user
            .get(&record.user_id)
            .map(|ids| ids.len())
            .unwrap_or(0);
        if live >= max_per_user {
            return Ok(false);
        }

        state.details.insert(
            record.connection_id.clone(),
            Entry {
                record: record.clone(),
                expires_at: now + self.ttl,
            },
        );
        state
            .by_user
            .entry(record.user_id.clone())
            .or_default()
            .insert(record.connection_id.clone());
        state
            .by_instance
            .entry(record.instance_id.clone())
            .or_default()
            .insert(record.connection_id.clone());

        Ok(true)
    }

    async fn remove_connection(&self, connection_id: &str) -> anyhow::Result<bool> {
        let mut state = self.state.lock();
        Ok(state.remove(connection_id).is_some())
    }

    async fn get_connection(&self, connection_id: &str) -> anyhow::Result<Option<ConnectionRecord>> {
        let now = Instant::now();
        let state = self.state.lock();
        Ok(state
            .details
            .get(connection_id)
            .filter(|e| e.expires_at > now)
            .map(|e| e.record.clone()))
    }

    async fn list_connections_for_user(&self, user_id: &str) -> anyhow::Result<Vec<String>> {
        let now = Instant::now();
        let state = self.state.lock();
        Ok(state.live_members(&state.by_user, user_id, now))
    }

    async fn list_connections_for_instance(&self, instance_id: &str) -> anyhow::Result<Vec<String>> {
        let now = Instant::now();
        let state = self.state.lock();
        Ok(state.live_members(&state.by_instance, instance_id, now))
    }

    async fn refresh_instance(&self, instance_id: &str) -> anyhow::Result<usize> {
        let now = Instant::now();
        let mut state = self.state.lock();
        state.purge_expired(now);

        let ids: Vec<String> = state
            .by_instance
            .get(instance_id)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default();

        let expires_at = now + self.ttl;
        let mut refreshed = 0;
        for id in ids {
            if let Some(entry) = state.details.get_mut(&id) {
                entry.expires_at = expires_at;
                refreshed += 1;
            }
        }

        Ok(refreshed)
    }
}
