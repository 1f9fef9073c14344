//! Connection Hub
//!
//! Owns the in-process map of client actors and the channels feeding the
//! worker pool. Every worker has its own lane of four bounded channels
//! (register, unregister, inbound, outbound); a connection always maps to
//! the same lane, so everything about it is handled by one worker.
//!
//! Ordering holds per channel only: a connection's frames are processed in
//! arrival order, but the worker picks between ready channels at random.
//! Register still precedes unregister because a socket only starts reading,
//! or asks to unregister, once its registration has been answered. When
//! that wait times out, the worker rolls back the late registration.
//!
//! Only workers mutate the client map.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::client::{ClientHandle, PushError};
use crate::protocol::{
    CLOSE_CONNECTION_LIMIT, CLOSE_GOING_AWAY, CLOSE_TRY_AGAIN_LATER, ClientFrame,
};

/// One decoded client frame, consumed once by a worker
#[derive(Debug)]
pub struct InboundEvent {
    pub client: ClientHandle,
    pub frame: ClientFrame,
}

/// Registration request; the worker replies once the registry has decided
#[derive(Debug)]
pub struct RegisterRequest {
    pub client: ClientHandle,
    pub reply: oneshot::Sender<Result<(), HubError>>,
}

/// Push request for one connection
#[derive(Debug)]
pub struct OutboundRequest {
    pub connection_id: String,
    pub payload: Vec<u8>,
    pub reply: oneshot::Sender<Result<(), PushError>>,
}

/// Receiving ends of one worker's lane
#[derive(Debug)]
pub struct WorkerLane {
    pub register: mpsc::Receiver<RegisterRequest>,
    pub unregister: mpsc::Receiver<ClientHandle>,
    pub inbound: mpsc::Receiver<InboundEvent>,
    pub outbound: mpsc::Receiver<OutboundRequest>,
}

struct LaneSenders {
    register: mpsc::Sender<RegisterRequest>,
    unregister: mpsc::Sender<ClientHandle>,
    inbound: mpsc::Sender<InboundEvent>,
    outbound: mpsc::Sender<OutboundRequest>,
}

/// Hub manages all local client actors
pub struct Hub {
    /// Live clients by connection id
    clients: DashMap<String, ClientHandle>,

    lanes: Vec<LaneSenders>,

    /// Bound on waiting for a register slot and the registry's answer
    register_timeout: Duration,
}

impl Hub {
    /// Create a hub with `worker_count` lanes; the returned lanes are handed
    /// to the worker pool
    pub fn new(
        worker_count: usize,
        channel_capacity: usize,
        register_timeout: Duration,
    ) -> (Self, Vec<WorkerLane>) {
        let capacity = channel_capacity.max(1);
        let mut senders = Vec::new();
        let mut lanes = Vec::new();

        for _ in 0..worker_count.max(1) {
            let (register_tx, register_rx) = mpsc::channel(capacity);
            let (unregister_tx, unregister_rx) = mpsc::channel(capacity);
            let (inbound_tx, inbound_rx) = mpsc::channel(capacity);
            let (outbound_tx, outbound_rx) = mpsc::channel(capacity);

            senders.push(LaneSenders {
                register: register_tx,
                unregister: unregister_tx,
                inbound: inbound_tx,
                outbound: outbound_tx,
            });
            lanes.push(WorkerLane {
                register: register_rx,
                unregister: unregister_rx,
                inbound: inbound_rx,
                outbound: outbound_rx,
            });
        }

        let hub = Self {
            clients: DashMap::new(),
            lanes: senders,
            register_timeout,
        };
        (hub, lanes)
    }

    fn lane(&self, connection_id: &str) -> &LaneSenders {
        let mut hasher = DefaultHasher::new();
        connection_id.hash(&mut hasher);
        &self.lanes[(hasher.finish() % self.lanes.len() as u64) as usize]
    }

    /// Register a client locally and in the distributed registry.
    ///
    /// Waits at most `register_timeout`; on any error the caller must close
    /// the socket with `HubError::close_code` and call `unregister_client`.
    pub async fn register_client(&self, client: &ClientHandle) -> Result<(), HubError> {
        let (reply, response) = oneshot::channel();
        let request = RegisterRequest {
            client: client.clone(),
            reply,
        };

        let lane = self.lane(client.connection_id());
        let outcome = tokio::time::timeout(self.register_timeout, async {
            lane.register
                .send(request)
                .await
                .map_err(|_| HubError::Closed)?;
            response.await.map_err(|_| HubError::Closed)?
        })
        .await;

        match outcome {
            Ok(result) => result,
            Err(_) => {
                warn!(conn_id = %client.connection_id(), "register timed out");
                Err(HubError::Saturated)
            }
        }
    }

    /// Queue the client's removal. Only the first call per client has any
    /// effect, so a connection produces exactly one unregister event.
    pub async fn unregister_client(&self, client: &ClientHandle) {
        if !client.begin_unregister() {
            return;
        }

        let lane = self.lane(client.connection_id());
        if lane.unregister.send(client.clone()).await.is_err() {
            // Workers are gone; registry rows are cleaned up by the drain
            self.remove(client);
            debug!(conn_id = %client.connection_id(), "unregister after worker shutdown");
        }
    }

    /// Hand a decoded frame to the workers without waiting
    pub fn submit_inbound(&self, event: InboundEvent) -> Result<(), HubError> {
        let lane = self.lane(event.client.connection_id());
        lane.inbound.try_send(event).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => HubError::Saturated,
            mpsc::error::TrySendError::Closed(_) => HubError::Closed,
        })
    }

    /// Deliver a payload to a local connection through its worker
    pub async fn push(&self, connection_id: &str, payload: Vec<u8>) -> Result<(), PushError> {
        let (reply, response) = oneshot::channel();
        let request = OutboundRequest {
            connection_id: connection_id.to_string(),
            payload,
            reply,
        };

        self.lane(connection_id)
            .outbound
            .send_timeout(request, self.register_timeout)
            .await
            .map_err(|e| match e {
                mpsc::error::SendTimeoutError::Timeout(_) => PushError::Saturated,
                mpsc::error::SendTimeoutError::Closed(_) => PushError::Closed,
            })?;

        response.await.map_err(|_| PushError::Closed)?
    }

    /// Look up a local client
    pub fn get_client(&self, connection_id: &str) -> Option<ClientHandle> {
        self.clients.get(connection_id).map(|c| c.value().clone())
    }

    /// Add a client; false if the id is already taken
    pub(crate) fn insert(&self, client: ClientHandle) -> bool {
        match self.clients.entry(client.connection_id().to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(client);
                true
            }
        }
    }

    /// Remove exactly this client (not another actor reusing its id)
    pub(crate) fn remove(&self, client: &ClientHandle) -> bool {
        self.clients
            .remove_if(client.connection_id(), |_, c| c.same_as(client))
            .is_some()
    }

    /// Get number of local clients
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Snapshot of all local clients
    pub fn clients(&self) -> Vec<ClientHandle> {
        self.clients.iter().map(|c| c.value().clone()).collect()
    }

    /// Close every local client, returning how many were closed
    pub fn close_all(&self, code: u16, reason: &str) -> usize {
        let clients = self.clients();
        for client in &clients {
            client.close(code, reason);
        }
        clients.len()
    }

    pub fn worker_count(&self) -> usize {
        self.lanes.len()
    }
}

impl std::fmt::Debug for Hub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hub")
            .field("clients", &self.clients.len())
            .field("lanes", &self.lanes.len())
            .finish()
    }
}

/// Registration errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HubError {
    #[error("hub saturated")]
    Saturated,
    #[error("hub closed")]
    Closed,
    #[error("per-user connection limit reached")]
    CapExceeded,
    #[error("registry failure: {0}")]
    Registry(String),
}

impl HubError {
    /// Close code sent to a client whose registration failed
    pub fn close_code(&self) -> u16 {
        match self {
            HubError::CapExceeded => CLOSE_CONNECTION_LIMIT,
            HubError::Closed => CLOSE_GOING_AWAY,
            HubError::Saturated | HubError::Registry(_) => CLOSE_TRY_AGAIN_LATER,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::ClientInfo;
    use tokio_util::sync::CancellationToken;

    fn client(root: &CancellationToken) -> ClientHandle {
        let info = ClientInfo::new(
            "u1".to_string(),
            "s1".to_string(),
            "127.0.0.1".to_string(),
            "test".to_string(),
        );
        ClientHandle::new(info, 4, root).0
    }

    fn frame() -> ClientFrame {
        crate::protocol::decode_frame(br#"{"type":5}"#).unwrap()
    }

    #[test]
    fn test_connection_sticks_to_one_lane() {
        let (hub, _lanes) = Hub::new(8, 4, Duration::from_secs(1));
        let root = CancellationToken::new();
        let c = client(&root);
        let first = hub.lane(c.connection_id()) as *const LaneSenders;
        for _ in 0..10 {
            assert_eq!(hub.lane(c.connection_id()) as *const LaneSenders, first);
        }
    }

    #[test]
    fn test_submit_inbound_never_blocks() {
        let (hub, _lanes) = Hub::new(1, 2, Duration::from_secs(1));
        let root = CancellationToken::new();
        let c = client(&root);

        for _ in 0..2 {
            hub.submit_inbound(InboundEvent {
                client: c.clone(),
                frame: frame(),
            })
            .unwrap();
        }
        let err = hub
            .submit_inbound(InboundEvent {
                client: c.clone(),
                frame: frame(),
            })
            .unwrap_err();
        assert_eq!(err, HubError::Saturated);
    }

    #[tokio::test]
    async fn test_unregister_emits_once() {
        let (hub, mut lanes) = Hub::new(1, 4, Duration::from_secs(1));
        let root = CancellationToken::new();
        let c = client(&root);

        hub.unregister_client(&c).await;
        hub.unregister_client(&c).await;
        hub.unregister_client(&c.clone()).await;

        assert!(lanes[0].unregister.try_recv().is_ok());
        assert!(lanes[0].unregister.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_register_times_out_without_workers() {
        let (hub, _lanes) = Hub::new(1, 1, Duration::from_millis(100));
        let root = CancellationToken::new();

        let err = hub.register_client(&client(&root)).await.unwrap_err();
        assert_eq!(err, HubError::Saturated);
        assert_eq!(err.close_code(), CLOSE_TRY_AGAIN_LATER);
    }

    #[tokio::test]
    async fn test_register_fails_when_lanes_dropped() {
        let (hub, lanes) = Hub::new(1, 1, Duration::from_secs(1));
        drop(lanes);
        let root = CancellationToken::new();
        assert_eq!(
            hub.register_client(&client(&root)).await.unwrap_err(),
            HubError::Closed
        );
    }

    #[test]
    fn test_remove_only_same_actor() {
        let (hub, _lanes) = Hub::new(1, 1, Duration::from_secs(1));
        let root = CancellationToken::new();
        let c = client(&root);

        assert!(hub.insert(c.clone()));
        assert!(!hub.insert(c.clone()));
        assert_eq!(hub.client_count(), 1);
        assert!(hub.remove(&c));
        assert!(!hub.remove(&c));
        assert!(hub.get_client(c.connection_id()).is_none());
    }
}
