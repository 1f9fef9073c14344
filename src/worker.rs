//! Worker pool
//!
//! N workers, each owning one hub lane and selecting over its four channels:
//!
//! - register: local insert, then the registry's atomic create under the
//!   per-user cap; any failure rolls the local insert back
//! - unregister: local removal and registry removal
//! - inbound: event type dispatch, normalization, publish, ack
//! - outbound: resolve a local client and queue the payload

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::client::{ClientHandle, PushError};
use crate::dispatch::Dispatcher;
use crate::events;
use crate::hub::{Hub, HubError, InboundEvent, OutboundRequest, RegisterRequest, WorkerLane};
use crate::protocol::{EventType, ProtocolError, ServerFrame};
use crate::registry::{ConnectionRecord, ConnectionRegistry};

/// Shared dependencies of every worker
#[derive(Clone)]
pub struct WorkerContext {
    pub hub: Arc<Hub>,
    pub registry: Arc<dyn ConnectionRegistry>,
    pub dispatcher: Arc<Dispatcher>,
    pub instance_id: String,
    pub max_connections_per_user: usize,
}

/// Spawn one worker per lane
pub fn spawn_pool(
    ctx: WorkerContext,
    lanes: Vec<WorkerLane>,
    shutdown: CancellationToken,
) -> Vec<JoinHandle<()>> {
    lanes
        .into_iter()
        .enumerate()
        .map(|(id, lane)| {
            let worker = Worker {
                id,
                ctx: ctx.clone(),
            };
            tokio::spawn(worker.run(lane, shutdown.clone()))
        })
        .collect()
}

struct Worker {
    id: usize,
    ctx: WorkerContext,
}

impl Worker {
    async fn run(self, mut lane: WorkerLane, shutdown: CancellationToken) {
        debug!(worker = self.id, "worker started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                Some(request) = lane.register.recv() => self.register(request).await,
                Some(client) = lane.unregister.recv() => self.unregister(client).await,
                Some(event) = lane.inbound.recv() => self.inbound(event).await,
                Some(request) = lane.outbound.recv() => self.outbound(request),
                else => break,
            }
        }

        debug!(worker = self.id, "worker stopped");
    }

    async fn register(&self, request: RegisterRequest) {
        let RegisterRequest { client, reply } = request;
        let conn_id = client.connection_id();

        // The handshake gave up before we got here
        if client.is_closed() {
            let _ = reply.send(Err(HubError::Closed));
            return;
        }

        if !self.ctx.hub.insert(client.clone()) {
            error!(worker = self.id, conn_id, "duplicate connection id");
            let _ = reply.send(Err(HubError::Registry("duplicate connection id".to_string())));
            return;
        }

        let record = ConnectionRecord::from_client(client.info(), &self.ctx.instance_id);
        let outcome = match self
            .ctx
            .registry
            .create_connection(&record, self.ctx.max_connections_per_user)
            .await
        {
            Ok(true) => Ok(()),
            Ok(false) => {
                warn!(worker = self.id, conn_id, user_id = %record.user_id, "connection limit reached");
                Err(HubError::CapExceeded)
            }
            Err(e) => {
                error!(worker = self.id, conn_id, error = %e, "registry create failed");
                Err(HubError::Registry(e.to_string()))
            }
        };

        if outcome.is_err() {
            self.ctx.hub.remove(&client);
            let _ = reply.send(outcome);
            return;
        }

        if client.is_closed() || reply.send(Ok(())).is_err() {
            debug!(worker = self.id, conn_id, "client gone during registration, rolling back");
            self.ctx.hub.remove(&client);
            self.remove_from_registry(conn_id).await;
            return;
        }

        info!(worker = self.id, conn_id, user_id = %record.user_id, "client registered");
    }

    async fn unregister(&self, client: ClientHandle) {
        let conn_id = client.connection_id();
        client.shutdown();

        if self.ctx.hub.remove(&client) {
            self.remove_from_registry(conn_id).await;
            info!(worker = self.id, conn_id, user_id = %client.info().user_id, "client unregistered");
        } else {
            debug!(worker = self.id, conn_id, "unregister for unknown client");
        }
    }

    async fn remove_from_registry(&self, conn_id: &str) {
        if let Err(e) = self.ctx.registry.remove_connection(conn_id).await {
            error!(worker = self.id, conn_id, error = %e, "registry remove failed");
        }
    }

    async fn inbound(&self, event: InboundEvent) {
        let InboundEvent { client, frame } = event;
        let conn_id = client.connection_id();
        let raw_type = frame.event_type;

        let event_type = match EventType::try_from(raw_type) {
            Ok(event_type) => event_type,
            Err(e) => {
                debug!(worker = self.id, conn_id, event_type = raw_type, "unknown event type");
                reply(&client, ServerFrame::error(&e, Some(raw_type)));
                return;
            }
        };

        let event = match events::normalize(event_type, frame.payload, client.info(), &self.ctx.instance_id) {
            Ok(event) => event,
            Err(e) => {
                debug!(worker = self.id, conn_id, error = %e, "invalid event payload");
                reply(&client, ServerFrame::error(&e, Some(raw_type)));
                return;
            }
        };

        let payload = match event.to_bytes() {
            Ok(payload) => payload,
            Err(e) => {
                error!(worker = self.id, conn_id, error = %e, "event encoding failed");
                reply(&client, ServerFrame::error(&ProtocolError::DeliveryFailed, Some(raw_type)));
                return;
            }
        };

        let family = event_type.family();
        match self
            .ctx
            .dispatcher
            .dispatch(family, Some(event.partition_key()), &payload)
            .await
        {
            Ok(ack) if ack.requires_ack() => reply(
                &client,
                ServerFrame::Ack {
                    event_type: raw_type,
                    event_id: event.event_id,
                },
            ),
            Ok(_) => {}
            Err(e) => {
                error!(worker = self.id, conn_id, family = family.as_str(), error = %e, "event dispatch failed");
                reply(&client, ServerFrame::error(&ProtocolError::DeliveryFailed, Some(raw_type)));
            }
        }
    }

    fn outbound(&self, request: OutboundRequest) {
        let OutboundRequest {
            connection_id,
            payload,
            reply,
        } = request;

        let result = match self.ctx.hub.get_client(&connection_id) {
            Some(client) => client.push(payload),
            None => Err(PushError::NotFound(connection_id.clone())),
        };

        if let Err(e) = &result {
            debug!(worker = self.id, conn_id = %connection_id, error = %e, "push not delivered");
        }
        let _ = reply.send(result);
    }
}

fn reply(client: &ClientHandle, frame: ServerFrame) {
    if let Err(e) = client.send_frame(&frame) {
        debug!(conn_id = %client.connection_id(), error = %e, "reply frame not queued");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{MemorySink, RouteTable};
    use crate::registry::MemoryRegistry;
    use crate::session::ClientInfo;
    use axum::extract::ws::Message;
    use serde_json::Value;
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct Harness {
        hub: Arc<Hub>,
        registry: Arc<MemoryRegistry>,
        sink: Arc<MemorySink>,
        root: CancellationToken,
    }

    fn start(workers: usize, cap: usize) -> Harness {
        let (hub, lanes) = Hub::new(workers, 64, Duration::from_secs(1));
        let hub = Arc::new(hub);
        let registry = Arc::new(MemoryRegistry::new(Duration::from_secs(60)));
        let sink = Arc::new(MemorySink::new());
        let dispatcher = Dispatcher::new(sink.clone(), RouteTable::default(), 0, Duration::from_millis(1));
        let root = CancellationToken::new();

        spawn_pool(
            WorkerContext {
                hub: hub.clone(),
                registry: registry.clone(),
                dispatcher: Arc::new(dispatcher),
                instance_id: "gw-test".to_string(),
                max_connections_per_user: cap,
            },
            lanes,
            root.clone(),
        );

        Harness {
            hub,
            registry,
            sink,
            root,
        }
    }

    fn client(h: &Harness, user: &str) -> (ClientHandle, mpsc::Receiver<Message>) {
        let info = ClientInfo::new(
            user.to_string(),
            "s1".to_string(),
            "127.0.0.1".to_string(),
            "test".to_string(),
        );
        ClientHandle::new(info, 16, &h.root)
    }

    async fn next_json(rx: &mut mpsc::Receiver<Message>) -> Value {
        match tokio::time::timeout(Duration::from_secs(2), rx.recv()).await {
            Ok(Some(Message::Text(text))) => serde_json::from_str(&text).unwrap(),
            other => panic!("expected text frame, got {other:?}"),
        }
    }

    fn submit(h: &Harness, c: &ClientHandle, raw: &str) {
        h.hub
            .submit_inbound(InboundEvent {
                client: c.clone(),
                frame: crate::protocol::decode_frame(raw.as_bytes()).unwrap(),
            })
            .unwrap();
    }

    #[tokio::test]
    async fn test_register_and_unregister() {
        let h = start(2, 5);
        let (c, _rx) = client(&h, "u1");

        h.hub.register_client(&c).await.unwrap();
        assert_eq!(h.hub.client_count(), 1);
        assert_eq!(h.registry.len(), 1);

        h.hub.unregister_client(&c).await;
        tokio::time::timeout(Duration::from_secs(2), async {
            while h.hub.client_count() > 0 || !h.registry.is_empty() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert!(!h.registry.contains_anywhere(c.connection_id()));
        assert!(c.is_closed());
    }

    #[tokio::test]
    async fn test_cap_rejection_leaves_no_state() {
        let h = start(4, 2);
        let mut clients = Vec::new();
        for _ in 0..2 {
            let (c, rx) = client(&h, "u1");
            h.hub.register_client(&c).await.unwrap();
            clients.push((c, rx));
        }

        let (extra, _rx) = client(&h, "u1");
        let err = h.hub.register_client(&extra).await.unwrap_err();
        assert_eq!(err, HubError::CapExceeded);
        assert!(h.hub.get_client(extra.connection_id()).is_none());
        assert!(!h.registry.contains_anywhere(extra.connection_id()));
        assert_eq!(h.hub.client_count(), 2);
    }

    #[tokio::test]
    async fn test_new_message_published_keyed_and_acked() {
        let h = start(2, 5);
        let (c, mut rx) = client(&h, "user_a");
        h.hub.register_client(&c).await.unwrap();

        submit(&h, &c, r#"{"type":0,"payload":{"conversation_id":"c1","message":"hi"}}"#);

        let ack = next_json(&mut rx).await;
        assert_eq!(ack["type"], "ack");
        assert_eq!(ack["event_type"], 0);

        let records = h.sink.records_for("chat.message.new");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].key.as_deref(), Some("c1"));

        let event: Value = serde_json::from_slice(&records[0].payload).unwrap();
        assert_eq!(event["sender_id"], "user_a");
        assert_eq!(event["data"]["message"], "hi");
        assert_eq!(event["event_id"], ack["event_id"]);
    }

    #[tokio::test]
    async fn test_fire_and_forget_is_not_acked() {
        let h = start(1, 5);
        let (c, mut rx) = client(&h, "u1");
        h.hub.register_client(&c).await.unwrap();

        submit(&h, &c, r#"{"type":5,"payload":{"conversation_id":"c1","is_typing":true}}"#);
        submit(&h, &c, r#"{"type":42,"payload":{}}"#);

        // The error for the second frame is the first thing queued
        let frame = next_json(&mut rx).await;
        assert_eq!(frame["type"], "error");
        assert_eq!(frame["code"], "unknown_event_type");
        assert_eq!(frame["event_type"], 42);
        assert_eq!(h.sink.records_for("chat.typing").len(), 1);
        assert!(!c.is_closed());
    }

    #[tokio::test]
    async fn test_frames_processed_in_order() {
        let h = start(4, 5);
        let (c, mut rx) = client(&h, "u1");
        h.hub.register_client(&c).await.unwrap();

        for seq in 0..10 {
            submit(
                &h,
                &c,
                &format!(r#"{{"type":0,"payload":{{"conversation_id":"c1","message":"m{seq}"}}}}"#),
            );
        }
        for _ in 0..10 {
            assert_eq!(next_json(&mut rx).await["type"], "ack");
        }

        let bodies: Vec<String> = h
            .sink
            .records_for("chat.message.new")
            .iter()
            .map(|r| {
                let event: Value = serde_json::from_slice(&r.payload).unwrap();
                event["data"]["message"].as_str().unwrap().to_string()
            })
            .collect();
        let expected: Vec<String> = (0..10).map(|seq| format!("m{seq}")).collect();
        assert_eq!(bodies, expected);
    }

    #[tokio::test]
    async fn test_push_to_local_and_missing_connection() {
        let h = start(2, 5);
        let (c, mut rx) = client(&h, "u1");
        h.hub.register_client(&c).await.unwrap();

        h.hub
            .push(c.connection_id(), br#"{"hello":1}"#.to_vec())
            .await
            .unwrap();
        assert_eq!(next_json(&mut rx).await["hello"], 1);

        let err = h.hub.push("missing", b"x".to_vec()).await.unwrap_err();
        assert_eq!(err, PushError::NotFound("missing".to_string()));
    }

    #[tokio::test]
    async fn test_full_queue_does_not_delay_other_clients() {
        // One worker, so both connections share a lane
        let h = start(1, 5);
        let info = ClientInfo::new(
            "u1".to_string(),
            "s1".to_string(),
            "127.0.0.1".to_string(),
            "test".to_string(),
        );
        let (stalled, _stalled_rx) = ClientHandle::new(info, 1, &h.root);
        let (healthy, mut healthy_rx) = client(&h, "u2");
        h.hub.register_client(&stalled).await.unwrap();
        h.hub.register_client(&healthy).await.unwrap();

        h.hub.push(stalled.connection_id(), b"1".to_vec()).await.unwrap();
        for _ in 0..5 {
            let err = h.hub.push(stalled.connection_id(), b"more".to_vec()).await.unwrap_err();
            assert_eq!(err, PushError::QueueFull);
        }

        tokio::time::timeout(
            Duration::from_millis(200),
            h.hub.push(healthy.connection_id(), br#"{"n":1}"#.to_vec()),
        )
        .await
        .expect("push to healthy client was delayed")
        .unwrap();
        assert_eq!(next_json(&mut healthy_rx).await["n"], 1);
    }

    #[tokio::test]
    async fn test_closed_client_is_not_registered() {
        let h = start(1, 5);
        let (c, _rx) = client(&h, "u1");
        c.shutdown();

        assert_eq!(h.hub.register_client(&c).await.unwrap_err(), HubError::Closed);
        assert_eq!(h.hub.client_count(), 0);
        assert!(h.registry.is_empty());
    }
}
