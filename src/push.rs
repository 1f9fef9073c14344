//! Push gateway
//!
//! gRPC surface other backend services use to reach connected clients.
//! Delivery goes through the local hub only: a connection held by another
//! gateway process is reported as not found (`SendMessage`) or counted as
//! remote (`SendToUser`), never forwarded.

use std::sync::Arc;

use tonic::{Request, Response, Status};
use tracing::{debug, warn};

use crate::client::PushError;
use crate::hub::Hub;
use crate::ratelimit::RateLimiter;
use crate::registry::ConnectionRegistry;
use crate::rpc::delivery::push_gateway_server::PushGateway;
use crate::rpc::delivery::{
    SendMessageRequest, SendMessageResponse, SendToUserRequest, SendToUserResponse,
};

pub use crate::rpc::delivery::push_gateway_server::PushGatewayServer;

/// PushGateway service implementation
pub struct PushGatewayService {
    hub: Arc<Hub>,
    registry: Arc<dyn ConnectionRegistry>,
    /// Admission control per target connection
    limiter: Option<Arc<dyn RateLimiter>>,
}

impl PushGatewayService {
    pub fn new(
        hub: Arc<Hub>,
        registry: Arc<dyn ConnectionRegistry>,
        limiter: Option<Arc<dyn RateLimiter>>,
    ) -> Self {
        Self {
            hub,
            registry,
            limiter,
        }
    }

    async fn admit(&self, connection_id: &str) -> Result<(), Status> {
        let Some(limiter) = &self.limiter else {
            return Ok(());
        };

        match limiter.allow(connection_id).await {
            Ok(true) => Ok(()),
            Ok(false) => {
                warn!(conn_id = %connection_id, "push rate limit exceeded");
                Err(Status::resource_exhausted("push rate limit exceeded"))
            }
            Err(e) => {
                warn!(conn_id = %connection_id, error = %e, "push limiter unavailable, admitting");
                Ok(())
            }
        }
    }
}

#[tonic::async_trait]
impl PushGateway for PushGatewayService {
    async fn send_message(
        &self,
        request: Request<SendMessageRequest>,
    ) -> Result<Response<SendMessageResponse>, Status> {
        let request = request.into_inner();
        if request.connection_id.is_empty() {
            return Err(Status::invalid_argument("connection_id is required"));
        }

        self.admit(&request.connection_id).await?;

        self.hub
            .push(&request.connection_id, request.payload)
            .await
            .map_err(push_status)?;

        debug!(conn_id = %request.connection_id, "push delivered");
        Ok(Response::new(SendMessageResponse {
            success: true,
            message: "queued".to_string(),
        }))
    }

    async fn send_to_user(
        &self,
        request: Request<SendToUserRequest>,
    ) -> Result<Response<SendToUserResponse>, Status> {
        let request = request.into_inner();
        if request.user_id.is_empty() {
            return Err(Status::invalid_argument("user_id is required"));
        }

        let connections = self
            .registry
            .list_connections_for_user(&request.user_id)
            .await
            .map_err(|e| Status::unavailable(format!("registry unavailable: {e}")))?;

        let mut response = SendToUserResponse::default();
        for connection_id in connections {
            if self.hub.get_client(&connection_id).is_none() {
                response.remote += 1;
                continue;
            }
            if self.admit(&connection_id).await.is_err() {
                response.failed += 1;
                continue;
            }
            match self.hub.push(&connection_id, request.payload.clone()).await {
                Ok(()) => response.delivered += 1,
                Err(e) => {
                    debug!(conn_id = %connection_id, error = %e, "push to user connection failed");
                    response.failed += 1;
                }
            }
        }

        debug!(
            user_id = %request.user_id,
            delivered = response.delivered,
            remote = response.remote,
            failed = response.failed,
            "push to user"
        );
        Ok(Response::new(response))
    }
}

fn push_status(err: PushError) -> Status {
    match err {
        PushError::NotFound(_) => Status::not_found(err.to_string()),
        PushError::QueueFull | PushError::Saturated => Status::resource_exhausted(err.to_string()),
        PushError::Closed => Status::unavailable(err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientHandle;
    use crate::dispatch::{Dispatcher, MemorySink, RouteTable};
    use crate::ratelimit::{MemoryRateLimiter, RateLimitPolicy};
    use crate::registry::{ConnectionRecord, MemoryRegistry};
    use crate::session::ClientInfo;
    use crate::worker::{WorkerContext, spawn_pool};
    use axum::extract::ws::Message;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    struct Setup {
        hub: Arc<Hub>,
        registry: Arc<MemoryRegistry>,
        root: CancellationToken,
    }

    fn setup() -> Setup {
        let (hub, lanes) = Hub::new(2, 16, Duration::from_secs(1));
        let hub = Arc::new(hub);
        let registry = Arc::new(MemoryRegistry::new(Duration::from_secs(60)));
        let dispatcher = Dispatcher::new(
            Arc::new(MemorySink::new()),
            RouteTable::default(),
            0,
            Duration::from_millis(1),
        );
        let root = CancellationToken::new();
        spawn_pool(
            WorkerContext {
                hub: hub.clone(),
                registry: registry.clone(),
                dispatcher: Arc::new(dispatcher),
                instance_id: "gw-a".to_string(),
                max_connections_per_user: 5,
            },
            lanes,
            root.clone(),
        );
        Setup {
            hub,
            registry,
            root,
        }
    }

    async fn connect(s: &Setup, user: &str, capacity: usize) -> (ClientHandle, mpsc::Receiver<Message>) {
        let info = ClientInfo::new(
            user.to_string(),
            "s1".to_string(),
            "127.0.0.1".to_string(),
            "test".to_string(),
        );
        let (client, rx) = ClientHandle::new(info, capacity, &s.root);
        s.hub.register_client(&client).await.unwrap();
        (client, rx)
    }

    fn send_message(connection_id: &str, payload: &[u8]) -> Request<SendMessageRequest> {
        Request::new(SendMessageRequest {
            connection_id: connection_id.to_string(),
            payload: payload.to_vec(),
        })
    }

    #[tokio::test]
    async fn test_send_message_to_local_connection() {
        let s = setup();
        let service = PushGatewayService::new(s.hub.clone(), s.registry.clone(), None);
        let (client, mut rx) = connect(&s, "u1", 4).await;

        let response = service
            .send_message(send_message(client.connection_id(), b"hello"))
            .await
            .unwrap()
            .into_inner();
        assert!(response.success);
        assert!(matches!(rx.recv().await, Some(Message::Text(t)) if t == "hello"));
    }

    #[tokio::test]
    async fn test_status_mapping() {
        let s = setup();
        let service = PushGatewayService::new(s.hub.clone(), s.registry.clone(), None);

        let status = service.send_message(send_message("", b"x")).await.unwrap_err();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);

        let status = service
            .send_message(send_message("elsewhere", b"x"))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::NotFound);

        let (client, _rx) = connect(&s, "u1", 1).await;
        service
            .send_message(send_message(client.connection_id(), b"1"))
            .await
            .unwrap();
        let status = service
            .send_message(send_message(client.connection_id(), b"2"))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::ResourceExhausted);
    }

    #[tokio::test]
    async fn test_push_rate_limited() {
        let s = setup();
        let limiter = MemoryRateLimiter::new(RateLimitPolicy::new("push_rpc", 1, Duration::from_secs(60)));
        let service = PushGatewayService::new(s.hub.clone(), s.registry.clone(), Some(Arc::new(limiter)));
        let (client, _rx) = connect(&s, "u1", 8).await;

        service
            .send_message(send_message(client.connection_id(), b"1"))
            .await
            .unwrap();
        let status = service
            .send_message(send_message(client.connection_id(), b"2"))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::ResourceExhausted);
    }

    #[tokio::test]
    async fn test_send_to_user_counts_local_and_remote() {
        let s = setup();
        let service = PushGatewayService::new(s.hub.clone(), s.registry.clone(), None);
        let (_a, mut rx_a) = connect(&s, "u1", 4).await;
        let (_b, mut rx_b) = connect(&s, "u1", 4).await;

        // Held by another gateway process
        s.registry
            .create_connection(
                &ConnectionRecord {
                    connection_id: "remote-1".to_string(),
                    user_id: "u1".to_string(),
                    session_id: "s2".to_string(),
                    instance_id: "gw-b".to_string(),
                    source_ip: "10.0.0.2".to_string(),
                    user_agent: "test".to_string(),
                    connected_at: 0,
                },
                5,
            )
            .await
            .unwrap();

        let response = service
            .send_to_user(Request::new(SendToUserRequest {
                user_id: "u1".to_string(),
                payload: b"hi".to_vec(),
            }))
            .await
            .unwrap()
            .into_inner();

        assert_eq!(response.delivered, 2);
        assert_eq!(response.remote, 1);
        assert_eq!(response.failed, 0);
        assert!(rx_a.recv().await.is_some());
        assert!(rx_b.recv().await.is_some());
    }
}
