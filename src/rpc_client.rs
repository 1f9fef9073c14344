//! Push gateway client
//!
//! Raw `tonic::client::Grpc` unary calls, so the crate only generates server
//! code for the push service.

use std::time::Duration;

use anyhow::Context;
use tonic::Request;
use tonic::client::Grpc;
use tonic::codec::ProstCodec;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::transport::{Channel, Endpoint};

use crate::rpc::delivery::{
    SendMessageRequest, SendMessageResponse, SendToUserRequest, SendToUserResponse,
};

pub struct PushClient {
    channel: Channel,
    timeout: Option<Duration>,
}

impl PushClient {
    pub async fn connect(addr: &str, timeout: Option<Duration>) -> anyhow::Result<Self> {
        let endpoint = Endpoint::from_shared(normalize_rpc_addr(addr))?
            .connect_timeout(Duration::from_secs(5));
        let channel = endpoint
            .connect()
            .await
            .with_context(|| format!("failed to connect to push gateway at {}", addr))?;

        Ok(Self { channel, timeout })
    }

    pub async fn send_message(
        &self,
        connection_id: &str,
        payload: Vec<u8>,
    ) -> anyhow::Result<SendMessageResponse> {
        let request = SendMessageRequest {
            connection_id: connection_id.to_string(),
            payload,
        };
        self.unary(request, "/delivery.PushGateway/SendMessage")
            .await
    }

    pub async fn send_to_user(
        &self,
        user_id: &str,
        payload: Vec<u8>,
    ) -> anyhow::Result<SendToUserResponse> {
        let request = SendToUserRequest {
            user_id: user_id.to_string(),
            payload,
        };
        self.unary(request, "/delivery.PushGateway/SendToUser")
            .await
    }

    async fn unary<Req, Res>(&self, message: Req, path: &'static str) -> anyhow::Result<Res>
    where
        Req: prost::Message + 'static,
        Res: prost::Message + Default + 'static,
    {
        let mut grpc = Grpc::new(self.channel.clone());
        grpc.ready()
            .await
            .context("push gateway service not ready")?;
        let mut request = Request::new(message);
        if let Some(timeout) = self.timeout {
            request.set_timeout(timeout);
        }
        let response = grpc
            .unary(request, PathAndQuery::from_static(path), ProstCodec::default())
            .await?
            .into_inner();
        Ok(response)
    }
}

fn normalize_rpc_addr(addr: &str) -> String {
    if addr.starts_with("http://") || addr.starts_with("https://") {
        addr.to_string()
    } else {
        format!("http://{}", addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_rpc_addr() {
        assert_eq!(normalize_rpc_addr("127.0.0.1:50051"), "http://127.0.0.1:50051");
        assert_eq!(normalize_rpc_addr("https://push.internal"), "https://push.internal");
    }
}
