//! Client actor
//!
//! One per live socket. The handle is the bounded outbound queue plus a
//! cancellation token; the socket itself is owned by two pumps:
//!
//! - `read_pump` - idle deadline, admission control, envelope decode, then a
//!   non-blocking hand-off to the hub
//! - `write_pump` - drains the outbound queue under a write deadline and
//!   keeps the peer alive with pings
//!
//! A slow or dead client only ever fills its own queue; producers get
//! `PushError::QueueFull` instead of waiting.

use std::fmt::Display;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::{Instant, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::hub::{Hub, InboundEvent};
use crate::protocol::{self, CLOSE_GOING_AWAY, CLOSE_POLICY_VIOLATION, ServerFrame};
use crate::ratelimit::{RateLimitScope, RateLimiter};
use crate::session::ClientInfo;

/// Per-connection I/O settings
#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub outbound_capacity: usize,
    pub idle_read_timeout: Duration,
    pub write_timeout: Duration,
    pub ping_period: Duration,
    /// Close after this many consecutive dropped frames; 0 never closes
    pub max_rate_violations: u32,
    pub rate_limit_scope: RateLimitScope,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            outbound_capacity: 256,
            idle_read_timeout: Duration::from_secs(60),
            write_timeout: Duration::from_secs(10),
            ping_period: Duration::from_secs(54),
            max_rate_violations: 10,
            rate_limit_scope: RateLimitScope::Connection,
        }
    }
}

/// Outbound delivery errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PushError {
    #[error("outbound queue full")]
    QueueFull,
    #[error("client closed")]
    Closed,
    #[error("connection {0} not found on this instance")]
    NotFound(String),
    #[error("hub saturated")]
    Saturated,
}

struct ClientInner {
    info: ClientInfo,
    tx: mpsc::Sender<Message>,
    cancel: CancellationToken,
    close_frame: Mutex<Option<CloseFrame<'static>>>,
    unregistered: AtomicBool,
}

/// Cloneable handle to one client actor
#[derive(Clone)]
pub struct ClientHandle {
    inner: Arc<ClientInner>,
}

impl ClientHandle {
    /// Create a handle and the receiving end of its outbound queue
    pub fn new(
        info: ClientInfo,
        capacity: usize,
        parent: &CancellationToken,
    ) -> (Self, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let inner = ClientInner {
            info,
            tx,
            cancel: parent.child_token(),
            close_frame: Mutex::new(None),
            unregistered: AtomicBool::new(false),
        };
        (
            Self {
                inner: Arc::new(inner),
            },
            rx,
        )
    }

    pub fn info(&self) -> &ClientInfo {
        &self.inner.info
    }

    pub fn connection_id(&self) -> &str {
        &self.inner.info.connection_id
    }

    /// Queue a payload without waiting. UTF-8 payloads go out as text
    /// frames, anything else as binary.
    pub fn push(&self, payload: Vec<u8>) -> Result<(), PushError> {
        let message = match String::from_utf8(payload) {
            Ok(text) => Message::Text(text),
            Err(e) => Message::Binary(e.into_bytes()),
        };
        self.enqueue(message)
    }

    pub fn send_frame(&self, frame: &ServerFrame) -> Result<(), PushError> {
        self.enqueue(Message::Text(frame.encode()))
    }

    fn enqueue(&self, message: Message) -> Result<(), PushError> {
        if self.is_closed() {
            return Err(PushError::Closed);
        }
        self.inner.tx.try_send(message).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => PushError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => PushError::Closed,
        })
    }

    /// Close with a code: already queued frames are flushed, then the close
    /// frame is written and both pumps stop
    pub fn close(&self, code: u16, reason: &str) {
        {
            let mut close_frame = self.inner.close_frame.lock();
            if close_frame.is_none() {
                *close_frame = Some(CloseFrame {
                    code,
                    reason: reason.to_string().into(),
                });
            }
        }
        self.inner.cancel.cancel();
    }

    /// Stop both pumps without a close frame
    pub fn shutdown(&self) {
        self.inner.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    pub async fn closed(&self) {
        self.inner.cancel.cancelled().await
    }

    fn take_close_frame(&self) -> Option<CloseFrame<'static>> {
        self.inner.close_frame.lock().take()
    }

    /// True for exactly one caller over the handle's lifetime
    pub(crate) fn begin_unregister(&self) -> bool {
        !self.inner.unregistered.swap(true, Ordering::SeqCst)
    }

    /// Whether both handles refer to the same actor
    pub fn same_as(&self, other: &ClientHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for ClientHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientHandle")
            .field("connection_id", &self.inner.info.connection_id)
            .field("user_id", &self.inner.info.user_id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Why a read pump returned
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disconnect {
    /// Peer closed the socket
    Closed,
    IdleTimeout,
    /// Closed after repeated rate-limit violations
    RateLimited,
    /// Handle cancelled (server close or shutdown)
    Cancelled,
    Transport(String),
}

/// Read frames until the socket closes, idles out, or the handle is cancelled
pub async fn read_pump<S, E>(
    mut stream: S,
    client: &ClientHandle,
    hub: &Hub,
    limiter: Option<&dyn RateLimiter>,
    settings: &ClientSettings,
) -> Disconnect
where
    S: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    let conn_id = client.connection_id();
    let mut violations: u32 = 0;

    loop {
        let next = tokio::select! {
            _ = client.closed() => return Disconnect::Cancelled,
            next = timeout(settings.idle_read_timeout, stream.next()) => next,
        };

        let message = match next {
            Err(_) => {
                debug!(conn_id, "idle read timeout");
                client.close(CLOSE_GOING_AWAY, "idle timeout");
                return Disconnect::IdleTimeout;
            }
            Ok(None) => return Disconnect::Closed,
            Ok(Some(Err(e))) => {
                debug!(conn_id, error = %e, "socket read failed");
                return Disconnect::Transport(e.to_string());
            }
            Ok(Some(Ok(message))) => message,
        };

        let data: &[u8] = match &message {
            Message::Text(text) => text.as_bytes(),
            Message::Binary(data) => data,
            Message::Close(_) => return Disconnect::Closed,
            Message::Ping(_) | Message::Pong(_) => continue,
        };

        if let Some(limiter) = limiter {
            let key = client.info().rate_limit_key(settings.rate_limit_scope);
            match limiter.allow(key).await {
                Ok(true) => violations = 0,
                Ok(false) => {
                    violations += 1;
                    warn!(conn_id, user_id = %client.info().user_id, violations, "rate limit exceeded, frame dropped");
                    if settings.max_rate_violations > 0 && violations >= settings.max_rate_violations {
                        client.close(CLOSE_POLICY_VIOLATION, "rate limit exceeded");
                        return Disconnect::RateLimited;
                    }
                    continue;
                }
                Err(e) => warn!(conn_id, error = %e, "rate limiter unavailable, admitting frame"),
            }
        }

        match protocol::decode_frame(data) {
            Ok(frame) => {
                let event = InboundEvent {
                    client: client.clone(),
                    frame,
                };
                if let Err(e) = hub.submit_inbound(event) {
                    warn!(conn_id, error = %e, "inbound frame dropped");
                }
            }
            Err(e) => {
                debug!(conn_id, error = %e, "rejected client frame");
                if let Err(e) = client.send_frame(&ServerFrame::error(&e, None)) {
                    debug!(conn_id, error = %e, "error frame not queued");
                }
            }
        }
    }
}

/// Write queued frames and pings until cancelled or the socket fails
pub async fn write_pump<W>(
    mut sink: W,
    mut rx: mpsc::Receiver<Message>,
    client: ClientHandle,
    settings: ClientSettings,
) where
    W: Sink<Message> + Unpin,
    W::Error: Display,
{
    let conn_id = client.connection_id().to_string();
    let mut ping = tokio::time::interval_at(
        Instant::now() + settings.ping_period,
        settings.ping_period,
    );

    loop {
        let message = tokio::select! {
            _ = client.closed() => break,
            message = rx.recv() => match message {
                Some(message) => message,
                None => break,
            },
            _ = ping.tick() => Message::Ping(Vec::new()),
        };

        if let Err(reason) = send_with_deadline(&mut sink, message, settings.write_timeout).await {
            debug!(conn_id = %conn_id, error = %reason, "socket write failed");
            client.shutdown();
            return;
        }
    }

    if let Some(frame) = client.take_close_frame() {
        // Flush what was queued before the close, then say goodbye
        while let Ok(message) = rx.try_recv() {
            if send_with_deadline(&mut sink, message, settings.write_timeout)
                .await
                .is_err()
            {
                return;
            }
        }
        debug!(conn_id = %conn_id, code = frame.code, "closing socket");
        let _ = send_with_deadline(&mut sink, Message::Close(Some(frame)), settings.write_timeout).await;
    }

    let _ = timeout(settings.write_timeout, sink.close()).await;
}

async fn send_with_deadline<W>(sink: &mut W, message: Message, deadline: Duration) -> Result<(), String>
where
    W: Sink<Message> + Unpin,
    W::Error: Display,
{
    match timeout(deadline, sink.send(message)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e.to_string()),
        Err(_) => Err("write timeout".to_string()),
    }
}
