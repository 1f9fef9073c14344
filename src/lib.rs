//! Delivery Gateway - real-time WebSocket message delivery
//!
//! Terminates client WebSocket connections, republishes client events onto
//! an event stream with per-family delivery guarantees, and lets other
//! backend services push bytes to any connection held by this process.
//!
//! ## Architecture
//!
//! ```text
//! Client (WS) → Gateway → Hub lanes → Workers → Event stream (Kafka)
//!                                       ↕
//!                             Connection registry (Redis)
//! Backend (gRPC) → Push gateway → Hub → Client outbound queue
//! ```
//!
//! ## Cargo Features
//!
//! - `redis` (default) - Redis connection registry and rate limiter
//! - `kafka` - Kafka event sink
//!
//! Without them, the in-memory backends serve a single process.

pub mod auth;
pub mod client;
pub mod config;
pub mod dispatch;
pub mod events;
pub mod gateway;
pub mod hub;
pub mod protocol;
pub mod push;
pub mod ratelimit;
pub mod registry;
pub mod rpc;
pub mod rpc_client;
pub mod session;
pub mod worker;

pub use client::{ClientHandle, ClientSettings, PushError};
pub use config::Config;
pub use dispatch::{AckLevel, Dispatcher, EventSink};
pub use hub::{Hub, HubError};
pub use protocol::{EventFamily, EventType, ProtocolError, ServerFrame};
pub use registry::ConnectionRegistry;
pub use session::ClientInfo;
