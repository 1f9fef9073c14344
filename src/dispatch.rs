//! Event dispatcher
//!
//! Publishes normalized client events to the event stream, one topic per
//! event family. The delivery guarantee of each family is a row in the
//! `RouteTable`, not per-call logic:
//!
//! - `none` - fire-and-forget, no acknowledgement wait, never retried
//! - `leader` - partition leader acknowledged
//! - `all` - every in-sync replica acknowledged
//!
//! Ack-required publishes are retried a bounded number of times before the
//! failure is surfaced to the caller.
//!
//! # Sinks
//!
//! - `memory` - in-process broadcast, for single-node deployments and tests
//! - `kafka` - rdkafka producers, one per ack level (feature `kafka`)

mod memory;

pub use memory::{MemorySink, PublishedRecord};

#[cfg(feature = "kafka")]
mod kafka;

#[cfg(feature = "kafka")]
pub use kafka::KafkaSink;

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::protocol::EventFamily;

/// Acknowledgement required from the event stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AckLevel {
    None,
    Leader,
    All,
}

impl AckLevel {
    pub fn requires_ack(self) -> bool {
        !matches!(self, AckLevel::None)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AckLevel::None => "none",
            AckLevel::Leader => "leader",
            AckLevel::All => "all",
        }
    }
}

impl FromStr for AckLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" | "0" => Ok(AckLevel::None),
            "leader" | "1" => Ok(AckLevel::Leader),
            "all" | "-1" => Ok(AckLevel::All),
            other => Err(format!("unknown ack level {other}")),
        }
    }
}

/// Where and how one event family is published
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicRoute {
    pub topic: String,
    pub ack: AckLevel,
    /// Whether the partition key is applied
    pub keyed: bool,
}

impl TopicRoute {
    fn new(topic: &str, ack: AckLevel, keyed: bool) -> Self {
        Self {
            topic: topic.to_string(),
            ack,
            keyed,
        }
    }
}

/// Event family -> topic route
#[derive(Debug, Clone)]
pub struct RouteTable {
    routes: HashMap<EventFamily, TopicRoute>,
}

impl Default for RouteTable {
    fn default() -> Self {
        let routes = HashMap::from([
            (
                EventFamily::NewMessage,
                TopicRoute::new("chat.message.new", AckLevel::All, true),
            ),
            (
                EventFamily::EditMessage,
                TopicRoute::new("chat.message.edit", AckLevel::All, false),
            ),
            (
                EventFamily::DeleteMessage,
                TopicRoute::new("chat.message.delete", AckLevel::All, false),
            ),
            (
                EventFamily::Reaction,
                TopicRoute::new("chat.message.reaction", AckLevel::Leader, false),
            ),
            (
                EventFamily::ReadReceipt,
                TopicRoute::new("chat.message.read", AckLevel::None, false),
            ),
            (
                EventFamily::Typing,
                TopicRoute::new("chat.typing", AckLevel::None, false),
            ),
            (
                EventFamily::CallSignal,
                TopicRoute::new("call.signal", AckLevel::All, false),
            ),
        ]);

        Self { routes }
    }
}

impl RouteTable {
    /// Route for a family; every family has one
    pub fn get(&self, family: EventFamily) -> &TopicRoute {
        &self.routes[&family]
    }

    pub fn set(&mut self, family: EventFamily, route: TopicRoute) {
        self.routes.insert(family, route);
    }
}

/// Event stream backend trait
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Publish one record. Returns once the requested acknowledgement level
    /// is satisfied (immediately for `AckLevel::None`).
    async fn publish(
        &self,
        topic: &str,
        key: Option<&str>,
        payload: &[u8],
        ack: AckLevel,
    ) -> anyhow::Result<()>;
}

/// Routes normalized events to their topics with the configured guarantees
pub struct Dispatcher {
    sink: Arc<dyn EventSink>,
    routes: RouteTable,
    retries: u32,
    backoff: Duration,
}

impl Dispatcher {
    pub fn new(sink: Arc<dyn EventSink>, routes: RouteTable, retries: u32, backoff: Duration) -> Self {
        Self {
            sink,
            routes,
            retries,
            backoff,
        }
    }

    pub fn route(&self, family: EventFamily) -> &TopicRoute {
        self.routes.get(family)
    }

    /// Publish an event, retrying ack-required families with linear backoff
    pub async fn dispatch(
        &self,
        family: EventFamily,
        key: Option<&str>,
        payload: &[u8],
    ) -> Result<AckLevel, DispatchError> {
        let route = self.routes.get(family);
        let key = if route.keyed { key } else { None };
        let attempts = if route.ack.requires_ack() {
            self.retries + 1
        } else {
            1
        };

        let mut last_error = None;
        for attempt in 1..=attempts {
            match self.sink.publish(&route.topic, key, payload, route.ack).await {
                Ok(()) => {
                    debug!(topic = %route.topic, ack = route.ack.as_str(), attempt, "event published");
                    return Ok(route.ack);
                }
                Err(e) => {
                    warn!(topic = %route.topic, attempt, error = %e, "event publish failed");
                    last_error = Some(e);
                    if attempt < attempts {
                        tokio::time::sleep(self.backoff * attempt).await;
                    }
                }
            }
        }

        Err(DispatchError::Failed {
            topic: route.topic.clone(),
            attempts,
            reason: last_error.map(|e| e.to_string()).unwrap_or_default(),
        })
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("routes", &self.routes)
            .field("retries", &self.retries)
            .finish()
    }
}

/// Dispatch errors
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("publish to {topic} failed after {attempts} attempt(s): {reason}")]
    Failed {
        topic: String,
        attempts: u32,
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails the first `failures` publishes, then delegates
    struct FlakySink {
        failures: AtomicU32,
        calls: AtomicU32,
        inner: MemorySink,
    }

    impl FlakySink {
        fn new(failures: u32) -> Self {
            Self {
                failures: AtomicU32::new(failures),
                calls: AtomicU32::new(0),
                inner: MemorySink::new(),
            }
        }
    }

    #[async_trait]
    impl EventSink for FlakySink {
        async fn publish(
            &self,
            topic: &str,
            key: Option<&str>,
            payload: &[u8],
            ack: AckLevel,
        ) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                anyhow::bail!("broker unavailable");
            }
            self.inner.publish(topic, key, payload, ack).await
        }
    }

    fn dispatcher(sink: Arc<dyn EventSink>, retries: u32) -> Dispatcher {
        Dispatcher::new(sink, RouteTable::default(), retries, Duration::from_millis(10))
    }

    #[test]
    fn test_default_ack_table() {
        let routes = RouteTable::default();
        assert_eq!(routes.get(EventFamily::NewMessage).ack, AckLevel::All);
        assert_eq!(routes.get(EventFamily::CallSignal).ack, AckLevel::All);
        assert_eq!(routes.get(EventFamily::Reaction).ack, AckLevel::Leader);
        assert_eq!(routes.get(EventFamily::Typing).ack, AckLevel::None);
        assert_eq!(routes.get(EventFamily::ReadReceipt).ack, AckLevel::None);
        assert!(routes.get(EventFamily::NewMessage).keyed);
        assert!(!routes.get(EventFamily::Typing).keyed);
    }

    #[test]
    fn test_parse_ack_level() {
        assert_eq!("ALL".parse::<AckLevel>().unwrap(), AckLevel::All);
        assert_eq!("1".parse::<AckLevel>().unwrap(), AckLevel::Leader);
        assert_eq!("none".parse::<AckLevel>().unwrap(), AckLevel::None);
        assert!("most".parse::<AckLevel>().is_err());
    }

    #[tokio::test]
    async fn test_keyed_route_applies_key() {
        let sink = Arc::new(MemorySink::new());
        let dispatcher = dispatcher(sink.clone(), 0);

        dispatcher
            .dispatch(EventFamily::NewMessage, Some("c1"), b"{}")
            .await
            .unwrap();
        dispatcher
            .dispatch(EventFamily::Typing, Some("c1"), b"{}")
            .await
            .unwrap();

        let records = sink.records();
        assert_eq!(records[0].topic, "chat.message.new");
        assert_eq!(records[0].key.as_deref(), Some("c1"));
        assert_eq!(records[0].ack, AckLevel::All);
        assert_eq!(records[1].topic, "chat.typing");
        assert_eq!(records[1].key, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_required_retries() {
        let sink = Arc::new(FlakySink::new(2));
        let dispatcher = dispatcher(sink.clone(), 3);

        let ack = dispatcher
            .dispatch(EventFamily::NewMessage, Some("c1"), b"{}")
            .await
            .unwrap();

        assert_eq!(ack, AckLevel::All);
        assert_eq!(sink.calls.load(Ordering::SeqCst), 3);
        assert_eq!(sink.inner.records().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_are_bounded() {
        let sink = Arc::new(FlakySink::new(10));
        let dispatcher = dispatcher(sink.clone(), 2);

        let err = dispatcher
            .dispatch(EventFamily::CallSignal, None, b"{}")
            .await
            .unwrap_err();

        assert!(matches!(err, DispatchError::Failed { attempts: 3, .. }));
        assert_eq!(sink.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_fire_and_forget_never_retries() {
        let sink = Arc::new(FlakySink::new(1));
        let dispatcher = dispatcher(sink.clone(), 5);

        assert!(dispatcher
            .dispatch(EventFamily::Typing, None, b"{}")
            .await
            .is_err());
        assert_eq!(sink.calls.load(Ordering::SeqCst), 1);
    }
}
