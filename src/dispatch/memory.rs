//! In-memory event sink using tokio::sync::broadcast
//!
//! Single-node only. Records are broadcast to local subscribers and the most
//! recent ones are retained for inspection. No persistence.

use std::collections::VecDeque;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::dispatch::{AckLevel, EventSink};

/// Default broadcast buffer and retention size
const DEFAULT_BUFFER_SIZE: usize = 1024;

/// One published record
#[derive(Debug, Clone)]
pub struct PublishedRecord {
    pub topic: String,
    pub key: Option<String>,
    pub payload: Vec<u8>,
    pub ack: AckLevel,
}

/// In-memory sink
pub struct MemorySink {
    tx: broadcast::Sender<PublishedRecord>,
    retained: Mutex<VecDeque<PublishedRecord>>,
    retain: usize,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::with_buffer_size(DEFAULT_BUFFER_SIZE)
    }

    pub fn with_buffer_size(buffer_size: usize) -> Self {
        let (tx, _) = broadcast::channel(buffer_size.max(1));
        Self {
            tx,
            retained: Mutex::new(VecDeque::with_capacity(buffer_size)),
            retain: buffer_size,
        }
    }

    /// Receive every record published from now on
    pub fn subscribe(&self) -> broadcast::Receiver<PublishedRecord> {
        self.tx.subscribe()
    }

    /// Most recent records, oldest first
    pub fn records(&self) -> Vec<PublishedRecord> {
        self.retained.lock().iter().cloned().collect()
    }

    pub fn records_for(&self, topic: &str) -> Vec<PublishedRecord> {
        self.retained
            .lock()
            .iter()
            .filter(|r| r.topic == topic)
            .cloned()
            .collect()
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventSink for MemorySink {
    async fn publish(
        &self,
        topic: &str,
        key: Option<&str>,
        payload: &[u8],
        ack: AckLevel,
    ) -> anyhow::Result<()> {
        let record = PublishedRecord {
            topic: topic.to_string(),
            key: key.map(str::to_string),
            payload: payload.to_vec(),
            ack,
        };

        {
            let mut retained = self.retained.lock();
            if retained.len() == self.retain {
                retained.pop_front();
            }
            retained.push_back(record.clone());
        }

        // Err only means nobody is subscribed
        let _ = self.tx.send(record);
        Ok(())
    }
}
