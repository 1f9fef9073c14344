//! Kafka event sink using rdkafka
//!
//! One `FutureProducer` per ack level, since `acks` is a producer-wide
//! setting. Full-ack producers also enable idempotence so broker retries
//! cannot duplicate records.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use rdkafka::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use tracing::info;

use crate::dispatch::{AckLevel, EventSink};

/// Kafka-backed sink
pub struct KafkaSink {
    producers: HashMap<AckLevel, FutureProducer>,
    timeout: Duration,
}

impl KafkaSink {
    pub fn new(brokers: &str, timeout: Duration) -> anyhow::Result<Self> {
        let mut producers = HashMap::new();

        for ack in [AckLevel::None, AckLevel::Leader, AckLevel::All] {
            let acks = match ack {
                AckLevel::None => "0",
                AckLevel::Leader => "1",
                AckLevel::All => "all",
            };

            let producer: FutureProducer = ClientConfig::new()
                .set("bootstrap.servers", brokers)
                .set("acks", acks)
                .set("enable.idempotence", (ack == AckLevel::All).to_string())
                .set("message.timeout.ms", timeout.as_millis().to_string())
                .create()
                .with_context(|| format!("failed to create kafka producer (acks={acks})"))?;

            producers.insert(ack, producer);
        }

        info!(brokers = %brokers, "kafka sink ready");
        Ok(Self { producers, timeout })
    }
}

#[async_trait]
impl EventSink for KafkaSink {
    async fn publish(
        &self,
        topic: &str,
        key: Option<&str>,
        payload: &[u8],
        ack: AckLevel,
    ) -> anyhow::Result<()> {
        let producer = self
            .producers
            .get(&ack)
            .context("no producer for ack level")?;

        let mut record = FutureRecord::<str, [u8]>::to(topic).payload(payload);
        if let Some(key) = key {
            record = record.key(key);
        }

        if !ack.requires_ack() {
            // Enqueue only; the delivery future is dropped
            producer
                .send_result(record)
                .map_err(|(e, _)| anyhow::anyhow!("kafka enqueue failed: {e}"))?;
            return Ok(());
        }

        producer
            .send(record, Timeout::After(self.timeout))
            .await
            .map_err(|(e, _)| anyhow::anyhow!("kafka delivery failed: {e}"))?;
        Ok(())
    }
}
