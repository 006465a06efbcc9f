//! Redpanda (Kafka-compatible) relay for ledger events.
//!
//! Subscribes to the [`EventBus`](super::EventBus) and forwards each event to
//! `{prefix}.{event_kind}.{wallet}`, keyed by wallet. Fire-and-forget: a slow
//! or unreachable broker never holds back ingestion.

use std::time::Duration;

use log::{error, info, warn};
use rdkafka::config::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use serde::Serialize;
use tokio::sync::broadcast::{error::RecvError, Receiver};
use tokio_util::sync::CancellationToken;

use super::LedgerEvent;
use crate::config::RedpandaSettings;

pub struct RedpandaPublisher {
    producer: FutureProducer,
    topic_prefix: String,
}

impl RedpandaPublisher {
    /// Returns None if Redpanda is disabled or the producer cannot be created.
    pub fn new(settings: &RedpandaSettings) -> Option<Self> {
        if !settings.enabled {
            info!("Redpanda publishing is disabled");
            return None;
        }

        info!("Connecting to Redpanda brokers: {}", settings.brokers);

        let producer: FutureProducer = match ClientConfig::new()
            .set("bootstrap.servers", &settings.brokers)
            .set("message.timeout.ms", "5000")
            .set("queue.buffering.max.messages", "10000")
            .set("linger.ms", "5")
            .create()
        {
            Ok(p) => p,
            Err(e) => {
                error!("Failed to create Redpanda producer: {}", e);
                return None;
            },
        };

        Some(Self {
            producer,
            topic_prefix: settings.topic_prefix.clone(),
        })
    }

    pub fn topic_for(&self, event: &LedgerEvent) -> String {
        format!(
            "{}.{}.{}",
            self.topic_prefix,
            event.kind(),
            event.wallet_address()
        )
    }

    pub async fn publish_event(&self, event: &LedgerEvent) {
        let topic = self.topic_for(event);
        self.publish_message(&topic, event.wallet_address(), event).await;
    }

    /// Forwards bus events until cancelled or the bus closes.
    pub async fn run(self, mut events: Receiver<LedgerEvent>, cancel: CancellationToken) {
        info!("Redpanda forwarder started (prefix {})", self.topic_prefix);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                received = events.recv() => match received {
                    Ok(event) => self.publish_event(&event).await,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Redpanda forwarder lagged, dropped {} events", skipped);
                    },
                    Err(RecvError::Closed) => break,
                },
            }
        }

        self.flush();
        info!("Redpanda forwarder stopped");
    }

    async fn publish_message<T: Serialize>(&self, topic: &str, key: &str, value: &T) {
        let payload = match serde_json::to_string(value) {
            Ok(p) => p,
            Err(e) => {
                warn!("Failed to serialize message for {}: {}", topic, e);
                return;
            },
        };

        let record = FutureRecord::to(topic).key(key).payload(&payload);

        if let Err((e, _)) = self.producer.send(record, Duration::from_millis(100)).await {
            warn!("Failed to send message to {}: {}", topic, e);
        }
    }

    pub fn flush(&self) {
        self.producer.flush(Duration::from_secs(5)).ok();
    }
}

impl Drop for RedpandaPublisher {
    fn drop(&mut self) {
        self.flush();
    }
}
