use crate::config::Config;
use crate::models::InteractionEvent;
use anyhow::Result;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::Message;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

/// Publish-only transport for event and feature messages.
///
/// Publish failures degrade to a DLQ publish attempt and are otherwise
/// swallowed: event processing never fails because transport publish failed.
pub struct EventPublisher {
    producer: FutureProducer,
    config: std::sync::Arc<Config>,
}

impl EventPublisher {
    pub fn new(config: &Config) -> Result<Self> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &config.kafka.brokers)
            .set("message.timeout.ms", "5000")
            .set("queue.buffering.max.messages", "100000")
            .create()?;

        Ok(Self {
            producer,
            config: std::sync::Arc::new(config.clone()),
        })
    }

    async fn publish(&self, topic: &str, payload: &str, key: &str) -> Result<()> {
        let record = FutureRecord::to(topic).payload(payload).key(key);
        match self.producer.send(record, Duration::from_secs(5)).await {
            Ok(_) => Ok(()),
            Err((e, _)) => Err(anyhow::anyhow!("kafka send error on {}: {}", topic, e)),
        }
    }

    /// Returns true when the message reached the primary topic.
    pub async fn publish_interaction_event(&self, event: &InteractionEvent) -> bool {
        let payload = match serde_json::to_string(event) {
            Ok(payload) => payload,
            Err(e) => {
                error!("failed to serialize interaction event: {}", e);
                return false;
            }
        };

        match self
            .publish(&self.config.kafka.interaction_topic, &payload, &event.user_id)
            .await
        {
            Ok(()) => {
                debug!("interaction event published: {}", event.request_id);
                true
            }
            Err(e) => {
                warn!("interaction publish failed, trying DLQ: {}", e);
                if let Err(e) = self
                    .publish(&self.config.kafka.dlq_topic, &payload, &event.user_id)
                    .await
                {
                    error!("DLQ publish failed, message dropped: {}", e);
                }
                false
            }
        }
    }

    pub async fn publish_processed_features(&self, user_id: &str, message: &serde_json::Value) {
        let payload = message.to_string();
        if let Err(e) = self
            .publish(&self.config.kafka.features_topic, &payload, user_id)
            .await
        {
            warn!("processed-features publish failed for {}: {}", user_id, e);
        }
    }

    pub async fn publish_feedback(&self, user_id: &str, message: &serde_json::Value) {
        let payload = message.to_string();
        if let Err(e) = self
            .publish(&self.config.kafka.feedback_topic, &payload, user_id)
            .await
        {
            warn!("feedback publish failed for {}: {}", user_id, e);
        }
    }
}

/// Consumer for the interaction topic, used by the out-of-process feature
/// worker.
pub struct InteractionConsumer {
    consumer: StreamConsumer,
    config: std::sync::Arc<Config>,
}

impl InteractionConsumer {
    pub fn new(config: &Config) -> Result<Self> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("group.id", &config.kafka.group_id)
            .set("bootstrap.servers", &config.kafka.brokers)
            .set("enable.partition.eof", "false")
            .set("session.timeout.ms", "6000")
            .set("enable.auto.commit", "true")
            .set("auto.offset.reset", &config.kafka.auto_offset_reset)
            .create()?;

        Ok(Self {
            consumer,
            config: std::sync::Arc::new(config.clone()),
        })
    }

    pub async fn consume_interaction_events(
        &self,
        tx: mpsc::Sender<InteractionEvent>,
    ) -> Result<()> {
        self.consumer
            .subscribe(&[&self.config.kafka.interaction_topic])?;

        loop {
            match self.consumer.recv().await {
                Ok(message) => {
                    if let Some(payload) = message.payload() {
                        match serde_json::from_slice::<InteractionEvent>(payload) {
                            Ok(event) => {
                                if tx.send(event).await.is_err() {
                                    warn!("interaction channel closed, stopping consumer");
                                    break;
                                }
                            }
                            Err(e) => {
                                warn!("failed to deserialize interaction event: {}", e);
                            }
                        }
                    }
                }
                Err(e) => {
                    error!("kafka consumer error: {}", e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }

        Ok(())
    }
}
