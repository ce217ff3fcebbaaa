//! Downstream notifications.
//!
//! Publishing is best effort: the store mutation is already committed when a
//! notification goes out, so a failed publish is logged and counted but never
//! rolls anything back or holds up the checkpoint.

use crate::config::KafkaConfig;
use crate::model::Notification;
use async_trait::async_trait;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, instrument, warn};

/// Errors that can occur while publishing a notification
#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("Failed to create producer: {0}")]
    Creation(String),

    #[error("Failed to serialize notification: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Failed to send notification to {topic}: {message}")]
    Send { topic: String, message: String },

    #[error("Notification timed out after {0:?}")]
    Timeout(Duration),
}

/// A downstream channel for notifications
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NotificationSink: Send + Sync {
    fn name(&self) -> &str;

    async fn publish(&self, notification: &Notification, request_id: &str) -> Result<(), NotifyError>;
}

/// Publishes JSON notifications to the notifications topic
pub struct KafkaNotificationSink {
    producer: FutureProducer,
    topic: String,
    send_timeout: Duration,
}

impl KafkaNotificationSink {
    pub fn new(config: &KafkaConfig) -> Result<Self, NotifyError> {
        info!(
            brokers = %config.bootstrap_servers,
            topic = %config.topics.notifications,
            "Creating Kafka notification producer"
        );

        let producer: FutureProducer = config
            .build_producer_config()
            .create()
            .map_err(|e| NotifyError::Creation(e.to_string()))?;

        Ok(Self {
            producer,
            topic: config.topics.notifications.clone(),
            send_timeout: config.request_timeout(),
        })
    }

    /// Flush pending deliveries, used on shutdown
    pub fn flush(&self, timeout: Duration) {
        if let Err(e) = self.producer.flush(Timeout::After(timeout)) {
            warn!(error = %e, "Failed to flush notification producer");
        }
    }
}

#[async_trait]
impl NotificationSink for KafkaNotificationSink {
    fn name(&self) -> &str {
        "kafka"
    }

    #[instrument(skip(self, notification), fields(topic = %self.topic, resource_id = %notification.resource_id))]
    async fn publish(&self, notification: &Notification, request_id: &str) -> Result<(), NotifyError> {
        let payload = serde_json::to_vec(notification)?;
        // Same key as the inbound event, so notifications for a resource stay ordered
        let key = format!(
            "{}:{}:{}",
            notification.tenant_key.business_id,
            notification.tenant_key.location_id,
            notification.resource_type
        );
        let headers = OwnedHeaders::new()
            .insert(Header {
                key: "message-type",
                value: Some("resource_mutated"),
            })
            .insert(Header {
                key: "correlation-id",
                value: Some(request_id),
            });

        let record = FutureRecord::to(&self.topic)
            .key(&key)
            .payload(&payload)
            .headers(headers);

        let (partition, offset) = self
            .producer
            .send(record, Timeout::After(self.send_timeout))
            .await
            .map_err(|(e, _)| NotifyError::Send {
                topic: self.topic.clone(),
                message: e.to_string(),
            })?;

        debug!(partition, offset, "Notification delivered");
        Ok(())
    }
}

/// Fans notifications out to in-process subscribers (WebSocket sessions).
///
/// Having no subscribers is not an error; a lagging subscriber loses the
/// oldest notifications rather than slowing the pipeline.
pub struct BroadcastNotificationSink {
    sender: broadcast::Sender<Notification>,
}

impl BroadcastNotificationSink {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.sender.subscribe()
    }
}

#[async_trait]
impl NotificationSink for BroadcastNotificationSink {
    fn name(&self) -> &str {
        "broadcast"
    }

    async fn publish(&self, notification: &Notification, _request_id: &str) -> Result<(), NotifyError> {
        if self.sender.send(notification.clone()).is_err() {
            debug!("No notification subscribers");
        }
        Ok(())
    }
}

/// Publishes to every configured sink, swallowing failures
pub struct NotificationEmitter {
    sinks: Vec<Arc<dyn NotificationSink>>,
    timeout: Duration,
}

impl NotificationEmitter {
    pub fn new(sinks: Vec<Arc<dyn NotificationSink>>, timeout: Duration) -> Self {
        Self { sinks, timeout }
    }

    pub fn sink_count(&self) -> usize {
        self.sinks.len()
    }

    /// Returns the number of sinks that accepted the notification
    pub async fn emit(&self, notification: &Notification, request_id: &str) -> usize {
        let publishes = self.sinks.iter().map(|sink| async move {
            let result = match tokio::time::timeout(self.timeout, sink.publish(notification, request_id)).await {
                Ok(result) => result,
                Err(_) => Err(NotifyError::Timeout(self.timeout)),
            };
            if let Err(e) = &result {
                metrics::counter!("pipeline.notifications.failed").increment(1);
                warn!(
                    sink = sink.name(),
                    error = %e,
                    tenant = %notification.tenant_key,
                    resource_id = %notification.resource_id,
                    "Notification dropped"
                );
            }
            result.is_ok()
        });

        futures::future::join_all(publishes)
            .await
            .into_iter()
            .filter(|delivered| *delivered)
            .count()
    }
}
