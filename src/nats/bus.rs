//! Event bus abstraction
//!
//! Publishing is fire-and-forget from the domain's point of view: the
//! [`Publisher`] logs and drops transport errors so a bus outage never fails
//! or rolls back a committed transition.

use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use super::subjects::Subjects;
use crate::types::Result;

/// Publish side of the pub/sub transport
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Transport name for health reporting
    fn name(&self) -> &'static str;

    async fn publish(&self, subject: &str, payload: Bytes) -> Result<()>;
}

/// Message delivered to local subscribers
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub subject: String,
    pub payload: Bytes,
}

/// In-process bus on a tokio broadcast channel
pub struct LocalBus {
    sender: broadcast::Sender<BusMessage>,
}

impl LocalBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusMessage> {
        self.sender.subscribe()
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl EventBus for LocalBus {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn publish(&self, subject: &str, payload: Bytes) -> Result<()> {
        let message = BusMessage {
            subject: subject.to_string(),
            payload,
        };
        // No subscribers is not an error
        if self.sender.send(message).is_err() {
            debug!(subject, "No local subscribers");
        }
        Ok(())
    }
}

/// Best-effort JSON publisher bound to a subject prefix
#[derive(Clone)]
pub struct Publisher {
    bus: Arc<dyn EventBus>,
    subjects: Subjects,
}

impl Publisher {
    pub fn new(bus: Arc<dyn EventBus>, subjects: Subjects) -> Self {
        Self { bus, subjects }
    }

    pub fn subjects(&self) -> &Subjects {
        &self.subjects
    }

    pub fn bus_name(&self) -> &'static str {
        self.bus.name()
    }

    /// Serialize and publish; failures are logged and dropped
    pub async fn publish_json<T: Serialize>(&self, subject: &str, value: &T) {
        let payload = match serde_json::to_vec(value) {
            Ok(bytes) => Bytes::from(bytes),
            Err(e) => {
                warn!(subject, error = %e, "Failed to encode event");
                return;
            }
        };
        match self.bus.publish(subject, payload).await {
            Ok(()) => debug!(subject, "Event published"),
            Err(e) => warn!(subject, error = %e, "Event publish failed, continuing"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::HandoffError;

    struct DownBus;

    #[async_trait]
    impl EventBus for DownBus {
        fn name(&self) -> &'static str {
            "down"
        }
        async fn publish(&self, _subject: &str, _payload: Bytes) -> Result<()> {
            Err(HandoffError::Nats("connection refused".into()))
        }
    }

    #[tokio::test]
    async fn test_local_bus_delivers_to_subscriber() {
        let bus = Arc::new(LocalBus::default());
        let mut rx = bus.subscribe();
        let publisher = Publisher::new(bus.clone(), Subjects::default());

        publisher
            .publish_json("handoff.tasks.open", &serde_json::json!({"delivery_id": "dl1"}))
            .await;

        let message = rx.recv().await.unwrap();
        assert_eq!(message.subject, "handoff.tasks.open");
        let body: serde_json::Value = serde_json::from_slice(&message.payload).unwrap();
        assert_eq!(body["delivery_id"], "dl1");
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_ok() {
        let bus = LocalBus::default();
        assert!(bus.publish("x", Bytes::from_static(b"{}")).await.is_ok());
    }

    #[tokio::test]
    async fn test_publisher_swallows_transport_errors() {
        let publisher = Publisher::new(Arc::new(DownBus), Subjects::default());
        // Must not panic or propagate
        publisher.publish_json("handoff.tasks.open", &1u32).await;
    }
}
