//! Lifecycle event publishing
//!
//! Events are notifications, not state: publishing is fire-and-forget and a
//! failure never rolls back the change that produced it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::warn;
use uuid::Uuid;

/// Channel carrying workflow events for a tenant
pub fn workflow_channel(tenant_id: &str) -> String {
    format!("workflows:{}", tenant_id)
}

/// Channel carrying job events for a queue
pub fn queue_channel(queue_name: &str) -> String {
    format!("queues:{}", queue_name)
}

/// A published lifecycle event
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventEnvelope {
    pub id: Uuid,
    pub channel: String,
    /// Dotted event name, e.g. `job.completed`
    pub event_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    pub occurred_at: DateTime<Utc>,
    pub data: serde_json::Value,
}

impl EventEnvelope {
    pub fn new(
        channel: impl Into<String>,
        event_type: impl Into<String>,
        data: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            channel: channel.into(),
            event_type: event_type.into(),
            tenant_id: None,
            occurred_at: Utc::now(),
            data,
        }
    }

    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }
}

/// Error type for event publishing
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("event bus unavailable: {0}")]
    Unavailable(String),
}

// ============================================================================
// EventPublisher - fan-out of lifecycle events
// ============================================================================

/// Trait for publishing lifecycle events to subscribers
///
/// Implementations can:
/// - Fan out in-process to dashboards and tests
/// - Forward to an external pub/sub bus
/// - Do nothing (no-op implementation)
#[async_trait]
pub trait EventPublisher: Send + Sync + 'static {
    /// Publish an event to a channel
    async fn publish(&self, channel: &str, event: EventEnvelope) -> Result<(), PublishError>;
}

/// Publish and log failures instead of propagating them
pub async fn publish_best_effort(publisher: &dyn EventPublisher, event: EventEnvelope) {
    let channel = event.channel.clone();
    let event_type = event.event_type.clone();
    if let Err(e) = publisher.publish(&channel, event).await {
        warn!(%channel, %event_type, "failed to publish event: {}", e);
    }
}

/// In-process publisher backed by a tokio broadcast channel
///
/// Subscribers receive events from every channel and filter on
/// [`EventEnvelope::channel`]. Publishing with no subscribers succeeds.
pub struct BroadcastEventPublisher {
    tx: broadcast::Sender<EventEnvelope>,
}

impl BroadcastEventPublisher {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for BroadcastEventPublisher {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl EventPublisher for BroadcastEventPublisher {
    async fn publish(&self, channel: &str, mut event: EventEnvelope) -> Result<(), PublishError> {
        if event.channel != channel {
            event.channel = channel.to_string();
        }
        // No receivers is not a failure
        let _ = self.tx.send(event);
        Ok(())
    }
}

/// Publisher that drops every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(&self, _channel: &str, _event: EventEnvelope) -> Result<(), PublishError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct FailingPublisher;

    #[async_trait]
    impl EventPublisher for FailingPublisher {
        async fn publish(&self, _channel: &str, _event: EventEnvelope) -> Result<(), PublishError> {
            Err(PublishError::Unavailable("down".to_string()))
        }
    }

    #[tokio::test]
    async fn test_broadcast_delivers_to_subscribers() {
        let publisher = BroadcastEventPublisher::default();
        let mut rx = publisher.subscribe();

        let event = EventEnvelope::new(queue_channel("email:send"), "job.completed", json!({}))
            .with_tenant("t1");
        publisher.publish(&event.channel.clone(), event).await.unwrap();

        let received = rx.recv().await.unwrap();
        assert_eq!(received.channel, "queues:email:send");
        assert_eq!(received.event_type, "job.completed");
        assert_eq!(received.tenant_id.as_deref(), Some("t1"));
    }

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let publisher = BroadcastEventPublisher::new(4);
        let event = EventEnvelope::new(workflow_channel("t1"), "workflow.started", json!({}));
        assert!(publisher.publish("workflows:t1", event).await.is_ok());
    }

    #[tokio::test]
    async fn test_best_effort_swallows_errors() {
        let event = EventEnvelope::new("c", "x", json!(null));
        publish_best_effort(&FailingPublisher, event).await;
    }
}
