//! Live-update fan-out
//!
//! Routes typed domain events onto dedicated coordination-store channels.
//! Dashboard instances subscribe to those channels (directly, or through the
//! coordinator's `/api/events` stream).
//!
//! Every payload has the shape `{type, action, data, timestamp}`:
//!
//! ```text
//! task   ──► queue:updates
//! worker ──► worker:updates   (shared with the lifecycle broadcast)
//! result ──► result:updates
//! stats  ──► stats:updates
//! ```
//!
//! Fan-out is best-effort. A failed publish is logged and never rolls back
//! the state change that produced the event.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::coordination::{
    CoordinationError, SharedCoordination, Subscription, QUEUE_UPDATES_CHANNEL,
    RESULT_UPDATES_CHANNEL, STATS_UPDATES_CHANNEL, WORKER_UPDATES_CHANNEL,
};
use crate::models::{ScrapeResult, SystemStats, Task, Worker};

// ============================================================================
// Event types
// ============================================================================

/// Entity an event refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Task,
    Worker,
    Result,
    Stats,
}

impl EventKind {
    /// Channel this kind of event is published on
    pub fn channel(&self) -> &'static str {
        match self {
            EventKind::Task => QUEUE_UPDATES_CHANNEL,
            EventKind::Worker => WORKER_UPDATES_CHANNEL,
            EventKind::Result => RESULT_UPDATES_CHANNEL,
            EventKind::Stats => STATS_UPDATES_CHANNEL,
        }
    }
}

/// What happened to the entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventAction {
    Create,
    Update,
    Delete,
    Claim,
    Complete,
    Fail,
    Register,
}

/// Envelope for every domain event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub action: EventAction,
    pub data: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl DomainEvent {
    pub fn new(kind: EventKind, action: EventAction, data: serde_json::Value) -> Self {
        Self {
            kind,
            action,
            data,
            timestamp: Utc::now(),
        }
    }

    /// Worker deletion broadcast; workers match `data.id` against their own id
    pub fn worker_deleted(id: Uuid, name: &str) -> Self {
        Self::new(
            EventKind::Worker,
            EventAction::Delete,
            serde_json::json!({ "id": id, "name": name }),
        )
    }

    /// Id referenced by `data.id`, if any
    pub fn subject_id(&self) -> Option<Uuid> {
        self.data
            .get("id")
            .and_then(|v| v.as_str())
            .and_then(|s| Uuid::parse_str(s).ok())
    }

    pub fn channel(&self) -> &'static str {
        self.kind.channel()
    }
}

// ============================================================================
// Publisher
// ============================================================================

/// Typed publish helper over the coordination store
#[derive(Clone)]
pub struct EventPublisher {
    store: SharedCoordination,
}

impl EventPublisher {
    pub fn new(store: SharedCoordination) -> Self {
        Self { store }
    }

    /// Publish one event, surfacing failures to the caller
    pub async fn publish(&self, event: &DomainEvent) -> Result<usize, CoordinationError> {
        let payload = serde_json::to_string(event)?;
        self.store.publish(event.channel(), &payload).await
    }

    /// Publish one event, logging and swallowing failures
    pub async fn emit(&self, event: DomainEvent) {
        if let Err(e) = self.publish(&event).await {
            tracing::warn!(
                error = %e,
                channel = event.channel(),
                action = ?event.action,
                "Live update publish failed"
            );
        }
    }

    pub async fn task(&self, action: EventAction, task: &Task) {
        match serde_json::to_value(task) {
            Ok(data) => self.emit(DomainEvent::new(EventKind::Task, action, data)).await,
            Err(e) => tracing::warn!(error = %e, "Failed to encode task event"),
        }
    }

    pub async fn task_deleted(&self, id: Uuid) {
        self.emit(DomainEvent::new(
            EventKind::Task,
            EventAction::Delete,
            serde_json::json!({ "id": id }),
        ))
        .await;
    }

    pub async fn worker(&self, action: EventAction, worker: &Worker) {
        match serde_json::to_value(worker) {
            Ok(data) => self.emit(DomainEvent::new(EventKind::Worker, action, data)).await,
            Err(e) => tracing::warn!(error = %e, "Failed to encode worker event"),
        }
    }

    pub async fn result_created(&self, result: &ScrapeResult) {
        match serde_json::to_value(result) {
            Ok(data) => {
                self.emit(DomainEvent::new(EventKind::Result, EventAction::Create, data))
                    .await
            }
            Err(e) => tracing::warn!(error = %e, "Failed to encode result event"),
        }
    }

    pub async fn stats(&self, stats: &SystemStats) {
        match serde_json::to_value(stats) {
            Ok(data) => {
                self.emit(DomainEvent::new(EventKind::Stats, EventAction::Update, data))
                    .await
            }
            Err(e) => tracing::warn!(error = %e, "Failed to encode stats event"),
        }
    }

    /// Subscribe to every domain channel
    pub async fn subscribe_all(&self) -> Result<Subscription, CoordinationError> {
        let channels: Vec<String> = crate::coordination::DOMAIN_CHANNELS
            .iter()
            .map(|c| c.to_string())
            .collect();
        self.store.subscribe(&channels).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::MemoryCoordination;
    use crate::models::TaskKind;
    use std::sync::Arc;

    #[test]
    fn test_event_envelope_shape() {
        let id = Uuid::new_v4();
        let event = DomainEvent::worker_deleted(id, "w1");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "worker");
        assert_eq!(json["action"], "delete");
        assert_eq!(json["data"]["id"], id.to_string());
        assert!(json["timestamp"].is_string());
        assert_eq!(event.subject_id(), Some(id));
    }

    #[tokio::test]
    async fn test_events_route_to_channels() {
        let store = Arc::new(MemoryCoordination::new());
        let events = EventPublisher::new(store.clone());

        let task = Task::new("https://www.tiktok.com/@a", TaskKind::Profile);
        events.task(EventAction::Create, &task).await;
        events.stats(&SystemStats::default()).await;

        assert_eq!(store.published_on(QUEUE_UPDATES_CHANNEL).await.len(), 1);
        assert_eq!(store.published_on(STATS_UPDATES_CHANNEL).await.len(), 1);
    }

    #[tokio::test]
    async fn test_emit_swallows_publish_failures() {
        let store = Arc::new(MemoryCoordination::new());
        store.set_fail_publishes(true);
        let events = EventPublisher::new(store.clone());

        events.task_deleted(Uuid::new_v4()).await;
        assert!(store.published().await.is_empty());
    }
}
