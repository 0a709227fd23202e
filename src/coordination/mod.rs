//! Coordination store client
//!
//! Typed wrapper over the shared key-value store used for task leases and
//! publish/subscribe messaging between the coordinator and its workers.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │      TaskLockManager / ControlPlane / EventPublisher      │
//! └───────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌───────────────────────────────────────────────────────────┐
//! │                 CoordinationStore (trait)                 │
//! │  set_nx_ex · get · delete · keys_with_prefix              │
//! │  publish · subscribe · ping                               │
//! └───────────────────────────────────────────────────────────┘
//!                 │                              │
//!                 ▼                              ▼
//!      ┌─────────────────────┐        ┌─────────────────────┐
//!      │  RedisCoordination  │        │ MemoryCoordination  │
//!      │  (deadpool-redis)   │        │  (tests, --in-memory)│
//!      └─────────────────────┘        └─────────────────────┘
//! ```
//!
//! # Key and channel layout
//!
//! | Name | Kind | Payload |
//! |------|------|---------|
//! | `lock:<task_id>` | key with TTL | opaque claimant token |
//! | `worker:<name>:control` | channel | `{action, timestamp}` |
//! | `worker:updates` | channel | lifecycle and worker domain events |
//! | `worker:status` | channel | worker status snapshot |
//! | `queue:updates` | channel | task domain events |
//! | `result:updates` | channel | result domain events |
//! | `stats:updates` | channel | aggregate stats events |

pub mod memory;
pub mod redis_store;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::{ErrorCategory, FleetErrorTrait};

pub use self::memory::MemoryCoordination;
pub use self::redis_store::{CoordinationConfig, RedisCoordination};

// ============================================================================
// Keys and channels
// ============================================================================

/// Prefix shared by every lease key
pub const LEASE_PREFIX: &str = "lock:";

/// Global lifecycle broadcast channel (also carries worker domain events)
pub const WORKER_UPDATES_CHANNEL: &str = "worker:updates";

/// Global heartbeat channel
pub const WORKER_STATUS_CHANNEL: &str = "worker:status";

/// Task domain events
pub const QUEUE_UPDATES_CHANNEL: &str = "queue:updates";

/// Result domain events
pub const RESULT_UPDATES_CHANNEL: &str = "result:updates";

/// Aggregate stats events
pub const STATS_UPDATES_CHANNEL: &str = "stats:updates";

/// Every channel a dashboard listens to
pub const DOMAIN_CHANNELS: [&str; 4] = [
    QUEUE_UPDATES_CHANNEL,
    WORKER_UPDATES_CHANNEL,
    RESULT_UPDATES_CHANNEL,
    STATS_UPDATES_CHANNEL,
];

/// Lease key for a task
pub fn lease_key(task_id: Uuid) -> String {
    format!("{LEASE_PREFIX}{task_id}")
}

/// Task id referenced by a lease key, if the key is well formed
pub fn task_id_from_lease_key(key: &str) -> Option<Uuid> {
    key.strip_prefix(LEASE_PREFIX)
        .and_then(|id| Uuid::parse_str(id).ok())
}

/// Command channel scoped to a worker's display name
pub fn control_channel(worker_name: &str) -> String {
    format!("worker:{worker_name}:control")
}

// ============================================================================
// Messages
// ============================================================================

/// A message received on a subscribed channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelMessage {
    pub channel: String,
    pub payload: String,
}

/// Receiving half of a subscription; dropping it ends the subscription
pub type Subscription = mpsc::Receiver<ChannelMessage>;

/// Buffer size for subscription channels
pub const SUBSCRIPTION_BUFFER: usize = 256;

// ============================================================================
// Store trait
// ============================================================================

/// Operations the lock manager and control plane need from the shared store
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Atomically set `key` to `value` with a TTL, only if absent.
    /// Returns `true` when this caller created the key.
    async fn set_nx_ex(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, CoordinationError>;

    async fn get(&self, key: &str) -> Result<Option<String>, CoordinationError>;

    /// Delete a key. Returns `true` if it existed.
    async fn delete(&self, key: &str) -> Result<bool, CoordinationError>;

    /// Enumerate keys starting with `prefix`
    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, CoordinationError>;

    /// Publish a payload. Returns the number of receivers that got it.
    async fn publish(&self, channel: &str, payload: &str) -> Result<usize, CoordinationError>;

    /// Subscribe to a set of channels
    async fn subscribe(&self, channels: &[String]) -> Result<Subscription, CoordinationError>;

    async fn ping(&self) -> Result<(), CoordinationError>;
}

/// Shared, dynamically dispatched store handle
pub type SharedCoordination = std::sync::Arc<dyn CoordinationStore>;

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum CoordinationError {
    #[error("connection pool error: {0}")]
    Pool(String),

    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("injected failure: {0}")]
    Injected(String),
}

impl FleetErrorTrait for CoordinationError {
    fn is_recoverable(&self) -> bool {
        !matches!(self, Self::Serialization(_))
    }

    fn category(&self) -> ErrorCategory {
        match self {
            Self::Serialization(_) => ErrorCategory::Other,
            _ => ErrorCategory::ControlPlane,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lease_key_round_trip() {
        let id = Uuid::new_v4();
        let key = lease_key(id);
        assert!(key.starts_with(LEASE_PREFIX));
        assert_eq!(task_id_from_lease_key(&key), Some(id));
        assert_eq!(task_id_from_lease_key("lock:not-a-uuid"), None);
        assert_eq!(task_id_from_lease_key("other:abc"), None);
    }

    #[test]
    fn test_control_channel_name() {
        assert_eq!(control_channel("scraper-1"), "worker:scraper-1:control");
    }
}
