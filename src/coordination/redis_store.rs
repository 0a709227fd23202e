//! Redis-backed coordination store
//!
//! Commands go through a deadpool-redis pool. Subscriptions use a dedicated
//! pub/sub connection per call, driven by a spawned task that forwards
//! messages into an mpsc channel until the receiver is dropped.

use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::{Config as PoolConfig, Pool, Runtime};
use futures::StreamExt;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::{
    ChannelMessage, CoordinationError, CoordinationStore, Subscription, SUBSCRIPTION_BUFFER,
};

/// Connection settings for the coordination store
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinationConfig {
    /// Redis URL (e.g., redis://localhost:6379)
    pub url: String,

    /// Connection pool size
    pub pool_size: usize,

    /// Keys fetched per SCAN round trip
    pub scan_count: usize,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            pool_size: 10,
            scan_count: 100,
        }
    }
}

impl CoordinationConfig {
    /// Create config from environment variables
    pub fn from_env() -> Self {
        Self {
            url: std::env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            pool_size: std::env::var("REDIS_POOL_SIZE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(10),
            scan_count: 100,
        }
    }
}

/// Redis implementation of [`CoordinationStore`]
pub struct RedisCoordination {
    pool: Pool,
    client: redis::Client,
    config: CoordinationConfig,
}

impl RedisCoordination {
    /// Build the pool and verify connectivity with PING
    pub async fn connect(config: &CoordinationConfig) -> Result<Self, CoordinationError> {
        let pool = PoolConfig::from_url(&config.url)
            .builder()
            .map_err(|e| CoordinationError::Pool(format!("failed to create pool builder: {e}")))?
            .max_size(config.pool_size)
            .runtime(Runtime::Tokio1)
            .build()
            .map_err(|e| CoordinationError::Pool(e.to_string()))?;

        let client = redis::Client::open(config.url.as_str())?;

        let store = Self {
            pool,
            client,
            config: config.clone(),
        };
        store.ping().await?;

        tracing::info!(url = %config.url, "Connected to coordination store");
        Ok(store)
    }

    async fn conn(&self) -> Result<deadpool_redis::Connection, CoordinationError> {
        self.pool
            .get()
            .await
            .map_err(|e| CoordinationError::Pool(e.to_string()))
    }
}

#[async_trait]
impl CoordinationStore for RedisCoordination {
    async fn set_nx_ex(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, CoordinationError> {
        let mut conn = self.conn().await?;
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut *conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, CoordinationError> {
        let mut conn = self.conn().await?;
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn delete(&self, key: &str) -> Result<bool, CoordinationError> {
        let mut conn = self.conn().await?;
        let removed: i64 = conn.del(key).await?;
        Ok(removed > 0)
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, CoordinationError> {
        let mut conn = self.conn().await?;
        let pattern = format!("{prefix}*");
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();

        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(self.config.scan_count)
                .query_async(&mut *conn)
                .await?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }

        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<usize, CoordinationError> {
        let mut conn = self.conn().await?;
        let receivers: i64 = conn.publish(channel, payload).await?;
        Ok(usize::try_from(receivers).unwrap_or(0))
    }

    async fn subscribe(&self, channels: &[String]) -> Result<Subscription, CoordinationError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        for channel in channels {
            pubsub.subscribe(channel).await?;
        }

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let names = channels.join(",");

        tokio::spawn(async move {
            let mut stream = pubsub.into_on_message();
            while let Some(msg) = stream.next().await {
                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(e) => {
                        tracing::warn!(error = %e, "Dropping non-text pub/sub payload");
                        continue;
                    }
                };
                let message = ChannelMessage {
                    channel: msg.get_channel_name().to_string(),
                    payload,
                };
                if tx.send(message).await.is_err() {
                    break;
                }
            }
            tracing::debug!(channels = %names, "Subscription closed");
        });

        Ok(rx)
    }

    async fn ping(&self) -> Result<(), CoordinationError> {
        let mut conn = self.conn().await?;
        let _: String = redis::cmd("PING").query_async(&mut *conn).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::lease_key;
    use uuid::Uuid;

    #[test]
    fn test_default_config() {
        let config = CoordinationConfig::default();
        assert_eq!(config.url, "redis://localhost:6379");
        assert_eq!(config.pool_size, 10);
    }

    #[tokio::test]
    #[ignore = "Requires running Redis"]
    async fn test_lease_lifecycle_against_redis() {
        let store = RedisCoordination::connect(&CoordinationConfig::from_env())
            .await
            .unwrap();
        let key = lease_key(Uuid::new_v4());

        assert!(store.set_nx_ex(&key, "a", Duration::from_secs(30)).await.unwrap());
        assert!(!store.set_nx_ex(&key, "b", Duration::from_secs(30)).await.unwrap());
        assert_eq!(store.get(&key).await.unwrap().as_deref(), Some("a"));
        assert!(store
            .keys_with_prefix("lock:")
            .await
            .unwrap()
            .contains(&key));
        assert!(store.delete(&key).await.unwrap());
        assert!(!store.delete(&key).await.unwrap());
    }

    #[tokio::test]
    #[ignore = "Requires running Redis"]
    async fn test_publish_subscribe_against_redis() {
        let store = RedisCoordination::connect(&CoordinationConfig::from_env())
            .await
            .unwrap();
        let channel = format!("test:{}", Uuid::new_v4());
        let mut sub = store.subscribe(&[channel.clone()]).await.unwrap();

        store.publish(&channel, "hello").await.unwrap();
        let msg = tokio::time::timeout(Duration::from_secs(2), sub.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg.channel, channel);
        assert_eq!(msg.payload, "hello");
    }
}
