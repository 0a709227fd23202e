//! In-process coordination store
//!
//! Used by tests and by `serve --in-memory`. Keys expire lazily on access
//! using tokio's clock, so paused-time tests can drive TTL expiry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;

use super::{
    ChannelMessage, CoordinationError, CoordinationStore, Subscription, SUBSCRIPTION_BUFFER,
};

struct Subscriber {
    channels: Vec<String>,
    tx: mpsc::Sender<ChannelMessage>,
}

/// In-memory implementation of [`CoordinationStore`]
#[derive(Default)]
pub struct MemoryCoordination {
    keys: Mutex<HashMap<String, (String, Instant)>>,
    subscribers: Mutex<Vec<Subscriber>>,
    published: Mutex<Vec<ChannelMessage>>,
    fail_publishes: AtomicBool,
    fail_keys: AtomicBool,
}

impl MemoryCoordination {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent publish fail (control-plane failure injection)
    pub fn set_fail_publishes(&self, fail: bool) {
        self.fail_publishes.store(fail, Ordering::SeqCst);
    }

    /// Make every subsequent key operation fail
    pub fn set_fail_keys(&self, fail: bool) {
        self.fail_keys.store(fail, Ordering::SeqCst);
    }

    /// Messages that were successfully published, in order
    pub async fn published(&self) -> Vec<ChannelMessage> {
        self.published.lock().await.clone()
    }

    /// Messages published on one channel
    pub async fn published_on(&self, channel: &str) -> Vec<ChannelMessage> {
        self.published
            .lock()
            .await
            .iter()
            .filter(|m| m.channel == channel)
            .cloned()
            .collect()
    }

    /// Insert a key directly, bypassing NX semantics
    pub async fn insert_raw(&self, key: &str, value: &str, ttl: Duration) {
        self.keys
            .lock()
            .await
            .insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
    }

    fn check_keys(&self) -> Result<(), CoordinationError> {
        if self.fail_keys.load(Ordering::SeqCst) {
            return Err(CoordinationError::Injected("key operation".to_string()));
        }
        Ok(())
    }
}

fn purge_expired(keys: &mut HashMap<String, (String, Instant)>) {
    let now = Instant::now();
    keys.retain(|_, (_, expires)| *expires > now);
}

#[async_trait]
impl CoordinationStore for MemoryCoordination {
    async fn set_nx_ex(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, CoordinationError> {
        self.check_keys()?;
        let mut keys = self.keys.lock().await;
        purge_expired(&mut keys);
        if keys.contains_key(key) {
            return Ok(false);
        }
        keys.insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
        Ok(true)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, CoordinationError> {
        self.check_keys()?;
        let mut keys = self.keys.lock().await;
        purge_expired(&mut keys);
        Ok(keys.get(key).map(|(v, _)| v.clone()))
    }

    async fn delete(&self, key: &str) -> Result<bool, CoordinationError> {
        self.check_keys()?;
        let mut keys = self.keys.lock().await;
        purge_expired(&mut keys);
        Ok(keys.remove(key).is_some())
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, CoordinationError> {
        self.check_keys()?;
        let mut keys = self.keys.lock().await;
        purge_expired(&mut keys);
        let mut matching: Vec<String> = keys
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        matching.sort();
        Ok(matching)
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<usize, CoordinationError> {
        if self.fail_publishes.load(Ordering::SeqCst) {
            return Err(CoordinationError::Injected(format!("publish to {channel}")));
        }

        let message = ChannelMessage {
            channel: channel.to_string(),
            payload: payload.to_string(),
        };

        let mut delivered = 0;
        let mut subscribers = self.subscribers.lock().await;
        subscribers.retain(|s| !s.tx.is_closed());
        for sub in subscribers.iter() {
            if sub.channels.iter().any(|c| c == channel) && sub.tx.try_send(message.clone()).is_ok()
            {
                delivered += 1;
            }
        }
        drop(subscribers);

        self.published.lock().await.push(message);
        Ok(delivered)
    }

    async fn subscribe(&self, channels: &[String]) -> Result<Subscription, CoordinationError> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        self.subscribers.lock().await.push(Subscriber {
            channels: channels.to_vec(),
            tx,
        });
        Ok(rx)
    }

    async fn ping(&self) -> Result<(), CoordinationError> {
        self.check_keys()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_nx_ex_is_exclusive() {
        let store = MemoryCoordination::new();
        assert!(store.set_nx_ex("lock:a", "t1", Duration::from_secs(60)).await.unwrap());
        assert!(!store.set_nx_ex("lock:a", "t2", Duration::from_secs(60)).await.unwrap());
        assert_eq!(store.get("lock:a").await.unwrap().as_deref(), Some("t1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_keys_expire_after_ttl() {
        let store = MemoryCoordination::new();
        store.set_nx_ex("lock:a", "t1", Duration::from_secs(10)).await.unwrap();

        tokio::time::advance(Duration::from_secs(11)).await;

        assert_eq!(store.get("lock:a").await.unwrap(), None);
        assert!(store.set_nx_ex("lock:a", "t2", Duration::from_secs(10)).await.unwrap());
    }

    #[tokio::test]
    async fn test_keys_with_prefix_and_delete() {
        let store = MemoryCoordination::new();
        store.insert_raw("lock:1", "x", Duration::from_secs(60)).await;
        store.insert_raw("lock:2", "x", Duration::from_secs(60)).await;
        store.insert_raw("other:3", "x", Duration::from_secs(60)).await;

        let keys = store.keys_with_prefix("lock:").await.unwrap();
        assert_eq!(keys, vec!["lock:1".to_string(), "lock:2".to_string()]);

        assert!(store.delete("lock:1").await.unwrap());
        assert!(!store.delete("lock:1").await.unwrap());
    }

    #[tokio::test]
    async fn test_publish_reaches_matching_subscribers_only() {
        let store = MemoryCoordination::new();
        let mut a = store.subscribe(&["alpha".to_string()]).await.unwrap();
        let mut b = store.subscribe(&["beta".to_string()]).await.unwrap();

        let delivered = store.publish("alpha", "hi").await.unwrap();
        assert_eq!(delivered, 1);
        assert_eq!(a.recv().await.unwrap().payload, "hi");
        assert!(b.try_recv().is_err());
        assert_eq!(store.published_on("alpha").await.len(), 1);
    }

    #[tokio::test]
    async fn test_injected_publish_failure() {
        let store = MemoryCoordination::new();
        store.set_fail_publishes(true);
        assert!(store.publish("alpha", "hi").await.is_err());
        assert!(store.published().await.is_empty());
    }
}
