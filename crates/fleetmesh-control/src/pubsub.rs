//! Cross-replica notification bus
//!
//! Channels in use: `licenses` (license changed, resync now), `replica`
//! (a peer announced itself) and `tailnet_coordinator` (node updates from
//! the high-availability coordinator).

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};
use thiserror::Error;

/// Receives payloads published on a channel. Must not block.
pub type Listener = Arc<dyn Fn(Bytes) + Send + Sync>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PubsubError {
    #[error("Subscribe to {channel} failed: {reason}")]
    Subscribe { channel: String, reason: String },

    #[error("Publish to {channel} failed: {reason}")]
    Publish { channel: String, reason: String },
}

/// Active subscription; unsubscribes when dropped
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn new(cancel: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    pub fn cancel(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

#[async_trait]
pub trait Pubsub: Send + Sync {
    async fn subscribe(&self, channel: &str, listener: Listener) -> Result<Subscription, PubsubError>;
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<(), PubsubError>;
}

type ListenerTable = RwLock<HashMap<String, Vec<(u64, Listener)>>>;

/// In-process bus; delivers synchronously to every listener, including the
/// publisher's own
#[derive(Default)]
pub struct MemoryPubsub {
    listeners: Arc<ListenerTable>,
    next_id: AtomicU64,
}

impl MemoryPubsub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn listener_count(&self, channel: &str) -> usize {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(channel)
            .map_or(0, Vec::len)
    }
}

fn unsubscribe(table: Weak<ListenerTable>, channel: String, id: u64) {
    let Some(table) = table.upgrade() else {
        return;
    };
    let mut listeners = table.write().unwrap_or_else(PoisonError::into_inner);
    if let Some(entries) = listeners.get_mut(&channel) {
        entries.retain(|(entry_id, _)| *entry_id != id);
        if entries.is_empty() {
            listeners.remove(&channel);
        }
    }
}

#[async_trait]
impl Pubsub for MemoryPubsub {
    async fn subscribe(&self, channel: &str, listener: Listener) -> Result<Subscription, PubsubError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(channel.to_string())
            .or_default()
            .push((id, listener));

        let table = Arc::downgrade(&self.listeners);
        let channel = channel.to_string();
        Ok(Subscription::new(move || unsubscribe(table, channel, id)))
    }

    async fn publish(&self, channel: &str, payload: Bytes) -> Result<(), PubsubError> {
        let listeners: Vec<Listener> = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(channel)
            .map(|entries| entries.iter().map(|(_, l)| Arc::clone(l)).collect())
            .unwrap_or_default();

        for listener in listeners {
            listener(payload.clone());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn test_publish_reaches_subscribers_until_dropped() {
        let pubsub = MemoryPubsub::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&hits);
        let subscription = pubsub
            .subscribe(
                "licenses",
                Arc::new(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .await
            .unwrap();

        pubsub.publish("licenses", Bytes::new()).await.unwrap();
        pubsub.publish("replica", Bytes::new()).await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        drop(subscription);
        assert_eq!(pubsub.listener_count("licenses"), 0);

        pubsub.publish("licenses", Bytes::new()).await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
