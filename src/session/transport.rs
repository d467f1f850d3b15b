//! Store-and-forward signaling transport

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use flume::{Receiver, Sender};
use parking_lot::Mutex;
use tracing::trace;

use crate::error::Result;

/// Messages delivered on a subscribed topic, in arrival order.
pub type Subscription = Receiver<Bytes>;

/// Topic-based publish/subscribe used to exchange offer and answer.
///
/// Delivery may be at-least-once; subscribers keep the first valid message.
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()>;

    async fn subscribe(&self, topic: &str) -> Result<Subscription>;
}

/// In-process broker, for tests and loopback setups.
#[derive(Default)]
pub struct MemoryBroker {
    topics: Mutex<HashMap<String, Vec<Sender<Bytes>>>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .lock()
            .get(topic)
            .map(|subs| subs.iter().filter(|s| !s.is_disconnected()).count())
            .unwrap_or(0)
    }
}

#[async_trait]
impl SignalingTransport for MemoryBroker {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()> {
        let mut topics = self.topics.lock();
        if let Some(subscribers) = topics.get_mut(topic) {
            subscribers.retain(|tx| tx.send(payload.clone()).is_ok());
            trace!("Delivered {} bytes to {} subscribers of {}", payload.len(), subscribers.len(), topic);
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription> {
        let (tx, rx) = flume::unbounded();
        self.topics.lock().entry(topic.to_string()).or_default().push(tx);
        Ok(rx)
    }
}
