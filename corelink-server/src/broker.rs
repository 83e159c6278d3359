//! Pub/sub broker abstraction.
//!
//! Contexts publish and subscribe through a broker so that messages reach
//! nodes on other processes. Subscriptions are scoped by the node id
//! minted per accepted connection and torn down when the connection
//! closes. Networked implementations (Redis and the like) live in their
//! own crates; the in-memory broker here backs single-process deployments
//! and tests.

use crate::error::ServerError;
use bytes::Bytes;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Callback invoked with each message published to a subscribed topic.
pub type MessageHandler = Arc<dyn Fn(Bytes) + Send + Sync>;

/// Topic-based publish/subscribe, scoped by node id.
pub trait Broker: Send + Sync {
    fn publish(&self, topic: &str, message: Bytes) -> Result<(), ServerError>;

    fn subscribe(
        &self,
        node_id: &str,
        topic: &str,
        on_message: MessageHandler,
    ) -> Result<(), ServerError>;

    fn unsubscribe(&self, node_id: &str, topic: &str) -> Result<(), ServerError>;

    fn unsubscribe_all(&self, node_id: &str) -> Result<(), ServerError>;
}

/// Default broadcast channel capacity per topic.
const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// In-process broker over per-topic broadcast channels.
pub struct MemoryBroker {
    topics: DashMap<String, broadcast::Sender<Bytes>>,
    /// node id → topic → forwarder task.
    subscriptions: DashMap<String, HashMap<String, JoinHandle<()>>>,
    channel_capacity: usize,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(channel_capacity: usize) -> Self {
        Self {
            topics: DashMap::new(),
            subscriptions: DashMap::new(),
            channel_capacity,
        }
    }

    /// Returns the number of live subscriptions for a node.
    pub fn subscription_count(&self, node_id: &str) -> usize {
        self.subscriptions
            .get(node_id)
            .map(|topics| topics.len())
            .unwrap_or(0)
    }

    fn sender(&self, topic: &str) -> broadcast::Sender<Bytes> {
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.channel_capacity).0)
            .clone()
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl Broker for MemoryBroker {
    fn publish(&self, topic: &str, message: Bytes) -> Result<(), ServerError> {
        if let Some(sender) = self.topics.get(topic) {
            // No receivers is not an error.
            let _ = sender.send(message);
        }
        Ok(())
    }

    fn subscribe(
        &self,
        node_id: &str,
        topic: &str,
        on_message: MessageHandler,
    ) -> Result<(), ServerError> {
        let mut receiver = self.sender(topic).subscribe();
        let topic_name = topic.to_string();
        let task = tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(message) => on_message(message),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("subscription on {} lagged {} messages", topic_name, n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        let mut topics = self.subscriptions.entry(node_id.to_string()).or_default();
        if let Some(previous) = topics.insert(topic.to_string(), task) {
            previous.abort();
        }
        Ok(())
    }

    fn unsubscribe(&self, node_id: &str, topic: &str) -> Result<(), ServerError> {
        let task = self
            .subscriptions
            .get_mut(node_id)
            .and_then(|mut topics| topics.remove(topic))
            .ok_or_else(|| ServerError::Broker(format!("node {node_id} is not subscribed")))?;
        task.abort();
        Ok(())
    }

    fn unsubscribe_all(&self, node_id: &str) -> Result<(), ServerError> {
        if let Some((_, topics)) = self.subscriptions.remove(node_id) {
            for (_, task) in topics {
                task.abort();
            }
        }
        Ok(())
    }
}
