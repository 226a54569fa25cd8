//! Pub/sub transport contract
//!
//! The node consumes a topic-addressable broadcast bus supplied by the
//! host: subscribe handlers to named topics, broadcast opaque bytes, list
//! a topic's subscribers, and expose a stable host identity. [`LocalBus`]
//! is an in-process implementation that connects several nodes inside one
//! process; integration tests and embedded demos run on it.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use thiserror::Error;
use tokio::sync::Mutex;

/// Callback invoked with the raw payload of every message on a topic.
pub type TopicHandler = Arc<dyn Fn(Vec<u8>) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport: {0}")]
    Failed(String),
}

/// The broadcast bus contract consumed by the sync protocol.
#[async_trait]
pub trait PubSub: Send + Sync {
    /// Attach `handler` to `topic`. `subscriber` marks this host as a
    /// listed member of the topic (peers discover each other through
    /// [`PubSub::list_peers`]); a false value installs the handler without
    /// listing the host.
    async fn subscribe(
        &self,
        topic: &str,
        handler: TopicHandler,
        subscriber: bool,
    ) -> Result<(), TransportError>;

    async fn cancel_subscribe(&self, topic: &str) -> Result<(), TransportError>;

    async fn is_subscribed(&self, topic: &str) -> bool;

    /// Deliver `payload` to every other subscriber of `topic`.
    async fn broadcast_with_topic(&self, topic: &str, payload: Vec<u8>)
        -> Result<(), TransportError>;

    /// Hosts currently listed as subscribers of `topic`.
    async fn list_peers(&self, topic: &str) -> Vec<String>;

    /// Stable identity of this host on the bus.
    fn host_id(&self) -> String;
}

struct Subscription {
    host: String,
    subscriber: bool,
    handler: TopicHandler,
}

/// Shared hub of an in-process bus. Clones share the hub; create one,
/// then hand an [`LocalBus::endpoint`] to each node.
#[derive(Clone, Default)]
pub struct LocalBus {
    topics: Arc<Mutex<HashMap<String, Vec<Subscription>>>>,
}

impl LocalBus {
    pub fn new() -> LocalBus {
        LocalBus::default()
    }

    /// A per-host handle implementing [`PubSub`].
    pub fn endpoint(&self, host: &str) -> Arc<LocalEndpoint> {
        Arc::new(LocalEndpoint {
            bus: self.clone(),
            host: host.to_string(),
        })
    }
}

/// One host's handle onto a [`LocalBus`].
pub struct LocalEndpoint {
    bus: LocalBus,
    host: String,
}

#[async_trait]
impl PubSub for LocalEndpoint {
    async fn subscribe(
        &self,
        topic: &str,
        handler: TopicHandler,
        subscriber: bool,
    ) -> Result<(), TransportError> {
        let mut topics = self.bus.topics.lock().await;
        let subs = topics.entry(topic.to_string()).or_default();
        subs.retain(|sub| sub.host != self.host);
        subs.push(Subscription {
            host: self.host.clone(),
            subscriber,
            handler,
        });
        Ok(())
    }

    async fn cancel_subscribe(&self, topic: &str) -> Result<(), TransportError> {
        let mut topics = self.bus.topics.lock().await;
        if let Some(subs) = topics.get_mut(topic) {
            subs.retain(|sub| sub.host != self.host);
        }
        Ok(())
    }

    async fn is_subscribed(&self, topic: &str) -> bool {
        let topics = self.bus.topics.lock().await;
        topics
            .get(topic)
            .map_or(false, |subs| subs.iter().any(|sub| sub.host == self.host))
    }

    async fn broadcast_with_topic(
        &self,
        topic: &str,
        payload: Vec<u8>,
    ) -> Result<(), TransportError> {
        let handlers: Vec<TopicHandler> = {
            let topics = self.bus.topics.lock().await;
            topics
                .get(topic)
                .map(|subs| {
                    subs.iter()
                        .filter(|sub| sub.host != self.host)
                        .map(|sub| Arc::clone(&sub.handler))
                        .collect()
                })
                .unwrap_or_default()
        };
        for handler in handlers {
            let payload = payload.clone();
            tokio::spawn(async move { handler(payload).await });
        }
        Ok(())
    }

    async fn list_peers(&self, topic: &str) -> Vec<String> {
        let topics = self.bus.topics.lock().await;
        topics
            .get(topic)
            .map(|subs| {
                subs.iter()
                    .filter(|sub| sub.subscriber)
                    .map(|sub| sub.host.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn host_id(&self) -> String {
        self.host.clone()
    }
}
