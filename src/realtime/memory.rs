//! In-process realtime hub.
//!
//! Every [`InMemoryClient`] behaves like one socket connected to the same
//! server: a publish is delivered to every *other* client joined to the
//! topic, matching broadcast semantics with self-delivery disabled.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use dashmap::DashMap;
use log::{debug, warn};
use tokio::sync::mpsc;

use super::{ChannelMessage, RealtimeTransport, TOPIC_QUEUE_CAPACITY, TransportError};

type ClientId = u64;

#[derive(Default)]
struct Hub {
    topics: DashMap<String, Vec<(ClientId, mpsc::Sender<ChannelMessage>)>>,
    next_client: AtomicU64,
}

/// A shared in-process "server".
#[derive(Clone, Default)]
pub struct InMemoryRealtime {
    hub: Arc<Hub>,
}

impl InMemoryRealtime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect a new client to the hub.
    pub fn client(&self) -> Arc<InMemoryClient> {
        let id = self.hub.next_client.fetch_add(1, Ordering::Relaxed);
        Arc::new(InMemoryClient {
            id,
            hub: self.hub.clone(),
            offline: AtomicBool::new(false),
            reject_publish: AtomicBool::new(false),
            publish_log: Mutex::new(Vec::new()),
        })
    }

    /// Number of clients currently joined to `topic`.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.hub.topics.get(topic).map(|s| s.len()).unwrap_or(0)
    }
}

/// A publish attempt as seen by the client, successful or not.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishAttempt {
    pub topic: String,
    pub message: ChannelMessage,
    pub delivered: bool,
}

/// One connection to an [`InMemoryRealtime`] hub.
pub struct InMemoryClient {
    id: ClientId,
    hub: Arc<Hub>,
    offline: AtomicBool,
    reject_publish: AtomicBool,
    publish_log: Mutex<Vec<PublishAttempt>>,
}

impl InMemoryClient {
    /// Simulate a dropped connection: subscribe and publish fail.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Make publishes fail while subscribes still succeed.
    pub fn set_reject_publish(&self, reject: bool) {
        self.reject_publish.store(reject, Ordering::SeqCst);
    }

    /// Every publish attempted through this client, in order.
    pub fn publish_attempts(&self) -> Vec<PublishAttempt> {
        self.publish_log
            .lock()
            .map(|log| log.clone())
            .unwrap_or_default()
    }

    /// Publish attempts on `topic`.
    pub fn publish_attempts_on(&self, topic: &str) -> Vec<PublishAttempt> {
        self.publish_attempts()
            .into_iter()
            .filter(|a| a.topic == topic)
            .collect()
    }

    fn log_attempt(&self, topic: &str, message: ChannelMessage, delivered: bool) {
        if let Ok(mut log) = self.publish_log.lock() {
            log.push(PublishAttempt {
                topic: topic.to_string(),
                message,
                delivered,
            });
        }
    }
}

#[async_trait]
impl RealtimeTransport for InMemoryClient {
    async fn subscribe(
        &self,
        topic: &str,
    ) -> Result<mpsc::Receiver<ChannelMessage>, TransportError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        let (tx, rx) = mpsc::channel(TOPIC_QUEUE_CAPACITY);
        let mut subscribers = self.hub.topics.entry(topic.to_string()).or_default();
        subscribers.retain(|(id, _)| *id != self.id);
        subscribers.push((self.id, tx));
        debug!(target: "Realtime/Memory", "client {} joined {}", self.id, topic);
        Ok(rx)
    }

    async fn publish(&self, topic: &str, message: ChannelMessage) -> Result<(), TransportError> {
        if self.offline.load(Ordering::SeqCst) {
            self.log_attempt(topic, message, false);
            return Err(TransportError::NotConnected);
        }
        if self.reject_publish.load(Ordering::SeqCst) {
            self.log_attempt(topic, message, false);
            return Err(TransportError::Rejected(format!("{topic} refused publish")));
        }

        if let Some(subscribers) = self.hub.topics.get(topic) {
            for (id, tx) in subscribers.iter().filter(|(id, _)| *id != self.id) {
                if let Err(e) = tx.try_send(message.clone()) {
                    warn!(target: "Realtime/Memory", "dropping message for client {id} on {topic}: {e}");
                }
            }
        }
        self.log_attempt(topic, message, true);
        Ok(())
    }

    fn unsubscribe(&self, topic: &str) {
        let now_empty = match self.hub.topics.get_mut(topic) {
            Some(mut subscribers) => {
                subscribers.retain(|(id, _)| *id != self.id);
                subscribers.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.hub.topics.remove_if(topic, |_, subs| subs.is_empty());
        }
        debug!(target: "Realtime/Memory", "client {} left {}", self.id, topic);
    }
}
