//! Realtime channel plumbing.
//!
//! [`RealtimeTransport`] is a dumb pub/sub pipe keyed by topic name with no
//! knowledge of call semantics. [`ChannelGateway`] sits on top of it and
//! turns channel traffic into call events.

mod gateway;
pub mod memory;
mod offline;
pub mod phoenix;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

pub use gateway::{ChannelGateway, EphemeralChannel, GatewayEvent, Subscription};
pub use memory::{InMemoryClient, InMemoryRealtime};
pub use offline::OfflineTransport;
pub use phoenix::{PhoenixConfig, PhoenixTransport};

/// Buffer size of per-topic inbound queues.
pub(crate) const TOPIC_QUEUE_CAPACITY: usize = 64;

/// One named event on a channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelMessage {
    pub event: String,
    pub payload: serde_json::Value,
}

impl ChannelMessage {
    pub fn new(event: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            event: event.into(),
            payload,
        }
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("realtime transport is not connected")]
    NotConnected,

    #[error("failed to connect: {0}")]
    Connect(String),

    #[error("join of {topic} rejected: {reason}")]
    JoinRejected { topic: String, reason: String },

    #[error("join of {0} timed out")]
    JoinTimeout(String),

    #[error("channel {0} is not joined")]
    NotJoined(String),

    #[error("publish rejected: {0}")]
    Rejected(String),

    #[error("failed to encode payload: {0}")]
    Encode(#[from] serde_json::Error),
}

/// A topic-based publish/subscribe connection.
#[async_trait]
pub trait RealtimeTransport: Send + Sync {
    /// Join `topic` and return the stream of events delivered on it. The
    /// stream ends when the topic is left or the connection drops.
    async fn subscribe(
        &self,
        topic: &str,
    ) -> Result<mpsc::Receiver<ChannelMessage>, TransportError>;

    /// Broadcast one event on a joined topic.
    async fn publish(&self, topic: &str, message: ChannelMessage) -> Result<(), TransportError>;

    /// Leave `topic`. Leaving a topic that is not joined is a no-op.
    fn unsubscribe(&self, topic: &str);
}
