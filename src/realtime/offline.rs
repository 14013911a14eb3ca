//! Stand-in transport for when the realtime backend cannot be reached.

use async_trait::async_trait;
use log::trace;
use tokio::sync::mpsc;

use super::{ChannelMessage, RealtimeTransport, TransportError};

/// Fails every join and publish with [`TransportError::NotConnected`], so a
/// gateway on top of it runs degraded instead of not at all.
#[derive(Debug, Clone, Default)]
pub struct OfflineTransport {
    reason: String,
}

impl OfflineTransport {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    /// Why the real transport is unavailable.
    pub fn reason(&self) -> &str {
        &self.reason
    }
}

#[async_trait]
impl RealtimeTransport for OfflineTransport {
    async fn subscribe(
        &self,
        topic: &str,
    ) -> Result<mpsc::Receiver<ChannelMessage>, TransportError> {
        trace!(target: "Realtime/Offline", "join of {topic} refused: {}", self.reason);
        Err(TransportError::NotConnected)
    }

    async fn publish(&self, topic: &str, _message: ChannelMessage) -> Result<(), TransportError> {
        trace!(target: "Realtime/Offline", "publish on {topic} refused: {}", self.reason);
        Err(TransportError::NotConnected)
    }

    fn unsubscribe(&self, _topic: &str) {}
}
