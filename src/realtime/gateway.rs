//! Call-aware wrapper over a [`RealtimeTransport`].

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashSet;
use log::{debug, info, trace, warn};
use serde::Serialize;
use tokio::sync::{Mutex, broadcast, mpsc, watch};
use tokio::task::JoinHandle;

use super::{ChannelMessage, RealtimeTransport, TransportError};
use crate::calls::signaling::{
    CallEndedPayload, IncomingCallPayload, SignalingEvent, room_channel_topic, user_channel_topic,
};

const USER_EVENT_CAPACITY: usize = 32;

/// Call events delivered on a user's channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayEvent {
    IncomingCall(IncomingCallPayload),
    CallEnded(CallEndedPayload),
}

impl GatewayEvent {
    /// Decode a channel message. `Ok(None)` for events this gateway does not
    /// handle; `Err` for known events with an unusable payload.
    pub fn decode(message: &ChannelMessage) -> Result<Option<Self>, serde_json::Error> {
        let Some(kind) = SignalingEvent::from_event_name(&message.event) else {
            return Ok(None);
        };
        match kind {
            SignalingEvent::IncomingCall => {
                let payload: IncomingCallPayload = serde_json::from_value(message.payload.clone())?;
                Ok(Some(Self::IncomingCall(payload)))
            }
            SignalingEvent::CallEnded | SignalingEvent::CallCancelled => {
                let payload = if message.payload.is_null() {
                    CallEndedPayload::default()
                } else {
                    serde_json::from_value(message.payload.clone())?
                };
                Ok(Some(Self::CallEnded(payload)))
            }
            SignalingEvent::CallDeclined => Ok(None),
        }
    }
}

/// A user's call channel. Cheap to clone; clones share state.
#[derive(Debug, Clone)]
pub struct Subscription {
    user_id: String,
    topic: String,
    subscribed: Arc<watch::Sender<bool>>,
    events: broadcast::Sender<GatewayEvent>,
}

impl Subscription {
    fn new(user_id: &str, topic: String, subscribed: bool) -> Self {
        Self {
            user_id: user_id.to_string(),
            topic,
            subscribed: Arc::new(watch::Sender::new(subscribed)),
            events: broadcast::channel(USER_EVENT_CAPACITY).0,
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// `false` when the transport could not join, or the channel has since
    /// dropped. A degraded subscription never yields events.
    pub fn is_subscribed(&self) -> bool {
        *self.subscribed.borrow()
    }

    /// Resolves once the subscription is degraded. Immediate for one that
    /// never joined.
    pub async fn lost(&self) {
        let mut state = self.subscribed.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = state.wait_for(|subscribed| !*subscribed).await;
    }

    fn mark_lost(&self) {
        self.subscribed.send_replace(false);
    }

    pub fn events(&self) -> broadcast::Receiver<GatewayEvent> {
        self.events.subscribe()
    }
}

struct UserChannel {
    subscription: Subscription,
    forwarder: JoinHandle<()>,
}

/// Owns the user's long-lived call channel and the short-lived per-room
/// channels used to signal declines.
pub struct ChannelGateway {
    transport: Arc<dyn RealtimeTransport>,
    user_channels: Mutex<HashMap<String, UserChannel>>,
    open_ephemeral: Arc<DashSet<String>>,
}

impl ChannelGateway {
    pub fn new(transport: Arc<dyn RealtimeTransport>) -> Self {
        Self {
            transport,
            user_channels: Mutex::new(HashMap::new()),
            open_ephemeral: Arc::new(DashSet::new()),
        }
    }

    /// Join `user-calls:{user_id}`. Calling again for the same user returns
    /// the existing subscription; a degraded subscription is retried.
    pub async fn subscribe_user_channel(&self, user_id: &str) -> Subscription {
        let mut channels = self.user_channels.lock().await;
        if let Some(existing) = channels.get(user_id) {
            if existing.subscription.is_subscribed() {
                trace!(target: "Call/Gateway", "Reusing subscription for {user_id}");
                return existing.subscription.clone();
            }
            if let Some(stale) = channels.remove(user_id) {
                stale.forwarder.abort();
            }
        }

        let topic = user_channel_topic(user_id);
        match self.transport.subscribe(&topic).await {
            Ok(inbound) => {
                let subscription = Subscription::new(user_id, topic, true);
                let forwarder = tokio::spawn(forward_user_channel(inbound, subscription.clone()));
                info!(target: "Call/Gateway", "Listening for calls on {}", subscription.topic());
                channels.insert(
                    user_id.to_string(),
                    UserChannel {
                        subscription: subscription.clone(),
                        forwarder,
                    },
                );
                subscription
            }
            Err(e) => {
                warn!(target: "Call/Gateway", "Could not subscribe to {topic}, calls unavailable: {e}");
                Subscription::new(user_id, topic, false)
            }
        }
    }

    pub async fn unsubscribe_user_channel(&self, user_id: &str) {
        let Some(channel) = self.user_channels.lock().await.remove(user_id) else {
            return;
        };
        channel.forwarder.abort();
        channel.subscription.mark_lost();
        self.transport.unsubscribe(channel.subscription.topic());
        debug!(target: "Call/Gateway", "Left {}", channel.subscription.topic());
    }

    /// Open `call-signal:{room_id}` for a single publish. The returned
    /// channel must be closed right after use; dropping it also closes it.
    pub async fn open_ephemeral_channel(&self, room_id: &str) -> EphemeralChannel {
        let topic = room_channel_topic(room_id);
        self.open_ephemeral.insert(topic.clone());
        let inbound = match self.transport.subscribe(&topic).await {
            Ok(rx) => Some(rx),
            Err(e) => {
                warn!(target: "Call/Gateway", "Ephemeral channel {topic} not ready: {e}");
                None
            }
        };
        EphemeralChannel {
            topic,
            transport: self.transport.clone(),
            open: self.open_ephemeral.clone(),
            _inbound: inbound,
        }
    }

    /// Force-close one room's ephemeral channel. No-op when it is not open.
    pub fn close_ephemeral(&self, room_id: &str) {
        let topic = room_channel_topic(room_id);
        if self.open_ephemeral.remove(&topic).is_some() {
            self.transport.unsubscribe(&topic);
            debug!(target: "Call/Gateway", "Force-closed ephemeral channel {topic}");
        }
    }

    /// Close every ephemeral channel still open, whoever opened it.
    pub fn close_all_ephemeral(&self) {
        let topics: Vec<String> = self.open_ephemeral.iter().map(|t| t.key().clone()).collect();
        for topic in topics {
            if self.open_ephemeral.remove(&topic).is_some() {
                self.transport.unsubscribe(&topic);
                debug!(target: "Call/Gateway", "Force-closed ephemeral channel {topic}");
            }
        }
    }

    pub fn open_ephemeral_count(&self) -> usize {
        self.open_ephemeral.len()
    }
}

async fn forward_user_channel(
    mut inbound: mpsc::Receiver<ChannelMessage>,
    subscription: Subscription,
) {
    while let Some(message) = inbound.recv().await {
        match GatewayEvent::decode(&message) {
            Ok(Some(event)) => {
                debug!(target: "Call/Gateway", "{} on {}", message.event, subscription.topic());
                if subscription.events.send(event).is_err() {
                    trace!(target: "Call/Gateway", "No listeners for {}", message.event);
                }
            }
            Ok(None) => {
                trace!(target: "Call/Gateway", "Ignoring {} on {}", message.event, subscription.topic());
            }
            Err(e) => {
                warn!(target: "Call/Gateway", "Dropping malformed {} payload: {e}", message.event);
            }
        }
    }
    subscription.mark_lost();
    warn!(target: "Call/Gateway", "Channel {} closed, calls unavailable until resubscribed", subscription.topic());
}

/// A per-room channel held open for one publish.
pub struct EphemeralChannel {
    topic: String,
    transport: Arc<dyn RealtimeTransport>,
    open: Arc<DashSet<String>>,
    _inbound: Option<mpsc::Receiver<ChannelMessage>>,
}

impl EphemeralChannel {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn is_open(&self) -> bool {
        self.open.contains(&self.topic)
    }

    /// Publish one event. Always reaches the transport, which reports
    /// whether the channel was ready.
    pub async fn publish<T: Serialize>(
        &self,
        event: SignalingEvent,
        payload: &T,
    ) -> Result<(), TransportError> {
        let message = ChannelMessage::new(event.event_name(), serde_json::to_value(payload)?);
        self.transport.publish(&self.topic, message).await
    }

    pub fn close(self) {
        drop(self);
    }
}

impl Drop for EphemeralChannel {
    fn drop(&mut self) {
        if self.open.remove(&self.topic).is_some() {
            self.transport.unsubscribe(&self.topic);
            trace!(target: "Call/Gateway", "Closed ephemeral channel {}", self.topic);
        }
    }
}
