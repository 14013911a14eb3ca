//! Phoenix-channel WebSocket client for the hosted realtime backend.
//!
//! Frames are JSON objects `{topic, event, payload, ref}`. Channel topics
//! are namespaced with `realtime:`; application events travel inside
//! `broadcast` frames as `{type: "broadcast", event, payload}`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use log::{debug, info, trace, warn};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use super::{ChannelMessage, OfflineTransport, RealtimeTransport, TOPIC_QUEUE_CAPACITY, TransportError};

const TOPIC_PREFIX: &str = "realtime:";
const PHOENIX_TOPIC: &str = "phoenix";
const EVENT_JOIN: &str = "phx_join";
const EVENT_LEAVE: &str = "phx_leave";
const EVENT_REPLY: &str = "phx_reply";
const EVENT_ERROR: &str = "phx_error";
const EVENT_CLOSE: &str = "phx_close";
const EVENT_HEARTBEAT: &str = "heartbeat";
const EVENT_BROADCAST: &str = "broadcast";
const PROTOCOL_VERSION: &str = "1.0.0";

type RawWs = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<RawWs, Message>;
type WsStream = SplitStream<RawWs>;

#[derive(Debug, Clone)]
pub struct PhoenixConfig {
    /// Project base URL, e.g. `https://xyz.example.co`.
    pub url: String,
    pub api_key: String,
    pub heartbeat_interval: Duration,
    pub join_timeout: Duration,
}

impl PhoenixConfig {
    pub fn new(url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            api_key: api_key.into(),
            heartbeat_interval: Duration::from_secs(25),
            join_timeout: Duration::from_secs(10),
        }
    }

    /// WebSocket endpoint derived from the project URL.
    pub fn socket_url(&self) -> String {
        let base = self.url.trim_end_matches('/');
        let base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            base.to_string()
        };
        format!(
            "{base}/realtime/v1/websocket?apikey={}&vsn={PROTOCOL_VERSION}",
            urlencoding::encode(&self.api_key)
        )
    }
}

/// One wire frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhoenixFrame {
    pub topic: String,
    pub event: String,
    pub payload: Value,
    #[serde(rename = "ref", default)]
    pub reference: Option<String>,
}

impl PhoenixFrame {
    pub fn join(topic: &str, reference: String) -> Self {
        Self {
            topic: format!("{TOPIC_PREFIX}{topic}"),
            event: EVENT_JOIN.to_string(),
            payload: json!({
                "config": {
                    "broadcast": { "self": false, "ack": false },
                    "presence": { "key": "" }
                }
            }),
            reference: Some(reference),
        }
    }

    pub fn leave(topic: &str, reference: String) -> Self {
        Self {
            topic: format!("{TOPIC_PREFIX}{topic}"),
            event: EVENT_LEAVE.to_string(),
            payload: json!({}),
            reference: Some(reference),
        }
    }

    pub fn heartbeat(reference: String) -> Self {
        Self {
            topic: PHOENIX_TOPIC.to_string(),
            event: EVENT_HEARTBEAT.to_string(),
            payload: json!({}),
            reference: Some(reference),
        }
    }

    pub fn broadcast(topic: &str, message: &ChannelMessage, reference: String) -> Self {
        Self {
            topic: format!("{TOPIC_PREFIX}{topic}"),
            event: EVENT_BROADCAST.to_string(),
            payload: json!({
                "type": "broadcast",
                "event": message.event,
                "payload": message.payload,
            }),
            reference: Some(reference),
        }
    }

    /// Channel topic with the `realtime:` namespace removed.
    pub fn channel_topic(&self) -> Option<&str> {
        self.topic.strip_prefix(TOPIC_PREFIX)
    }

    /// The application event carried by a `broadcast` frame.
    pub fn broadcast_message(&self) -> Option<ChannelMessage> {
        if self.event != EVENT_BROADCAST {
            return None;
        }
        let event = self.payload.get("event")?.as_str()?.to_string();
        let payload = self.payload.get("payload").cloned().unwrap_or(Value::Null);
        Some(ChannelMessage { event, payload })
    }

    /// `(status, response)` of a `phx_reply` frame.
    pub fn reply(&self) -> Option<PhoenixReply> {
        if self.event != EVENT_REPLY {
            return None;
        }
        let status = self.payload.get("status")?.as_str()?.to_string();
        let response = self.payload.get("response").cloned().unwrap_or(Value::Null);
        Some(PhoenixReply { status, response })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PhoenixReply {
    pub status: String,
    pub response: Value,
}

impl PhoenixReply {
    pub fn is_ok(&self) -> bool {
        self.status == "ok"
    }
}

/// A connected Phoenix socket.
pub struct PhoenixTransport {
    outbound: mpsc::UnboundedSender<Message>,
    joined: DashMap<String, mpsc::Sender<ChannelMessage>>,
    pending_replies: DashMap<String, oneshot::Sender<PhoenixReply>>,
    next_ref: AtomicU64,
    connected: AtomicBool,
    join_timeout: Duration,
    /// Set once by `disconnect`; loops observe it even if they were busy.
    shutdown: watch::Sender<bool>,
}

/// Removes a join's reply slot however the join future ends.
struct PendingReply<'a> {
    replies: &'a DashMap<String, oneshot::Sender<PhoenixReply>>,
    reference: String,
}

impl Drop for PendingReply<'_> {
    fn drop(&mut self) {
        self.replies.remove(&self.reference);
    }
}

impl PhoenixTransport {
    pub async fn connect(config: PhoenixConfig) -> Result<Arc<Self>, TransportError> {
        let url = config.socket_url();
        info!(target: "Realtime/Phoenix", "Connecting to {}", config.url);
        let (ws, _response) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        let (sink, stream) = ws.split();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Self::new(outbound, config.join_timeout));

        tokio::spawn(write_loop(sink, outbound_rx));
        tokio::spawn(transport.clone().read_loop(stream));
        tokio::spawn(transport.clone().heartbeat_loop(config.heartbeat_interval));

        Ok(transport)
    }

    /// [`Self::connect`], falling back to an [`OfflineTransport`] when the
    /// socket cannot be opened so callers can still start degraded.
    pub async fn connect_or_offline(config: PhoenixConfig) -> Arc<dyn RealtimeTransport> {
        match Self::connect(config).await {
            Ok(transport) => transport as Arc<dyn RealtimeTransport>,
            Err(e) => {
                warn!(target: "Realtime/Phoenix", "Realtime backend unavailable, running offline: {e}");
                Arc::new(OfflineTransport::new(e.to_string()))
            }
        }
    }

    fn new(outbound: mpsc::UnboundedSender<Message>, join_timeout: Duration) -> Self {
        Self {
            outbound,
            joined: DashMap::new(),
            pending_replies: DashMap::new(),
            next_ref: AtomicU64::new(1),
            connected: AtomicBool::new(true),
            join_timeout,
            shutdown: watch::channel(false).0,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Close the socket. Every joined topic's stream ends.
    pub fn disconnect(&self) {
        if !self.connected.swap(false, Ordering::AcqRel) {
            return;
        }
        let _ = self.outbound.send(Message::Close(None));
        self.shutdown.send_replace(true);
        self.joined.clear();
        self.pending_replies.clear();
        info!(target: "Realtime/Phoenix", "Disconnected");
    }

    fn make_ref(&self) -> String {
        self.next_ref.fetch_add(1, Ordering::Relaxed).to_string()
    }

    fn send_frame(&self, frame: &PhoenixFrame) -> Result<(), TransportError> {
        let text = serde_json::to_string(frame)?;
        trace!(target: "Realtime/Phoenix", "--> {text}");
        self.outbound
            .send(Message::Text(text.into()))
            .map_err(|_| TransportError::NotConnected)
    }

    async fn read_loop(self: Arc<Self>, mut stream: WsStream) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            let next = tokio::select! {
                next = stream.next() => next,
                _ = shutdown.wait_for(|closed| *closed) => break,
            };
            match next {
                Some(Ok(Message::Text(text))) => self.handle_text(text.as_str()),
                Some(Ok(Message::Close(frame))) => {
                    debug!(target: "Realtime/Phoenix", "Server closed socket: {frame:?}");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(target: "Realtime/Phoenix", "Socket read error: {e}");
                    break;
                }
                None => break,
            }
        }
        self.disconnect();
    }

    fn handle_text(&self, text: &str) {
        trace!(target: "Realtime/Phoenix", "<-- {text}");
        let frame: PhoenixFrame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(target: "Realtime/Phoenix", "Ignoring malformed frame: {e}");
                return;
            }
        };

        if let Some(reply) = frame.reply() {
            if let Some(reference) = &frame.reference
                && let Some((_, waiter)) = self.pending_replies.remove(reference)
            {
                let _ = waiter.send(reply);
            }
            return;
        }

        let Some(topic) = frame.channel_topic() else {
            return;
        };

        match frame.event.as_str() {
            EVENT_BROADCAST => {
                let Some(message) = frame.broadcast_message() else {
                    warn!(target: "Realtime/Phoenix", "Broadcast on {topic} without event name");
                    return;
                };
                if let Some(tx) = self.joined.get(topic)
                    && let Err(e) = tx.try_send(message)
                {
                    warn!(target: "Realtime/Phoenix", "Dropping broadcast on {topic}: {e}");
                }
            }
            EVENT_ERROR | EVENT_CLOSE => {
                if self.joined.remove(topic).is_some() {
                    warn!(target: "Realtime/Phoenix", "Channel {topic} closed by server ({})", frame.event);
                }
            }
            other => {
                trace!(target: "Realtime/Phoenix", "Unhandled event {other} on {topic}");
            }
        }
    }

    async fn heartbeat_loop(self: Arc<Self>, interval: Duration) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if !self.is_connected() {
                        return;
                    }
                    if self.send_frame(&PhoenixFrame::heartbeat(self.make_ref())).is_err() {
                        debug!(target: "Realtime/Phoenix", "Heartbeat failed, exiting heartbeat loop.");
                        return;
                    }
                }
                _ = shutdown.wait_for(|closed| *closed) => {
                    debug!(target: "Realtime/Phoenix", "Shutdown signaled, exiting heartbeat loop.");
                    return;
                }
            }
        }
    }
}

async fn write_loop(mut sink: WsSink, mut outbound: mpsc::UnboundedReceiver<Message>) {
    while let Some(message) = outbound.recv().await {
        let closing = matches!(message, Message::Close(_));
        if let Err(e) = sink.send(message).await {
            warn!(target: "Realtime/Phoenix", "Socket write error: {e}");
            break;
        }
        if closing {
            break;
        }
    }
    let _ = sink.close().await;
}

#[async_trait]
impl RealtimeTransport for PhoenixTransport {
    async fn subscribe(
        &self,
        topic: &str,
    ) -> Result<mpsc::Receiver<ChannelMessage>, TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }

        let reference = self.make_ref();
        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending_replies.insert(reference.clone(), reply_tx);
        let _pending = PendingReply {
            replies: &self.pending_replies,
            reference: reference.clone(),
        };
        self.send_frame(&PhoenixFrame::join(topic, reference))?;

        let reply = match tokio::time::timeout(self.join_timeout, reply_rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => return Err(TransportError::NotConnected),
            Err(_) => return Err(TransportError::JoinTimeout(topic.to_string())),
        };
        if !reply.is_ok() {
            return Err(TransportError::JoinRejected {
                topic: topic.to_string(),
                reason: reply.response.to_string(),
            });
        }

        let (tx, rx) = mpsc::channel(TOPIC_QUEUE_CAPACITY);
        self.joined.insert(topic.to_string(), tx);
        debug!(target: "Realtime/Phoenix", "Joined {topic}");
        Ok(rx)
    }

    async fn publish(&self, topic: &str, message: ChannelMessage) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        if !self.joined.contains_key(topic) {
            return Err(TransportError::NotJoined(topic.to_string()));
        }
        self.send_frame(&PhoenixFrame::broadcast(topic, &message, self.make_ref()))
    }

    fn unsubscribe(&self, topic: &str) {
        if self.joined.remove(topic).is_none() || !self.is_connected() {
            return;
        }
        if let Err(e) = self.send_frame(&PhoenixFrame::leave(topic, self.make_ref())) {
            debug!(target: "Realtime/Phoenix", "Failed to send leave for {topic}: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socket_url_from_https_project_url() {
        let config = PhoenixConfig::new("https://abc.example.co/", "key with space");
        assert_eq!(
            config.socket_url(),
            "wss://abc.example.co/realtime/v1/websocket?apikey=key%20with%20space&vsn=1.0.0"
        );
    }

    #[test]
    fn test_socket_url_from_http_project_url() {
        let config = PhoenixConfig::new("http://localhost:54321", "k");
        assert!(
            config
                .socket_url()
                .starts_with("ws://localhost:54321/realtime/v1/websocket?")
        );
    }

    #[test]
    fn test_join_frame_shape() {
        let frame = PhoenixFrame::join("user-calls:42", "7".into());
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["topic"], "realtime:user-calls:42");
        assert_eq!(value["event"], "phx_join");
        assert_eq!(value["ref"], "7");
        assert_eq!(value["payload"]["config"]["broadcast"]["self"], false);
    }

    #[test]
    fn test_broadcast_frame_wraps_event() {
        let message = ChannelMessage::new("call-declined", json!({"declinedBy": "me"}));
        let frame = PhoenixFrame::broadcast("call-signal:r1", &message, "3".into());
        assert_eq!(frame.topic, "realtime:call-signal:r1");
        assert_eq!(frame.payload["type"], "broadcast");
        assert_eq!(frame.payload["event"], "call-declined");
        assert_eq!(frame.broadcast_message(), Some(message));
    }

    #[test]
    fn test_parse_inbound_broadcast() {
        let text = r#"{"topic":"realtime:user-calls:42","event":"broadcast","ref":null,
            "payload":{"type":"broadcast","event":"incoming-call",
            "payload":{"callerId":"u1","callerName":"Alex","roomId":"r1"}}}"#;
        let frame: PhoenixFrame = serde_json::from_str(text).unwrap();
        assert_eq!(frame.channel_topic(), Some("user-calls:42"));
        let message = frame.broadcast_message().unwrap();
        assert_eq!(message.event, "incoming-call");
        assert_eq!(message.payload["roomId"], "r1");
        assert!(frame.reply().is_none());
    }

    #[test]
    fn test_parse_reply() {
        let text = r#"{"topic":"realtime:user-calls:42","event":"phx_reply","ref":"1",
            "payload":{"status":"error","response":{"reason":"unauthorized"}}}"#;
        let frame: PhoenixFrame = serde_json::from_str(text).unwrap();
        let reply = frame.reply().unwrap();
        assert!(!reply.is_ok());
        assert_eq!(reply.response["reason"], "unauthorized");
    }

    fn detached(join_timeout: Duration) -> (Arc<PhoenixTransport>, mpsc::UnboundedReceiver<Message>) {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        (Arc::new(PhoenixTransport::new(outbound, join_timeout)), outbound_rx)
    }

    fn sent_frame(message: Message) -> PhoenixFrame {
        match message {
            Message::Text(text) => serde_json::from_str(text.as_str()).unwrap(),
            other => panic!("expected text frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_join_completes_on_ok_reply() {
        let (transport, mut outbound) = detached(Duration::from_secs(5));
        let joining = tokio::spawn({
            let transport = transport.clone();
            async move { transport.subscribe("user-calls:42").await }
        });

        let join = sent_frame(outbound.recv().await.unwrap());
        assert_eq!(join.event, "phx_join");
        let reply = json!({
            "topic": join.topic,
            "event": "phx_reply",
            "ref": join.reference,
            "payload": {"status": "ok", "response": {}}
        });
        transport.handle_text(&reply.to_string());

        assert!(joining.await.unwrap().is_ok());
        assert!(transport.pending_replies.is_empty());
        assert!(transport.joined.contains_key("user-calls:42"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_timeout_releases_reply_slot() {
        let (transport, _outbound) = detached(Duration::from_secs(1));
        let result = transport.subscribe("user-calls:42").await;
        assert!(matches!(result, Err(TransportError::JoinTimeout(_))));
        assert!(transport.pending_replies.is_empty());
    }

    #[tokio::test]
    async fn test_abandoned_join_releases_reply_slot() {
        let (transport, mut outbound) = detached(Duration::from_secs(60));
        let joining = tokio::spawn({
            let transport = transport.clone();
            async move { transport.subscribe("call-signal:r1").await }
        });

        outbound.recv().await.unwrap();
        assert_eq!(transport.pending_replies.len(), 1);
        joining.abort();
        assert!(joining.await.unwrap_err().is_cancelled());
        assert!(transport.pending_replies.is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_is_sticky_for_late_observers() {
        let (transport, mut outbound) = detached(Duration::from_secs(1));
        transport.disconnect();
        transport.disconnect();

        assert!(!transport.is_connected());
        // A loop that subscribes after the fact still sees the shutdown.
        let mut shutdown = transport.shutdown.subscribe();
        assert!(*shutdown.wait_for(|closed| *closed).await.unwrap());
        assert!(matches!(outbound.recv().await, Some(Message::Close(None))));
        assert!(matches!(
            transport.subscribe("user-calls:42").await,
            Err(TransportError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_unreachable_backend_falls_back_to_offline() {
        let transport =
            PhoenixTransport::connect_or_offline(PhoenixConfig::new("not a url", "anon-key")).await;

        assert!(matches!(
            transport.subscribe("user-calls:me").await,
            Err(TransportError::NotConnected)
        ));
    }

    #[test]
    fn test_heartbeat_uses_phoenix_topic() {
        let frame = PhoenixFrame::heartbeat("9".into());
        assert_eq!(frame.topic, "phoenix");
        assert_eq!(frame.event, "heartbeat");
        assert!(frame.channel_topic().is_none());
    }
}
