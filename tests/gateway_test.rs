use call_lifecycle::calls::{CallEndedPayload, DeclineSignal, IncomingCallPayload, SignalingEvent};
use call_lifecycle::realtime::{
    ChannelGateway, ChannelMessage, GatewayEvent, InMemoryRealtime, RealtimeTransport,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

async fn next_event(rx: &mut tokio::sync::broadcast::Receiver<GatewayEvent>) -> GatewayEvent {
    timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("no gateway event within 1s")
        .expect("gateway event stream closed")
}

#[tokio::test]
async fn test_subscribe_is_idempotent() {
    let hub = InMemoryRealtime::new();
    let gateway = ChannelGateway::new(hub.client());

    let first = gateway.subscribe_user_channel("me").await;
    let second = gateway.subscribe_user_channel("me").await;

    assert!(first.is_subscribed());
    assert_eq!(first.topic(), "user-calls:me");
    assert_eq!(second.topic(), first.topic());
    assert_eq!(hub.subscriber_count("user-calls:me"), 1);
}

#[tokio::test]
async fn test_events_are_decoded_and_malformed_ones_dropped() {
    let hub = InMemoryRealtime::new();
    let caller = hub.client();
    let gateway = ChannelGateway::new(hub.client());
    let subscription = gateway.subscribe_user_channel("me").await;
    let mut events = subscription.events();

    let publish = |event: &'static str, payload: serde_json::Value| {
        let caller = caller.clone();
        async move {
            caller
                .publish("user-calls:me", ChannelMessage::new(event, payload))
                .await
                .unwrap()
        }
    };

    publish("incoming-call", json!({"callerName": "no ids"})).await;
    publish("presence", json!({})).await;
    publish(
        "incoming-call",
        json!({"callerId": "u1", "callerName": "Alex", "roomId": "r1"}),
    )
    .await;
    publish("call-ended", json!({"roomId": "r1"})).await;

    assert_eq!(
        next_event(&mut events).await,
        GatewayEvent::IncomingCall(IncomingCallPayload {
            caller_id: "u1".into(),
            caller_name: "Alex".into(),
            room_id: "r1".into(),
        })
    );
    assert_eq!(
        next_event(&mut events).await,
        GatewayEvent::CallEnded(CallEndedPayload {
            room_id: Some("r1".into())
        })
    );
    assert!(subscription.is_subscribed());
}

#[tokio::test]
async fn test_degraded_subscription_is_retried() {
    let hub = InMemoryRealtime::new();
    let client = hub.client();
    let gateway = ChannelGateway::new(client.clone());

    client.set_offline(true);
    let degraded = gateway.subscribe_user_channel("me").await;
    assert!(!degraded.is_subscribed());
    assert_eq!(hub.subscriber_count("user-calls:me"), 0);

    client.set_offline(false);
    let recovered = gateway.subscribe_user_channel("me").await;
    assert!(recovered.is_subscribed());
    assert_eq!(hub.subscriber_count("user-calls:me"), 1);
}

#[tokio::test]
async fn test_unsubscribe_leaves_topic() {
    let hub = InMemoryRealtime::new();
    let gateway = ChannelGateway::new(hub.client());
    let subscription = gateway.subscribe_user_channel("me").await;

    gateway.unsubscribe_user_channel("me").await;
    gateway.unsubscribe_user_channel("me").await;

    assert!(!subscription.is_subscribed());
    assert_eq!(hub.subscriber_count("user-calls:me"), 0);
}

#[tokio::test]
async fn test_ephemeral_channel_publishes_and_closes() {
    let hub = InMemoryRealtime::new();
    let caller = hub.client();
    let callee = hub.client();
    let gateway = ChannelGateway::new(callee.clone());
    let mut room = caller.subscribe("call-signal:r1").await.unwrap();

    let channel = gateway.open_ephemeral_channel("r1").await;
    assert_eq!(channel.topic(), "call-signal:r1");
    assert!(channel.is_open());
    assert_eq!(gateway.open_ephemeral_count(), 1);

    channel
        .publish(SignalingEvent::CallDeclined, &DeclineSignal::now("me"))
        .await
        .unwrap();
    channel.close();

    let message = timeout(Duration::from_secs(1), room.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(message.event, "call-declined");
    assert_eq!(message.payload["declinedBy"], "me");
    assert_eq!(gateway.open_ephemeral_count(), 0);
    assert_eq!(hub.subscriber_count("call-signal:r1"), 1);
    assert_eq!(callee.publish_attempts_on("call-signal:r1").len(), 1);
}

#[tokio::test]
async fn test_close_all_ephemeral_force_closes() {
    let hub = InMemoryRealtime::new();
    let gateway = Arc::new(ChannelGateway::new(hub.client()));

    let first = gateway.open_ephemeral_channel("r1").await;
    let second = gateway.open_ephemeral_channel("r2").await;
    assert_eq!(gateway.open_ephemeral_count(), 2);

    gateway.close_all_ephemeral();
    assert_eq!(gateway.open_ephemeral_count(), 0);
    assert!(!first.is_open());
    assert_eq!(hub.subscriber_count("call-signal:r1"), 0);
    assert_eq!(hub.subscriber_count("call-signal:r2"), 0);

    // Dropping after a forced close must not double-unsubscribe.
    drop(first);
    drop(second);
    assert_eq!(gateway.open_ephemeral_count(), 0);
}

#[tokio::test]
async fn test_publish_on_offline_transport_reports_error() {
    let hub = InMemoryRealtime::new();
    let client = hub.client();
    let gateway = ChannelGateway::new(client.clone());

    let channel = gateway.open_ephemeral_channel("r1").await;
    client.set_offline(true);
    let result = channel
        .publish(SignalingEvent::CallDeclined, &DeclineSignal::now("me"))
        .await;

    assert!(result.is_err());
    let attempts = client.publish_attempts();
    assert_eq!(attempts.len(), 1);
    assert!(!attempts[0].delivered);
}

#[tokio::test]
async fn test_close_ephemeral_only_touches_its_room() {
    let hub = InMemoryRealtime::new();
    let gateway = ChannelGateway::new(hub.client());

    let mine = gateway.open_ephemeral_channel("r1").await;
    let other = gateway.open_ephemeral_channel("r2").await;

    gateway.close_ephemeral("r1");
    gateway.close_ephemeral("r1");
    gateway.close_ephemeral("never-opened");

    assert!(!mine.is_open());
    assert!(other.is_open());
    assert_eq!(gateway.open_ephemeral_count(), 1);
    assert_eq!(hub.subscriber_count("call-signal:r1"), 0);
    assert_eq!(hub.subscriber_count("call-signal:r2"), 1);
}

#[tokio::test]
async fn test_lost_resolves_when_channel_drops() {
    let hub = InMemoryRealtime::new();
    let client = hub.client();
    let gateway = ChannelGateway::new(client.clone());
    let subscription = gateway.subscribe_user_channel("me").await;

    let watcher = subscription.clone();
    let lost = tokio::spawn(async move { watcher.lost().await });
    tokio::task::yield_now().await;
    assert!(!lost.is_finished());

    // The transport ending the stream degrades the subscription.
    client.unsubscribe("user-calls:me");
    timeout(Duration::from_secs(1), lost)
        .await
        .expect("lost() did not resolve")
        .unwrap();
    assert!(!subscription.is_subscribed());

    let resubscribed = gateway.subscribe_user_channel("me").await;
    assert!(resubscribed.is_subscribed());
    assert_eq!(hub.subscriber_count("user-calls:me"), 1);
}

#[tokio::test]
async fn test_lost_is_immediate_for_degraded_subscription() {
    let hub = InMemoryRealtime::new();
    let client = hub.client();
    client.set_offline(true);
    let gateway = ChannelGateway::new(client);

    let degraded = gateway.subscribe_user_channel("me").await;
    timeout(Duration::from_secs(1), degraded.lost())
        .await
        .expect("degraded subscription should already be lost");
}
