//! Call signaling event definitions and channel naming.
//!
//! Signaling travels as named broadcast events on realtime channels. Two
//! channel families exist: one long-lived channel per user that carries
//! inbound invites, and one short-lived channel per call room that carries
//! the decline signal back to the caller.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Prefix of the per-user inbound channel.
pub const USER_CHANNEL_PREFIX: &str = "user-calls:";
/// Prefix of the per-room signaling channel.
pub const ROOM_CHANNEL_PREFIX: &str = "call-signal:";

/// Topic of the long-lived channel that delivers calls to `user_id`.
pub fn user_channel_topic(user_id: &str) -> String {
    format!("{USER_CHANNEL_PREFIX}{user_id}")
}

/// Topic of the ephemeral channel scoped to one call room.
pub fn room_channel_topic(room_id: &str) -> String {
    format!("{ROOM_CHANNEL_PREFIX}{room_id}")
}

/// Named events exchanged on call channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalingEvent {
    /// A caller is ringing this user. Carries an [`IncomingCallPayload`].
    IncomingCall,
    /// The caller hung up before the callee acted.
    CallEnded,
    /// Alias of `CallEnded` sent by older callers.
    CallCancelled,
    /// Sent by the callee on the room channel. Carries a [`DeclineSignal`].
    CallDeclined,
}

impl SignalingEvent {
    pub const ALL: [SignalingEvent; 4] = [
        Self::IncomingCall,
        Self::CallEnded,
        Self::CallCancelled,
        Self::CallDeclined,
    ];

    /// Event name used on the wire.
    pub const fn event_name(&self) -> &'static str {
        match self {
            Self::IncomingCall => "incoming-call",
            Self::CallEnded => "call-ended",
            Self::CallCancelled => "call-cancelled",
            Self::CallDeclined => "call-declined",
        }
    }

    pub fn from_event_name(name: &str) -> Option<Self> {
        match name {
            "incoming-call" => Some(Self::IncomingCall),
            "call-ended" => Some(Self::CallEnded),
            "call-cancelled" => Some(Self::CallCancelled),
            "call-declined" => Some(Self::CallDeclined),
            _ => None,
        }
    }

    /// Whether this event terminates a ringing call from the caller side.
    pub const fn is_remote_end(&self) -> bool {
        matches!(self, Self::CallEnded | Self::CallCancelled)
    }
}

impl fmt::Display for SignalingEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.event_name())
    }
}

/// Payload of `incoming-call`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomingCallPayload {
    pub caller_id: String,
    #[serde(default)]
    pub caller_name: String,
    pub room_id: String,
}

/// Optional payload of `call-ended` / `call-cancelled`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallEndedPayload {
    #[serde(default)]
    pub room_id: Option<String>,
}

/// Payload of `call-declined`. Transient; never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeclineSignal {
    pub declined_by: String,
    pub declined_at: DateTime<Utc>,
}

impl DeclineSignal {
    pub fn now(declined_by: impl Into<String>) -> Self {
        Self {
            declined_by: declined_by.into(),
            declined_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_name_roundtrip() {
        for event in SignalingEvent::ALL {
            let parsed = SignalingEvent::from_event_name(event.event_name()).unwrap();
            assert_eq!(event, parsed, "Failed roundtrip for {:?}", event);
        }
        assert!(SignalingEvent::from_event_name("incoming_call").is_none());
    }

    #[test]
    fn test_remote_end_events() {
        assert!(SignalingEvent::CallEnded.is_remote_end());
        assert!(SignalingEvent::CallCancelled.is_remote_end());
        assert!(!SignalingEvent::IncomingCall.is_remote_end());
        assert!(!SignalingEvent::CallDeclined.is_remote_end());
    }

    #[test]
    fn test_channel_topics() {
        assert_eq!(user_channel_topic("42"), "user-calls:42");
        assert_eq!(room_channel_topic("r1"), "call-signal:r1");
    }

    #[test]
    fn test_incoming_payload_uses_camel_case() {
        let payload: IncomingCallPayload = serde_json::from_value(serde_json::json!({
            "callerId": "u1",
            "callerName": "Alex",
            "roomId": "r1"
        }))
        .unwrap();
        assert_eq!(payload.caller_id, "u1");
        assert_eq!(payload.caller_name, "Alex");
        assert_eq!(payload.room_id, "r1");
    }

    #[test]
    fn test_incoming_payload_missing_room_is_rejected() {
        let result = serde_json::from_value::<IncomingCallPayload>(serde_json::json!({
            "callerId": "u1",
            "callerName": "Alex"
        }));
        assert!(result.is_err());
    }

    #[test]
    fn test_decline_signal_wire_shape() {
        let signal = DeclineSignal::now("callee-7");
        let value = serde_json::to_value(&signal).unwrap();
        assert_eq!(value["declinedBy"], "callee-7");
        assert!(value["declinedAt"].is_string());
    }

    #[test]
    fn test_call_ended_payload_is_optional() {
        let payload: CallEndedPayload =
            serde_json::from_value(serde_json::json!({})).unwrap();
        assert!(payload.room_id.is_none());
    }
}
