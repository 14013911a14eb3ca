//! Collaborators the controller drives: persistence of notification rows,
//! OS-level push, and UI navigation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::state::CallInvite;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationType {
    IncomingCall,
    MissedCall,
}

impl NotificationType {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::IncomingCall => "incoming_call",
            Self::MissedCall => "missed_call",
        }
    }
}

/// A notification row. Write-once; this crate never updates it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationRecord {
    pub user_id: String,
    #[serde(rename = "type")]
    pub kind: NotificationType,
    pub title: String,
    pub message: String,
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caller_id: Option<String>,
}

impl NotificationRecord {
    pub fn incoming_call(user_id: &str, invite: &CallInvite) -> Self {
        Self::for_invite(
            user_id,
            invite,
            NotificationType::IncomingCall,
            "Incoming video call".to_string(),
            format!("{} is calling you", invite.display_name()),
        )
    }

    pub fn missed_call(user_id: &str, invite: &CallInvite) -> Self {
        Self::for_invite(
            user_id,
            invite,
            NotificationType::MissedCall,
            "Missed video call".to_string(),
            format!("You missed a call from {}", invite.display_name()),
        )
    }

    fn for_invite(
        user_id: &str,
        invite: &CallInvite,
        kind: NotificationType,
        title: String,
        message: String,
    ) -> Self {
        Self {
            user_id: user_id.to_string(),
            kind,
            title,
            message,
            is_read: false,
            created_at: Utc::now(),
            room_id: Some(invite.room_id.clone()),
            caller_id: Some(invite.caller_id.clone()),
        }
    }
}

/// Persists notification rows.
#[async_trait]
pub trait NotificationRecorder: Send + Sync {
    async fn record(&self, record: NotificationRecord) -> Result<(), anyhow::Error>;
}

/// OS/browser-level notifications shown alongside in-app ringing.
#[async_trait]
pub trait PushNotifier: Send + Sync {
    async fn notify_incoming(
        &self,
        caller_name: &str,
        room_id: &str,
        caller_id: &str,
    ) -> Result<(), anyhow::Error>;

    async fn notify_missed(&self, caller_name: &str, room_id: &str) -> Result<(), anyhow::Error>;
}

/// Moves the user interface into the call room.
pub trait Navigator: Send + Sync {
    fn go_to_room(&self, room_id: &str);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missed_call_record_shape() {
        let invite = CallInvite::new("u1", "Alex", "r1");
        let record = NotificationRecord::missed_call("callee", &invite);

        assert_eq!(record.kind, NotificationType::MissedCall);
        assert_eq!(record.user_id, "callee");
        assert_eq!(record.message, "You missed a call from Alex");
        assert_eq!(record.room_id.as_deref(), Some("r1"));
        assert!(!record.is_read);

        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["type"], "missed_call");
        assert_eq!(value["user_id"], "callee");
        assert_eq!(value["is_read"], false);
        assert_eq!(value["room_id"], "r1");
    }

    #[test]
    fn test_incoming_call_record_shape() {
        let invite = CallInvite::new("u1", "", "r1");
        let record = NotificationRecord::incoming_call("callee", &invite);

        assert_eq!(record.kind.as_str(), "incoming_call");
        assert_eq!(record.message, "u1 is calling you");
    }
}
