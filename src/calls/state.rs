//! Call state, invite and transition types.

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::signaling::IncomingCallPayload;

/// Current state of the incoming-call slot.
///
/// `Answered`, `Declined` and `Missed` are terminal: the controller passes
/// through them and immediately re-enters `Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
pub enum CallState {
    #[default]
    Idle,
    Ringing,
    Answered,
    Declined,
    Missed,
}

impl CallState {
    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }

    pub fn is_ringing(&self) -> bool {
        matches!(self, Self::Ringing)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Answered | Self::Declined | Self::Missed)
    }
}

impl std::fmt::Display for CallState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Ringing => "ringing",
            Self::Answered => "answered",
            Self::Declined => "declined",
            Self::Missed => "missed",
        };
        f.write_str(name)
    }
}

/// One incoming call attempt. Immutable once received.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallInvite {
    pub caller_id: String,
    pub caller_name: String,
    pub room_id: String,
    pub received_at: DateTime<Utc>,
}

impl CallInvite {
    pub fn new(
        caller_id: impl Into<String>,
        caller_name: impl Into<String>,
        room_id: impl Into<String>,
    ) -> Self {
        Self {
            caller_id: caller_id.into(),
            caller_name: caller_name.into(),
            room_id: room_id.into(),
            received_at: Utc::now(),
        }
    }

    /// Display name for notifications, falling back to the caller id.
    pub fn display_name(&self) -> &str {
        let name = self.caller_name.trim();
        if name.is_empty() {
            &self.caller_id
        } else {
            name
        }
    }
}

impl From<IncomingCallPayload> for CallInvite {
    fn from(payload: IncomingCallPayload) -> Self {
        Self::new(payload.caller_id, payload.caller_name, payload.room_id)
    }
}

/// Emitted on every state change, including the transient terminal states.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallTransitionEvent {
    pub from: CallState,
    pub to: CallState,
    pub room_id: Option<String>,
    pub at: DateTime<Utc>,
}

/// Latest-value view of the controller.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CallSnapshot {
    pub state: CallState,
    pub invite: Option<CallInvite>,
    pub timers_armed: bool,
}
