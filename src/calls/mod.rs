//! Incoming video-call lifecycle.
//!
//! # Architecture
//!
//! - [`CallState`] & [`CallInvite`]: the state machine's vocabulary
//! - [`SignalingEvent`]: event names and payloads on the realtime channels
//! - [`ToneEngine`]: the ring sound, degrading to silence without audio
//! - [`TimerHandles`]: the ring-repeat and missed-call timers of one ringing period
//! - [`CallLifecycleController`]: Idle → Ringing → {Answered, Declined, Missed} → Idle
//! - [`CallService`] & [`CallHandle`]: run the controller on a task fed by the
//!   user's call channel
//!
//! At most one call rings at a time. A second invite that arrives while
//! ringing is dropped, not queued.

mod controller;
mod error;
mod notify;
mod service;
pub mod signaling;
mod state;
mod timers;
mod tone;

pub use controller::{CallDependencies, CallLifecycleController, ControlEvent};
pub use error::CallError;
pub use notify::{
    Navigator, NotificationRecord, NotificationRecorder, NotificationType, PushNotifier,
};
pub use service::{CallHandle, CallService};
pub use signaling::{CallEndedPayload, DeclineSignal, IncomingCallPayload, SignalingEvent};
pub use state::{CallInvite, CallSnapshot, CallState, CallTransitionEvent};
pub use timers::{TimerHandle, TimerHandles};
pub use tone::{RingPattern, ToneEngine, ToneError, ToneSink};
