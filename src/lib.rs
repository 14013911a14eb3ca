//! Incoming video-call signaling and ringing lifecycle.
//!
//! A [`calls::CallService`] listens on a user's realtime channel, rings while
//! a call is pending and resolves it to answered, declined or missed.

pub mod calls;
pub mod config;
pub mod realtime;
pub mod store;

pub use calls::{
    CallDependencies, CallError, CallHandle, CallInvite, CallLifecycleController, CallService,
    CallState, ToneEngine,
};
pub use config::{BackendConfig, CallConfig};
pub use realtime::{ChannelGateway, RealtimeTransport};
