//! Incoming-call state machine.
//!
//! The controller owns the single in-flight [`CallInvite`] and both ringing
//! timers. It is driven by one stream of [`ControlEvent`]s: realtime events,
//! user actions and timer expiry all arrive through the same queue, so
//! exactly one terminal transition can win for any ringing period.
//!
//! Side effects that involve I/O (push, persistence, decline publish) are
//! spawned and never awaited by a transition. Disposal is two-step:
//! [`CallLifecycleController::dispose`] stops ringing synchronously, then
//! [`CallLifecycleController::finish_declines`] gives decline publishes that
//! are already queued a bounded chance to go out.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::future::join_all;
use log::{debug, info, trace, warn};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::notify::{Navigator, NotificationRecord, NotificationRecorder, PushNotifier};
use super::signaling::{DeclineSignal, SignalingEvent};
use super::state::{CallInvite, CallSnapshot, CallState, CallTransitionEvent};
use super::timers::{TimerHandle, TimerHandles};
use super::tone::ToneEngine;
use crate::config::CallConfig;
use crate::realtime::ChannelGateway;

const TRANSITION_CHANNEL_CAPACITY: usize = 64;

/// Everything that can move the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlEvent {
    /// A caller started ringing this user.
    Incoming(CallInvite),
    /// The caller gave up. `room_id`, when present, must match the ringing call.
    CallEnded { room_id: Option<String> },
    Answer,
    Decline,
    /// The missed-call timer of ringing period `attempt` expired.
    MissedCallTimeout { attempt: u64 },
    Dispose,
}

/// Collaborators the controller drives.
#[derive(Clone)]
pub struct CallDependencies {
    pub gateway: Arc<ChannelGateway>,
    pub tone: Arc<ToneEngine>,
    pub recorder: Arc<dyn NotificationRecorder>,
    pub push: Arc<dyn PushNotifier>,
    pub navigator: Arc<dyn Navigator>,
}

struct PendingDecline {
    room_id: String,
    task: JoinHandle<()>,
}

pub struct CallLifecycleController {
    config: CallConfig,
    user_id: String,
    deps: CallDependencies,
    state: CallState,
    invite: Option<CallInvite>,
    timers: TimerHandles,
    /// Incremented on every entry into Ringing.
    attempt: u64,
    pending_declines: Vec<PendingDecline>,
    events: mpsc::UnboundedSender<ControlEvent>,
    transitions: broadcast::Sender<CallTransitionEvent>,
    snapshot: watch::Sender<CallSnapshot>,
    disposed: bool,
}

impl CallLifecycleController {
    /// Create a controller for `user_id`. The returned receiver is the
    /// controller's inbound queue; feed each event to [`Self::handle_event`].
    pub fn new(
        config: CallConfig,
        user_id: impl Into<String>,
        deps: CallDependencies,
    ) -> (Self, mpsc::UnboundedReceiver<ControlEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let controller = Self {
            config,
            user_id: user_id.into(),
            deps,
            state: CallState::Idle,
            invite: None,
            timers: TimerHandles::default(),
            attempt: 0,
            pending_declines: Vec::new(),
            events,
            transitions: broadcast::channel(TRANSITION_CHANNEL_CAPACITY).0,
            snapshot: watch::channel(CallSnapshot::default()).0,
            disposed: false,
        };
        (controller, events_rx)
    }

    /// Sender into this controller's queue.
    pub fn sender(&self) -> mpsc::UnboundedSender<ControlEvent> {
        self.events.clone()
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    pub fn invite(&self) -> Option<&CallInvite> {
        self.invite.as_ref()
    }

    pub fn timers(&self) -> &TimerHandles {
        &self.timers
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    pub fn subscribe_transitions(&self) -> broadcast::Receiver<CallTransitionEvent> {
        self.transitions.subscribe()
    }

    pub(crate) fn transitions_sender(&self) -> broadcast::Sender<CallTransitionEvent> {
        self.transitions.clone()
    }

    pub fn watch_snapshot(&self) -> watch::Receiver<CallSnapshot> {
        self.snapshot.subscribe()
    }

    pub fn handle_event(&mut self, event: ControlEvent) {
        trace!(target: "Call/Controller", "Event {event:?} in state {}", self.state);
        match event {
            ControlEvent::Incoming(invite) => self.handle_incoming(invite),
            ControlEvent::CallEnded { room_id } => self.call_ended(room_id.as_deref()),
            ControlEvent::Answer => self.answer(),
            ControlEvent::Decline => self.decline(),
            ControlEvent::MissedCallTimeout { attempt } => self.missed_call_timeout(attempt),
            ControlEvent::Dispose => self.dispose(),
        }
    }

    /// Idle → Ringing. Dropped while another call is ringing.
    pub fn handle_incoming(&mut self, invite: CallInvite) {
        if self.disposed {
            debug!(target: "Call/Controller", "Ignoring call from {} after dispose", invite.caller_id);
            return;
        }
        if let Some(current) = &self.invite {
            info!(
                target: "Call/Controller",
                "Already ringing for room {}, dropping call from {} (room {})",
                current.room_id, invite.caller_id, invite.room_id
            );
            return;
        }

        self.attempt += 1;
        let ring = TimerHandle::spawn(
            "ring",
            ring_loop(self.deps.tone.clone(), self.config.ring_interval),
        );
        let missed = TimerHandle::spawn(
            "missed-call",
            missed_call_timer(
                self.events.clone(),
                self.config.missed_call_timeout,
                self.attempt,
            ),
        );
        self.timers.arm(ring, missed);
        self.invite = Some(invite.clone());
        info!(
            target: "Call/Controller",
            "Incoming call from {} ({}) for room {}",
            invite.display_name(), invite.caller_id, invite.room_id
        );
        self.set_state(CallState::Ringing, Some(&invite.room_id));

        let push = self.deps.push.clone();
        let pushed = invite.clone();
        spawn_best_effort("incoming-call push", async move {
            push.notify_incoming(pushed.display_name(), &pushed.room_id, &pushed.caller_id)
                .await
        });

        let recorder = self.deps.recorder.clone();
        let record = NotificationRecord::incoming_call(&self.user_id, &invite);
        spawn_best_effort("incoming-call record", async move {
            recorder.record(record).await
        });
    }

    /// Ringing → Answered → Idle, then navigate to the room.
    pub fn answer(&mut self) {
        let Some(invite) = self.take_ringing_invite("answer") else {
            return;
        };
        self.timers.cancel_all();
        self.set_state(CallState::Answered, Some(&invite.room_id));
        self.deps.navigator.go_to_room(&invite.room_id);
        self.set_state(CallState::Idle, Some(&invite.room_id));
    }

    /// Ringing → Declined → Idle, signalling the caller on the room channel.
    pub fn decline(&mut self) {
        let Some(invite) = self.take_ringing_invite("decline") else {
            return;
        };
        self.timers.cancel_all();
        self.set_state(CallState::Declined, Some(&invite.room_id));

        let signal = DeclineSignal::now(&self.user_id);
        self.pending_declines.retain(|d| !d.task.is_finished());
        self.pending_declines.push(PendingDecline {
            room_id: invite.room_id.clone(),
            task: tokio::spawn(send_decline(
                self.deps.gateway.clone(),
                invite.room_id.clone(),
                signal,
            )),
        });

        self.set_state(CallState::Idle, Some(&invite.room_id));
    }

    /// Ringing → Idle when the caller hangs up first.
    pub fn call_ended(&mut self, room_id: Option<&str>) {
        let Some(current) = &self.invite else {
            debug!(target: "Call/Controller", "call-ended while {}, ignoring", self.state);
            return;
        };
        if let Some(room_id) = room_id
            && room_id != current.room_id
        {
            debug!(
                target: "Call/Controller",
                "call-ended for room {room_id} does not match ringing room {}",
                current.room_id
            );
            return;
        }
        let Some(invite) = self.take_ringing_invite("call-ended") else {
            return;
        };
        self.timers.cancel_all();
        info!(target: "Call/Controller", "Caller {} hung up", invite.caller_id);
        self.set_state(CallState::Idle, Some(&invite.room_id));
    }

    fn missed_call_timeout(&mut self, attempt: u64) {
        if attempt != self.attempt || !self.state.is_ringing() {
            debug!(
                target: "Call/Controller",
                "Stale missed-call timeout (attempt {attempt}, current {}, state {})",
                self.attempt, self.state
            );
            return;
        }
        let Some(invite) = self.take_ringing_invite("missed-call timeout") else {
            return;
        };
        self.timers.cancel_ring();
        self.timers.cancel_missed_call_timeout();
        info!(target: "Call/Controller", "Missed call from {}", invite.caller_id);
        self.set_state(CallState::Missed, Some(&invite.room_id));

        let recorder = self.deps.recorder.clone();
        let record = NotificationRecord::missed_call(&self.user_id, &invite);
        spawn_best_effort("missed-call record", async move {
            recorder.record(record).await
        });

        let push = self.deps.push.clone();
        let pushed = invite.clone();
        spawn_best_effort("missed-call push", async move {
            push.notify_missed(pushed.display_name(), &pushed.room_id).await
        });

        self.set_state(CallState::Idle, Some(&invite.room_id));
    }

    /// Stop ringing and refuse later invites. Safe from any state and
    /// idempotent. Decline publishes already spawned keep running until
    /// [`Self::finish_declines`] or drop.
    pub fn dispose(&mut self) {
        self.timers.cancel_all();

        if let Some(invite) = self.invite.take() {
            debug!(target: "Call/Controller", "Disposing while ringing for room {}", invite.room_id);
            self.set_state(CallState::Idle, Some(&invite.room_id));
        }
        if !self.disposed {
            self.disposed = true;
            debug!(target: "Call/Controller", "Controller disposed");
        }
    }

    /// Wait up to `decline_grace` for in-flight decline publishes, abort
    /// whatever is left and close the room channels this controller opened.
    pub async fn finish_declines(&mut self) {
        if self.pending_declines.is_empty() {
            return;
        }
        let grace = self.config.decline_grace;
        let pending: Vec<PendingDecline> = self.pending_declines.drain(..).collect();
        let aborts: Vec<_> = pending.iter().map(|d| d.task.abort_handle()).collect();
        let rooms: Vec<String> = pending.iter().map(|d| d.room_id.clone()).collect();

        let tasks = pending.into_iter().map(|d| d.task);
        if tokio::time::timeout(grace, join_all(tasks)).await.is_err() {
            warn!(
                target: "Call/Controller",
                "Decline publish still pending after {grace:?}, giving up"
            );
            for abort in &aborts {
                abort.abort();
            }
        }
        for room_id in &rooms {
            self.deps.gateway.close_ephemeral(room_id);
        }
    }

    /// Decline publishes not yet joined by [`Self::finish_declines`].
    pub fn pending_decline_count(&self) -> usize {
        self.pending_declines
            .iter()
            .filter(|d| !d.task.is_finished())
            .count()
    }

    fn take_ringing_invite(&mut self, action: &str) -> Option<CallInvite> {
        if !self.state.is_ringing() {
            debug!(target: "Call/Controller", "{action} while {}, nothing to do", self.state);
            return None;
        }
        self.invite.take()
    }

    fn set_state(&mut self, to: CallState, room_id: Option<&str>) {
        let from = self.state;
        self.state = to;

        if to.is_ringing() {
            debug_assert!(self.timers.is_armed(), "ringing without both timers");
        } else {
            debug_assert!(self.timers.is_clear(), "{to} with a live timer");
        }

        debug!(target: "Call/Controller", "{from} -> {to}");
        let _ = self.transitions.send(CallTransitionEvent {
            from,
            to,
            room_id: room_id.map(str::to_string),
            at: Utc::now(),
        });
        self.snapshot.send_replace(CallSnapshot {
            state: to,
            invite: self.invite.clone(),
            timers_armed: self.timers.is_armed(),
        });
    }
}

impl Drop for CallLifecycleController {
    fn drop(&mut self) {
        self.timers.cancel_all();
        for decline in self.pending_declines.drain(..) {
            decline.task.abort();
            self.deps.gateway.close_ephemeral(&decline.room_id);
        }
    }
}

async fn ring_loop(tone: Arc<ToneEngine>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        tone.ring();
    }
}

async fn missed_call_timer(
    events: mpsc::UnboundedSender<ControlEvent>,
    timeout: Duration,
    attempt: u64,
) {
    tokio::time::sleep(timeout).await;
    if events
        .send(ControlEvent::MissedCallTimeout { attempt })
        .is_err()
    {
        trace!(target: "Call/Controller", "Missed-call timeout fired after controller stopped");
    }
}

async fn send_decline(gateway: Arc<ChannelGateway>, room_id: String, signal: DeclineSignal) {
    let channel = gateway.open_ephemeral_channel(&room_id).await;
    match channel.publish(SignalingEvent::CallDeclined, &signal).await {
        Ok(()) => debug!(target: "Call/Controller", "Decline sent on {}", channel.topic()),
        Err(e) => warn!(
            target: "Call/Controller",
            "Could not deliver decline on {}: {e}",
            channel.topic()
        ),
    }
    channel.close();
}

fn spawn_best_effort<F>(what: &'static str, fut: F)
where
    F: Future<Output = Result<(), anyhow::Error>> + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(e) = fut.await {
            warn!(target: "Call/Controller", "{what} failed: {e:#}");
        }
    });
}
