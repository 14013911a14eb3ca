//! Runs a [`CallLifecycleController`] on its own task.
//!
//! A second task keeps the user's call channel alive: it forwards channel
//! events into the controller queue and, whenever the subscription degrades,
//! retries it with capped exponential backoff.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

use super::controller::{CallDependencies, CallLifecycleController, ControlEvent};
use super::error::CallError;
use super::state::{CallInvite, CallSnapshot, CallState, CallTransitionEvent};
use super::tone::ToneEngine;
use crate::config::CallConfig;
use crate::realtime::{ChannelGateway, GatewayEvent, Subscription};

/// Cloneable front-end to a running controller.
#[derive(Clone)]
pub struct CallHandle {
    events: mpsc::UnboundedSender<ControlEvent>,
    snapshot: watch::Receiver<CallSnapshot>,
    transitions: broadcast::Sender<CallTransitionEvent>,
}

impl CallHandle {
    fn send(&self, event: ControlEvent) -> Result<(), CallError> {
        self.events
            .send(event)
            .map_err(|_| CallError::ControllerStopped)
    }

    /// Inject an invite that did not arrive on the user channel.
    pub fn handle_incoming(&self, invite: CallInvite) -> Result<(), CallError> {
        self.send(ControlEvent::Incoming(invite))
    }

    pub fn answer(&self) -> Result<(), CallError> {
        self.send(ControlEvent::Answer)
    }

    pub fn decline(&self) -> Result<(), CallError> {
        self.send(ControlEvent::Decline)
    }

    pub fn call_ended(&self, room_id: Option<String>) -> Result<(), CallError> {
        self.send(ControlEvent::CallEnded { room_id })
    }

    /// Stop the controller. Safe to call any number of times.
    pub fn dispose(&self) {
        if self.send(ControlEvent::Dispose).is_err() {
            debug!(target: "Call/Service", "dispose() on a stopped controller");
        }
    }

    pub fn is_running(&self) -> bool {
        !self.events.is_closed()
    }

    pub fn state(&self) -> CallState {
        self.snapshot.borrow().state
    }

    pub fn snapshot(&self) -> CallSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Every transition, including the short-lived Answered/Declined/Missed
    /// steps that a snapshot never shows for long.
    pub fn subscribe_transitions(&self) -> broadcast::Receiver<CallTransitionEvent> {
        self.transitions.subscribe()
    }

    /// Wait until the latest snapshot is in `state`. Only meaningful for
    /// Idle and Ringing; use [`Self::subscribe_transitions`] for the rest.
    pub async fn wait_for_state(&self, state: CallState) -> Result<CallSnapshot, CallError> {
        let mut snapshot = self.snapshot.clone();
        let current = snapshot
            .wait_for(|s| s.state == state)
            .await
            .map_err(|_| CallError::ControllerStopped)?;
        Ok(current.clone())
    }
}

/// Delay before the first resubscribe attempt after the channel degrades.
const RESUBSCRIBE_INITIAL_DELAY: Duration = Duration::from_secs(1);
const RESUBSCRIBE_MAX_DELAY: Duration = Duration::from_secs(30);

/// A controller subscribed to one user's call channel.
pub struct CallService {
    user_id: String,
    handle: CallHandle,
    subscription: watch::Receiver<Subscription>,
    gateway: Arc<ChannelGateway>,
    tone: Arc<ToneEngine>,
    controller_task: JoinHandle<()>,
    channel_task: JoinHandle<()>,
}

impl CallService {
    /// Subscribe `user_id`'s call channel and start the controller. A
    /// channel that cannot be joined now is retried in the background.
    pub async fn start(
        config: CallConfig,
        user_id: impl Into<String>,
        deps: CallDependencies,
    ) -> Result<Self, CallError> {
        config.validate()?;
        let user_id = user_id.into();
        let gateway = deps.gateway.clone();
        let tone = deps.tone.clone();

        let (controller, events_rx) = CallLifecycleController::new(config, user_id.clone(), deps);
        let handle = CallHandle {
            events: controller.sender(),
            snapshot: controller.watch_snapshot(),
            transitions: controller.transitions_sender(),
        };

        let subscription = gateway.subscribe_user_channel(&user_id).await;
        if !subscription.is_subscribed() {
            warn!(target: "Call/Service", "Starting without a call channel for {user_id}");
        }
        let (current, subscription_rx) = watch::channel(subscription);
        let channel_task = tokio::spawn(supervise_user_channel(
            gateway.clone(),
            user_id.clone(),
            current,
            controller.sender(),
        ));
        let controller_task = tokio::spawn(run_controller(controller, events_rx));
        info!(target: "Call/Service", "Call service started for {user_id}");

        Ok(Self {
            user_id,
            handle,
            subscription: subscription_rx,
            gateway,
            tone,
            controller_task,
            channel_task,
        })
    }

    pub fn handle(&self) -> CallHandle {
        self.handle.clone()
    }

    /// The user channel currently in use. Replaced after a successful
    /// resubscribe.
    pub fn subscription(&self) -> Subscription {
        self.subscription.borrow().clone()
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Dispose the controller, leave the user channel and release audio.
    /// Declines still being sent get `decline_grace` to go out first.
    pub async fn shutdown(self) {
        self.handle.dispose();
        if let Err(e) = self.controller_task.await {
            warn!(target: "Call/Service", "Controller task ended abnormally: {e}");
        }
        self.channel_task.abort();
        self.gateway.unsubscribe_user_channel(&self.user_id).await;
        self.tone.close();
        info!(target: "Call/Service", "Call service for {} stopped", self.user_id);
    }
}

async fn run_controller(
    mut controller: CallLifecycleController,
    mut events: mpsc::UnboundedReceiver<ControlEvent>,
) {
    while let Some(event) = events.recv().await {
        controller.handle_event(event);
        if controller.is_disposed() {
            break;
        }
    }
    controller.dispose();
    controller.finish_declines().await;
    debug!(target: "Call/Service", "Controller loop for {} exited", controller.user_id());
}

async fn supervise_user_channel(
    gateway: Arc<ChannelGateway>,
    user_id: String,
    current: watch::Sender<Subscription>,
    events: mpsc::UnboundedSender<ControlEvent>,
) {
    let mut delay = RESUBSCRIBE_INITIAL_DELAY;
    let mut failures: u32 = 0;

    loop {
        let subscription = current.borrow().clone();
        if subscription.is_subscribed() {
            tokio::select! {
                () = bridge_gateway_events(subscription.events(), &events) => return,
                () = events.closed() => return,
                () = subscription.lost() => {
                    warn!(target: "Call/Service", "Call channel for {user_id} lost, resubscribing");
                }
            }
            continue;
        }

        tokio::select! {
            () = tokio::time::sleep(delay) => {}
            () = events.closed() => return,
        }
        let next = gateway.subscribe_user_channel(&user_id).await;
        if next.is_subscribed() {
            info!(
                target: "Call/Service",
                "Call channel for {user_id} restored after {} attempt(s)",
                failures + 1
            );
            failures = 0;
            delay = RESUBSCRIBE_INITIAL_DELAY;
            current.send_replace(next);
        } else {
            failures += 1;
            delay = (delay * 2).min(RESUBSCRIBE_MAX_DELAY);
            debug!(
                target: "Call/Service",
                "Resubscribe for {user_id} failed ({failures}), next try in {delay:?}"
            );
        }
    }
}

/// Forward channel events until the controller stops taking them.
async fn bridge_gateway_events(
    mut inbound: broadcast::Receiver<GatewayEvent>,
    events: &mpsc::UnboundedSender<ControlEvent>,
) {
    loop {
        let event = match inbound.recv().await {
            Ok(GatewayEvent::IncomingCall(payload)) => ControlEvent::Incoming(payload.into()),
            Ok(GatewayEvent::CallEnded(payload)) => ControlEvent::CallEnded {
                room_id: payload.room_id,
            },
            Err(RecvError::Lagged(skipped)) => {
                warn!(target: "Call/Service", "Call channel lagged, {skipped} events skipped");
                continue;
            }
            Err(RecvError::Closed) => return,
        };
        if events.send(event).is_err() {
            return;
        }
    }
}
