//! Named, cancellable timer handles owned by the call controller.

use std::future::Future;

use log::trace;
use tokio::task::JoinHandle;

/// A spawned timer task. Cancelling is idempotent and never fails.
#[derive(Debug)]
pub struct TimerHandle {
    name: &'static str,
    task: JoinHandle<()>,
}

impl TimerHandle {
    pub fn spawn<F>(name: &'static str, fut: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Self {
            name,
            task: tokio::spawn(fut),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Whether the timer task has completed or been aborted.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub fn cancel(self) {
        trace!(target: "Call/Timers", "Cancelling {} timer", self.name);
        self.task.abort();
    }
}

/// Both timers of one ringing period.
///
/// Both slots are `None` while idle and both are `Some` while ringing.
#[derive(Debug, Default)]
pub struct TimerHandles {
    ring_interval: Option<TimerHandle>,
    missed_call_timeout: Option<TimerHandle>,
}

impl TimerHandles {
    pub fn arm(&mut self, ring_interval: TimerHandle, missed_call_timeout: TimerHandle) {
        self.cancel_all();
        self.ring_interval = Some(ring_interval);
        self.missed_call_timeout = Some(missed_call_timeout);
    }

    pub fn cancel_ring(&mut self) {
        if let Some(handle) = self.ring_interval.take() {
            handle.cancel();
        }
    }

    pub fn cancel_missed_call_timeout(&mut self) {
        if let Some(handle) = self.missed_call_timeout.take() {
            handle.cancel();
        }
    }

    pub fn cancel_all(&mut self) {
        self.cancel_ring();
        self.cancel_missed_call_timeout();
    }

    pub fn ring_interval(&self) -> Option<&TimerHandle> {
        self.ring_interval.as_ref()
    }

    pub fn missed_call_timeout(&self) -> Option<&TimerHandle> {
        self.missed_call_timeout.as_ref()
    }

    pub fn is_armed(&self) -> bool {
        self.ring_interval.is_some() && self.missed_call_timeout.is_some()
    }

    pub fn is_clear(&self) -> bool {
        self.ring_interval.is_none() && self.missed_call_timeout.is_none()
    }
}

impl Drop for TimerHandles {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
