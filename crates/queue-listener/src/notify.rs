//! Edge-triggered notifiable delay
//!
//! `tokio::sync::Notify` on its own stores one permit per `notify_one()`
//! call regardless of whether anything is currently waiting, so a bare
//! `Notify` does not satisfy the spec's edge-triggered contract (§4.2,
//! §8): a `notify()` issued while no wait is installed must be swallowed,
//! not carried into the next cycle. This wraps `Notify` with an `armed`
//! flag guarded by a mutex (§5 "`_stop_waiting_wake_handle` is guarded by
//! a single mutex that serializes install-vs-notify") — `notify()` only
//! ever signals while a wait is actually installed.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Why a [`NotifiableDelay::wait`] call returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitReason {
    /// The full delay elapsed without interruption.
    Elapsed,
    /// `notify()` was called while this wait was installed.
    Notified,
    /// The poll scope was cancelled.
    Cancelled,
}

/// A delay that can be woken early by an external `notify()`, or cut short
/// by cancellation. `notify()` is edge-triggered: it only wakes a wait that
/// is installed at the moment it is called.
#[derive(Debug, Clone)]
pub struct NotifiableDelay {
    armed: Arc<Mutex<bool>>,
    notify: Arc<Notify>,
}

impl Default for NotifiableDelay {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifiableDelay {
    pub fn new() -> Self {
        Self {
            armed: Arc::new(Mutex::new(false)),
            notify: Arc::new(Notify::new()),
        }
    }

    /// A cloneable handle that can call [`Self::notify`] without holding a
    /// reference to the delay itself (used by the cross-queue wake path).
    pub fn handle(&self) -> NotifyHandle {
        NotifyHandle {
            armed: self.armed.clone(),
            notify: self.notify.clone(),
        }
    }

    /// Resolve the currently installed wait, if one is installed. A call
    /// that arrives while no wait is installed is swallowed — it has no
    /// effect on the next [`Self::wait`] call.
    pub fn notify(&self) {
        notify_if_armed(&self.armed, &self.notify);
    }

    /// Wait for `d` to elapse, for `notify()` to be called, or for
    /// `cancel` to fire, whichever happens first. Installs a fresh wait for
    /// the duration of this call only; `notify()` calls before this or
    /// after it returns have no effect on it.
    pub async fn wait(&self, d: Duration, cancel: &CancellationToken) -> WaitReason {
        *self.armed.lock().unwrap() = true;

        let reason = tokio::select! {
            biased;
            _ = cancel.cancelled() => WaitReason::Cancelled,
            _ = self.notify.notified() => WaitReason::Notified,
            _ = tokio::time::sleep(d) => WaitReason::Elapsed,
        };

        *self.armed.lock().unwrap() = false;

        if reason != WaitReason::Notified {
            // A notify() that raced cancellation/elapse and lost may have
            // already stored a permit on `self.notify`; drain it now so it
            // doesn't leak into the next cycle's wait.
            let _ = tokio::time::timeout(Duration::ZERO, self.notify.notified()).await;
        }

        reason
    }
}

fn notify_if_armed(armed: &Mutex<bool>, notify: &Notify) {
    if *armed.lock().unwrap() {
        notify.notify_one();
    }
}

/// A cloneable handle that can wake a [`NotifiableDelay`] without owning it.
#[derive(Debug, Clone)]
pub struct NotifyHandle {
    armed: Arc<Mutex<bool>>,
    notify: Arc<Notify>,
}

impl NotifyHandle {
    pub fn notify(&self) {
        notify_if_armed(&self.armed, &self.notify);
    }
}
