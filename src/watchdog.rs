//! Per-worker timeout watchdog.
//!
//! A single deadline slot with a diagnostic label. Blocking connection I/O is
//! run through [`Watchdog::guard`], which drops the I/O future the moment the
//! deadline fires and hands back [`Guarded::TimedOut`]; the worker checks that
//! result after every suspension point and unwinds to its per-iteration
//! recovery point.
//!
//! Code that must not be interrupted brackets itself with
//! [`Watchdog::block_alarms`]. A deadline that expires inside such a section is
//! held back and delivered exactly once when the outermost block ends.

use parking_lot::Mutex;
use std::borrow::Cow;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{sleep_until, Instant};
use tracing::debug;

use crate::error::Error;

/// What the worker does when a deadline fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnFire {
    /// Abort the connection and unwind to the recovery point
    AbortConnection,
    /// Stop draining a lingering close and close the socket
    StopLingering,
}

/// A delivered timeout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fired {
    /// Label of the arming that fired
    pub label: Cow<'static, str>,
    /// Action requested by the arming
    pub on_fire: OnFire,
    /// Whether a request was being processed when it fired
    pub request_in_flight: bool,
    /// Duration the deadline was armed for
    pub duration: Duration,
}

impl Fired {
    /// Describe the fire as a connection timeout error for logs and diagnostics.
    #[must_use]
    pub fn to_error(&self) -> Error {
        Error::connection_timeout(
            self.label.as_ref(),
            u64::try_from(self.duration.as_millis()).unwrap_or(u64::MAX),
        )
    }
}

/// Outcome of a guarded operation.
#[derive(Debug)]
pub enum Guarded<T> {
    /// The operation finished before the deadline
    Completed(T),
    /// The deadline fired and the operation was abandoned
    TimedOut(Fired),
}

#[derive(Debug)]
struct Arming {
    label: Cow<'static, str>,
    duration: Duration,
    deadline: Instant,
    on_fire: OnFire,
}

#[derive(Debug, Default)]
struct State {
    armed: Option<Arming>,
    blocked: u32,
    pending: Option<Fired>,
    fired: Option<Fired>,
    request_in_flight: bool,
    fires: u64,
}

#[derive(Debug, Default)]
struct Inner {
    state: Mutex<State>,
    notify: Notify,
}

/// Deadline slot shared by a worker and the connection it serves.
#[derive(Debug, Clone, Default)]
pub struct Watchdog {
    inner: Arc<Inner>,
}

/// Critical section in which fires are deferred; ends on drop.
#[derive(Debug)]
#[must_use = "alarms are unblocked as soon as the guard is dropped"]
pub struct AlarmBlock {
    watchdog: Watchdog,
}

impl Drop for AlarmBlock {
    fn drop(&mut self) {
        self.watchdog.unblock();
    }
}

impl Watchdog {
    /// Create a disarmed watchdog.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `on_fire` for `duration` from now, replacing any earlier arming.
    pub fn arm<L>(&self, label: L, duration: Duration, on_fire: OnFire)
    where
        L: Into<Cow<'static, str>>,
    {
        {
            let mut state = self.inner.state.lock();
            state.armed = Some(Arming {
                label: label.into(),
                duration,
                deadline: Instant::now() + duration,
                on_fire,
            });
        }
        // wake a running guard so it picks up the new deadline
        self.inner.notify.notify_one();
    }

    /// Arm for a whole request; a fire aborts the request in flight.
    pub fn hard_timeout<L>(&self, label: L, duration: Duration)
    where
        L: Into<Cow<'static, str>>,
    {
        self.inner.state.lock().request_in_flight = true;
        self.arm(label, duration, OnFire::AbortConnection);
    }

    /// Arm while waiting for a request on a connection not yet persistent.
    pub fn soft_timeout<L>(&self, label: L, duration: Duration)
    where
        L: Into<Cow<'static, str>>,
    {
        self.arm(label, duration, OnFire::AbortConnection);
    }

    /// Arm while waiting for the next request on a persistent connection.
    pub fn keepalive_timeout<L>(&self, label: L, duration: Duration)
    where
        L: Into<Cow<'static, str>>,
    {
        self.arm(label, duration, OnFire::AbortConnection);
    }

    /// Clear the deadline and forget the request in flight.
    ///
    /// A fire deferred by a critical section still in progress is kept.
    pub fn disarm(&self) {
        let mut state = self.inner.state.lock();
        state.armed = None;
        state.fired = None;
        state.request_in_flight = false;
    }

    /// Push the current deadline out by its original duration.
    ///
    /// Does nothing if the watchdog is not armed.
    pub fn reset(&self) {
        {
            let mut state = self.inner.state.lock();
            if let Some(ref mut arming) = state.armed {
                arming.deadline = Instant::now() + arming.duration;
            }
        }
        self.inner.notify.notify_one();
    }

    /// Enter a critical section; fires are deferred until every block ends.
    pub fn block_alarms(&self) -> AlarmBlock {
        self.inner.state.lock().blocked += 1;
        AlarmBlock {
            watchdog: self.clone(),
        }
    }

    fn unblock(&self) {
        let mut state = self.inner.state.lock();
        state.blocked = state.blocked.saturating_sub(1);
        if state.blocked == 0 {
            if let Some(fired) = state.pending.take() {
                debug!(label = %fired.label, "replaying deferred timeout");
                state.fires += 1;
                state.fired = Some(fired);
                drop(state);
                self.inner.notify.notify_one();
            }
        }
    }

    /// Whether a deadline is pending.
    #[must_use]
    pub fn is_armed(&self) -> bool {
        self.inner.state.lock().armed.is_some()
    }

    /// Label of the current arming.
    #[must_use]
    pub fn label(&self) -> Option<String> {
        self.inner
            .state
            .lock()
            .armed
            .as_ref()
            .map(|arming| arming.label.to_string())
    }

    /// Whether fires are currently deferred.
    #[must_use]
    pub fn alarms_blocked(&self) -> bool {
        self.inner.state.lock().blocked > 0
    }

    /// Number of fires delivered since creation.
    #[must_use]
    pub fn fires(&self) -> u64 {
        self.inner.state.lock().fires
    }

    fn deadline(&self) -> Option<Instant> {
        self.inner
            .state
            .lock()
            .armed
            .as_ref()
            .map(|arming| arming.deadline)
    }

    fn take_fired(&self) -> Option<Fired> {
        self.inner.state.lock().fired.take()
    }

    fn expire(&self, now: Instant) {
        let mut state = self.inner.state.lock();
        match state.armed {
            Some(ref arming) if now >= arming.deadline => {}
            _ => return,
        }
        let Some(arming) = state.armed.take() else {
            return;
        };
        let fired = Fired {
            label: arming.label,
            on_fire: arming.on_fire,
            request_in_flight: state.request_in_flight,
            duration: arming.duration,
        };
        if state.blocked > 0 {
            debug!(label = %fired.label, "timeout deferred by critical section");
            state.pending = Some(fired);
        } else {
            state.fires += 1;
            state.fired = Some(fired);
        }
    }

    /// Run `operation` until it completes or the deadline fires.
    ///
    /// A fire delivered while the operation was finishing still wins: the
    /// result is discarded and [`Guarded::TimedOut`] returned.
    pub async fn guard<F: Future>(&self, operation: F) -> Guarded<F::Output> {
        tokio::pin!(operation);
        loop {
            if let Some(fired) = self.take_fired() {
                return Guarded::TimedOut(fired);
            }
            let deadline = self.deadline();
            let notified = self.inner.notify.notified();

            tokio::select! {
                biased;
                () = notified => {}
                () = sleep_until_or_forever(deadline) => self.expire(Instant::now()),
                output = &mut operation => {
                    return match self.take_fired() {
                        Some(fired) => Guarded::TimedOut(fired),
                        None => Guarded::Completed(output),
                    };
                }
            }
        }
    }
}

async fn sleep_until_or_forever(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
