//! OS signal handling.
//!
//! Maps the process signals an operator uses to steer the server onto
//! [`ControlEvent`]s:
//!
//! | Signal | Event |
//! |---|---|
//! | `SIGHUP` | [`ControlEvent::FullRestart`] |
//! | `SIGUSR1` | [`ControlEvent::GracefulRestart`] |
//! | `SIGTERM`, `SIGINT` | [`ControlEvent::Terminate`] |

use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::control::ControlEvent;
#[cfg(unix)]
use crate::error::Error;
use crate::error::Result;

const SIGHUP: i32 = 1;
const SIGINT: i32 = 2;
const SIGUSR1: i32 = 10;
const SIGTERM: i32 = 15;

/// Control event requested by `signal`, if the server reacts to it.
#[must_use]
pub const fn control_event_for(signal: i32) -> Option<ControlEvent> {
    match signal {
        SIGHUP => Some(ControlEvent::FullRestart),
        SIGUSR1 => Some(ControlEvent::GracefulRestart),
        SIGTERM | SIGINT => Some(ControlEvent::Terminate),
        _ => None,
    }
}

/// Human-readable description of a signal.
#[must_use]
pub const fn signal_description(signal: i32) -> &'static str {
    match signal {
        SIGHUP => "SIGHUP (full restart)",
        SIGINT => "SIGINT (Interrupt/Ctrl+C)",
        SIGUSR1 => "SIGUSR1 (graceful restart)",
        SIGTERM => "SIGTERM (Terminate)",
        _ => "Unknown signal",
    }
}

/// Registered signal streams feeding the supervisor.
#[derive(Debug)]
pub struct SignalHandler {
    events: mpsc::UnboundedSender<ControlEvent>,
    #[cfg(unix)]
    streams: UnixSignals,
}

#[cfg(unix)]
#[derive(Debug)]
struct UnixSignals {
    hangup: tokio::signal::unix::Signal,
    user1: tokio::signal::unix::Signal,
    terminate: tokio::signal::unix::Signal,
    interrupt: tokio::signal::unix::Signal,
}

#[cfg(unix)]
fn register(kind: tokio::signal::unix::SignalKind, number: i32) -> Result<tokio::signal::unix::Signal> {
    tokio::signal::unix::signal(kind).map_err(|e| {
        Error::signal_with_number(
            format!("Failed to register {} handler: {e}", signal_description(number)),
            number,
        )
    })
}

impl SignalHandler {
    /// Install the handlers. Signals arriving from now on are not lost.
    ///
    /// Must be called within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns a signal error carrying the number of the signal whose handler
    /// could not be installed.
    pub fn register(events: mpsc::UnboundedSender<ControlEvent>) -> Result<Self> {
        #[cfg(unix)]
        {
            use tokio::signal::unix::SignalKind;

            let streams = UnixSignals {
                hangup: register(SignalKind::hangup(), SIGHUP)?,
                user1: register(SignalKind::user_defined1(), SIGUSR1)?,
                terminate: register(SignalKind::terminate(), SIGTERM)?,
                interrupt: register(SignalKind::interrupt(), SIGINT)?,
            };
            info!("Unix signal handlers registered (SIGHUP, SIGUSR1, SIGTERM, SIGINT)");
            Ok(Self { events, streams })
        }

        #[cfg(not(unix))]
        {
            info!("Ctrl+C handler registered");
            Ok(Self { events })
        }
    }

    /// Forward signals until the supervisor stops listening.
    #[cfg(unix)]
    pub async fn run(mut self) {
        loop {
            let number = tokio::select! {
                _ = self.streams.hangup.recv() => SIGHUP,
                _ = self.streams.user1.recv() => SIGUSR1,
                _ = self.streams.terminate.recv() => SIGTERM,
                _ = self.streams.interrupt.recv() => SIGINT,
                () = self.events.closed() => break,
            };
            if !self.forward(number) {
                break;
            }
        }
        debug!("Signal handling stopped");
    }

    /// Forward Ctrl+C until the supervisor stops listening.
    #[cfg(not(unix))]
    pub async fn run(self) {
        loop {
            tokio::select! {
                result = tokio::signal::ctrl_c() => {
                    if result.is_err() || !self.forward(SIGINT) {
                        break;
                    }
                }
                () = self.events.closed() => break,
            }
        }
        debug!("Signal handling stopped");
    }

    fn forward(&self, number: i32) -> bool {
        let Some(event) = control_event_for(number) else {
            return true;
        };
        info!(signal = number, event = %event, "Received {}", signal_description(number));
        self.events.send(event).is_ok()
    }
}
