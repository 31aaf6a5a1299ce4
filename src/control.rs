//! Control plane between the environment, the supervisor and its workers.
//!
//! * [`ControlEvent`]s ask the supervisor for a full restart, a graceful
//!   restart or termination. They arrive from OS signals or from a
//!   [`ControlHandle`].
//! * [`Directive`]s are what the supervisor tells one worker: keep running,
//!   retire after the current work, or terminate now.
//! * [`SupervisorState`] is published by the supervisor after every
//!   transition so observers can follow generations and bound addresses.

use std::net::SocketAddr;
use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::error::{Error, ErrorCode, Result};

/// Request addressed to the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlEvent {
    /// Terminate every worker, reload, and start a fresh batch
    FullRestart,
    /// Reload and let old workers retire after their current work
    GracefulRestart,
    /// Terminate every worker and stop
    Terminate,
}

impl std::fmt::Display for ControlEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::FullRestart => write!(f, "FullRestart"),
            Self::GracefulRestart => write!(f, "GracefulRestart"),
            Self::Terminate => write!(f, "Terminate"),
        }
    }
}

/// Instruction for one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Directive {
    /// Keep serving
    Run,
    /// Exit at the next connection boundary
    Retire,
    /// Exit immediately, dropping any connection
    Terminate,
}

/// Supervisor lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Loading configuration and opening listeners
    Starting,
    /// Serving and maintaining the pool
    Running,
    /// Tearing down or retiring the previous generation
    Restarting,
    /// Terminating all workers
    Stopping,
    /// `run` has returned
    Stopped,
}

/// What the supervisor last published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorState {
    /// Current generation (0 before the first one starts)
    pub generation: u64,
    /// Lifecycle phase
    pub phase: Phase,
    /// Bound listener addresses of the current generation
    pub listening: Vec<SocketAddr>,
}

impl Default for SupervisorState {
    fn default() -> Self {
        Self {
            generation: 0,
            phase: Phase::Starting,
            listening: Vec::new(),
        }
    }
}

/// Cloneable handle to steer a running server.
#[derive(Debug, Clone)]
pub struct ControlHandle {
    events: mpsc::UnboundedSender<ControlEvent>,
    state: watch::Receiver<SupervisorState>,
}

impl ControlHandle {
    /// Deliver `event` to the supervisor.
    ///
    /// # Errors
    ///
    /// Returns an error if the supervisor has already stopped.
    pub fn send(&self, event: ControlEvent) -> Result<()> {
        debug!(event = %event, "control event requested");
        self.events.send(event).map_err(|_| {
            Error::signal_with_code(ErrorCode::SignalSendFailed, "supervisor is not running")
        })
    }

    /// Request a full restart.
    ///
    /// # Errors
    ///
    /// Returns an error if the supervisor has already stopped.
    pub fn full_restart(&self) -> Result<()> {
        self.send(ControlEvent::FullRestart)
    }

    /// Request a graceful restart.
    ///
    /// # Errors
    ///
    /// Returns an error if the supervisor has already stopped.
    pub fn graceful_restart(&self) -> Result<()> {
        self.send(ControlEvent::GracefulRestart)
    }

    /// Request termination.
    ///
    /// # Errors
    ///
    /// Returns an error if the supervisor has already stopped.
    pub fn terminate(&self) -> Result<()> {
        self.send(ControlEvent::Terminate)
    }

    /// Latest published state.
    #[must_use]
    pub fn state(&self) -> SupervisorState {
        self.state.borrow().clone()
    }

    /// Current generation.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.state.borrow().generation
    }

    /// Wait until the published state satisfies `condition`.
    ///
    /// # Errors
    ///
    /// Returns an error if the supervisor stops publishing first.
    pub async fn wait_for<F>(&self, mut condition: F) -> Result<SupervisorState>
    where
        F: FnMut(&SupervisorState) -> bool,
    {
        let mut state = self.state.clone();
        let matched = state
            .wait_for(|current| condition(current))
            .await
            .map_err(|_| Error::invalid_state("supervisor stopped publishing state"))?;
        Ok(matched.clone())
    }

    /// Wait until the supervisor is serving and return its bound addresses.
    ///
    /// # Errors
    ///
    /// Returns an error if the supervisor stops before it starts serving.
    pub async fn listening(&self) -> Result<Vec<SocketAddr>> {
        let state = self
            .wait_for(|state| state.phase == Phase::Running || state.phase == Phase::Stopped)
            .await?;
        if state.phase == Phase::Stopped {
            return Err(Error::invalid_state("supervisor stopped before serving"));
        }
        Ok(state.listening)
    }
}

/// Supervisor end of the control plane.
#[derive(Debug)]
pub(crate) struct ControlPlane {
    pub(crate) events: mpsc::UnboundedReceiver<ControlEvent>,
    pub(crate) sender: mpsc::UnboundedSender<ControlEvent>,
    state: watch::Sender<SupervisorState>,
}

impl ControlPlane {
    pub(crate) fn new() -> (Self, ControlHandle) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(SupervisorState::default());
        let handle = ControlHandle {
            events: events_tx.clone(),
            state: state_rx,
        };
        (
            Self {
                events: events_rx,
                sender: events_tx,
                state: state_tx,
            },
            handle,
        )
    }

    pub(crate) fn publish(&self, generation: u64, phase: Phase, listening: Vec<SocketAddr>) {
        self.state.send_replace(SupervisorState {
            generation,
            phase,
            listening,
        });
    }

    pub(crate) fn set_phase(&self, phase: Phase) {
        self.state.send_modify(|state| state.phase = phase);
    }
}

/// Resolve once the worker must stop immediately (or its supervisor is gone).
pub(crate) async fn terminated(directive: &mut watch::Receiver<Directive>) {
    loop {
        let current = *directive.borrow_and_update();
        if current == Directive::Terminate {
            return;
        }
        if directive.changed().await.is_err() {
            return;
        }
    }
}

/// Resolve once the worker must stop taking new connections.
pub(crate) async fn retiring(directive: &mut watch::Receiver<Directive>) {
    loop {
        let current = *directive.borrow_and_update();
        if current != Directive::Run {
            return;
        }
        if directive.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_handle_delivers_events() {
        let (mut plane, handle) = ControlPlane::new();
        handle.graceful_restart().unwrap();
        handle.full_restart().unwrap();
        handle.terminate().unwrap();

        assert_eq!(plane.events.recv().await, Some(ControlEvent::GracefulRestart));
        assert_eq!(plane.events.recv().await, Some(ControlEvent::FullRestart));
        assert_eq!(plane.events.recv().await, Some(ControlEvent::Terminate));
    }

    #[tokio::test]
    async fn test_send_fails_once_supervisor_is_gone() {
        let (plane, handle) = ControlPlane::new();
        drop(plane);
        let err = handle.terminate().unwrap_err();
        assert_eq!(err.code(), ErrorCode::SignalSendFailed);
    }

    #[tokio::test]
    async fn test_wait_for_published_state() {
        let test_result = tokio::time::timeout(Duration::from_secs(5), async {
            let (plane, handle) = ControlPlane::new();
            let addr: SocketAddr = "127.0.0.1:8080".parse().unwrap();

            let waiter = tokio::spawn({
                let handle = handle.clone();
                async move { handle.listening().await }
            });
            plane.publish(1, Phase::Running, vec![addr]);

            assert_eq!(waiter.await.unwrap().unwrap(), vec![addr]);
            assert_eq!(handle.generation(), 1);

            plane.set_phase(Phase::Stopped);
            assert_eq!(handle.state().phase, Phase::Stopped);
        })
        .await;
        assert!(test_result.is_ok(), "Test timed out after 5 seconds");
    }

    #[tokio::test]
    async fn test_directive_waits() {
        let test_result = tokio::time::timeout(Duration::from_secs(5), async {
            let (tx, rx) = watch::channel(Directive::Run);

            let mut retire_rx = rx.clone();
            let retire = tokio::spawn(async move { retiring(&mut retire_rx).await });
            let mut terminate_rx = rx.clone();
            let terminate = tokio::spawn(async move { terminated(&mut terminate_rx).await });

            tx.send_replace(Directive::Retire);
            retire.await.unwrap();
            assert!(!terminate.is_finished());

            tx.send_replace(Directive::Terminate);
            terminate.await.unwrap();

            // a vanished supervisor counts as terminate
            let (tx, mut orphan) = watch::channel(Directive::Run);
            drop(tx);
            terminated(&mut orphan).await;
        })
        .await;
        assert!(test_result.is_ok(), "Test timed out after 5 seconds");
    }
}
