//! Supervisor.
//!
//! Owns the pool of workers. It starts the first batch, keeps the number of
//! idle workers between `min_free` and `max_free`, replaces workers that die
//! and runs the two restart protocols:
//!
//! * **Full restart**: every worker is terminated and reclaimed, the status
//!   table is cleared, and a fresh batch starts on the reloaded configuration.
//! * **Graceful restart**: the exit generation is bumped and every worker is
//!   told to retire after its current connection. The table is kept and old
//!   workers are replaced one for one as they leave.
//!
//! Worker exits arrive as [`WorkerExit`] notifications from a small task that
//! awaits each worker; the supervisor only writes a slot after its worker has
//! been confirmed gone.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::AbortHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, instrument, warn};

use crate::config::{Config, ConfigSource};
use crate::control::{ControlEvent, ControlPlane, Directive, Phase};
use crate::error::{Error, ErrorCode, Result};
use crate::gate::AdmissionGate;
use crate::listener::ListenerRing;
use crate::protocol::{Diagnostics, Protocol};
use crate::scoreboard::{IdleScan, Scoreboard, WorkerStatus};
use crate::worker::{ConnectionServer, ExitReason, Worker};

const RECLAIM_INITIAL_WAIT: Duration = Duration::from_millis(4);

/// How a worker task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WorkerOutcome {
    Exited(ExitReason),
    Panicked,
    Aborted,
}

/// "A managed worker has exited."
#[derive(Debug)]
pub(crate) struct WorkerExit {
    worker_id: u64,
    slot: usize,
    outcome: WorkerOutcome,
}

#[derive(Debug)]
struct WorkerHandle {
    id: u64,
    generation: u64,
    directive: watch::Sender<Directive>,
    abort: AbortHandle,
    retiring: bool,
}

/// One idle-maintenance decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Maintenance {
    Steady,
    Retire(usize),
    Spawn(usize),
    LimitReached,
}

/// Decide the single adjustment a maintenance cycle makes.
pub(crate) fn plan_maintenance(scan: &IdleScan, min_free: usize, max_free: usize) -> Maintenance {
    if scan.idle > max_free {
        scan.retire_candidate.map_or(Maintenance::Steady, Maintenance::Retire)
    } else if scan.idle < min_free {
        scan.free_slot.map_or(Maintenance::LimitReached, Maintenance::Spawn)
    } else {
        Maintenance::Steady
    }
}

#[derive(Debug)]
struct Generation {
    number: u64,
    config: Arc<Config>,
    listeners: Arc<ListenerRing>,
}

pub(crate) struct Supervisor<P: Protocol> {
    source: Box<dyn ConfigSource>,
    preloaded: Option<Config>,
    protocol: Arc<P>,
    diagnostics: Arc<dyn Diagnostics>,
    scoreboard: Arc<Scoreboard>,
    gate: Arc<AdmissionGate>,
    control: ControlPlane,
    exit_tx: mpsc::UnboundedSender<WorkerExit>,
    exit_rx: mpsc::UnboundedReceiver<WorkerExit>,
    workers: HashMap<usize, WorkerHandle>,
    abandoned: HashMap<usize, WorkerHandle>,
    generation: u64,
    next_worker_id: u64,
    limit_reported: bool,
}

impl<P: Protocol> Supervisor<P> {
    pub(crate) fn new(
        source: Box<dyn ConfigSource>,
        protocol: Arc<P>,
        diagnostics: Arc<dyn Diagnostics>,
        scoreboard: Arc<Scoreboard>,
        control: ControlPlane,
    ) -> Self {
        let (exit_tx, exit_rx) = mpsc::unbounded_channel();
        Self {
            source,
            preloaded: None,
            protocol,
            diagnostics,
            scoreboard,
            gate: Arc::new(AdmissionGate::disabled()),
            control,
            exit_tx,
            exit_rx,
            workers: HashMap::new(),
            abandoned: HashMap::new(),
            generation: 0,
            next_worker_id: 0,
            limit_reported: false,
        }
    }

    /// Use `config` for the first generation instead of loading it again.
    pub(crate) fn with_initial_config(mut self, config: Config) -> Self {
        self.preloaded = Some(config);
        self
    }

    /// Run generations until terminated.
    ///
    /// Configuration, listener and admission failures at the start of a
    /// generation are fatal: running workers are terminated and the error is
    /// returned.
    #[instrument(name = "supervisor", skip_all)]
    pub(crate) async fn run(mut self) -> Result<()> {
        let mut previous: Option<Generation> = None;
        let mut graceful = false;

        loop {
            self.generation += 1;
            let (current, remaining) = match self.begin_generation(previous.as_ref(), graceful) {
                Ok(started) => started,
                Err(e) => {
                    error!(generation = self.generation, error = %e, "failed to start generation");
                    let stage = previous.as_ref().map_or_else(
                        || Config::default().reclaim_stage_timeout(),
                        |g| g.config.reclaim_stage_timeout(),
                    );
                    self.stop(stage).await;
                    return Err(e);
                }
            };
            drop(previous);

            let stage = current.config.reclaim_stage_timeout();
            match self.maintain(&current, remaining).await {
                ControlEvent::Terminate => {
                    info!(generation = current.number, "terminating");
                    self.stop(stage).await;
                    self.persist(&current);
                    return Ok(());
                }
                ControlEvent::GracefulRestart => {
                    info!(generation = current.number, "graceful restart requested");
                    self.control.set_phase(Phase::Restarting);
                    self.scoreboard.set_exit_generation(current.number);
                    self.retire_all();
                    graceful = true;
                }
                ControlEvent::FullRestart => {
                    info!(generation = current.number, "full restart requested");
                    self.control.set_phase(Phase::Restarting);
                    self.reclaim_all(stage).await;
                    graceful = false;
                }
            }
            previous = Some(current);
        }
    }

    fn begin_generation(
        &mut self,
        previous: Option<&Generation>,
        graceful: bool,
    ) -> Result<(Generation, usize)> {
        self.control.set_phase(Phase::Starting);
        let config = match self.preloaded.take() {
            Some(config) => Arc::new(config),
            None => Arc::new(self.source.load()?),
        };
        let listeners = Arc::new(ListenerRing::setup(
            &config.listen.addresses,
            config.listen.backlog,
            previous.map(|g| g.listeners.as_ref()),
        )?);
        self.gate.reinit(&config.admission)?;

        if !graceful {
            let keep: Vec<usize> = self.abandoned.keys().copied().collect();
            self.scoreboard.reinit_except(&keep);
        }

        let current = Generation {
            number: self.generation,
            config,
            listeners,
        };
        let mut remaining = current.config.effective_start();
        if !graceful {
            self.start_batch(&current, remaining);
            remaining = 0;
        }

        let listening = current.listeners.local_addrs();
        info!(
            generation = current.number,
            listening = ?listening,
            workers = self.workers.len(),
            graceful,
            "generation started"
        );
        self.control
            .publish(current.number, Phase::Running, listening);
        Ok((current, remaining))
    }

    async fn maintain(&mut self, current: &Generation, mut remaining: usize) -> ControlEvent {
        let interval = current.config.maintenance_interval();
        loop {
            let exited = tokio::select! {
                biased;
                event = self.control.events.recv() => {
                    return event.unwrap_or(ControlEvent::Terminate);
                }
                Some(exit) = self.exit_rx.recv() => Some(exit),
                () = sleep(interval) => None,
            };

            match exited {
                Some(exit) => {
                    if let Some(slot) = self.reap(exit) {
                        if remaining > 0 && slot < current.config.workers.limit {
                            // one for one replacement, the newcomer is not idle yet
                            self.start_worker(current, slot);
                            remaining -= 1;
                            continue;
                        }
                    }
                }
                None if remaining > 0 => {
                    self.persist(current);
                    self.start_batch(current, remaining);
                    remaining = 0;
                    continue;
                }
                None => self.persist(current),
            }
            self.idle_maintenance(current);
        }
    }

    /// Process an exit notification; returns the slot it freed.
    fn reap(&mut self, exit: WorkerExit) -> Option<usize> {
        let WorkerExit {
            worker_id,
            slot,
            outcome,
        } = exit;
        match outcome {
            WorkerOutcome::Exited(reason) => {
                debug!(worker_id, slot, reason = %reason, "worker exited");
            }
            WorkerOutcome::Panicked => {
                let err = Error::worker(
                    ErrorCode::WorkerPanic,
                    format!("worker {worker_id} in slot {slot} panicked"),
                );
                warn!(worker_id, slot, error = %err, "worker died");
                self.diagnostics.report(&err.to_string());
            }
            WorkerOutcome::Aborted => debug!(worker_id, slot, "worker aborted"),
        }

        if self.workers.get(&slot).is_some_and(|h| h.id == worker_id) {
            self.workers.remove(&slot);
        } else if self.abandoned.get(&slot).is_some_and(|h| h.id == worker_id) {
            info!(worker_id, slot, "abandoned worker finally exited");
            self.abandoned.remove(&slot);
        } else {
            warn!(worker_id, slot, "long lost worker came home");
            return None;
        }

        // a cleared table may already show the slot as someone else's
        if self
            .scoreboard
            .read(slot)
            .is_ok_and(|record| record.worker_id == worker_id)
        {
            if let Err(e) = self.scoreboard.mark_dead(slot) {
                warn!(slot, error = %e, "failed to mark slot dead");
            }
        }
        Some(slot)
    }

    fn scan(&self, current: &Generation) -> IdleScan {
        let board = &self.scoreboard;
        let workers = &self.workers;
        let abandoned = &self.abandoned;
        board.idle_scan_excluding(current.config.workers.limit, |slot| {
            abandoned.contains_key(&slot)
                || workers
                    .get(&slot)
                    .is_some_and(|h| h.retiring || board.status(slot) == WorkerStatus::Dead)
        })
    }

    fn idle_maintenance(&mut self, current: &Generation) {
        let scan = self.scan(current);
        let workers = &current.config.workers;
        let max_free = current.config.effective_max_free();

        match plan_maintenance(&scan, workers.min_free, max_free) {
            Maintenance::Retire(slot) => {
                if let Some(handle) = self.workers.get_mut(&slot) {
                    debug!(worker_id = handle.id, slot, idle = scan.idle, "retiring idle worker");
                    handle.directive.send_replace(Directive::Retire);
                    handle.retiring = true;
                }
                self.limit_reported = false;
            }
            Maintenance::Spawn(slot) => {
                debug!(slot, idle = scan.idle, "starting idle worker");
                self.start_worker(current, slot);
                self.limit_reported = false;
            }
            Maintenance::LimitReached => self.report_limit(current),
            Maintenance::Steady => self.limit_reported = false,
        }
    }

    fn report_limit(&mut self, current: &Generation) {
        if !self.limit_reported {
            self.diagnostics.report(&format!(
                "server reached the worker limit of {}, consider raising it",
                current.config.workers.limit
            ));
            self.limit_reported = true;
        }
    }

    fn start_batch(&mut self, current: &Generation, count: usize) {
        for _ in 0..count {
            let Some(slot) = self.scan(current).free_slot else {
                self.report_limit(current);
                return;
            };
            self.start_worker(current, slot);
        }
    }

    fn start_worker(&mut self, current: &Generation, slot: usize) {
        self.next_worker_id += 1;
        let id = self.next_worker_id;

        let handle = match self
            .scoreboard
            .claim(slot, id)
            .and_then(|_| self.scoreboard.handle(slot))
        {
            Ok(handle) => handle,
            Err(e) => {
                error!(slot, error = %e, "cannot start worker");
                return;
            }
        };

        let (directive, directive_rx) = watch::channel(Directive::Run);
        let server = ConnectionServer::new(
            Arc::clone(&self.protocol),
            Arc::clone(&current.config),
            handle,
            directive_rx,
            current.number,
        );
        let worker = Worker::new(
            id,
            server,
            Arc::clone(&current.listeners),
            Arc::clone(&self.gate),
        );

        let task = tokio::spawn(worker.run());
        let abort = task.abort_handle();
        let exit_tx = self.exit_tx.clone();
        tokio::spawn(async move {
            let outcome = match task.await {
                Ok(reason) => WorkerOutcome::Exited(reason),
                Err(e) if e.is_panic() => WorkerOutcome::Panicked,
                Err(_) => WorkerOutcome::Aborted,
            };
            let _ = exit_tx.send(WorkerExit {
                worker_id: id,
                slot,
                outcome,
            });
        });

        debug!(worker_id = id, slot, generation = current.number, "worker spawned");
        self.workers.insert(
            slot,
            WorkerHandle {
                id,
                generation: current.number,
                directive,
                abort,
                retiring: false,
            },
        );
    }

    fn retire_all(&mut self) {
        for handle in self.workers.values_mut() {
            handle.directive.send_replace(Directive::Retire);
            handle.retiring = true;
        }
    }

    /// Terminate every worker and wait for each to exit, escalating per stage.
    #[instrument(skip_all, fields(generation = self.generation, workers = self.workers.len()))]
    async fn reclaim_all(&mut self, stage: Duration) {
        for handle in self.workers.values() {
            handle.directive.send_replace(Directive::Terminate);
        }
        if self.await_exits(stage).await {
            return;
        }

        for handle in self.workers.values() {
            debug!(worker_id = handle.id, "resending terminate");
            handle.directive.send_replace(Directive::Terminate);
        }
        if self.await_exits(stage).await {
            return;
        }

        for handle in self.workers.values() {
            warn!(worker_id = handle.id, "forcing worker to stop");
            handle.abort.abort();
        }
        if self.await_exits(stage).await {
            return;
        }

        let waited_ms = u64::try_from(stage.as_millis().saturating_mul(3)).unwrap_or(u64::MAX);
        for (slot, handle) in self.workers.drain() {
            let err = Error::timeout(format!("reclaim worker {}", handle.id), waited_ms);
            error!(
                worker_id = handle.id,
                slot,
                generation = handle.generation,
                error = %err,
                "could not make worker exit"
            );
            self.abandoned.insert(slot, handle);
        }
    }

    /// Reap exits with exponential backoff until no worker is left or `budget` elapses.
    async fn await_exits(&mut self, budget: Duration) -> bool {
        let deadline = Instant::now() + budget;
        let mut wait = RECLAIM_INITIAL_WAIT;
        loop {
            while let Ok(exit) = self.exit_rx.try_recv() {
                self.reap(exit);
            }
            if self.workers.is_empty() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            sleep(wait.min(deadline - now)).await;
            wait = (wait * 2).min(budget);
        }
    }

    async fn stop(&mut self, stage: Duration) {
        self.control.set_phase(Phase::Stopping);
        self.reclaim_all(stage).await;
        self.control.set_phase(Phase::Stopped);
    }

    fn persist(&self, current: &Generation) {
        if let Some(ref path) = current.config.scoreboard_file {
            if let Err(e) = self.scoreboard.persist(path) {
                warn!(error = %e, "failed to persist status table");
            }
        }
    }
}
