//! Shared status table ("scoreboard").
//!
//! One [`StatusSlot`] per worker capacity unit plus a global record holding the
//! exit generation. The table is allocated once per supervisor lifetime, stays
//! in place across configuration reloads, and is cleared only by a full restart.
//!
//! # Single writer per slot
//!
//! Slot writes take no lock. At any instant a slot has exactly one writer:
//!
//! * the supervisor, while claiming the slot (`STARTING`) before the worker
//!   exists, and when writing `DEAD` after the worker's exit was confirmed;
//! * the occupying worker, through the [`SlotHandle`] it owns, in between.
//!
//! Every write path bumps a per-slot writer counter for its duration; a write
//! that finds the counter already raised is counted in
//! [`Scoreboard::contended_writes`], which must stay at zero.

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::warn;

use crate::error::{Error, ErrorCode, Result};

/// Width of the client address diagnostic field, terminator included.
pub const CLIENT_WIDTH: usize = 32;
/// Width of the request line diagnostic field, terminator included.
pub const REQUEST_WIDTH: usize = 64;
/// Width of the virtual host diagnostic field, terminator included.
pub const VHOST_WIDTH: usize = 32;

/// Lifecycle state of a worker slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum WorkerStatus {
    /// No worker occupies the slot
    Dead = 0,
    /// Claimed by the supervisor, worker not yet running
    Starting = 1,
    /// Waiting for a connection
    Ready = 2,
    /// Reading a request
    BusyRead = 3,
    /// Handling a request and writing the response
    BusyWrite = 4,
    /// Waiting for the next request on a persistent connection
    BusyKeepalive = 5,
    /// Finishing its current work before retiring
    Graceful = 6,
}

impl WorkerStatus {
    const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Starting,
            2 => Self::Ready,
            3 => Self::BusyRead,
            4 => Self::BusyWrite,
            5 => Self::BusyKeepalive,
            6 => Self::Graceful,
            _ => Self::Dead,
        }
    }

    /// Whether the worker is in the middle of a connection.
    #[must_use]
    pub const fn is_busy(self) -> bool {
        matches!(self, Self::BusyRead | Self::BusyWrite | Self::BusyKeepalive)
    }

    /// Short name used in logs and status dumps.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Dead => "dead",
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::BusyRead => "busy_read",
            Self::BusyWrite => "busy_write",
            Self::BusyKeepalive => "busy_keepalive",
            Self::Graceful => "graceful",
        }
    }
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Best-effort description of the connection a worker is serving.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestInfo {
    /// Peer address of the client
    pub client: String,
    /// First line of the current request
    pub request: String,
    /// Virtual host the request was addressed to
    pub vhost: String,
}

impl RequestInfo {
    /// Create a request description.
    pub fn new<C, R, V>(client: C, request: R, vhost: V) -> Self
    where
        C: Into<String>,
        R: Into<String>,
        V: Into<String>,
    {
        Self {
            client: client.into(),
            request: request.into(),
            vhost: vhost.into(),
        }
    }

    fn truncated(&self) -> Self {
        Self {
            client: truncate(&self.client, CLIENT_WIDTH),
            request: truncate(&self.request, REQUEST_WIDTH),
            vhost: truncate(&self.vhost, VHOST_WIDTH),
        }
    }
}

fn truncate(value: &str, width: usize) -> String {
    if value.len() < width {
        return value.to_owned();
    }
    let mut end = width.saturating_sub(1);
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    value[..end].to_owned()
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
}

/// One worker's record in the status table.
#[derive(Debug)]
pub struct StatusSlot {
    worker_id: AtomicU64,
    status: AtomicU8,
    access_count: AtomicU64,
    my_access_count: AtomicU64,
    bytes_served: AtomicU64,
    my_bytes_served: AtomicU64,
    conn_count: AtomicU64,
    conn_bytes: AtomicU64,
    last_used: AtomicU64,
    info: ArcSwap<RequestInfo>,
    writers: AtomicU32,
}

impl StatusSlot {
    fn new() -> Self {
        Self {
            worker_id: AtomicU64::new(0),
            status: AtomicU8::new(WorkerStatus::Dead as u8),
            access_count: AtomicU64::new(0),
            my_access_count: AtomicU64::new(0),
            bytes_served: AtomicU64::new(0),
            my_bytes_served: AtomicU64::new(0),
            conn_count: AtomicU64::new(0),
            conn_bytes: AtomicU64::new(0),
            last_used: AtomicU64::new(0),
            info: ArcSwap::from_pointee(RequestInfo::default()),
            writers: AtomicU32::new(0),
        }
    }

    fn status(&self) -> WorkerStatus {
        WorkerStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    fn reset(&self) {
        self.worker_id.store(0, Ordering::Release);
        self.status.store(WorkerStatus::Dead as u8, Ordering::Release);
        for counter in [
            &self.access_count,
            &self.my_access_count,
            &self.bytes_served,
            &self.my_bytes_served,
            &self.conn_count,
            &self.conn_bytes,
            &self.last_used,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.info.store(Arc::new(RequestInfo::default()));
    }
}

/// Point-in-time copy of a slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotSnapshot {
    /// Slot index
    pub index: usize,
    /// Current or last occupant (0 = never used)
    pub worker_id: u64,
    /// Lifecycle state
    pub status: WorkerStatus,
    /// Requests served in this slot since the table was cleared
    pub access_count: u64,
    /// Requests served by the current occupant
    pub my_access_count: u64,
    /// Bytes sent from this slot since the table was cleared
    pub bytes_served: u64,
    /// Bytes sent by the current occupant
    pub my_bytes_served: u64,
    /// Requests served on the current connection
    pub conn_count: u64,
    /// Bytes sent on the current connection
    pub conn_bytes: u64,
    /// Unix time of the last update, in milliseconds
    pub last_used_ms: u64,
    /// Last connection diagnostics
    pub info: RequestInfo,
}

/// Serializable copy of the whole table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoreboardSnapshot {
    /// Global exit generation
    pub exit_generation: u64,
    /// Every slot that has ever been occupied
    pub slots: Vec<SlotSnapshot>,
}

impl ScoreboardSnapshot {
    /// Read a snapshot persisted by [`Scoreboard::persist`].
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|e| {
            Error::io_with_source(format!("Failed to read status file: {}", path.display()), e)
        })?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Number of slots in the given state.
    #[must_use]
    pub fn count(&self, status: WorkerStatus) -> usize {
        self.slots.iter().filter(|slot| slot.status == status).count()
    }
}

/// Outcome of one idle-maintenance scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IdleScan {
    /// Slots in `READY`
    pub idle: usize,
    /// Slots not `DEAD`
    pub live: usize,
    /// Lowest `DEAD` slot, if any
    pub free_slot: Option<usize>,
    /// Highest `READY` slot, the one retired when there are too many idle
    pub retire_candidate: Option<usize>,
}

/// The shared status table.
#[derive(Debug)]
pub struct Scoreboard {
    slots: Box<[StatusSlot]>,
    exit_generation: AtomicU64,
    contended: AtomicU64,
}

impl Scoreboard {
    /// Allocate a table with `capacity` slots, all `DEAD`.
    ///
    /// # Errors
    ///
    /// Returns an error if `capacity` is zero.
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(Error::invalid_state("status table needs at least one slot"));
        }
        Ok(Self {
            slots: (0..capacity).map(|_| StatusSlot::new()).collect(),
            exit_generation: AtomicU64::new(0),
            contended: AtomicU64::new(0),
        })
    }

    /// Number of slots.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn slot(&self, index: usize) -> Result<&StatusSlot> {
        self.slots
            .get(index)
            .ok_or_else(|| Error::slot_out_of_range(index, self.slots.len()))
    }

    fn enter(&self, slot: &StatusSlot, index: usize) {
        if slot.writers.fetch_add(1, Ordering::AcqRel) != 0 {
            self.contended.fetch_add(1, Ordering::Relaxed);
            warn!(slot = index, "overlapping writes to a status slot");
        }
    }

    fn apply(
        &self,
        index: usize,
        slot: &StatusSlot,
        status: WorkerStatus,
        info: Option<&RequestInfo>,
    ) -> WorkerStatus {
        self.enter(slot, index);
        let previous = WorkerStatus::from_u8(slot.status.swap(status as u8, Ordering::AcqRel));

        if matches!(status, WorkerStatus::Ready | WorkerStatus::Dead) {
            slot.conn_count.store(0, Ordering::Relaxed);
            slot.conn_bytes.store(0, Ordering::Relaxed);
        }
        if status == WorkerStatus::Dead {
            slot.my_access_count.store(0, Ordering::Relaxed);
            slot.my_bytes_served.store(0, Ordering::Relaxed);
        }
        if let Some(info) = info {
            slot.info.store(Arc::new(info.truncated()));
        }
        slot.last_used.store(now_millis(), Ordering::Relaxed);

        slot.writers.fetch_sub(1, Ordering::AcqRel);
        previous
    }

    fn bump(&self, index: usize, slot: &StatusSlot, bytes: u64) {
        self.enter(slot, index);
        slot.access_count.fetch_add(1, Ordering::Relaxed);
        slot.my_access_count.fetch_add(1, Ordering::Relaxed);
        slot.conn_count.fetch_add(1, Ordering::Relaxed);
        slot.bytes_served.fetch_add(bytes, Ordering::Relaxed);
        slot.my_bytes_served.fetch_add(bytes, Ordering::Relaxed);
        slot.conn_bytes.fetch_add(bytes, Ordering::Relaxed);
        slot.writers.fetch_sub(1, Ordering::AcqRel);
    }

    /// Set a slot's status, returning the status it replaced.
    ///
    /// Entering `READY` or `DEAD` resets the per-connection counters; entering
    /// `DEAD` also resets the occupant's counters. Never blocks.
    ///
    /// # Errors
    ///
    /// Returns an error if `index` is outside the table.
    pub fn update(
        &self,
        index: usize,
        status: WorkerStatus,
        info: Option<&RequestInfo>,
    ) -> Result<WorkerStatus> {
        let slot = self.slot(index)?;
        Ok(self.apply(index, slot, status, info))
    }

    /// Account one served request of `bytes` bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if `index` is outside the table.
    pub fn increment(&self, index: usize, bytes: u64) -> Result<()> {
        let slot = self.slot(index)?;
        self.bump(index, slot, bytes);
        Ok(())
    }

    /// Claim a slot for a worker about to be started.
    ///
    /// # Errors
    ///
    /// Returns an error if `index` is outside the table.
    pub fn claim(&self, index: usize, worker_id: u64) -> Result<WorkerStatus> {
        let slot = self.slot(index)?;
        slot.worker_id.store(worker_id, Ordering::Release);
        Ok(self.apply(index, slot, WorkerStatus::Starting, None))
    }

    /// Mark a slot `DEAD` once its worker's exit has been confirmed.
    ///
    /// # Errors
    ///
    /// Returns an error if `index` is outside the table.
    pub fn mark_dead(&self, index: usize) -> Result<WorkerStatus> {
        self.update(index, WorkerStatus::Dead, None)
    }

    /// Snapshot of one slot.
    ///
    /// # Errors
    ///
    /// Returns an error if `index` is outside the table.
    pub fn read(&self, index: usize) -> Result<SlotSnapshot> {
        let slot = self.slot(index)?;
        Ok(SlotSnapshot {
            index,
            worker_id: slot.worker_id.load(Ordering::Acquire),
            status: slot.status(),
            access_count: slot.access_count.load(Ordering::Relaxed),
            my_access_count: slot.my_access_count.load(Ordering::Relaxed),
            bytes_served: slot.bytes_served.load(Ordering::Relaxed),
            my_bytes_served: slot.my_bytes_served.load(Ordering::Relaxed),
            conn_count: slot.conn_count.load(Ordering::Relaxed),
            conn_bytes: slot.conn_bytes.load(Ordering::Relaxed),
            last_used_ms: slot.last_used.load(Ordering::Relaxed),
            info: RequestInfo::clone(&slot.info.load()),
        })
    }

    /// Current status of a slot, `DEAD` if out of range.
    #[must_use]
    pub fn status(&self, index: usize) -> WorkerStatus {
        self.slots.get(index).map_or(WorkerStatus::Dead, StatusSlot::status)
    }

    /// Find the slot whose current occupant is `worker_id`.
    #[must_use]
    pub fn find_by_worker_id(&self, worker_id: u64) -> Option<usize> {
        if worker_id == 0 {
            return None;
        }
        self.slots
            .iter()
            .position(|slot| slot.worker_id.load(Ordering::Acquire) == worker_id)
    }

    /// Count idle slots and pick candidates among the first `limit` slots.
    #[must_use]
    pub fn idle_scan(&self, limit: usize) -> IdleScan {
        self.idle_scan_excluding(limit, |_| false)
    }

    /// Like [`Scoreboard::idle_scan`], but slots for which `excluded` holds are
    /// neither free nor idle (a worker whose exit has not been reported yet, or
    /// one already told to retire). They still count as live.
    pub fn idle_scan_excluding<F>(&self, limit: usize, excluded: F) -> IdleScan
    where
        F: Fn(usize) -> bool,
    {
        let mut scan = IdleScan::default();
        for (index, slot) in self.slots.iter().take(limit).enumerate() {
            if excluded(index) {
                scan.live += 1;
                continue;
            }
            match slot.status() {
                WorkerStatus::Dead => {
                    if scan.free_slot.is_none() {
                        scan.free_slot = Some(index);
                    }
                }
                WorkerStatus::Ready => {
                    scan.idle += 1;
                    scan.live += 1;
                    scan.retire_candidate = Some(index);
                }
                _ => scan.live += 1,
            }
        }
        scan
    }

    /// Global exit generation.
    #[must_use]
    pub fn exit_generation(&self) -> u64 {
        self.exit_generation.load(Ordering::Acquire)
    }

    /// Publish a new exit generation; workers stamped with it or earlier retire.
    pub fn set_exit_generation(&self, generation: u64) {
        self.exit_generation.store(generation, Ordering::Release);
    }

    /// Clear the table except the slots in `keep`, and reset the exit generation.
    pub fn reinit_except(&self, keep: &[usize]) {
        for (index, slot) in self.slots.iter().enumerate() {
            if !keep.contains(&index) {
                slot.reset();
            }
        }
        self.exit_generation.store(0, Ordering::Release);
    }

    /// Number of overlapping slot writes observed since allocation.
    #[must_use]
    pub fn contended_writes(&self) -> u64 {
        self.contended.load(Ordering::Relaxed)
    }

    /// Copy of every slot that has ever been occupied.
    #[must_use]
    pub fn snapshot(&self) -> ScoreboardSnapshot {
        let slots = (0..self.slots.len())
            .filter_map(|index| self.read(index).ok())
            .filter(|slot| slot.worker_id != 0)
            .collect();
        ScoreboardSnapshot {
            exit_generation: self.exit_generation(),
            slots,
        }
    }

    /// Write a JSON snapshot for external status readers.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub fn persist<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let json = serde_json::to_vec_pretty(&self.snapshot())?;
        std::fs::write(path, json).map_err(|e| Error::Scoreboard {
            code: ErrorCode::ScoreboardPersist,
            message: format!("Failed to write status file {}", path.display()),
            slot: None,
            source: Some(Box::new(e)),
        })
    }

    /// Write capability for `index`, handed to the worker that occupies it.
    pub(crate) fn handle(self: &Arc<Self>, index: usize) -> Result<SlotHandle> {
        self.slot(index)?;
        Ok(SlotHandle {
            board: Arc::clone(self),
            index,
        })
    }
}

/// Exclusive write access to one slot, owned by its worker.
#[derive(Debug)]
pub(crate) struct SlotHandle {
    board: Arc<Scoreboard>,
    index: usize,
}

impl SlotHandle {
    pub(crate) const fn index(&self) -> usize {
        self.index
    }

    pub(crate) fn board(&self) -> &Scoreboard {
        &self.board
    }

    pub(crate) fn update(&self, status: WorkerStatus, info: Option<&RequestInfo>) -> WorkerStatus {
        let slot = &self.board.slots[self.index];
        self.board.apply(self.index, slot, status, info)
    }

    pub(crate) fn increment(&self, bytes: u64) {
        let slot = &self.board.slots[self.index];
        self.board.bump(self.index, slot, bytes);
    }
}
