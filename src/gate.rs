//! Admission gate.
//!
//! Serializes the "wait for a readable listener, accept" step across workers so
//! that only one worker polls the shared listeners at a time. The gate is an
//! async mutex held in an [`ArcSwap`]: re-initialising it on restart swaps in a
//! fresh primitive, leaving workers of the old generation with the one they
//! already hold. With serialization disabled every acquire succeeds at once.

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info};

use crate::config::AdmissionConfig;
use crate::error::Result;
use crate::lock::{expand_lock_path, GateLock};

/// Exclusive admission rights, released on drop.
#[derive(Debug)]
#[must_use = "admission is released as soon as the permit is dropped"]
pub struct AdmissionPermit {
    guard: Option<OwnedMutexGuard<()>>,
}

impl AdmissionPermit {
    /// Whether this permit excludes other workers (false when the gate is a no-op).
    #[must_use]
    pub const fn is_exclusive(&self) -> bool {
        self.guard.is_some()
    }

    /// Relinquish admission rights.
    pub fn release(self) {
        drop(self);
    }
}

/// Cross-worker mutual exclusion around the accept step.
#[derive(Debug)]
pub struct AdmissionGate {
    mutex: ArcSwap<tokio::sync::Mutex<()>>,
    serialize: AtomicBool,
    lock: Mutex<Option<GateLock>>,
    lock_base: Mutex<Option<PathBuf>>,
    epoch: AtomicU64,
}

impl AdmissionGate {
    /// Create the gate described by `config`.
    ///
    /// # Errors
    ///
    /// Returns a fatal admission error if the configured lock file cannot be
    /// created or locked.
    pub fn new(config: &AdmissionConfig) -> Result<Self> {
        let gate = Self::disabled();
        gate.reinit(config)?;
        Ok(gate)
    }

    /// A gate that never excludes anyone.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            mutex: ArcSwap::from_pointee(tokio::sync::Mutex::new(())),
            serialize: AtomicBool::new(false),
            lock: Mutex::new(None),
            lock_base: Mutex::new(None),
            epoch: AtomicU64::new(0),
        }
    }

    /// Wait until the caller holds exclusive admission rights.
    pub async fn acquire(&self) -> AdmissionPermit {
        if !self.serialize.load(Ordering::Acquire) {
            return AdmissionPermit { guard: None };
        }
        let mutex = self.mutex.load_full();
        AdmissionPermit {
            guard: Some(mutex.lock_owned().await),
        }
    }

    /// Take admission rights only if nobody holds them.
    #[must_use]
    pub fn try_acquire(&self) -> Option<AdmissionPermit> {
        if !self.serialize.load(Ordering::Acquire) {
            return Some(AdmissionPermit { guard: None });
        }
        let mutex = self.mutex.load_full();
        mutex
            .try_lock_owned()
            .ok()
            .map(|guard| AdmissionPermit { guard: Some(guard) })
    }

    /// Re-initialise for a new generation.
    ///
    /// Permits handed out before the call stay valid but no longer exclude
    /// permits handed out after it.
    ///
    /// # Errors
    ///
    /// Returns a fatal admission error if a newly configured lock file cannot
    /// be created or locked. The previous lock is kept in that case.
    pub fn reinit(&self, config: &AdmissionConfig) -> Result<()> {
        {
            let mut base = self.lock_base.lock();
            if *base != config.lock_file {
                let next = match config.lock_file.as_deref() {
                    Some(path) => Some(GateLock::acquire(expand_lock_path(path))?),
                    None => None,
                };
                if let Some(ref lock) = next {
                    info!(path = %lock.path().display(), "admission lock file created");
                }
                *self.lock.lock() = next;
                base.clone_from(&config.lock_file);
            }
        }

        self.mutex.store(Arc::new(tokio::sync::Mutex::new(())));
        self.serialize.store(config.serialize, Ordering::Release);
        let epoch = self.epoch.fetch_add(1, Ordering::AcqRel) + 1;
        debug!(epoch, serialize = config.serialize, "admission gate initialised");
        Ok(())
    }

    /// Whether acquiring excludes other workers.
    #[must_use]
    pub fn is_serialized(&self) -> bool {
        self.serialize.load(Ordering::Acquire)
    }

    /// Path of the lock file currently held, if any.
    #[must_use]
    pub fn lock_path(&self) -> Option<PathBuf> {
        self.lock.lock().as_ref().map(|lock| lock.path().to_path_buf())
    }

    /// Number of times the gate has been initialised.
    #[must_use]
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn serialized() -> AdmissionConfig {
        AdmissionConfig {
            serialize: true,
            lock_file: None,
        }
    }

    #[tokio::test]
    async fn test_only_one_holder_at_a_time() {
        let test_result = tokio::time::timeout(Duration::from_secs(5), async {
            let gate = Arc::new(AdmissionGate::new(&serialized()).unwrap());
            let inside = Arc::new(AtomicUsize::new(0));
            let peak = Arc::new(AtomicUsize::new(0));

            let mut tasks = Vec::new();
            for _ in 0..8 {
                let gate = Arc::clone(&gate);
                let inside = Arc::clone(&inside);
                let peak = Arc::clone(&peak);
                tasks.push(tokio::spawn(async move {
                    for _ in 0..20 {
                        let permit = gate.acquire().await;
                        assert!(permit.is_exclusive());
                        let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::task::yield_now().await;
                        inside.fetch_sub(1, Ordering::SeqCst);
                        permit.release();
                    }
                }));
            }
            for task in tasks {
                task.await.unwrap();
            }
            assert_eq!(peak.load(Ordering::SeqCst), 1);
        })
        .await;
        assert!(test_result.is_ok(), "Test timed out after 5 seconds");
    }

    #[tokio::test]
    async fn test_disabled_gate_is_a_no_op() {
        let gate = AdmissionGate::disabled();
        let first = gate.acquire().await;
        let second = gate.acquire().await;
        assert!(!first.is_exclusive());
        assert!(!second.is_exclusive());
        assert!(!gate.is_serialized());
    }

    #[tokio::test]
    async fn test_reinit_detaches_old_holders() {
        let gate = AdmissionGate::new(&serialized()).unwrap();
        let old = gate.acquire().await;
        assert!(gate.try_acquire().is_none());

        gate.reinit(&serialized()).unwrap();
        let fresh = gate.try_acquire();
        assert!(fresh.is_some());
        assert_eq!(gate.epoch(), 2);
        drop(old);
    }

    #[test]
    fn test_lock_file_is_held_and_fatal_when_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let config = AdmissionConfig {
            serialize: true,
            lock_file: Some(dir.path().join("accept.lock")),
        };
        let gate = AdmissionGate::new(&config).unwrap();
        let path = gate.lock_path().unwrap();
        assert!(path.exists());

        // same pid, same path: the second gate cannot take the lock
        let err = AdmissionGate::new(&config).unwrap_err();
        assert!(err.is_fatal_startup());

        drop(gate);
        assert!(!path.exists());

        let missing = AdmissionConfig {
            serialize: true,
            lock_file: Some(PathBuf::from("/nonexistent-dir/accept.lock")),
        };
        assert!(AdmissionGate::new(&missing).is_err());
    }
}
