//! Deployment lock acquisition with a bounded wait

use crate::migration::ledger::LedgerStore;
use crate::migration::MigrationError;
use std::time::{Duration, Instant};

/// Floor for the delay between lock attempts
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Lock guard that releases the deployment lock when dropped
///
/// This ensures the lock is released on every exit path of a run, including
/// errors and cancellation.
pub struct DeploymentLockGuard<'a> {
    store: &'a dyn LedgerStore,
    released: bool,
}

impl<'a> DeploymentLockGuard<'a> {
    /// Acquire the deployment lock, polling until held or `timeout` elapses
    ///
    /// # How It Works
    ///
    /// 1. Try the lock once
    /// 2. If another session holds it, sleep `poll_interval` (at least
    ///    [`MIN_POLL_INTERVAL`]) and retry
    /// 3. Give up with `LockTimeout` once `timeout` has elapsed
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::LockTimeout` if the lock cannot be acquired,
    /// or the store's error if the lock query itself fails.
    pub fn acquire(
        store: &'a dyn LedgerStore,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<Self, MigrationError> {
        let start = Instant::now();
        let poll_interval = poll_interval.max(MIN_POLL_INTERVAL);
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            if store.try_acquire_deployment_lock()? {
                log::debug!(
                    "Deployment lock acquired after {} attempt(s) in {:?}",
                    attempts,
                    start.elapsed()
                );
                return Ok(Self {
                    store,
                    released: false,
                });
            }

            let waited = start.elapsed();
            if waited >= timeout {
                return Err(MigrationError::LockTimeout { waited });
            }
            if attempts == 1 {
                log::info!("Waiting for deployment lock held by another process...");
            }

            std::thread::sleep(poll_interval.min(timeout - waited));
        }
    }

    /// Release the lock now, reporting failures
    ///
    /// # Errors
    ///
    /// Returns the store's error if the unlock fails.
    pub fn release(mut self) -> Result<(), MigrationError> {
        self.released = true;
        self.store.release_deployment_lock()
    }
}

impl Drop for DeploymentLockGuard<'_> {
    fn drop(&mut self) {
        if !self.released {
            // Can't propagate from drop; the session-scoped lock also dies with the connection.
            if let Err(e) = self.store.release_deployment_lock() {
                log::warn!("Failed to release deployment lock: {}", e);
            }
        }
    }
}
