//! Migration runner: the state machine driving a deploy
//!
//! A runner owns one ledger session. `initialize()` connects and makes sure
//! the ledger table exists; `check_status()` diffs without locking;
//! `run_migrations()` serializes against other deploy processes through the
//! deployment lock and applies each pending migration in its own transaction.

use crate::config::MigrationsConfig;
use crate::migration::ledger::{Connect, LedgerEntry, LedgerStore, LedgerTransaction};
use crate::migration::lock::DeploymentLockGuard;
use crate::migration::source::MigrationSource;
use crate::migration::status::{MigrationState, MigrationStatus, RunSummary};
use crate::migration::{MigrationDefinition, MigrationError};
use chrono::Utc;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Lifecycle state of a [`MigrationRunner`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
    Uninitialized,
    /// Initialized, no run completed yet
    Connected,
    /// Connected, last run completed
    Idle,
    Diffing,
    Applying,
    /// An operation failed; `initialize()` must be called again
    Failed,
}

impl fmt::Display for RunnerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunnerState::Uninitialized => "uninitialized",
            RunnerState::Connected => "connected",
            RunnerState::Idle => "idle",
            RunnerState::Diffing => "diffing",
            RunnerState::Applying => "applying",
            RunnerState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Deployment lock behaviour of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunnerOptions {
    /// Give up waiting for the deployment lock after this long
    pub lock_timeout: Duration,
    /// Delay between lock attempts
    pub lock_poll_interval: Duration,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(60),
            lock_poll_interval: Duration::from_millis(100),
        }
    }
}

impl From<&MigrationsConfig> for RunnerOptions {
    fn from(config: &MigrationsConfig) -> Self {
        Self {
            lock_timeout: config.lock_timeout(),
            lock_poll_interval: config.lock_poll_interval(),
        }
    }
}

/// Cooperative cancellation shared between a runner and its caller
///
/// Checked before each migration starts and again before it commits.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Set the flag once `deadline` has elapsed
    pub fn cancel_after(&self, deadline: Duration) {
        let flag = self.clone();
        std::thread::spawn(move || {
            std::thread::sleep(deadline);
            if !flag.is_cancelled() {
                log::warn!("Run deadline of {:?} reached, cancelling", deadline);
                flag.cancel();
            }
        });
    }
}

/// Applies migrations from a [`MigrationSource`] to a ledger
pub struct MigrationRunner {
    connector: Box<dyn Connect>,
    source: Box<dyn MigrationSource>,
    options: RunnerOptions,
    cancel: CancelFlag,
    store: Option<Box<dyn LedgerStore>>,
    state: RunnerState,
}

impl MigrationRunner {
    pub fn new(
        connector: impl Connect + 'static,
        source: impl MigrationSource + 'static,
    ) -> Self {
        Self {
            connector: Box::new(connector),
            source: Box::new(source),
            options: RunnerOptions::default(),
            cancel: CancelFlag::new(),
            store: None,
            state: RunnerState::Uninitialized,
        }
    }

    #[must_use]
    pub fn with_options(mut self, options: RunnerOptions) -> Self {
        self.options = options;
        self
    }

    #[must_use]
    pub fn with_cancel_flag(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn state(&self) -> RunnerState {
        self.state
    }

    pub fn options(&self) -> &RunnerOptions {
        &self.options
    }

    pub fn cancel_flag(&self) -> &CancelFlag {
        &self.cancel
    }

    /// Where definitions are read from, for diagnostics
    pub fn source_location(&self) -> String {
        self.source.location()
    }

    /// Connect and create the ledger table if it does not exist
    ///
    /// Allowed from any state; a previous session is closed first.
    ///
    /// # Errors
    ///
    /// Returns `Connection` if the database cannot be reached, or `Ledger`
    /// if the ledger table cannot be created. The runner is `Failed` after.
    pub fn initialize(&mut self) -> Result<(), MigrationError> {
        self.store = None;

        let result = self.connector.connect().and_then(|store| {
            store.ensure_schema()?;
            Ok(store)
        });

        match result {
            Ok(store) => {
                self.store = Some(store);
                self.state = RunnerState::Connected;
                log::debug!("Migration runner connected; source: {}", self.source.location());
                Ok(())
            }
            Err(e) => {
                self.state = RunnerState::Failed;
                Err(e)
            }
        }
    }

    /// Diff the source against the ledger without taking the lock
    ///
    /// Read-only and lock-free, so it may run while another deploy holds the
    /// deployment lock. The state is left unchanged on success.
    ///
    /// # Errors
    ///
    /// Returns `NotConnected` unless the runner is connected or idle (state
    /// is left unchanged). A source or ledger read error moves the runner to
    /// `Failed` like any other operation error: the session may be broken,
    /// so it is closed and must be re-initialized.
    pub fn check_status(&mut self) -> Result<MigrationStatus, MigrationError> {
        let store = connected(self.state, &self.store)?;
        let result = diff(store, self.source.as_ref());
        if result.is_err() {
            self.fail();
        }
        result
    }

    /// Apply every pending migration, in ascending version order
    ///
    /// # Errors
    ///
    /// Returns `NotConnected` unless the runner is connected. Otherwise any
    /// error leaves earlier migrations of this run committed, rolls back the
    /// failing one, and moves the runner to `Failed`.
    pub fn run_migrations(&mut self) -> Result<RunSummary, MigrationError> {
        #[cfg(feature = "tracing")]
        let _span =
            tracing::info_span!("run_migrations", source = %self.source.location()).entered();

        let store = connected(self.state, &self.store)?;
        let result = execute_run(
            store,
            self.source.as_ref(),
            &self.options,
            &self.cancel,
            &mut self.state,
        );
        match result {
            Ok(summary) => {
                self.state = RunnerState::Idle;
                Ok(summary)
            }
            Err(e) => {
                self.fail();
                Err(e)
            }
        }
    }

    fn fail(&mut self) {
        self.state = RunnerState::Failed;
        // Closing the session also drops any advisory lock it still holds.
        self.store = None;
    }
}

fn connected(
    state: RunnerState,
    store: &Option<Box<dyn LedgerStore>>,
) -> Result<&dyn LedgerStore, MigrationError> {
    match (state, store.as_deref()) {
        (RunnerState::Connected | RunnerState::Idle, Some(store)) => Ok(store),
        (state, _) => Err(MigrationError::NotConnected { state }),
    }
}

fn diff(
    store: &dyn LedgerStore,
    source: &dyn MigrationSource,
) -> Result<MigrationStatus, MigrationError> {
    let definitions = source.list()?;
    let applied = store.list_applied()?;
    Ok(MigrationStatus::compute(&definitions, &applied))
}

fn execute_run(
    store: &dyn LedgerStore,
    source: &dyn MigrationSource,
    options: &RunnerOptions,
    cancel: &CancelFlag,
    state: &mut RunnerState,
) -> Result<RunSummary, MigrationError> {
    let lock =
        DeploymentLockGuard::acquire(store, options.lock_timeout, options.lock_poll_interval)?;

    *state = RunnerState::Diffing;
    let definitions = source.list()?;
    let applied = store.list_applied()?;
    let status = MigrationStatus::compute(&definitions, &applied);

    if status.has_drift() {
        return Err(MigrationError::DriftDetected(status.drifted()));
    }
    for orphan in &status.orphaned {
        log::warn!(
            "Ledger entry '{}' has no matching migration definition; leaving it untouched",
            orphan.id
        );
    }

    let pending: Vec<&MigrationDefinition> = definitions
        .iter()
        .zip(&status.migrations)
        .filter(|(_, m)| m.status == MigrationState::Pending)
        .map(|(d, _)| d)
        .collect();

    if pending.is_empty() {
        log::debug!("Schema is up to date ({} migration(s) applied)", status.executed);
        release(lock);
        return Ok(RunSummary {
            executed: 0,
            total: status.total,
            applied: Vec::new(),
        });
    }

    *state = RunnerState::Applying;
    let latest_applied = status.latest_applied_version();
    let mut applied_ids = Vec::with_capacity(pending.len());

    for definition in pending {
        if cancel.is_cancelled() {
            return Err(MigrationError::Cancelled {
                id: definition.id().to_string(),
            });
        }
        if let Some(latest) = latest_applied {
            if definition.version() < latest {
                log::warn!(
                    "Applying '{}' out of order: version {} is below latest applied version {}",
                    definition.id(),
                    definition.version(),
                    latest
                );
            }
        }

        apply_migration(store, definition, cancel)?;
        applied_ids.push(definition.id().to_string());
    }

    release(lock);
    Ok(RunSummary {
        executed: applied_ids.len(),
        total: status.total,
        applied: applied_ids,
    })
}

/// Run one migration and its ledger insert in a single transaction
fn apply_migration(
    store: &dyn LedgerStore,
    definition: &MigrationDefinition,
    cancel: &CancelFlag,
) -> Result<(), MigrationError> {
    #[cfg(feature = "tracing")]
    let _span = tracing::info_span!(
        "apply_migration",
        id = definition.id(),
        version = definition.version()
    )
    .entered();

    let id = definition.id();
    let failed = |cause: String| MigrationError::MigrationFailed {
        id: id.to_string(),
        cause,
    };

    let mut tx = store.begin().map_err(|e| failed(e.to_string()))?;
    let start = Instant::now();

    if let Err(e) = tx.execute_sql(definition.sql()) {
        rollback_quietly(tx, id);
        return Err(failed(e.to_string()));
    }
    let execution_time_ms = i64::try_from(start.elapsed().as_millis()).ok();

    if cancel.is_cancelled() {
        rollback_quietly(tx, id);
        return Err(MigrationError::Cancelled { id: id.to_string() });
    }

    let entry = LedgerEntry::for_definition(definition, Utc::now(), execution_time_ms);
    if let Err(e) = tx.record_applied(&entry) {
        rollback_quietly(tx, id);
        return Err(match e {
            MigrationError::DuplicateApplication { .. } => {
                log::error!("{}", e);
                e
            }
            other => failed(other.to_string()),
        });
    }

    tx.commit().map_err(|e| {
        if e.is_unique_violation() {
            let dup = MigrationError::DuplicateApplication { id: id.to_string() };
            log::error!("{}", dup);
            dup
        } else {
            failed(e.to_string())
        }
    })?;

    log::info!(
        "Applied migration {} ({}ms)",
        id,
        execution_time_ms.map_or_else(|| "?".to_string(), |ms| ms.to_string())
    );
    Ok(())
}

fn rollback_quietly(tx: Box<dyn LedgerTransaction + '_>, id: &str) {
    if let Err(e) = tx.rollback() {
        log::warn!("Rollback of migration {} failed: {}", id, e);
    }
}

fn release(lock: DeploymentLockGuard<'_>) {
    // The work is committed; an unlock failure only delays the next deploy.
    if let Err(e) = lock.release() {
        log::warn!("Failed to release deployment lock: {}", e);
    }
}
