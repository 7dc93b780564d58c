//! In-process ledger
//!
//! `MemoryDatabase` mimics the parts of `PostgreSQL` the runner relies on:
//! a ledger table with a unique id, per-session advisory locking, and
//! transactions whose statements and ledger rows become visible together on
//! commit. Any number of sessions (including from other threads) share one
//! database, which makes it suitable for exercising concurrent deploys.
//!
//! Statements are not interpreted; committed SQL is appended to a schema log.
//! Fault injection hooks simulate failing statements, an unreachable server,
//! slow statements and stale ledger reads. A statement timeout cancels any
//! statement slower than it.

use crate::executor::DbError;
use crate::migration::ledger::{
    sort_entries, Connect, LedgerEntry, LedgerStore, LedgerTransaction, LEDGER_TABLE,
};
use crate::migration::MigrationError;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

#[derive(Debug, Default)]
struct MemoryState {
    ledger_exists: bool,
    entries: Vec<LedgerEntry>,
    schema_log: Vec<String>,
    lock_holder: Option<u64>,
    next_session: u64,
    unreachable: bool,
    failing_patterns: Vec<String>,
    statement_delay: Duration,
    statement_timeout: Option<Duration>,
    stale_reads: bool,
}

/// Shared in-process database; clones refer to the same data
#[derive(Debug, Clone, Default)]
pub struct MemoryDatabase {
    inner: Arc<Mutex<MemoryState>>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open a new session (equivalent to a new connection)
    pub fn open_session(&self) -> MemoryLedger {
        let mut state = self.state();
        state.next_session += 1;
        MemoryLedger {
            db: self.clone(),
            session: state.next_session,
        }
    }

    /// Refuse new connections
    pub fn set_unreachable(&self, unreachable: bool) {
        self.state().unreachable = unreachable;
    }

    /// Fail any statement batch containing `pattern`
    pub fn fail_statements_containing(&self, pattern: impl Into<String>) {
        self.state().failing_patterns.push(pattern.into());
    }

    pub fn clear_failures(&self) {
        self.state().failing_patterns.clear();
    }

    /// Sleep this long for every executed statement batch
    pub fn set_statement_delay(&self, delay: Duration) {
        self.state().statement_delay = delay;
    }

    /// Cancel statements running longer than `timeout`, like the session
    /// `statement_timeout` setting
    pub fn set_statement_timeout(&self, timeout: Option<Duration>) {
        self.state().statement_timeout = timeout;
    }

    /// Make `list_applied` return an empty ledger, as a session that cannot
    /// see another writer's commits would
    pub fn set_stale_reads(&self, stale: bool) {
        self.state().stale_reads = stale;
    }

    /// Write a ledger row directly, as an operator would
    pub fn insert_entry(&self, entry: LedgerEntry) {
        let mut state = self.state();
        state.ledger_exists = true;
        state.entries.push(entry);
    }

    /// Committed ledger rows, in ledger order
    pub fn entries(&self) -> Vec<LedgerEntry> {
        let mut entries = self.state().entries.clone();
        sort_entries(&mut entries);
        entries
    }

    /// Committed ledger ids in the order they were inserted
    pub fn recorded_ids(&self) -> Vec<String> {
        self.state().entries.iter().map(|e| e.id.clone()).collect()
    }

    /// Committed statement batches, in commit order
    pub fn schema_log(&self) -> Vec<String> {
        self.state().schema_log.clone()
    }

    pub fn ledger_exists(&self) -> bool {
        self.state().ledger_exists
    }

    pub fn is_locked(&self) -> bool {
        self.state().lock_holder.is_some()
    }
}

impl Connect for MemoryDatabase {
    fn connect(&self) -> Result<Box<dyn LedgerStore>, MigrationError> {
        if self.state().unreachable {
            return Err(MigrationError::Connection(
                "connection refused: in-memory database is unreachable".to_string(),
            ));
        }
        Ok(Box::new(self.open_session()))
    }
}

/// One session against a [`MemoryDatabase`]
///
/// Dropping the session releases its advisory lock, as closing a
/// `PostgreSQL` connection does.
#[derive(Debug)]
pub struct MemoryLedger {
    db: MemoryDatabase,
    session: u64,
}

impl Drop for MemoryLedger {
    fn drop(&mut self) {
        let mut state = self.db.state();
        if state.lock_holder == Some(self.session) {
            state.lock_holder = None;
        }
    }
}

impl LedgerStore for MemoryLedger {
    fn ensure_schema(&self) -> Result<(), MigrationError> {
        self.db.state().ledger_exists = true;
        Ok(())
    }

    fn list_applied(&self) -> Result<Vec<LedgerEntry>, MigrationError> {
        let state = self.db.state();
        if !state.ledger_exists {
            return Err(MigrationError::Ledger(DbError::Query(format!(
                "relation \"{LEDGER_TABLE}\" does not exist"
            ))));
        }
        if state.stale_reads {
            return Ok(Vec::new());
        }
        let mut entries = state.entries.clone();
        sort_entries(&mut entries);
        Ok(entries)
    }

    fn try_acquire_deployment_lock(&self) -> Result<bool, MigrationError> {
        let mut state = self.db.state();
        match state.lock_holder {
            None => {
                state.lock_holder = Some(self.session);
                Ok(true)
            }
            Some(holder) => Ok(holder == self.session),
        }
    }

    fn release_deployment_lock(&self) -> Result<(), MigrationError> {
        let mut state = self.db.state();
        if state.lock_holder == Some(self.session) {
            state.lock_holder = None;
        } else {
            log::warn!(
                "Advisory lock was not held by session {} when releasing",
                self.session
            );
        }
        Ok(())
    }

    fn begin(&self) -> Result<Box<dyn LedgerTransaction + '_>, DbError> {
        Ok(Box::new(MemoryTransaction {
            db: &self.db,
            statements: Vec::new(),
            entries: Vec::new(),
        }))
    }
}

/// Buffered transaction; nothing is visible until commit
struct MemoryTransaction<'a> {
    db: &'a MemoryDatabase,
    statements: Vec<String>,
    entries: Vec<LedgerEntry>,
}

impl LedgerTransaction for MemoryTransaction<'_> {
    fn execute_sql(&mut self, sql: &str) -> Result<(), DbError> {
        let (delay, timeout, failing) = {
            let state = self.db.state();
            let failing = state
                .failing_patterns
                .iter()
                .find(|p| sql.contains(p.as_str()))
                .cloned();
            (state.statement_delay, state.statement_timeout, failing)
        };
        if let Some(timeout) = timeout.filter(|t| delay > *t) {
            std::thread::sleep(timeout);
            return Err(DbError::Query(
                "canceling statement due to statement timeout".to_string(),
            ));
        }
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        if let Some(pattern) = failing {
            return Err(DbError::Query(format!("statement rejected near \"{pattern}\"")));
        }
        self.statements.push(sql.to_string());
        Ok(())
    }

    fn record_applied(&mut self, entry: &LedgerEntry) -> Result<(), MigrationError> {
        let state = self.db.state();
        if !state.ledger_exists {
            return Err(MigrationError::Ledger(DbError::Query(format!(
                "relation \"{LEDGER_TABLE}\" does not exist"
            ))));
        }
        let duplicate = state
            .entries
            .iter()
            .chain(self.entries.iter())
            .any(|e| e.id == entry.id);
        if duplicate {
            return Err(MigrationError::DuplicateApplication { id: entry.id.clone() });
        }
        drop(state);
        self.entries.push(entry.clone());
        Ok(())
    }

    fn commit(self: Box<Self>) -> Result<(), DbError> {
        let this = *self;
        let mut state = this.db.state();
        let duplicate = this
            .entries
            .iter()
            .find(|e| state.entries.iter().any(|c| c.id == e.id));
        if let Some(dup) = duplicate {
            return Err(DbError::UniqueViolation(format!(
                "duplicate key value violates unique constraint \"{LEDGER_TABLE}_pkey\" (id)=({})",
                dup.id
            )));
        }
        state.schema_log.extend(this.statements);
        state.entries.extend(this.entries);
        Ok(())
    }

    fn rollback(self: Box<Self>) -> Result<(), DbError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::MigrationDefinition;
    use chrono::Utc;

    fn entry(id: &str) -> LedgerEntry {
        let def = MigrationDefinition::new(id, "SELECT 1;").unwrap();
        LedgerEntry::for_definition(&def, Utc::now(), None)
    }

    #[test]
    fn test_list_applied_requires_schema() {
        let db = MemoryDatabase::new();
        let session = db.open_session();
        assert!(session.list_applied().is_err());
        session.ensure_schema().unwrap();
        session.ensure_schema().unwrap();
        assert!(session.list_applied().unwrap().is_empty());
    }

    #[test]
    fn test_commit_makes_statements_and_entry_visible_together() {
        let db = MemoryDatabase::new();
        let session = db.open_session();
        session.ensure_schema().unwrap();

        let mut tx = session.begin().unwrap();
        tx.execute_sql("CREATE TABLE users (id BIGINT);").unwrap();
        tx.record_applied(&entry("001_init")).unwrap();
        assert!(db.entries().is_empty());
        assert!(db.schema_log().is_empty());

        tx.commit().unwrap();
        assert_eq!(db.recorded_ids(), vec!["001_init"]);
        assert_eq!(db.schema_log(), vec!["CREATE TABLE users (id BIGINT);"]);
    }

    #[test]
    fn test_rollback_and_drop_discard_everything() {
        let db = MemoryDatabase::new();
        let session = db.open_session();
        session.ensure_schema().unwrap();

        let mut tx = session.begin().unwrap();
        tx.execute_sql("CREATE TABLE users (id BIGINT);").unwrap();
        tx.record_applied(&entry("001_init")).unwrap();
        tx.rollback().unwrap();

        let mut tx = session.begin().unwrap();
        tx.record_applied(&entry("001_init")).unwrap();
        drop(tx);

        assert!(db.entries().is_empty());
        assert!(db.schema_log().is_empty());
    }

    #[test]
    fn test_record_applied_rejects_duplicate_id() {
        let db = MemoryDatabase::new();
        let session = db.open_session();
        session.ensure_schema().unwrap();
        db.insert_entry(entry("001_init"));

        let mut tx = session.begin().unwrap();
        let err = tx.record_applied(&entry("001_init")).unwrap_err();
        assert!(matches!(err, MigrationError::DuplicateApplication { ref id } if id == "001_init"));
    }

    #[test]
    fn test_second_commit_of_same_id_is_unique_violation() {
        let db = MemoryDatabase::new();
        let a = db.open_session();
        let b = db.open_session();
        a.ensure_schema().unwrap();

        let mut tx_a = a.begin().unwrap();
        let mut tx_b = b.begin().unwrap();
        tx_a.record_applied(&entry("001_init")).unwrap();
        tx_b.record_applied(&entry("001_init")).unwrap();

        tx_a.commit().unwrap();
        let err = tx_b.commit().unwrap_err();
        assert!(err.is_unique_violation());
        assert_eq!(db.recorded_ids(), vec!["001_init"]);
    }

    #[test]
    fn test_statement_timeout_cancels_slow_statement() {
        let db = MemoryDatabase::new();
        db.set_statement_delay(Duration::from_secs(5));
        db.set_statement_timeout(Some(Duration::from_millis(20)));
        let session = db.open_session();
        let mut tx = session.begin().unwrap();

        let start = std::time::Instant::now();
        let err = tx.execute_sql("LOCK TABLE users;").unwrap_err();
        assert!(err.to_string().contains("statement timeout"));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_failing_statement_pattern() {
        let db = MemoryDatabase::new();
        db.fail_statements_containing("streaks");
        let session = db.open_session();
        let mut tx = session.begin().unwrap();
        let err = tx.execute_sql("CREATE TABLE streaks (id BIGINT);").unwrap_err();
        assert!(err.to_string().contains("statement rejected near \"streaks\""));
    }

    #[test]
    fn test_lock_is_per_session_and_released_on_drop() {
        let db = MemoryDatabase::new();
        let a = db.open_session();
        let b = db.open_session();
        assert!(a.try_acquire_deployment_lock().unwrap());
        assert!(a.try_acquire_deployment_lock().unwrap());
        assert!(!b.try_acquire_deployment_lock().unwrap());
        drop(a);
        assert!(b.try_acquire_deployment_lock().unwrap());
    }

    #[test]
    fn test_unreachable_database_refuses_connections() {
        let db = MemoryDatabase::new();
        db.set_unreachable(true);
        assert!(matches!(db.connect().err().unwrap(), MigrationError::Connection(_)));
    }
}
