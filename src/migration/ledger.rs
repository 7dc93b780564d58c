//! Ledger store: the persisted record of applied migrations
//!
//! The ledger is the single shared mutable resource of the migration system.
//! Every write goes through [`LedgerTransaction::record_applied`] inside the
//! same transaction that performs the schema change.

use crate::executor::DbError;
use crate::migration::{MigrationDefinition, MigrationError};
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Name of the ledger table created by [`LedgerStore::ensure_schema`]
pub const LEDGER_TABLE: &str = "questline_migrations";

/// One applied migration, as recorded in the ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LedgerEntry {
    /// Migration id (unique)
    pub id: String,

    /// Ordering key at the time of application
    pub version: i64,

    /// `SHA-256` checksum of the migration content when it was applied
    pub checksum: String,

    /// When the migration was applied
    pub applied_at: DateTime<Utc>,

    /// Execution time in milliseconds (`None` if not recorded)
    pub execution_time_ms: Option<i64>,
}

impl LedgerEntry {
    /// Create the entry recording `definition` as applied
    #[must_use]
    pub fn for_definition(
        definition: &MigrationDefinition,
        applied_at: DateTime<Utc>,
        execution_time_ms: Option<i64>,
    ) -> Self {
        Self {
            id: definition.id().to_string(),
            version: definition.version(),
            checksum: definition.checksum().to_string(),
            applied_at,
            execution_time_ms,
        }
    }
}

/// Connection-level ledger operations
///
/// Implementations hold one database session. The deployment lock is scoped
/// to that session: closing the connection releases it.
pub trait LedgerStore: Send {
    /// Create the ledger table if absent. Safe to call on every initialize.
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::Ledger` if the DDL fails.
    fn ensure_schema(&self) -> Result<(), MigrationError>;

    /// Applied entries, ascending by `applied_at`, ties broken by id
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::Ledger` if the ledger cannot be read.
    fn list_applied(&self) -> Result<Vec<LedgerEntry>, MigrationError>;

    /// Try once to take the database-wide deployment lock
    ///
    /// Returns `Ok(false)` when another session holds it.
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::Ledger` if the lock query fails.
    fn try_acquire_deployment_lock(&self) -> Result<bool, MigrationError>;

    /// Release the deployment lock held by this session
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::Ledger` if the unlock query fails.
    fn release_deployment_lock(&self) -> Result<(), MigrationError>;

    /// Open a transaction for one migration
    ///
    /// # Errors
    ///
    /// Returns `DbError` if the transaction cannot be started.
    fn begin(&self) -> Result<Box<dyn LedgerTransaction + '_>, DbError>;
}

/// A transaction spanning one migration's statements and its ledger row
///
/// Dropping an open transaction rolls it back.
pub trait LedgerTransaction {
    /// Run the migration's statements
    ///
    /// # Errors
    ///
    /// Returns the database error of the first failing statement.
    fn execute_sql(&mut self, sql: &str) -> Result<(), DbError>;

    /// Insert `entry` into the ledger within this transaction
    ///
    /// # Errors
    ///
    /// Returns `DuplicateApplication` when the id is already recorded and
    /// `MigrationError::Ledger` for any other insert failure.
    fn record_applied(&mut self, entry: &LedgerEntry) -> Result<(), MigrationError>;

    /// # Errors
    ///
    /// Returns `DbError` if the commit fails; nothing is applied in that case.
    fn commit(self: Box<Self>) -> Result<(), DbError>;

    /// # Errors
    ///
    /// Returns `DbError` if the rollback statement fails.
    fn rollback(self: Box<Self>) -> Result<(), DbError>;
}

/// Opens ledger sessions for the runner
pub trait Connect: Send + Sync {
    /// # Errors
    ///
    /// Returns `MigrationError::Connection` if the database is unreachable or
    /// the credentials are invalid.
    fn connect(&self) -> Result<Box<dyn LedgerStore>, MigrationError>;
}

/// Sort entries the way every ledger reports them
pub(crate) fn sort_entries(entries: &mut [LedgerEntry]) {
    entries.sort_by(|a, b| a.applied_at.cmp(&b.applied_at).then_with(|| a.id.cmp(&b.id)));
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn entry(id: &str, secs: i64) -> LedgerEntry {
        LedgerEntry {
            id: id.to_string(),
            version: 0,
            checksum: String::new(),
            applied_at: Utc.timestamp_opt(secs, 0).unwrap(),
            execution_time_ms: None,
        }
    }

    #[test]
    fn test_sort_entries_by_applied_at_then_id() {
        let mut entries = vec![entry("003_c", 20), entry("002_b", 10), entry("001_a", 10)];
        sort_entries(&mut entries);
        let ids: Vec<_> = entries.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["001_a", "002_b", "003_c"]);
    }

    #[test]
    fn test_for_definition_copies_checksum() {
        let def =
            MigrationDefinition::new("002_add_badges", "CREATE TABLE badges (id BIGINT);").unwrap();
        let e = LedgerEntry::for_definition(&def, Utc::now(), Some(12));
        assert_eq!(e.id, "002_add_badges");
        assert_eq!(e.version, 2);
        assert_eq!(e.checksum, def.checksum());
        assert_eq!(e.execution_time_ms, Some(12));
    }
}
