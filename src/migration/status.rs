//! Migration status: the diff between definitions and the ledger

use crate::migration::{LedgerEntry, MigrationDefinition};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;

/// State of one known migration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MigrationState {
    /// Recorded in the ledger with a matching checksum
    Applied,
    /// Not yet recorded
    Pending,
    /// Recorded, but the definition's content changed since
    Drifted,
}

impl fmt::Display for MigrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MigrationState::Applied => "applied",
            MigrationState::Pending => "pending",
            MigrationState::Drifted => "drifted",
        };
        f.write_str(s)
    }
}

/// Per-migration line of a [`MigrationStatus`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationStatusEntry {
    pub id: String,
    pub version: i64,
    pub executed: bool,
    pub status: MigrationState,
    /// Checksum of the current definition
    pub checksum: String,
    /// Checksum recorded in the ledger, if applied
    pub recorded_checksum: Option<String>,
    pub applied_at: Option<DateTime<Utc>>,
}

/// A migration whose recorded checksum no longer matches its definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DriftedMigration {
    pub id: String,
    pub stored_checksum: String,
    pub current_checksum: String,
}

/// Migration status information
///
/// Computed fresh on every query; it is a snapshot and may be stale by the
/// time the caller reads it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationStatus {
    /// Number of known definitions
    pub total: usize,

    /// Definitions with a ledger entry (applied or drifted)
    pub executed: usize,

    /// Definitions without a ledger entry
    pub pending: usize,

    /// One line per definition, ascending by version
    pub migrations: Vec<MigrationStatusEntry>,

    /// Ledger entries with no current definition (retired migrations)
    pub orphaned: Vec<LedgerEntry>,
}

impl MigrationStatus {
    /// Diff `definitions` (sorted ascending) against the `applied` ledger entries
    #[must_use]
    pub fn compute(definitions: &[MigrationDefinition], applied: &[LedgerEntry]) -> Self {
        let by_id: HashMap<&str, &LedgerEntry> =
            applied.iter().map(|e| (e.id.as_str(), e)).collect();

        let migrations: Vec<MigrationStatusEntry> = definitions
            .iter()
            .map(|def| {
                let record = by_id.get(def.id());
                let status = match record {
                    None => MigrationState::Pending,
                    Some(r) if r.checksum == def.checksum() => MigrationState::Applied,
                    Some(_) => MigrationState::Drifted,
                };
                MigrationStatusEntry {
                    id: def.id().to_string(),
                    version: def.version(),
                    executed: record.is_some(),
                    status,
                    checksum: def.checksum().to_string(),
                    recorded_checksum: record.map(|r| r.checksum.clone()),
                    applied_at: record.map(|r| r.applied_at),
                }
            })
            .collect();

        let known: HashMap<&str, ()> = definitions.iter().map(|d| (d.id(), ())).collect();
        let orphaned = applied
            .iter()
            .filter(|e| !known.contains_key(e.id.as_str()))
            .cloned()
            .collect();

        let executed = migrations.iter().filter(|m| m.executed).count();
        Self {
            total: migrations.len(),
            executed,
            pending: migrations.len() - executed,
            migrations,
            orphaned,
        }
    }

    /// Check if all known migrations are applied
    #[must_use]
    pub fn is_up_to_date(&self) -> bool {
        self.pending == 0
    }

    #[must_use]
    pub fn has_drift(&self) -> bool {
        self.migrations.iter().any(|m| m.status == MigrationState::Drifted)
    }

    /// Every drifted migration with both checksums
    #[must_use]
    pub fn drifted(&self) -> Vec<DriftedMigration> {
        self.migrations
            .iter()
            .filter(|m| m.status == MigrationState::Drifted)
            .map(|m| DriftedMigration {
                id: m.id.clone(),
                stored_checksum: m.recorded_checksum.clone().unwrap_or_default(),
                current_checksum: m.checksum.clone(),
            })
            .collect()
    }

    /// Pending migrations in application order
    pub fn pending_ids(&self) -> impl Iterator<Item = &str> {
        self.migrations
            .iter()
            .filter(|m| m.status == MigrationState::Pending)
            .map(|m| m.id.as_str())
    }

    /// Get the latest applied migration version
    #[must_use]
    pub fn latest_applied_version(&self) -> Option<i64> {
        self.migrations.iter().filter(|m| m.executed).map(|m| m.version).max()
    }

    /// Get the next pending migration version
    #[must_use]
    pub fn next_pending_version(&self) -> Option<i64> {
        self.migrations
            .iter()
            .find(|m| m.status == MigrationState::Pending)
            .map(|m| m.version)
    }
}

/// Result of one `run_migrations()` call
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    /// Migrations applied by this run
    pub executed: usize,
    /// All known definitions
    pub total: usize,
    /// Ids applied by this run, in order
    pub applied: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defs() -> Vec<MigrationDefinition> {
        [
            ("001_init", "CREATE TABLE users (id BIGINT);"),
            ("002_add_badges", "CREATE TABLE badges (id BIGINT);"),
            ("003_add_streaks", "CREATE TABLE streaks (id BIGINT);"),
        ]
        .into_iter()
        .map(|(id, sql)| MigrationDefinition::new(id, sql).unwrap())
        .collect()
    }

    fn applied(def: &MigrationDefinition) -> LedgerEntry {
        LedgerEntry::for_definition(def, Utc::now(), Some(1))
    }

    #[test]
    fn test_fresh_database_is_all_pending() {
        let status = MigrationStatus::compute(&defs(), &[]);
        assert_eq!((status.total, status.executed, status.pending), (3, 0, 3));
        assert!(status
            .migrations
            .iter()
            .all(|m| m.status == MigrationState::Pending && !m.executed));
        assert_eq!(status.next_pending_version(), Some(1));
        assert_eq!(status.latest_applied_version(), None);
        assert!(!status.is_up_to_date());
    }

    #[test]
    fn test_partially_applied() {
        let defs = defs();
        let status = MigrationStatus::compute(&defs, &[applied(&defs[0])]);
        assert_eq!((status.total, status.executed, status.pending), (3, 1, 2));
        assert_eq!(status.migrations[0].status, MigrationState::Applied);
        assert!(status.migrations[0].applied_at.is_some());
        assert_eq!(
            status.pending_ids().collect::<Vec<_>>(),
            vec!["002_add_badges", "003_add_streaks"]
        );
        assert_eq!(status.latest_applied_version(), Some(1));
    }

    #[test]
    fn test_changed_checksum_is_drifted() {
        let defs = defs();
        let mut entry = applied(&defs[1]);
        entry.checksum = "0".repeat(64);
        let status = MigrationStatus::compute(&defs, &[applied(&defs[0]), entry]);

        assert!(status.has_drift());
        assert_eq!(status.migrations[1].status, MigrationState::Drifted);
        assert!(status.migrations[1].executed);
        assert_eq!(status.executed, 2);

        let drifted = status.drifted();
        assert_eq!(drifted.len(), 1);
        assert_eq!(drifted[0].id, "002_add_badges");
        assert_eq!(drifted[0].stored_checksum, "0".repeat(64));
        assert_eq!(drifted[0].current_checksum, defs[1].checksum());
    }

    #[test]
    fn test_retired_ledger_entry_is_orphaned() {
        let defs = defs();
        let retired = MigrationDefinition::new("000_legacy", "SELECT 1;").unwrap();
        let status = MigrationStatus::compute(&defs, &[applied(&retired), applied(&defs[0])]);
        assert_eq!(status.orphaned.len(), 1);
        assert_eq!(status.orphaned[0].id, "000_legacy");
        assert_eq!(status.executed, 1);
        assert_eq!(status.total, 3);
    }

    #[test]
    fn test_status_serializes_lowercase_states() {
        let status = MigrationStatus::compute(&defs(), &[]);
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["total"], 3);
        assert_eq!(json["migrations"][0]["status"], "pending");
        assert_eq!(json["migrations"][0]["executed"], false);
    }
}
