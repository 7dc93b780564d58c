//! Migration-specific error types

use crate::executor::DbError;
use crate::migration::runner::RunnerState;
use crate::migration::status::DriftedMigration;
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by the migration source, ledger and runner
#[derive(Debug, Error)]
pub enum MigrationError {
    /// Database unreachable or credentials rejected
    #[error("Cannot connect to database: {0}")]
    Connection(String),

    /// The migration definitions could not be read
    #[error("Migration source '{location}' is unavailable: {reason}")]
    SourceUnavailable { location: String, reason: String },

    /// A migration definition is malformed or conflicts with another
    #[error("Invalid migration definition: {0}")]
    InvalidDefinition(String),

    /// The deployment lock was not acquired in time
    #[error(
        "Migration lock timeout: deployment lock not acquired within {waited:?}.\n\
         Another process may be running migrations. If this persists, check for:\n\
         - Stuck migration process\n\
         - Idle sessions holding the advisory lock (pg_locks where locktype = 'advisory')"
    )]
    LockTimeout { waited: Duration },

    /// Applied migrations were modified after being applied
    #[error("{}", describe_drift(.0))]
    DriftDetected(Vec<DriftedMigration>),

    /// A migration's statements or its ledger insert failed
    #[error("Migration '{id}' failed during execution: {cause}")]
    MigrationFailed { id: String, cause: String },

    /// The ledger already holds this id; the deployment lock was bypassed
    #[error(
        "Migration '{id}' has already been recorded in the ledger by another process.\n\
         The deployment lock did not serialize this run."
    )]
    DuplicateApplication { id: String },

    /// The run was cancelled before the migration committed
    #[error("Migration run cancelled; '{id}' was not applied")]
    Cancelled { id: String },

    /// The runner must be initialized before use
    #[error("Migration runner is not connected (state: {state}); call initialize() first")]
    NotConnected { state: RunnerState },

    /// Ledger read, lock or bookkeeping failure
    #[error("Ledger error: {0}")]
    Ledger(#[from] DbError),
}

fn describe_drift(drifted: &[DriftedMigration]) -> String {
    let mut message = format!(
        "{} applied migration(s) have been modified after being applied:",
        drifted.len()
    );
    for d in drifted {
        message.push_str(&format!(
            "\n  - '{}': stored checksum {}, current checksum {}",
            d.id, d.stored_checksum, d.current_checksum
        ));
    }
    message.push_str(
        "\nThis indicates the migration was edited after deployment; \
         operator intervention is required.",
    );
    message
}

impl MigrationError {
    /// Stable machine-readable error kind for deploy tooling
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            MigrationError::Connection(_) => "connection_error",
            MigrationError::SourceUnavailable { .. } => "source_unavailable",
            MigrationError::InvalidDefinition(_) => "invalid_definition",
            MigrationError::LockTimeout { .. } => "lock_timeout",
            MigrationError::DriftDetected(_) => "drift_detected",
            MigrationError::MigrationFailed { .. } => "migration_failed",
            MigrationError::DuplicateApplication { .. } => "duplicate_application",
            MigrationError::Cancelled { .. } => "cancelled",
            MigrationError::NotConnected { .. } => "not_connected",
            MigrationError::Ledger(_) => "ledger_error",
        }
    }

    /// Whether re-invoking the whole run later may succeed without operator action
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, MigrationError::LockTimeout { .. })
    }

    /// The migration id this error is about, if any
    #[must_use]
    pub fn migration_id(&self) -> Option<&str> {
        match self {
            MigrationError::MigrationFailed { id, .. }
            | MigrationError::DuplicateApplication { id }
            | MigrationError::Cancelled { id } => Some(id),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migration_failed_names_id_and_cause() {
        let err = MigrationError::MigrationFailed {
            id: "002_add_badges".to_string(),
            cause: "relation \"users\" does not exist".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("002_add_badges"));
        assert!(msg.contains("relation \"users\" does not exist"));
        assert_eq!(err.migration_id(), Some("002_add_badges"));
    }

    #[test]
    fn test_drift_lists_every_migration() {
        let err = MigrationError::DriftDetected(vec![
            DriftedMigration {
                id: "001_init".to_string(),
                stored_checksum: "aaa".to_string(),
                current_checksum: "bbb".to_string(),
            },
            DriftedMigration {
                id: "003_add_streaks".to_string(),
                stored_checksum: "ccc".to_string(),
                current_checksum: "ddd".to_string(),
            },
        ]);
        let msg = err.to_string();
        assert!(msg.starts_with("2 applied migration(s)"));
        assert!(msg.contains("'001_init': stored checksum aaa, current checksum bbb"));
        assert!(msg.contains("003_add_streaks"));
        assert_eq!(err.kind(), "drift_detected");
    }

    #[test]
    fn test_only_lock_timeout_is_transient() {
        let lock_timeout = MigrationError::LockTimeout {
            waited: Duration::from_secs(1),
        };
        let duplicate = MigrationError::DuplicateApplication {
            id: "001_init".to_string(),
        };
        assert!(lock_timeout.is_transient());
        assert!(!MigrationError::Connection("refused".to_string()).is_transient());
        assert!(!duplicate.is_transient());
    }

    #[test]
    fn test_not_connected_mentions_state() {
        let err = MigrationError::NotConnected { state: RunnerState::Failed };
        assert!(err.to_string().contains("failed"));
        assert_eq!(err.kind(), "not_connected");
    }
}
