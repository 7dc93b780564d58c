//! `PostgreSQL` ledger over `may_postgres`
//!
//! The deployment lock is a session-level advisory lock
//! (`pg_try_advisory_lock`), so it is released automatically if the deploy
//! process dies and its connection closes.
//!
//! Ledger creation takes a separate transaction-level advisory lock. `IF NOT
//! EXISTS` alone races on the system catalogs when several sessions create the
//! table at once, and the losers fail with a unique violation.

use crate::connection::{connect, redact_connection_string};
use crate::executor::{DbError, PgExecutor};
use crate::migration::ledger::{
    Connect, LedgerEntry, LedgerStore, LedgerTransaction, LEDGER_TABLE,
};
use crate::migration::MigrationError;
use crate::transaction::Transaction;
use may_postgres::Row;
use std::time::Duration;

/// Ledger stored in the `questline_migrations` table
pub struct PostgresLedger {
    executor: PgExecutor,
    lock_key: i64,
}

impl PostgresLedger {
    pub fn new(executor: PgExecutor, lock_key: i64) -> Self {
        Self { executor, lock_key }
    }
}

/// Two-part key for the ledger creation lock
///
/// The `(int4, int4)` advisory key space does not overlap the `bigint` one,
/// so creating the ledger never waits on a deploy holding the session lock.
pub fn schema_lock_key(lock_key: i64) -> (i32, i32) {
    let bits = lock_key as u64;
    ((bits >> 32) as u32 as i32, bits as u32 as i32)
}

/// DDL for the ledger table and its index
pub fn ledger_schema_sql() -> String {
    format!(
        r#"
        CREATE TABLE IF NOT EXISTS {table} (
            id VARCHAR(255) PRIMARY KEY,
            version BIGINT NOT NULL,
            checksum VARCHAR(64) NOT NULL,
            applied_at TIMESTAMPTZ NOT NULL,
            execution_time_ms BIGINT
        );
        CREATE INDEX IF NOT EXISTS idx_{table}_applied_at ON {table}(applied_at);
        "#,
        table = LEDGER_TABLE
    )
}

/// Expected column order: `id`, `version`, `checksum`, `applied_at`, `execution_time_ms`
fn entry_from_row(row: &Row) -> Result<LedgerEntry, DbError> {
    let parse = |e: may_postgres::Error| DbError::Parse(format!("Invalid ledger row: {e}"));
    Ok(LedgerEntry {
        id: row.try_get(0).map_err(parse)?,
        version: row.try_get(1).map_err(parse)?,
        checksum: row.try_get(2).map_err(parse)?,
        applied_at: row.try_get(3).map_err(parse)?,
        execution_time_ms: row.try_get(4).map_err(parse)?,
    })
}

impl LedgerStore for PostgresLedger {
    fn ensure_schema(&self) -> Result<(), MigrationError> {
        let (high, low) = schema_lock_key(self.lock_key);
        let tx = self.executor.begin()?;
        tx.execute("SELECT pg_advisory_xact_lock($1, $2)", &[&high, &low])?;
        tx.batch_execute(&ledger_schema_sql())?;
        tx.commit()?;
        Ok(())
    }

    fn list_applied(&self) -> Result<Vec<LedgerEntry>, MigrationError> {
        let sql = format!(
            "SELECT id, version, checksum, applied_at, execution_time_ms \
             FROM {LEDGER_TABLE} ORDER BY applied_at ASC, id ASC"
        );
        let rows = self.executor.query_all(&sql, &[])?;
        rows.iter()
            .map(|row| entry_from_row(row).map_err(MigrationError::from))
            .collect()
    }

    fn try_acquire_deployment_lock(&self) -> Result<bool, MigrationError> {
        let row = self
            .executor
            .query_one("SELECT pg_try_advisory_lock($1)", &[&self.lock_key])?;
        let acquired: bool = row
            .try_get(0)
            .map_err(|e| DbError::Parse(format!("Invalid advisory lock result: {e}")))?;
        Ok(acquired)
    }

    fn release_deployment_lock(&self) -> Result<(), MigrationError> {
        let row = self
            .executor
            .query_one("SELECT pg_advisory_unlock($1)", &[&self.lock_key])?;
        let released: bool = row
            .try_get(0)
            .map_err(|e| DbError::Parse(format!("Invalid advisory unlock result: {e}")))?;
        if !released {
            log::warn!(
                "Advisory lock {} was not held by this session when releasing",
                self.lock_key
            );
        }
        Ok(())
    }

    fn begin(&self) -> Result<Box<dyn LedgerTransaction + '_>, DbError> {
        Ok(Box::new(PostgresTransaction {
            tx: self.executor.begin()?,
        }))
    }
}

struct PostgresTransaction<'a> {
    tx: Transaction<'a>,
}

impl LedgerTransaction for PostgresTransaction<'_> {
    fn execute_sql(&mut self, sql: &str) -> Result<(), DbError> {
        self.tx.batch_execute(sql)
    }

    fn record_applied(&mut self, entry: &LedgerEntry) -> Result<(), MigrationError> {
        let sql = format!(
            "INSERT INTO {LEDGER_TABLE} (id, version, checksum, applied_at, execution_time_ms) \
             VALUES ($1, $2, $3, $4, $5)"
        );
        match self.tx.execute(
            &sql,
            &[
                &entry.id,
                &entry.version,
                &entry.checksum,
                &entry.applied_at,
                &entry.execution_time_ms,
            ],
        ) {
            Ok(_) => Ok(()),
            Err(e) if e.is_unique_violation() => Err(MigrationError::DuplicateApplication {
                id: entry.id.clone(),
            }),
            Err(e) => Err(MigrationError::Ledger(e)),
        }
    }

    fn commit(self: Box<Self>) -> Result<(), DbError> {
        self.tx.commit()
    }

    fn rollback(self: Box<Self>) -> Result<(), DbError> {
        self.tx.rollback()
    }
}

/// Opens [`PostgresLedger`] sessions from a connection string
#[derive(Debug, Clone)]
pub struct PostgresConnector {
    url: String,
    lock_key: i64,
    statement_timeout: Option<Duration>,
}

impl PostgresConnector {
    pub fn new(url: impl Into<String>, lock_key: i64) -> Self {
        Self {
            url: url.into(),
            lock_key,
            statement_timeout: None,
        }
    }

    #[must_use]
    pub fn with_statement_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.statement_timeout = timeout;
        self
    }
}

impl Connect for PostgresConnector {
    fn connect(&self) -> Result<Box<dyn LedgerStore>, MigrationError> {
        log::debug!("Connecting to {}", redact_connection_string(&self.url));
        let client = connect(&self.url, self.statement_timeout)
            .map_err(|e| MigrationError::Connection(e.to_string()))?;
        Ok(Box::new(PostgresLedger::new(PgExecutor::new(client), self.lock_key)))
    }
}
