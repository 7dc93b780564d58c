//! Executor Module
//!
//! Thin synchronous wrapper over `may_postgres::Client` used by the PostgreSQL
//! ledger. Every call is a blocking round trip; `may_postgres` schedules the
//! underlying socket I/O on the `may` runtime.

use may_postgres::error::SqlState;
use may_postgres::types::ToSql;
use may_postgres::{Client, Error as PostgresError, Row};
use thiserror::Error;

#[cfg(feature = "tracing")]
use tracing::debug_span;

/// Database execution error
#[derive(Debug, Error)]
pub enum DbError {
    /// `PostgreSQL` error from `may_postgres`
    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] PostgresError),
    /// Query execution error
    #[error("Query error: {0}")]
    Query(String),
    /// A unique key was violated
    #[error("Unique constraint violated: {0}")]
    UniqueViolation(String),
    /// Row parsing/conversion error
    #[error("Parse error: {0}")]
    Parse(String),
    /// Other execution errors
    #[error("Execution error: {0}")]
    Other(String),
}

impl DbError {
    /// Whether the failure was a unique/primary key violation.
    #[must_use]
    pub fn is_unique_violation(&self) -> bool {
        match self {
            DbError::Postgres(e) => e.code() == Some(&SqlState::UNIQUE_VIOLATION),
            DbError::UniqueViolation(_) => true,
            _ => false,
        }
    }
}

/// Executor over a single `may_postgres` connection
pub struct PgExecutor {
    client: Client,
}

impl PgExecutor {
    /// Create a new executor from a `may_postgres::Client`
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Execute a query and return exactly one row
    ///
    /// # Errors
    ///
    /// Returns `DbError` if the query fails or does not return exactly one row.
    pub fn query_one(&self, query: &str, params: &[&dyn ToSql]) -> Result<Row, DbError> {
        #[cfg(feature = "tracing")]
        let _span = debug_span!("query_one", query).entered();

        self.client.query_one(query, params).map_err(DbError::from)
    }

    /// Execute a query and return all rows
    ///
    /// # Errors
    ///
    /// Returns `DbError` if the query fails.
    pub fn query_all(&self, query: &str, params: &[&dyn ToSql]) -> Result<Vec<Row>, DbError> {
        #[cfg(feature = "tracing")]
        let _span = debug_span!("query_all", query).entered();

        self.client.query(query, params).map_err(DbError::from)
    }

    /// Execute one or more semicolon-separated statements without parameters
    ///
    /// Migration files are run through this path so that a single file may
    /// carry several DDL statements.
    ///
    /// # Errors
    ///
    /// Returns `DbError` at the first failing statement.
    pub fn batch_execute(&self, sql: &str) -> Result<(), DbError> {
        #[cfg(feature = "tracing")]
        let _span = debug_span!("batch_execute").entered();

        self.client.batch_execute(sql).map_err(DbError::from)
    }

    /// Start a new transaction on this connection
    ///
    /// # Errors
    ///
    /// Returns `DbError` if `BEGIN` fails.
    pub fn begin(&self) -> Result<crate::transaction::Transaction<'_>, DbError> {
        crate::transaction::Transaction::begin(&self.client)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_db_error_display() {
        let err = DbError::Query("relation does not exist".to_string());
        assert!(err.to_string().contains("Query error"));
        assert!(err.to_string().contains("relation does not exist"));
    }

    #[test]
    fn test_unique_violation_detection() {
        assert!(DbError::UniqueViolation("id".to_string()).is_unique_violation());
        assert!(!DbError::Query("syntax error".to_string()).is_unique_violation());
        assert!(!DbError::Other("closed".to_string()).is_unique_violation());
    }
}
