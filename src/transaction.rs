//! Transaction Module
//!
//! A top-level `PostgreSQL` transaction bound to one connection. The
//! migration runner opens one of these per migration so that the schema
//! change and its ledger row commit (or roll back) together.

use crate::executor::DbError;
use may_postgres::types::ToSql;
use may_postgres::Client;

#[cfg(feature = "tracing")]
use tracing::debug_span;

/// A database transaction
///
/// Dropping a transaction that was neither committed nor rolled back issues a
/// `ROLLBACK`, so a transaction is never left pending when the caller bails
/// out early with `?` or is cancelled.
pub struct Transaction<'a> {
    client: &'a Client,
    closed: bool,
}

impl<'a> Transaction<'a> {
    /// Start a new transaction with the default isolation level (`READ COMMITTED`)
    pub(crate) fn begin(client: &'a Client) -> Result<Self, DbError> {
        #[cfg(feature = "tracing")]
        let _span = debug_span!("begin_transaction").entered();

        client.batch_execute("BEGIN").map_err(DbError::from)?;

        Ok(Self {
            client,
            closed: false,
        })
    }

    fn ensure_open(&self) -> Result<(), DbError> {
        if self.closed {
            return Err(DbError::Other("Transaction is closed".to_string()));
        }
        Ok(())
    }

    /// Execute a parameterised statement inside the transaction
    ///
    /// # Errors
    ///
    /// Returns `DbError` if the transaction is closed or the statement fails.
    pub fn execute(&self, query: &str, params: &[&dyn ToSql]) -> Result<u64, DbError> {
        self.ensure_open()?;
        self.client.execute(query, params).map_err(DbError::from)
    }

    /// Execute raw, possibly multi-statement SQL inside the transaction
    ///
    /// # Errors
    ///
    /// Returns `DbError` if the transaction is closed or any statement fails.
    pub fn batch_execute(&self, sql: &str) -> Result<(), DbError> {
        self.ensure_open()?;
        self.client.batch_execute(sql).map_err(DbError::from)
    }

    /// Commit the transaction
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction has already been closed or `COMMIT` fails.
    pub fn commit(mut self) -> Result<(), DbError> {
        self.ensure_open()?;

        #[cfg(feature = "tracing")]
        let _span = debug_span!("commit_transaction").entered();

        // Mark closed first: a failed COMMIT leaves nothing to roll back.
        self.closed = true;
        self.client.batch_execute("COMMIT").map_err(DbError::from)
    }

    /// Roll the transaction back
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction has already been closed or `ROLLBACK` fails.
    pub fn rollback(mut self) -> Result<(), DbError> {
        self.ensure_open()?;

        #[cfg(feature = "tracing")]
        let _span = debug_span!("rollback_transaction").entered();

        self.closed = true;
        self.client.batch_execute("ROLLBACK").map_err(DbError::from)
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.closed {
            if let Err(e) = self.client.batch_execute("ROLLBACK") {
                log::warn!("Failed to roll back abandoned transaction: {e}");
            }
        }
    }
}
