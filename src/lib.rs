//! # Questline
//!
//! Schema migration runner for the Questline activity tracker.
//!
//! Applies the product's SQL migrations to `PostgreSQL` exactly once and in
//! order, records each in the `questline_migrations` ledger, detects edited
//! migrations through checksums, and serializes concurrent deploys with an
//! advisory lock. See [`migration`] for the runner and [`schema`] for the
//! bundled migrations.

pub mod config;
pub mod connection;
pub mod executor;
pub mod migration;
pub mod schema;
pub mod transaction;

pub use config::RunnerConfig;
pub use executor::{DbError, PgExecutor};
pub use migration::{MigrationError, MigrationRunner, MigrationStatus, RunSummary};
