//! Questline's own migrations, embedded at build time

use crate::migration::{EmbeddedMigration, MigrationError, MigrationRegistry};

/// Every product migration, in version order
pub const BUNDLED: &[EmbeddedMigration] = &[
    EmbeddedMigration {
        id: "001_init",
        sql: include_str!("../migrations/001_init.sql"),
    },
    EmbeddedMigration {
        id: "002_add_badges",
        sql: include_str!("../migrations/002_add_badges.sql"),
    },
    EmbeddedMigration {
        id: "003_add_streaks",
        sql: include_str!("../migrations/003_add_streaks.sql"),
    },
];

/// Registry of the bundled migrations
///
/// # Errors
///
/// Returns `InvalidDefinition` if a bundled migration is malformed.
pub fn bundled() -> Result<MigrationRegistry, MigrationError> {
    MigrationRegistry::from_embedded(BUNDLED)
}
