//! Migration sources: where definitions come from
//!
//! [`MigrationRegistry`] is an explicit, typed sequence of definitions built
//! at load time (bundled SQL via `include_str!`, or definitions assembled in
//! code). [`DirectorySource`] builds such a registry from a directory of
//! `{digits}_{name}.sql` files each time it is listed, so edits on disk are
//! seen by the next status check.

use crate::migration::{MigrationDefinition, MigrationError};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

/// Read-only provider of migration definitions
pub trait MigrationSource: Send + Sync {
    /// Human-readable location used in diagnostics
    fn location(&self) -> String;

    /// All definitions, sorted ascending by version
    ///
    /// # Errors
    ///
    /// Returns `SourceUnavailable` if the location cannot be read, or
    /// `InvalidDefinition` if a definition is malformed.
    fn list(&self) -> Result<Vec<MigrationDefinition>, MigrationError>;

    /// Look up one definition by id
    ///
    /// # Errors
    ///
    /// Same as [`MigrationSource::list`].
    fn get(&self, id: &str) -> Result<Option<MigrationDefinition>, MigrationError> {
        Ok(self.list()?.into_iter().find(|d| d.id() == id))
    }
}

impl<S: MigrationSource + ?Sized> MigrationSource for Box<S> {
    fn location(&self) -> String {
        (**self).location()
    }

    fn list(&self) -> Result<Vec<MigrationDefinition>, MigrationError> {
        (**self).list()
    }

    fn get(&self, id: &str) -> Result<Option<MigrationDefinition>, MigrationError> {
        (**self).get(id)
    }
}

/// A migration embedded into the binary at build time
#[derive(Debug, Clone, Copy)]
pub struct EmbeddedMigration {
    pub id: &'static str,
    pub sql: &'static str,
}

/// Explicit, ordered set of migration definitions
#[derive(Debug, Clone, Default)]
pub struct MigrationRegistry {
    definitions: Vec<MigrationDefinition>,
}

impl MigrationRegistry {
    /// Build a registry, sorting by version
    ///
    /// # Errors
    ///
    /// Returns `InvalidDefinition` if two definitions share an id or a version.
    pub fn new(mut definitions: Vec<MigrationDefinition>) -> Result<Self, MigrationError> {
        definitions.sort_by(|a, b| a.version().cmp(&b.version()).then_with(|| a.id().cmp(b.id())));

        let mut ids = HashSet::new();
        for d in &definitions {
            if !ids.insert(d.id()) {
                return Err(MigrationError::InvalidDefinition(format!(
                    "Migration id '{}' is defined more than once",
                    d.id()
                )));
            }
        }
        for pair in definitions.windows(2) {
            if pair[0].version() == pair[1].version() {
                return Err(MigrationError::InvalidDefinition(format!(
                    "Migrations '{}' and '{}' share version {}",
                    pair[0].id(),
                    pair[1].id(),
                    pair[0].version()
                )));
            }
        }

        Ok(Self { definitions })
    }

    /// Build a registry from migrations embedded with `include_str!`
    ///
    /// # Errors
    ///
    /// Returns `InvalidDefinition` for a malformed id, blank SQL, or a
    /// duplicate id/version.
    pub fn from_embedded(migrations: &[EmbeddedMigration]) -> Result<Self, MigrationError> {
        let definitions = migrations
            .iter()
            .map(|m| MigrationDefinition::new(m.id, m.sql))
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(definitions)
    }

    pub fn definitions(&self) -> &[MigrationDefinition] {
        &self.definitions
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}

impl MigrationSource for MigrationRegistry {
    fn location(&self) -> String {
        "<registry>".to_string()
    }

    fn list(&self) -> Result<Vec<MigrationDefinition>, MigrationError> {
        Ok(self.definitions.clone())
    }

    fn get(&self, id: &str) -> Result<Option<MigrationDefinition>, MigrationError> {
        Ok(self.definitions.iter().find(|d| d.id() == id).cloned())
    }
}

/// Loads a [`MigrationRegistry`] from a directory of `.sql` files
#[derive(Debug, Clone)]
pub struct DirectorySource {
    dir: PathBuf,
}

impl DirectorySource {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn unavailable(&self, reason: impl Into<String>) -> MigrationError {
        MigrationError::SourceUnavailable {
            location: self.dir.display().to_string(),
            reason: reason.into(),
        }
    }

    /// Read every `{digits}_{name}.sql` file into a registry
    ///
    /// Files without a `.sql` extension are ignored; subdirectories are not
    /// descended into.
    ///
    /// # Errors
    ///
    /// Returns `SourceUnavailable` if the directory or a file cannot be read,
    /// and `InvalidDefinition` for misnamed `.sql` files or duplicates.
    pub fn load(&self) -> Result<MigrationRegistry, MigrationError> {
        if !self.dir.is_dir() {
            return Err(self.unavailable("not a readable directory"));
        }

        let entries = fs::read_dir(&self.dir)
            .map_err(|e| self.unavailable(format!("failed to read directory: {}", e)))?;

        let mut definitions = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| {
                self.unavailable(format!("failed to read directory entry: {}", e))
            })?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }

            let Some(filename) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some(id) = MigrationDefinition::id_from_filename(filename)? else {
                continue;
            };

            let sql = fs::read_to_string(&path).map_err(|e| {
                self.unavailable(format!("failed to read {}: {}", path.display(), e))
            })?;
            definitions.push(MigrationDefinition::new(id, sql)?);
        }

        MigrationRegistry::new(definitions)
    }
}

impl MigrationSource for DirectorySource {
    fn location(&self) -> String {
        self.dir.display().to_string()
    }

    fn list(&self) -> Result<Vec<MigrationDefinition>, MigrationError> {
        Ok(self.load()?.definitions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn def(id: &str) -> MigrationDefinition {
        MigrationDefinition::new(id, format!("-- {id}\nSELECT 1;")).unwrap()
    }

    #[test]
    fn test_registry_sorts_by_version_not_insertion_order() {
        let registry = MigrationRegistry::new(vec![
            def("010_later"),
            def("002_add_badges"),
            def("001_init"),
        ])
        .unwrap();
        let ids: Vec<_> = registry.list().unwrap().iter().map(|d| d.id().to_string()).collect();
        assert_eq!(ids, vec!["001_init", "002_add_badges", "010_later"]);
    }

    #[test]
    fn test_registry_rejects_duplicate_version() {
        let err = MigrationRegistry::new(vec![def("001_init"), def("1_other")]).unwrap_err();
        assert!(err.to_string().contains("share version 1"));
    }

    #[test]
    fn test_registry_rejects_duplicate_id() {
        let err = MigrationRegistry::new(vec![def("001_init"), def("001_init")]).unwrap_err();
        assert!(err.to_string().contains("defined more than once"));
    }

    #[test]
    fn test_registry_get() {
        let registry =
            MigrationRegistry::new(vec![def("001_init"), def("002_add_badges")]).unwrap();
        assert_eq!(registry.get("002_add_badges").unwrap().unwrap().version(), 2);
        assert!(registry.get("003_add_streaks").unwrap().is_none());
    }

    #[test]
    fn test_directory_source_loads_sql_files_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let write = |name: &str, sql: &str| fs::write(dir.path().join(name), sql).unwrap();
        write("003_add_streaks.sql", "CREATE TABLE streaks (id BIGINT);");
        write("001_init.sql", "CREATE TABLE users (id BIGINT);");
        write("002_add_badges.sql", "CREATE TABLE badges (id BIGINT);");
        fs::write(dir.path().join("README.md"), "not a migration").unwrap();

        let source = DirectorySource::new(dir.path());
        let ids: Vec<_> = source.list().unwrap().iter().map(|d| d.id().to_string()).collect();
        assert_eq!(ids, vec!["001_init", "002_add_badges", "003_add_streaks"]);
        assert!(source.get("002_add_badges").unwrap().is_some());
    }

    #[test]
    fn test_directory_source_rereads_changed_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("001_init.sql");
        fs::write(&path, "CREATE TABLE users (id BIGINT);").unwrap();
        let source = DirectorySource::new(dir.path());
        let before = source.get("001_init").unwrap().unwrap().checksum().to_string();

        fs::write(&path, "CREATE TABLE users (id BIGINT, email TEXT);").unwrap();
        let after = source.get("001_init").unwrap().unwrap().checksum().to_string();
        assert_ne!(before, after);
    }

    #[test]
    fn test_missing_directory_is_source_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let source = DirectorySource::new(dir.path().join("nope"));
        let err = source.list().unwrap_err();
        assert!(matches!(err, MigrationError::SourceUnavailable { .. }));
        assert!(err.to_string().contains("nope"));
    }

    #[test]
    fn test_misnamed_sql_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("add_badges.sql"), "SELECT 1;").unwrap();
        let err = DirectorySource::new(dir.path()).list().unwrap_err();
        assert!(matches!(err, MigrationError::InvalidDefinition(_)));
    }
}
