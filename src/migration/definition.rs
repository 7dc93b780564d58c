//! Migration definitions and their checksums

use crate::migration::MigrationError;
use regex::Regex;
use sha2::{Digest, Sha256};

/// A single, ordered, one-time schema change
///
/// Definitions are immutable: the checksum is computed once from the SQL
/// text and the ledger compares against it to detect drift.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationDefinition {
    id: String,
    version: i64,
    name: String,
    sql: String,
    checksum: String,
}

impl MigrationDefinition {
    /// Create a definition from its stable id and SQL text
    ///
    /// The id must look like `{digits}_{name}`, e.g. `001_init`; the numeric
    /// prefix is the ordering key.
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::InvalidDefinition` if the id is malformed or
    /// the SQL is blank.
    pub fn new(id: impl Into<String>, sql: impl Into<String>) -> Result<Self, MigrationError> {
        let id = id.into();
        let sql = sql.into();
        let (version, name) = Self::parse_id(&id)?;

        if sql.trim().is_empty() {
            return Err(MigrationError::InvalidDefinition(format!(
                "Migration '{}' has no statements",
                id
            )));
        }

        let checksum = calculate_checksum(&sql);
        Ok(Self {
            id,
            version,
            name,
            sql,
            checksum,
        })
    }

    /// Parse a migration id into its ordering key and name
    ///
    /// # Example
    /// - `003_add_streaks` → version: 3, name: "add_streaks"
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::InvalidDefinition` if the id does not match
    /// `{digits}_{name}` or the prefix does not fit in an `i64`.
    pub fn parse_id(id: &str) -> Result<(i64, String), MigrationError> {
        let re = Regex::new(r"^(\d+)_([A-Za-z0-9_]+)$")
            .map_err(|e| MigrationError::InvalidDefinition(format!("Invalid regex: {}", e)))?;

        let caps = re.captures(id).ok_or_else(|| {
            MigrationError::InvalidDefinition(format!(
                "Migration id '{}' does not match expected pattern: {{digits}}_{{name}}",
                id
            ))
        })?;

        let version = caps[1].parse::<i64>().map_err(|e| {
            MigrationError::InvalidDefinition(format!(
                "Migration id '{}' has an out-of-range version prefix: {}",
                id, e
            ))
        })?;

        Ok((version, caps[2].to_string()))
    }

    /// Map a migration file name (`001_init.sql`) to its id (`001_init`)
    ///
    /// Returns `Ok(None)` for files that are not SQL and should be ignored.
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::InvalidDefinition` for a `.sql` file whose
    /// stem is not a valid id.
    pub fn id_from_filename(filename: &str) -> Result<Option<String>, MigrationError> {
        let Some(stem) = filename.strip_suffix(".sql") else {
            return Ok(None);
        };
        Self::parse_id(stem).map_err(|_| {
            MigrationError::InvalidDefinition(format!(
                "Migration file name '{}' does not match expected pattern: {{digits}}_{{name}}.sql",
                filename
            ))
        })?;
        Ok(Some(stem.to_string()))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Ordering key (numeric id prefix)
    pub fn version(&self) -> i64 {
        self.version
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Lowercase hex `SHA-256` of the SQL text
    pub fn checksum(&self) -> &str {
        &self.checksum
    }
}

/// Calculate the `SHA-256` checksum of migration content
///
/// The exact bytes are hashed, so any edit (including whitespace) to an
/// applied migration is reported as drift.
pub fn calculate_checksum(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_id() {
        assert_eq!(
            MigrationDefinition::parse_id("001_init").unwrap(),
            (1, "init".to_string())
        );
        assert_eq!(
            MigrationDefinition::parse_id("20240120120000_add_badges").unwrap(),
            (20240120120000, "add_badges".to_string())
        );
    }

    #[test]
    fn test_parse_id_rejects_malformed() {
        for id in ["init", "001", "001-init", "_init", "001_", "v001_init"] {
            assert!(MigrationDefinition::parse_id(id).is_err(), "Should reject: {}", id);
        }
        let err = MigrationDefinition::parse_id("99999999999999999999_huge").unwrap_err();
        assert!(err.to_string().contains("out-of-range"));
    }

    #[test]
    fn test_id_from_filename() {
        assert_eq!(
            MigrationDefinition::id_from_filename("002_add_badges.sql").unwrap(),
            Some("002_add_badges".to_string())
        );
        assert_eq!(MigrationDefinition::id_from_filename("README.md").unwrap(), None);
        assert!(MigrationDefinition::id_from_filename("add_badges.sql").is_err());
    }

    #[test]
    fn test_checksum_is_sha256_hex() {
        let checksum = calculate_checksum("CREATE TABLE users (id BIGINT);");
        assert_eq!(checksum.len(), 64);
        assert!(checksum.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_eq!(
            calculate_checksum(""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_checksum_changes_with_content() {
        let a = MigrationDefinition::new("001_init", "CREATE TABLE users (id BIGINT);").unwrap();
        let b = MigrationDefinition::new("001_init", "CREATE TABLE users (id BIGINT); ").unwrap();
        assert_ne!(a.checksum(), b.checksum());
        assert_eq!(a.version(), 1);
        assert_eq!(a.name(), "init");
    }

    #[test]
    fn test_blank_sql_is_rejected() {
        let err = MigrationDefinition::new("001_init", "  \n").unwrap_err();
        assert!(err.to_string().contains("has no statements"));
    }
}
