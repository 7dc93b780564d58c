//! Resolution of command-line flags against environment and config

use questline::config::RunnerConfig;
use questline::migration::{
    CancelFlag, DirectorySource, MigrationError, MigrationSource, RunnerOptions,
};
use std::path::PathBuf;
use std::time::Duration;

/// Environment variables consulted for the database URL, in order
pub const DATABASE_URL_VARS: [&str; 2] = ["QUESTLINE_DATABASE_URL", "DATABASE_URL"];

/// Pick the database URL: flag, then environment, then configuration
///
/// `lookup` reads an environment variable; empty values are skipped.
pub fn resolve_database_url(
    flag: Option<String>,
    lookup: impl Fn(&str) -> Option<String>,
    config: &RunnerConfig,
) -> String {
    flag.or_else(|| {
        DATABASE_URL_VARS
            .iter()
            .filter_map(|&var| lookup(var))
            .find(|value| !value.trim().is_empty())
    })
    .unwrap_or_else(|| config.database.url.clone())
}

/// Lock options from config, overridden by flags
///
/// An overall deadline also caps the lock wait, so a deploy never waits for
/// the lock longer than it is allowed to run.
pub fn runner_options(
    config: &RunnerConfig,
    lock_timeout_secs: Option<u64>,
    deadline: Option<Duration>,
) -> RunnerOptions {
    let mut options = RunnerOptions::from(&config.migrations);
    if let Some(secs) = lock_timeout_secs {
        options.lock_timeout = Duration::from_secs(secs);
    }
    if let Some(deadline) = deadline {
        options.lock_timeout = options.lock_timeout.min(deadline);
    }
    options
}

/// Session `statement_timeout`: the configured value, else the deadline
///
/// The cancel flag is only checked between statements, so without a
/// statement timeout a statement blocked on a table lock would outlive the
/// deadline. The server cancels it instead and the transaction rolls back.
pub fn statement_timeout(config: &RunnerConfig, deadline: Option<Duration>) -> Option<Duration> {
    config.database.statement_timeout().or(deadline)
}

/// Cancel flag that trips once `deadline` elapses
pub fn deadline_flag(deadline: Option<Duration>) -> CancelFlag {
    let flag = CancelFlag::new();
    if let Some(deadline) = deadline {
        flag.cancel_after(deadline);
    }
    flag
}

/// Directory from the flag or config; `None` means the bundled migrations
pub fn migrations_dir(flag: Option<PathBuf>, config: &RunnerConfig) -> Option<PathBuf> {
    flag.or_else(|| config.migrations.dir.clone())
}

/// Build the migration source for `dir`, or the bundled set
///
/// # Errors
///
/// Returns `InvalidDefinition` if the bundled migrations are malformed.
pub fn migration_source(dir: Option<PathBuf>) -> Result<Box<dyn MigrationSource>, MigrationError> {
    match dir {
        Some(dir) => Ok(Box::new(DirectorySource::new(dir))),
        None => Ok(Box::new(questline::schema::bundled()?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_flag_wins_over_environment() {
        let url = resolve_database_url(
            Some("postgres://flag/db".to_string()),
            env(&[("QUESTLINE_DATABASE_URL", "postgres://env/db")]),
            &RunnerConfig::default(),
        );
        assert_eq!(url, "postgres://flag/db");
    }

    #[test]
    fn test_questline_variable_before_generic() {
        let url = resolve_database_url(
            None,
            env(&[
                ("QUESTLINE_DATABASE_URL", "postgres://questline/db"),
                ("DATABASE_URL", "postgres://generic/db"),
            ]),
            &RunnerConfig::default(),
        );
        assert_eq!(url, "postgres://questline/db");

        let url = resolve_database_url(
            None,
            env(&[("QUESTLINE_DATABASE_URL", " "), ("DATABASE_URL", "postgres://generic/db")]),
            &RunnerConfig::default(),
        );
        assert_eq!(url, "postgres://generic/db");
    }

    #[test]
    fn test_falls_back_to_config() {
        let url = resolve_database_url(None, env(&[]), &RunnerConfig::default());
        assert_eq!(url, RunnerConfig::default().database.url);
    }

    #[test]
    fn test_deadline_caps_lock_timeout() {
        let config = RunnerConfig::default();
        let options = runner_options(&config, Some(120), Some(Duration::from_secs(30)));
        assert_eq!(options.lock_timeout, Duration::from_secs(30));

        let options = runner_options(&config, Some(5), None);
        assert_eq!(options.lock_timeout, Duration::from_secs(5));
        assert_eq!(options.lock_poll_interval, Duration::from_millis(100));
    }

    #[test]
    fn test_deadline_becomes_statement_timeout_unless_configured() {
        let mut config = RunnerConfig::default();
        let deadline = Some(Duration::from_secs(30));
        assert_eq!(statement_timeout(&config, deadline), deadline);
        assert_eq!(statement_timeout(&config, None), None);

        config.database.statement_timeout_seconds = Some(10);
        assert_eq!(
            statement_timeout(&config, deadline),
            Some(Duration::from_secs(10))
        );
    }

    #[test]
    fn test_bundled_source_when_no_directory() {
        let source = migration_source(migrations_dir(None, &RunnerConfig::default())).unwrap();
        assert_eq!(source.location(), "<registry>");
        assert_eq!(source.list().unwrap().len(), 3);
    }
}
