//! Command handlers for `questline-migrate`
//!
//! Each handler drives a [`MigrationRunner`] through the operations its
//! command needs and owns all console output. Handlers return an
//! [`Outcome`]; `main` maps it to the process exit code.

use colored::Colorize;
use questline::migration::{render_run, render_status, MigrationError, MigrationRunner};
use serde_json::json;
use std::io::{self, Write};

/// Output format selected by `--json`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Json,
}

/// Result of a command, as seen by deploy automation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
}

impl Outcome {
    pub fn code(self) -> i32 {
        match self {
            Outcome::Success => 0,
            Outcome::Failure => 1,
        }
    }
}

/// Pre-flight stage names, in execution order
pub const STAGE_CONNECT: &str = "connect";
pub const STAGE_MIGRATE: &str = "migrate";
pub const STAGE_VERIFY: &str = "verify";

/// Destination for command output
pub struct Console<O: Write, E: Write> {
    out: O,
    err: E,
    format: OutputFormat,
    quiet: bool,
}

impl<O: Write, E: Write> Console<O, E> {
    pub fn new(out: O, err: E, format: OutputFormat) -> Self {
        Self {
            out,
            err,
            format,
            quiet: false,
        }
    }

    /// Suppress success chatter in text mode; results and errors still print
    #[must_use]
    pub fn quiet(mut self, quiet: bool) -> Self {
        self.quiet = quiet;
        self
    }

    pub fn into_parts(self) -> (O, E) {
        (self.out, self.err)
    }

    fn json(&mut self, value: &serde_json::Value) -> io::Result<()> {
        writeln!(self.out, "{}", value)
    }

    fn success(&mut self, message: &str) -> io::Result<()> {
        if !self.quiet {
            writeln!(self.out, "{} {}", "✅".green(), message)?;
        }
        Ok(())
    }

    fn failure(&mut self, stage: Option<&str>, error: &MigrationError) -> io::Result<Outcome> {
        match self.format {
            OutputFormat::Json => {
                let mut value = json!({
                    "error": error.to_string(),
                    "kind": error.kind(),
                    "transient": error.is_transient(),
                });
                if let Some(stage) = stage {
                    value["stage"] = json!(stage);
                }
                if let Some(id) = error.migration_id() {
                    value["migration"] = json!(id);
                }
                self.json(&value)?;
            }
            OutputFormat::Text => {
                let label = match stage {
                    Some(stage) => format!("❌ Pre-flight failed at {}:", stage),
                    None => "❌ Error:".to_string(),
                };
                writeln!(self.err, "{} {}", label.red().bold(), error)?;
            }
        }
        Ok(Outcome::Failure)
    }
}

/// `check`: connect and ensure the ledger table exists
///
/// # Errors
///
/// Returns an I/O error only if the console cannot be written.
pub fn check<O: Write, E: Write>(
    runner: &mut MigrationRunner,
    console: &mut Console<O, E>,
) -> io::Result<Outcome> {
    if let Err(e) = runner.initialize() {
        return console.failure(None, &e);
    }
    match console.format {
        OutputFormat::Json => console.json(&json!({ "status": "ok" }))?,
        OutputFormat::Text => console.success("Database reachable, migration ledger ready")?,
    }
    Ok(Outcome::Success)
}

/// `status`: print the per-migration table
///
/// Drift and pending migrations are reported, not treated as failures.
///
/// # Errors
///
/// Returns an I/O error only if the console cannot be written.
pub fn status<O: Write, E: Write>(
    runner: &mut MigrationRunner,
    console: &mut Console<O, E>,
) -> io::Result<Outcome> {
    let status = match runner.initialize().and_then(|()| runner.check_status()) {
        Ok(status) => status,
        Err(e) => return console.failure(None, &e),
    };

    match console.format {
        OutputFormat::Json => console.json(&json!(status))?,
        OutputFormat::Text => {
            write!(console.out, "{}", render_status(&status))?;
            if status.has_drift() {
                writeln!(
                    console.err,
                    "{} applied migrations were modified; `run` will refuse to proceed",
                    "⚠️".yellow()
                )?;
            }
        }
    }
    Ok(Outcome::Success)
}

/// `run`: apply all pending migrations
///
/// # Errors
///
/// Returns an I/O error only if the console cannot be written.
pub fn run<O: Write, E: Write>(
    runner: &mut MigrationRunner,
    console: &mut Console<O, E>,
) -> io::Result<Outcome> {
    let summary = match runner.initialize().and_then(|()| runner.run_migrations()) {
        Ok(summary) => summary,
        Err(e) => return console.failure(None, &e),
    };

    match console.format {
        OutputFormat::Json => console.json(&json!(summary))?,
        OutputFormat::Text => {
            write!(console.out, "{}", render_run(&summary))?;
            console.success("Schema is up to date")?;
        }
    }
    Ok(Outcome::Success)
}

/// `preflight`: connect, migrate, then verify nothing is left pending
///
/// The deploy gate: a failure names the stage it happened in, and the exit
/// code is non-zero unless the schema is fully applied without drift.
///
/// # Errors
///
/// Returns an I/O error only if the console cannot be written.
pub fn preflight<O: Write, E: Write>(
    runner: &mut MigrationRunner,
    console: &mut Console<O, E>,
) -> io::Result<Outcome> {
    if let Err(e) = runner.initialize() {
        return console.failure(Some(STAGE_CONNECT), &e);
    }

    let summary = match runner.run_migrations() {
        Ok(summary) => summary,
        Err(e) => return console.failure(Some(STAGE_MIGRATE), &e),
    };

    let status = match runner.check_status() {
        Ok(status) => status,
        Err(e) => return console.failure(Some(STAGE_VERIFY), &e),
    };

    let ready = status.is_up_to_date() && !status.has_drift();
    match console.format {
        OutputFormat::Json => {
            let mut value = json!({
                "ready": ready,
                "run": summary,
                "status": status,
            });
            if !ready {
                value["stage"] = json!(STAGE_VERIFY);
            }
            console.json(&value)?;
        }
        OutputFormat::Text => {
            write!(console.out, "{}", render_run(&summary))?;
            if ready {
                writeln!(console.out, "{}", "ready".green().bold())?;
            } else {
                write!(console.out, "{}", render_status(&status))?;
                writeln!(
                    console.err,
                    "{} {} migration(s) still pending, drift: {}",
                    format!("❌ Pre-flight failed at {}:", STAGE_VERIFY).red().bold(),
                    status.pending,
                    if status.has_drift() { "yes" } else { "no" }
                )?;
            }
        }
    }

    Ok(if ready { Outcome::Success } else { Outcome::Failure })
}
