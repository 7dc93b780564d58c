//! Plain-text rendering of status and run results
//!
//! Shared by every command of the CLI and by the deploy pre-flight, so the
//! same table is printed everywhere.

use crate::migration::{MigrationState, MigrationStatus, RunSummary};
use std::fmt;

const CHECKSUM_PREFIX: usize = 12;

/// Display adapter for a [`MigrationStatus`]
pub struct StatusReport<'a>(pub &'a MigrationStatus);

/// Display adapter for a [`RunSummary`]
pub struct RunReport<'a>(pub &'a RunSummary);

fn short(checksum: &str) -> &str {
    checksum.get(..CHECKSUM_PREFIX).unwrap_or(checksum)
}

impl fmt::Display for StatusReport<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = self.0;
        writeln!(
            f,
            "Migrations: {} total, {} executed, {} pending",
            status.total, status.executed, status.pending
        )?;

        let width = status.migrations.iter().map(|m| m.id.len()).max().unwrap_or(0);
        for m in &status.migrations {
            write!(f, "  [{:<7}] {:<width$}", m.status.to_string(), m.id, width = width)?;
            match m.status {
                MigrationState::Applied => {
                    if let Some(at) = m.applied_at {
                        write!(f, "  {}", at.format("%Y-%m-%d %H:%M:%S UTC"))?;
                    }
                }
                MigrationState::Drifted => {
                    write!(
                        f,
                        "  recorded {} != current {}",
                        short(m.recorded_checksum.as_deref().unwrap_or("")),
                        short(&m.checksum)
                    )?;
                }
                MigrationState::Pending => {}
            }
            writeln!(f)?;
        }

        if !status.orphaned.is_empty() {
            writeln!(f, "Ledger entries without a definition ({}):", status.orphaned.len())?;
            for e in &status.orphaned {
                let applied_at = e.applied_at.format("%Y-%m-%d %H:%M:%S UTC");
                writeln!(f, "  {} (applied {})", e.id, applied_at)?;
            }
        }
        Ok(())
    }
}

impl fmt::Display for RunReport<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let summary = self.0;
        writeln!(f, "Executed {} of {} migration(s)", summary.executed, summary.total)?;
        for id in &summary.applied {
            writeln!(f, "  applied {}", id)?;
        }
        Ok(())
    }
}

pub fn render_status(status: &MigrationStatus) -> String {
    StatusReport(status).to_string()
}

pub fn render_run(summary: &RunSummary) -> String {
    RunReport(summary).to_string()
}
