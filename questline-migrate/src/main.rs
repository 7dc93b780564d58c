//! Questline Migration CLI Tool
//!
//! Applies and inspects the Questline schema migrations. Designed to be
//! called from deploy pipelines: every command exits 0 on success and 1 on
//! failure, and `--json` emits one machine-readable document on stdout.

use anyhow::Context;
use clap::{Parser, Subcommand};
use colored::Colorize;
use questline::config::RunnerConfig;
use questline::migration::{MigrationRunner, PostgresConnector};
use questline_migrate::commands::{self, Console, Outcome, OutputFormat};
use questline_migrate::settings;
use std::io;
use std::path::PathBuf;
use std::process;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "questline-migrate")]
#[command(about = "Schema migration tool for Questline")]
#[command(version)]
struct Cli {
    /// Database connection URL (else QUESTLINE_DATABASE_URL, DATABASE_URL, then config)
    #[arg(long, global = true)]
    database_url: Option<String>,

    /// Load migrations from this directory instead of the bundled set
    #[arg(long, global = true)]
    migrations_dir: Option<PathBuf>,

    /// Seconds to wait for the deployment lock
    #[arg(long, global = true)]
    lock_timeout_secs: Option<u64>,

    /// Overall deadline in seconds; also caps each statement unless a statement
    /// timeout is configured
    #[arg(long, global = true)]
    timeout_secs: Option<u64>,

    /// Machine-readable JSON output
    #[arg(long, global = true)]
    json: bool,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Quiet output (errors only)
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply pending migrations
    Run,

    /// Show migration status (applied, pending, drifted)
    Status,

    /// Verify the database is reachable and the ledger exists
    Check,

    /// Connect, migrate and verify; exits non-zero unless fully applied
    Preflight,
}

fn main() {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    // Initialize logging
    let default_filter = if cli.quiet {
        "error"
    } else if cli.verbose {
        "debug"
    } else {
        "info"
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    let code = match execute(cli) {
        Ok(outcome) => outcome.code(),
        Err(e) => {
            eprintln!("{} {:#}", "❌ Error:".red().bold(), e);
            Outcome::Failure.code()
        }
    };
    process::exit(code);
}

fn execute(cli: Cli) -> anyhow::Result<Outcome> {
    let config = RunnerConfig::load().context("failed to load configuration")?;

    let database_url =
        settings::resolve_database_url(cli.database_url, |var| std::env::var(var).ok(), &config);
    let deadline = cli.timeout_secs.map(Duration::from_secs);
    let options = settings::runner_options(&config, cli.lock_timeout_secs, deadline);

    let source = settings::migration_source(settings::migrations_dir(cli.migrations_dir, &config))
        .context("failed to load migrations")?;
    let connector = PostgresConnector::new(database_url, config.migrations.lock_key)
        .with_statement_timeout(settings::statement_timeout(&config, deadline));

    let mut runner = MigrationRunner::new(connector, source)
        .with_options(options)
        .with_cancel_flag(settings::deadline_flag(deadline));

    let format = if cli.json { OutputFormat::Json } else { OutputFormat::Text };
    let mut console =
        Console::new(io::stdout().lock(), io::stderr().lock(), format).quiet(cli.quiet);

    let outcome = match cli.command {
        Commands::Run => commands::run(&mut runner, &mut console),
        Commands::Status => commands::status(&mut runner, &mut console),
        Commands::Check => commands::check(&mut runner, &mut console),
        Commands::Preflight => commands::preflight(&mut runner, &mut console),
    }
    .context("failed to write output")?;

    Ok(outcome)
}
