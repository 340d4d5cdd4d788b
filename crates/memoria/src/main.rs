//! Memoria - long-term memory for AI agents
//!
//! Main entry point for the Memoria CLI.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use console::Style;
use tracing::warn;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};

use memoria_config::{ConfigError, LoadedConfig, MemoriaConfig, resolve_data_dir};
use memoria_engine::{ErrorKind, MemoryError};

mod commands;

use commands::{Outcome, config, fact, link, maintenance};

// ─────────────────────────────────────────────────────────────────────────────
// CLI Structure
// ─────────────────────────────────────────────────────────────────────────────

/// Memoria - long-term memory for AI agents
#[derive(Parser)]
#[command(name = "memoria")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output as JSON (for scripting)
    #[arg(long, global = true)]
    pub json: bool,

    /// Config file to use instead of the user and project files
    #[arg(long, global = true, env = "MEMORIA_CONFIG")]
    pub config: Option<PathBuf>,

    /// Data directory (overrides config and MEMORIA_DATA_DIR)
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Store a fact
    Store(fact::StoreArgs),

    /// Show one fact by id
    Get(fact::GetArgs),

    /// Exact lookup by entity, key and tag
    Lookup(fact::LookupArgs),

    /// Hybrid keyword and semantic search
    Search(fact::SearchArgs),

    /// Change a fact in place
    Update(fact::UpdateArgs),

    /// Delete a fact and its links
    Delete(fact::DeleteArgs),

    /// Link two facts
    Link(link::LinkArgs),

    /// Remove links between two facts
    Unlink(link::UnlinkArgs),

    /// Walk the link graph from one or more facts
    Traverse(link::TraverseArgs),

    /// Run a decay sweep now
    Prune(maintenance::PruneArgs),

    /// List near-duplicate fact pairs
    Duplicates(maintenance::DuplicatesArgs),

    /// Merge near-duplicate facts
    Consolidate(maintenance::ConsolidateArgs),

    /// Embed facts that have no vector
    Backfill(maintenance::BackfillArgs),

    /// Show store statistics
    Stats,

    /// Write-ahead log maintenance
    Wal(maintenance::WalArgs),

    /// Configuration management
    Config(config::ConfigArgs),
}

// ─────────────────────────────────────────────────────────────────────────────
// Exit codes
// ─────────────────────────────────────────────────────────────────────────────

const EXIT_FATAL: u8 = 1;
const EXIT_VALIDATION: u8 = 2;
const EXIT_NOT_FOUND: u8 = 3;
const EXIT_DEGRADED: u8 = 4;

/// Exit code for the first engine or config error in the chain.
fn exit_code(err: &anyhow::Error) -> u8 {
    for cause in err.chain() {
        if let Some(e) = cause.downcast_ref::<MemoryError>() {
            return match e.kind() {
                ErrorKind::Validation => EXIT_VALIDATION,
                ErrorKind::NotFound => EXIT_NOT_FOUND,
                ErrorKind::VectorBackend => EXIT_DEGRADED,
                ErrorKind::Storage | ErrorKind::Provider => EXIT_FATAL,
            };
        }
        if cause.downcast_ref::<ConfigError>().is_some() {
            return EXIT_VALIDATION;
        }
    }
    EXIT_FATAL
}

fn report_error(err: &anyhow::Error, json: bool) {
    if json {
        let body = serde_json::json!({ "error": format!("{err:#}") });
        eprintln!("{body}");
    } else {
        let red = Style::new().red().bold();
        eprintln!("{} {:#}", red.apply_to("Error:"), err);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Logging
// ─────────────────────────────────────────────────────────────────────────────

const CRATES: [&str; 4] = ["memoria", "memoria_engine", "memoria_llm", "memoria_config"];

fn crate_filter(level: &str, rest: &str) -> String {
    let mut directives: Vec<String> = CRATES.iter().map(|c| format!("{c}={level}")).collect();
    directives.push(rest.to_string());
    directives.join(",")
}

/// Console (human-readable, stderr) plus an optional daily JSON file.
///
/// The returned guard flushes the file writer on drop.
fn init_tracing(verbose: bool, config: &MemoriaConfig, data_dir: &Path) -> Option<WorkerGuard> {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::{EnvFilter, fmt};

    let console_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new(crate_filter("debug", "warn"))
        } else {
            EnvFilter::new("warn")
        }
    });

    let mut guard = None;
    let file_layer = if config.logging.file {
        let log_dir = config
            .logging
            .dir
            .clone()
            .or_else(|| memoria_config::user_config_dir().map(|d| d.join("logs")))
            .unwrap_or_else(|| data_dir.join("logs"));
        let appender = RollingFileAppender::builder()
            .rotation(Rotation::DAILY)
            .filename_prefix("memoria")
            .filename_suffix("log")
            .build(&log_dir);
        match appender {
            Ok(appender) => {
                let (writer, g) = tracing_appender::non_blocking(appender);
                guard = Some(g);
                Some(
                    fmt::layer()
                        .json()
                        .with_writer(writer)
                        .with_filter(EnvFilter::new(crate_filter(&config.logging.level, "warn"))),
                )
            }
            Err(e) => {
                eprintln!("warning: file logging disabled: {e}");
                None
            }
        }
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(true)
                .with_writer(std::io::stderr)
                .with_filter(console_filter),
        )
        .with(file_layer)
        .init();

    guard
}

// ─────────────────────────────────────────────────────────────────────────────
// Main
// ─────────────────────────────────────────────────────────────────────────────

fn load_configuration(explicit: Option<&Path>) -> memoria_config::Result<LoadedConfig> {
    let loaded = match explicit {
        Some(path) => memoria_config::load_explicit(path)?,
        None => memoria_config::load_config(None)?,
    };
    loaded.config.validate()?;
    Ok(loaded)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let loaded = match load_configuration(cli.config.as_deref()) {
        Ok(loaded) => loaded,
        Err(e) => {
            report_error(&anyhow::Error::new(e), cli.json);
            return ExitCode::from(EXIT_VALIDATION);
        }
    };
    let data_dir = resolve_data_dir(&loaded.config, cli.data_dir.as_deref());
    let _guard = init_tracing(cli.verbose, &loaded.config, &data_dir);
    for warning in &loaded.warnings {
        warn!("{warning}");
    }

    // Create context for commands
    let ctx = commands::Context {
        json_output: cli.json,
        verbose: cli.verbose,
        config_sources: loaded
            .loaded_from()
            .into_iter()
            .map(Path::to_path_buf)
            .collect(),
        config_override: cli.config.clone(),
        config: loaded.config,
        data_dir,
    };

    // Dispatch to command handlers
    let result = match cli.command {
        Commands::Store(args) => fact::store(args, &ctx).await,
        Commands::Get(args) => fact::get(args, &ctx).await,
        Commands::Lookup(args) => fact::lookup(args, &ctx).await,
        Commands::Search(args) => fact::search(args, &ctx).await,
        Commands::Update(args) => fact::update(args, &ctx).await,
        Commands::Delete(args) => fact::delete(args, &ctx).await,
        Commands::Link(args) => link::link(args, &ctx).await,
        Commands::Unlink(args) => link::unlink(args, &ctx).await,
        Commands::Traverse(args) => link::traverse(args, &ctx).await,
        Commands::Prune(args) => maintenance::prune(args, &ctx).await,
        Commands::Duplicates(args) => maintenance::duplicates(args, &ctx).await,
        Commands::Consolidate(args) => maintenance::consolidate(args, &ctx).await,
        Commands::Backfill(args) => maintenance::backfill(args, &ctx).await,
        Commands::Stats => maintenance::stats(&ctx).await,
        Commands::Wal(args) => maintenance::wal(args, &ctx).await,
        Commands::Config(args) => config::run(args, &ctx).await,
    };

    match result {
        Ok(Outcome::Done) => ExitCode::SUCCESS,
        Ok(Outcome::Degraded) => ExitCode::from(EXIT_DEGRADED),
        Err(e) => {
            report_error(&e, ctx.json_output);
            ExitCode::from(exit_code(&e))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use memoria_engine::ValidationError;

    #[test]
    fn test_exit_codes_follow_error_kind() {
        let validation = anyhow::Error::new(MemoryError::from(ValidationError::EmptyText));
        assert_eq!(exit_code(&validation), EXIT_VALIDATION);

        let missing = anyhow::Error::new(MemoryError::NotFound("fact x".into()));
        assert_eq!(exit_code(&missing), EXIT_NOT_FOUND);

        let vector = anyhow::Error::new(MemoryError::VectorBackend("down".into()))
            .context("finding duplicates");
        assert_eq!(exit_code(&vector), EXIT_DEGRADED);

        assert_eq!(exit_code(&anyhow::anyhow!("boom")), EXIT_FATAL);
    }

    #[test]
    fn test_crate_filter() {
        assert_eq!(
            crate_filter("debug", "warn"),
            "memoria=debug,memoria_engine=debug,memoria_llm=debug,memoria_config=debug,warn"
        );
    }
}
