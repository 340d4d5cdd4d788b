//! CLI command handlers.

pub mod config;
pub mod fact;
pub mod link;
pub mod maintenance;

use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context as _, Result};
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;

use memoria_config::MemoriaConfig;
use memoria_engine::MemoryEngine;

/// Shared context for all commands.
#[derive(Debug, Clone)]
pub struct Context {
    /// Output as JSON for scripting.
    pub json_output: bool,
    /// Verbose output enabled.
    pub verbose: bool,
    /// Resolved configuration.
    pub config: MemoriaConfig,
    /// Config files that contributed to `config`, lowest priority first.
    pub config_sources: Vec<PathBuf>,
    /// File given with `--config`, if any.
    pub config_override: Option<PathBuf>,
    /// Resolved data directory.
    pub data_dir: PathBuf,
}

impl Context {
    /// Open the engine for a single command. Background tasks stay off; the
    /// open itself replays the WAL and runs one decay sweep.
    pub async fn open_engine(&self) -> Result<MemoryEngine> {
        MemoryEngine::builder(self.config.clone())
            .with_data_dir(&self.data_dir)
            .background_tasks(false)
            .open()
            .await
            .with_context(|| format!("opening memory at {}", self.data_dir.display()))
    }
}

/// How a successful command finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Done,
    /// Results were produced without the vector index.
    Degraded,
}

impl Outcome {
    pub fn degraded_if(degraded: bool) -> Self {
        if degraded { Self::Degraded } else { Self::Done }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

pub(crate) fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Truncate a string for display, on a character boundary.
pub(crate) fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_chars.saturating_sub(3)).collect();
        format!("{kept}...")
    }
}

/// Parse an RFC 3339 timestamp or a bare `YYYY-MM-DD` date (midnight UTC).
pub(crate) fn parse_datetime(raw: &str) -> Result<DateTime<Utc>> {
    if let Ok(at) = DateTime::parse_from_rfc3339(raw) {
        return Ok(at.with_timezone(&Utc));
    }
    let date = NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .with_context(|| format!("'{raw}' is not an RFC 3339 timestamp or YYYY-MM-DD date"))?;
    Ok(date.and_time(NaiveTime::MIN).and_utc())
}

/// Run `work` behind a spinner on stderr. No spinner in JSON mode.
pub(crate) async fn with_spinner<T>(
    ctx: &Context,
    message: impl Into<String>,
    work: impl Future<Output = T>,
) -> T {
    if ctx.json_output {
        return work.await;
    }
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::with_template("{spinner:.cyan} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.set_message(message.into());
    pb.enable_steady_tick(Duration::from_millis(100));
    let out = work.await;
    pb.finish_and_clear();
    out
}

pub(crate) fn format_datetime(at: &DateTime<Utc>) -> String {
    at.format("%Y-%m-%d %H:%M").to_string()
}
