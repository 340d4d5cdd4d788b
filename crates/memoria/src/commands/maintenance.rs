//! Maintenance commands - decay, deduplication, embeddings, WAL and stats.

use anyhow::Result;
use clap::{Args, Subcommand};
use console::{Style, style};

use memoria_engine::{FactId, PruneMode};

use super::{Context, Outcome, print_json, truncate, with_spinner};

// ─────────────────────────────────────────────────────────────────────────────
// Arguments
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Args, Debug)]
pub struct PruneArgs {
    /// hard (delete expired), soft (lower confidence near expiry) or both
    #[arg(long, default_value = "both")]
    pub mode: PruneMode,
}

#[derive(Args, Debug)]
pub struct DuplicatesArgs {
    /// Cosine similarity at or above which two facts count as duplicates
    #[arg(long, short)]
    pub threshold: Option<f32>,
}

#[derive(Args, Debug)]
pub struct ConsolidateArgs {
    /// Cosine similarity at or above which facts are merged
    #[arg(long, short)]
    pub threshold: Option<f32>,
}

#[derive(Args, Debug)]
pub struct BackfillArgs {
    /// Drop and recreate the vector index first, then embed every fact
    #[arg(long)]
    pub rebuild: bool,
}

#[derive(Args, Debug)]
pub struct WalArgs {
    #[command(subcommand)]
    pub command: WalCommand,
}

#[derive(Subcommand, Debug)]
pub enum WalCommand {
    /// Show how many entries are waiting in the log
    Status,

    /// Rewrite the log without completed or stale entries
    Compact,
}

// ─────────────────────────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────────────────────────

pub async fn prune(args: PruneArgs, ctx: &Context) -> Result<Outcome> {
    let engine = ctx.open_engine().await?;
    let result = engine.prune(args.mode).await;
    engine.close().await;
    let report = result?;

    if ctx.json_output {
        print_json(&report)?;
    } else {
        println!(
            "{} {} expired fact(s) deleted, {} fact(s) decayed",
            style("✓").green(),
            style(report.expired).cyan(),
            style(report.decayed).cyan()
        );
    }
    Ok(Outcome::Done)
}

pub async fn duplicates(args: DuplicatesArgs, ctx: &Context) -> Result<Outcome> {
    let engine = ctx.open_engine().await?;
    let result = engine.find_duplicates(args.threshold).and_then(|pairs| {
        let mut ids: Vec<FactId> = pairs.iter().flat_map(|p| [p.first, p.second]).collect();
        ids.sort_by_key(|id| id.to_string());
        ids.dedup();
        let facts = engine.get_many(&ids)?;
        Ok((pairs, facts))
    });
    engine.close().await;
    let (pairs, facts) = result?;

    if ctx.json_output {
        print_json(&pairs)?;
        return Ok(Outcome::Done);
    }

    let dim = Style::new().dim();
    if pairs.is_empty() {
        println!("{}", dim.apply_to("No duplicates found"));
        return Ok(Outcome::Done);
    }
    let text_of = |id: FactId| {
        facts
            .iter()
            .find(|f| f.id == id)
            .map(|f| truncate(&f.text, 60))
            .unwrap_or_default()
    };
    println!("{}", style("Near-duplicate Facts").bold());
    println!("{}", dim.apply_to("─".repeat(50)));
    for pair in &pairs {
        println!("{}", style(format!("{:.3}", pair.similarity)).cyan());
        println!("  {} {}", dim.apply_to(pair.first), text_of(pair.first));
        println!("  {} {}", dim.apply_to(pair.second), text_of(pair.second));
    }
    Ok(Outcome::Done)
}

pub async fn consolidate(args: ConsolidateArgs, ctx: &Context) -> Result<Outcome> {
    let engine = ctx.open_engine().await?;
    let result = with_spinner(ctx, "Consolidating...", engine.consolidate(args.threshold)).await;
    engine.close().await;
    let report = result?;

    if ctx.json_output {
        print_json(&report)?;
        return Ok(Outcome::Done);
    }

    let dim = Style::new().dim();
    println!(
        "{} {} cluster(s) merged, {} fact(s) removed ({} scanned)",
        style("✓").green(),
        style(report.clusters.len()).cyan(),
        style(report.deleted).cyan(),
        report.scanned
    );
    if report.skipped_identifiers > 0 {
        println!(
            "  {}",
            dim.apply_to(format!(
                "{} identifier-like fact(s) left alone",
                report.skipped_identifiers
            ))
        );
    }
    if ctx.verbose {
        for cluster in &report.clusters {
            println!(
                "  {} {}",
                style(cluster.merged_id).cyan(),
                dim.apply_to(format!(
                    "from {} facts{}",
                    cluster.members.len(),
                    if cluster.summarized { ", summarized" } else { "" }
                ))
            );
        }
    }
    Ok(Outcome::Done)
}

pub async fn backfill(args: BackfillArgs, ctx: &Context) -> Result<Outcome> {
    let engine = ctx.open_engine().await?;
    let message = if args.rebuild {
        "Rebuilding vector index..."
    } else {
        "Embedding facts..."
    };
    let result = with_spinner(ctx, message, engine.backfill(args.rebuild)).await;
    engine.close().await;
    let report = result?;

    if ctx.json_output {
        print_json(&report)?;
    } else {
        println!(
            "{} {} of {} fact(s) embedded{}",
            style("✓").green(),
            style(report.embedded).cyan(),
            report.scanned,
            if report.rebuilt { " into a fresh index" } else { "" }
        );
        if report.failed > 0 {
            println!(
                "  {}",
                style(format!("{} fact(s) could not be embedded", report.failed)).yellow()
            );
        }
    }
    Ok(Outcome::Done)
}

pub async fn stats(ctx: &Context) -> Result<Outcome> {
    let engine = ctx.open_engine().await?;
    let result = engine.stats();
    engine.close().await;
    let stats = result?;

    if ctx.json_output {
        print_json(&stats)?;
        return Ok(Outcome::Done);
    }

    let dim = Style::new().dim();
    let none = || dim.apply_to("none").to_string();

    println!("{}", style("Memory Statistics").bold());
    println!("{}", dim.apply_to("─".repeat(50)));
    println!();
    println!("  Facts:       {}", style(stats.store.facts).cyan());
    println!("  Current:     {}", style(stats.store.current).cyan());
    println!("  Superseded:  {}", style(stats.store.superseded).cyan());
    println!("  Embedded:    {}", style(stats.store.embedded).cyan());
    println!("  Links:       {}", style(stats.store.links).cyan());
    println!("  Schema:      v{}", stats.store.schema_version);
    println!("  Data dir:    {}", stats.data_dir.display());
    println!();

    println!("{}", style("Providers").bold());
    println!("{}", dim.apply_to("─".repeat(50)));
    println!();
    println!(
        "  Embedder:    {}",
        stats.embedder.clone().unwrap_or_else(none)
    );
    println!("  Dimensions:  {}", stats.dimensions);
    println!(
        "  Completer:   {}",
        stats.completer.clone().unwrap_or_else(none)
    );
    println!("  Classifier:  {}", stats.classifier);
    println!();

    println!("{}", style("Vector Index").bold());
    println!("{}", dim.apply_to("─".repeat(50)));
    println!();
    if stats.vector_available {
        println!("  Status:      {}", style("available").green());
    } else {
        println!("  Status:      {}", style("unavailable").yellow());
    }
    if let Some(count) = stats.vector_count {
        println!("  Vectors:     {}", style(count).cyan());
    }
    if let Some(err) = &stats.vector_error {
        println!("  Error:       {}", style(err).yellow());
    }
    println!(
        "  WAL pending: {}{}",
        stats.wal_pending,
        stats
            .wal_format
            .as_deref()
            .map(|f| format!(" ({f})"))
            .unwrap_or_default()
    );
    Ok(Outcome::Done)
}

pub async fn wal(args: WalArgs, ctx: &Context) -> Result<Outcome> {
    let engine = ctx.open_engine().await?;
    let result = match args.command {
        WalCommand::Status => engine
            .wal_pending()
            .map(|pending| serde_json::json!({ "pending": pending })),
        WalCommand::Compact => engine
            .compact_wal()
            .and_then(|report| Ok(serde_json::to_value(report)?)),
    };
    let recovery = engine.open_report().recovery.clone();
    engine.close().await;
    let value = result?;

    if ctx.json_output {
        print_json(&value)?;
        return Ok(Outcome::Done);
    }

    let dim = Style::new().dim();
    match args.command {
        WalCommand::Status => {
            println!("  Pending:     {}", style(&value["pending"]).cyan());
            println!(
                "  {}",
                dim.apply_to(format!(
                    "replayed at open: {}, skipped: {}, discarded: {}, failed: {}",
                    recovery.replayed, recovery.skipped, recovery.discarded, recovery.failed
                ))
            );
        }
        WalCommand::Compact => {
            println!(
                "{} {} entr(ies) kept, {} dropped",
                style("✓").green(),
                style(&value["kept"]).cyan(),
                style(&value["dropped"]).cyan()
            );
        }
    }
    Ok(Outcome::Done)
}
