//! Config command - configuration management.

use std::path::PathBuf;

use anyhow::{Context as _, Result};
use clap::{Args, Subcommand};
use console::{Style, style};

use memoria_config::{MemoriaConfig, save_config, user_config_path};

use super::{Context, Outcome, print_json};

/// Arguments for the config command.
#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Show the resolved configuration
    Show,

    /// Show the config files in use and the data directory
    Path,

    /// Write a config file with defaults
    Init {
        /// Where to write (defaults to the user config file)
        #[arg(long)]
        path: Option<PathBuf>,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

pub async fn run(args: ConfigArgs, ctx: &Context) -> Result<Outcome> {
    match args.command {
        ConfigCommand::Show => cmd_show(ctx),
        ConfigCommand::Path => cmd_path(ctx),
        ConfigCommand::Init { path, force } => cmd_init(path, force, ctx),
    }
}

fn cmd_show(ctx: &Context) -> Result<Outcome> {
    if ctx.json_output {
        print_json(&ctx.config)?;
        return Ok(Outcome::Done);
    }

    let dim = Style::new().dim();
    if ctx.config_sources.is_empty() {
        println!("{}", dim.apply_to("# no config files found, showing defaults"));
    } else {
        for source in &ctx.config_sources {
            println!("{}", dim.apply_to(format!("# loaded from {}", source.display())));
        }
    }
    println!();
    print!("{}", ctx.config.to_toml()?);
    Ok(Outcome::Done)
}

fn cmd_path(ctx: &Context) -> Result<Outcome> {
    let user = user_config_path();

    if ctx.json_output {
        print_json(&serde_json::json!({
            "userConfig": user,
            "override": ctx.config_override,
            "loaded": ctx.config_sources,
            "dataDir": ctx.data_dir,
        }))?;
        return Ok(Outcome::Done);
    }

    let dim = Style::new().dim();
    println!("{}", style("Configuration").bold());
    println!("{}", dim.apply_to("─".repeat(50)));
    println!();
    match &user {
        Some(path) => {
            let marker = if path.exists() {
                style("✓").green()
            } else {
                style("✗").dim()
            };
            println!("  {} User config:  {}", marker, path.display());
        }
        None => println!("  {}", dim.apply_to("No user config directory on this platform")),
    }
    if let Some(path) = &ctx.config_override {
        println!("  {} Override:     {}", style("✓").green(), path.display());
    }
    for source in &ctx.config_sources {
        if Some(source) != user.as_ref() && Some(source) != ctx.config_override.as_ref() {
            println!("  {} Project:      {}", style("✓").green(), source.display());
        }
    }
    println!("    Data dir:     {}", ctx.data_dir.display());
    Ok(Outcome::Done)
}

fn cmd_init(path: Option<PathBuf>, force: bool, ctx: &Context) -> Result<Outcome> {
    let path = match path.or_else(user_config_path) {
        Some(path) => path,
        None => anyhow::bail!("no user config directory on this platform; pass --path"),
    };
    if path.exists() && !force {
        anyhow::bail!(
            "{} already exists; pass --force to overwrite",
            path.display()
        );
    }

    save_config(&MemoriaConfig::default(), &path)
        .with_context(|| format!("writing {}", path.display()))?;

    if ctx.json_output {
        print_json(&serde_json::json!({ "written": path }))?;
    } else {
        println!("{} Wrote {}", style("✓").green(), path.display());
    }
    Ok(Outcome::Done)
}
