//! Link commands - relate facts and walk the link graph.

use anyhow::Result;
use clap::Args;
use console::{Style, style};

use memoria_engine::{FactId, LinkType};

use super::{Context, Outcome, print_json, truncate};

#[derive(Args, Debug)]
pub struct LinkArgs {
    /// Source fact id
    pub source: FactId,

    /// Target fact id
    pub target: FactId,

    /// Link type (related_to, part_of, caused_by, depends_on, supersedes)
    #[arg(long = "type", short = 't', default_value = "related_to")]
    pub link_type: LinkType,

    /// Edge weight in 0.0..=1.0
    #[arg(long, short, default_value_t = 1.0)]
    pub strength: f32,
}

#[derive(Args, Debug)]
pub struct UnlinkArgs {
    /// Source fact id
    pub source: FactId,

    /// Target fact id
    pub target: FactId,

    /// Only remove links of this type
    #[arg(long = "type", short = 't')]
    pub link_type: Option<LinkType>,
}

#[derive(Args, Debug)]
pub struct TraverseArgs {
    /// Fact ids to start from
    #[arg(required = true)]
    pub start: Vec<FactId>,

    /// Maximum hops (defaults to graph.default_depth)
    #[arg(long, short)]
    pub depth: Option<usize>,
}

pub async fn link(args: LinkArgs, ctx: &Context) -> Result<Outcome> {
    let engine = ctx.open_engine().await?;
    let result = engine
        .link(args.source, args.target, args.link_type, args.strength)
        .await;
    engine.close().await;
    let link = result?;

    if ctx.json_output {
        print_json(&link)?;
    } else {
        println!(
            "{} {} {} {} {}",
            style("✓").green(),
            link.source_id,
            style(format!("-[{}]->", link.link_type)).cyan(),
            link.target_id,
            Style::new()
                .dim()
                .apply_to(format!("(strength {:.2})", link.strength))
        );
    }
    Ok(Outcome::Done)
}

pub async fn unlink(args: UnlinkArgs, ctx: &Context) -> Result<Outcome> {
    let engine = ctx.open_engine().await?;
    let result = engine.unlink(args.source, args.target, args.link_type).await;
    engine.close().await;
    let removed = result?;

    if ctx.json_output {
        print_json(&serde_json::json!({ "removed": removed }))?;
    } else if removed == 0 {
        println!("{}", Style::new().dim().apply_to("No matching links"));
    } else {
        println!("{} Removed {} link(s)", style("✓").green(), style(removed).cyan());
    }
    Ok(Outcome::Done)
}

pub async fn traverse(args: TraverseArgs, ctx: &Context) -> Result<Outcome> {
    let engine = ctx.open_engine().await?;
    let result = engine.traverse(&args.start, args.depth).and_then(|hits| {
        let ids: Vec<FactId> = hits.iter().map(|h| h.fact_id).collect();
        let facts = engine.get_many(&ids)?;
        Ok((hits, facts))
    });
    engine.close().await;
    let (hits, facts) = result?;

    if ctx.json_output {
        print_json(&hits)?;
        return Ok(Outcome::Done);
    }

    let dim = Style::new().dim();
    if hits.is_empty() {
        println!("{}", dim.apply_to("No linked facts"));
        return Ok(Outcome::Done);
    }
    println!("{}", style("Linked Facts").bold());
    println!("{}", dim.apply_to("─".repeat(50)));
    for hit in &hits {
        let text = facts
            .iter()
            .find(|f| f.id == hit.fact_id)
            .map(|f| truncate(&f.text, 60))
            .unwrap_or_default();
        let indent = "  ".repeat(hit.depth.saturating_sub(1));
        println!("{}{} {}", indent, style(hit.link_type).cyan(), text);
        println!(
            "{}  {}",
            indent,
            dim.apply_to(format!(
                "{} | depth {} | strength {:.3} | via {}",
                hit.fact_id, hit.depth, hit.strength, hit.via
            ))
        );
    }
    Ok(Outcome::Done)
}
