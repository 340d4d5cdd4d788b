//! Fact commands - store, read, search, change and delete facts.

use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};
use chrono::{DateTime, Utc};
use clap::{ArgGroup, Args, ValueEnum};
use console::{Style, style};
use serde::Deserialize;

use memoria_engine::{
    Category, DecayClass, Fact, FactId, FactPatch, HitSource, LookupOrder, LookupQuery,
    MemoryEngine, MemoryError, MemoryLink, Scope, ScopeFilter, SearchFilter, SearchQuery,
    StoreAction, StoreOutcome, StoreRequest, Triple,
};

use super::{
    Context, Outcome, format_datetime, parse_datetime, print_json, truncate, with_spinner,
};

// ─────────────────────────────────────────────────────────────────────────────
// Arguments
// ─────────────────────────────────────────────────────────────────────────────

/// Caller identity used to filter scoped facts. Without any flag every scope
/// is visible.
#[derive(Args, Debug, Default)]
pub struct ScopeArgs {
    /// Admit facts scoped to this user
    #[arg(long)]
    pub user: Option<String>,

    /// Admit facts scoped to this agent
    #[arg(long)]
    pub agent: Option<String>,

    /// Admit facts scoped to this session
    #[arg(long)]
    pub session: Option<String>,
}

impl ScopeArgs {
    fn filter(&self) -> Option<ScopeFilter> {
        if self.user.is_none() && self.agent.is_none() && self.session.is_none() {
            return None;
        }
        Some(ScopeFilter {
            user: self.user.clone(),
            agent: self.agent.clone(),
            session: self.session.clone(),
        })
    }
}

#[derive(Args, Debug)]
pub struct StoreArgs {
    /// Fact text
    #[arg(required_unless_present = "batch", conflicts_with = "batch")]
    pub text: Option<String>,

    /// Store every line of an NDJSON file (one request object per line)
    #[arg(long, value_name = "FILE")]
    pub batch: Option<PathBuf>,

    /// Category (preference, fact, decision, entity, pattern, rule, other or a custom label)
    #[arg(long, short)]
    pub category: Option<Category>,

    /// Subject of the structured triple
    #[arg(long, requires_all = ["key", "value"])]
    pub entity: Option<String>,

    /// Attribute of the structured triple
    #[arg(long, requires_all = ["entity", "value"])]
    pub key: Option<String>,

    /// Value of the structured triple
    #[arg(long, requires_all = ["entity", "key"])]
    pub value: Option<String>,

    /// Importance in 0.0..=1.0
    #[arg(long, short)]
    pub importance: Option<f32>,

    /// Decay class (permanent, stable, active, session, checkpoint)
    #[arg(long = "decay", short = 'd')]
    pub decay_class: Option<DecayClass>,

    /// Scope: global, user:<id>, agent:<id> or session:<id>
    #[arg(long, default_value = "global")]
    pub scope: Scope,

    /// Tag (repeatable)
    #[arg(long = "tag", short = 't')]
    pub tags: Vec<String>,

    /// Short summary shown in listings
    #[arg(long)]
    pub summary: Option<String>,

    /// When the fact became true (RFC 3339 or YYYY-MM-DD)
    #[arg(long, value_parser = parse_datetime)]
    pub source_date: Option<DateTime<Utc>>,

    /// Fact this one replaces (repeatable)
    #[arg(long)]
    pub supersedes: Vec<FactId>,

    /// Use this id instead of generating one
    #[arg(long)]
    pub id: Option<FactId>,
}

#[derive(Args, Debug)]
pub struct GetArgs {
    /// Fact id
    pub id: FactId,

    /// Also list the fact's links
    #[arg(long)]
    pub links: bool,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum OrderArg {
    /// Importance times confidence, newest first on ties
    Relevance,
    /// Oldest effective date first
    Oldest,
    /// Newest effective date first
    Newest,
}

impl From<OrderArg> for LookupOrder {
    fn from(order: OrderArg) -> Self {
        match order {
            OrderArg::Relevance => LookupOrder::Relevance,
            OrderArg::Oldest => LookupOrder::EffectiveDateAsc,
            OrderArg::Newest => LookupOrder::EffectiveDateDesc,
        }
    }
}

#[derive(Args, Debug)]
pub struct LookupArgs {
    /// Entity to look up
    pub entity: String,

    /// Restrict to one key
    #[arg(long, short)]
    pub key: Option<String>,

    /// Restrict to facts with this tag
    #[arg(long, short)]
    pub tag: Option<String>,

    #[command(flatten)]
    pub scope: ScopeArgs,

    /// Answer as of this point in time (RFC 3339 or YYYY-MM-DD)
    #[arg(long, value_parser = parse_datetime)]
    pub as_of: Option<DateTime<Utc>>,

    /// Include superseded facts
    #[arg(long)]
    pub include_superseded: bool,

    /// Result order
    #[arg(long, value_enum, default_value = "relevance")]
    pub order: OrderArg,

    /// Maximum number of results
    #[arg(long, short)]
    pub limit: Option<usize>,
}

#[derive(Args, Debug)]
pub struct SearchArgs {
    /// Search query
    pub query: String,

    /// Maximum number of results
    #[arg(long, short)]
    pub limit: Option<usize>,

    /// Restrict to one category
    #[arg(long, short)]
    pub category: Option<String>,

    /// Restrict to facts with this tag
    #[arg(long, short)]
    pub tag: Option<String>,

    #[command(flatten)]
    pub scope: ScopeArgs,

    /// Answer as of this point in time (RFC 3339 or YYYY-MM-DD)
    #[arg(long, value_parser = parse_datetime)]
    pub as_of: Option<DateTime<Utc>>,

    /// Include superseded facts
    #[arg(long)]
    pub include_superseded: bool,

    /// Add facts linked to the hits, up to this many hops
    #[arg(long, value_name = "DEPTH")]
    pub expand: Option<usize>,

    /// Rewrite the query with the completion provider before embedding
    #[arg(long, conflicts_with = "no_rewrite")]
    pub rewrite: bool,

    /// Never rewrite the query
    #[arg(long)]
    pub no_rewrite: bool,
}

#[derive(Args, Debug)]
#[command(group(
    ArgGroup::new("fields")
        .required(true)
        .multiple(true)
        .args(["text", "category", "importance", "decay_class", "tags", "summary", "entity"])
))]
pub struct UpdateArgs {
    /// Fact id
    pub id: FactId,

    /// New text (re-embeds the fact)
    #[arg(long)]
    pub text: Option<String>,

    #[arg(long, short)]
    pub category: Option<Category>,

    #[arg(long, short)]
    pub importance: Option<f32>,

    #[arg(long = "decay", short = 'd')]
    pub decay_class: Option<DecayClass>,

    /// Replace all tags (comma separated)
    #[arg(long, value_delimiter = ',')]
    pub tags: Option<Vec<String>>,

    #[arg(long)]
    pub summary: Option<String>,

    #[arg(long, requires_all = ["key", "value"])]
    pub entity: Option<String>,

    #[arg(long, requires_all = ["entity", "value"])]
    pub key: Option<String>,

    #[arg(long, requires_all = ["entity", "key"])]
    pub value: Option<String>,
}

#[derive(Args, Debug)]
pub struct DeleteArgs {
    /// Fact id
    pub id: FactId,
}

// ─────────────────────────────────────────────────────────────────────────────
// Batch input
// ─────────────────────────────────────────────────────────────────────────────

/// One line of a `store --batch` file.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct BatchLine {
    text: String,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    entity: Option<String>,
    #[serde(default)]
    key: Option<String>,
    #[serde(default)]
    value: Option<String>,
    #[serde(default)]
    importance: Option<f32>,
    #[serde(default)]
    decay_class: Option<String>,
    #[serde(default)]
    scope: Option<String>,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    summary: Option<String>,
    #[serde(default)]
    source_date: Option<DateTime<Utc>>,
}

impl BatchLine {
    fn into_request(self) -> Result<StoreRequest, MemoryError> {
        let mut request = StoreRequest::new(self.text);
        if let Some(category) = self.category {
            request = request.with_category(category.parse()?);
        }
        if let (Some(entity), Some(key), Some(value)) = (self.entity, self.key, self.value) {
            request = request.with_triple(entity, key, value);
        }
        if let Some(importance) = self.importance {
            request = request.with_importance(importance);
        }
        if let Some(class) = self.decay_class {
            request = request.with_decay_class(class.parse()?);
        }
        if let Some(scope) = self.scope {
            request = request.with_scope(scope.parse()?);
        }
        for tag in self.tags {
            request = request.with_tag(tag);
        }
        if let Some(summary) = self.summary {
            request = request.with_summary(summary);
        }
        if let Some(date) = self.source_date {
            request = request.with_source_date(date);
        }
        Ok(request)
    }
}

fn read_batch(path: &Path) -> Result<Vec<StoreRequest>> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("reading batch file {}", path.display()))?;
    let mut requests = Vec::new();
    for (n, line) in contents.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let parsed: BatchLine = serde_json::from_str(line)
            .with_context(|| format!("{} line {}", path.display(), n + 1))?;
        let request = parsed
            .into_request()
            .with_context(|| format!("{} line {}", path.display(), n + 1))?;
        requests.push(request);
    }
    Ok(requests)
}

// ─────────────────────────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────────────────────────

pub async fn store(args: StoreArgs, ctx: &Context) -> Result<Outcome> {
    if let Some(path) = &args.batch {
        return store_batch(path, ctx).await;
    }

    let mut request = StoreRequest::new(args.text.unwrap_or_default()).with_scope(args.scope);
    if let Some(category) = args.category {
        request = request.with_category(category);
    }
    if let (Some(entity), Some(key), Some(value)) = (args.entity, args.key, args.value) {
        request = request.with_triple(entity, key, value);
    }
    if let Some(importance) = args.importance {
        request = request.with_importance(importance);
    }
    if let Some(class) = args.decay_class {
        request = request.with_decay_class(class);
    }
    for tag in args.tags {
        request = request.with_tag(tag);
    }
    if let Some(summary) = args.summary {
        request = request.with_summary(summary);
    }
    if let Some(date) = args.source_date {
        request = request.with_source_date(date);
    }
    for id in args.supersedes {
        request = request.supersedes(id);
    }
    if let Some(id) = args.id {
        request = request.with_id(id);
    }

    let engine = ctx.open_engine().await?;
    let result = engine.store(request).await;
    engine.close().await;
    let outcome = result?;

    if ctx.json_output {
        print_json(&outcome)?;
    } else {
        print_store_outcome(&outcome, ctx);
    }
    Ok(Outcome::degraded_if(outcome.degraded()))
}

async fn store_batch(path: &Path, ctx: &Context) -> Result<Outcome> {
    let requests = read_batch(path)?;
    let count = requests.len();

    let engine = ctx.open_engine().await?;
    let result = with_spinner(
        ctx,
        format!("Storing {count} facts..."),
        engine.store_batch(requests),
    )
    .await;
    engine.close().await;
    let outcomes = result?;

    let degraded = outcomes.iter().any(StoreOutcome::degraded);
    if ctx.json_output {
        print_json(&outcomes)?;
    } else {
        let created = outcomes
            .iter()
            .filter(|o| !matches!(o.action, StoreAction::Reinforced))
            .count();
        println!(
            "{} {} stored, {} reinforced",
            style("✓").green(),
            style(created).cyan(),
            style(outcomes.len() - created).cyan()
        );
        if degraded {
            print_degraded_notice();
        }
    }
    Ok(Outcome::degraded_if(degraded))
}

pub async fn get(args: GetArgs, ctx: &Context) -> Result<Outcome> {
    let engine = ctx.open_engine().await?;
    let result = fact_with_links(&engine, args.id, args.links);
    engine.close().await;
    let (fact, links) = result?;

    if ctx.json_output {
        if args.links {
            print_json(&serde_json::json!({ "fact": fact, "links": links }))?;
        } else {
            print_json(&fact)?;
        }
        return Ok(Outcome::Done);
    }

    print_fact_detail(&fact);
    if args.links {
        let dim = Style::new().dim();
        println!();
        println!("{}", style("Links").bold());
        println!("{}", dim.apply_to("─".repeat(50)));
        if links.is_empty() {
            println!("{}", dim.apply_to("No links"));
        }
        for link in &links {
            let (arrow, other) = if link.source_id == fact.id {
                ("→", link.target_id)
            } else {
                ("←", link.source_id)
            };
            println!(
                "  {} {} {} {}",
                arrow,
                style(link.link_type).cyan(),
                other,
                dim.apply_to(format!("(strength {:.2})", link.strength))
            );
        }
    }
    Ok(Outcome::Done)
}

fn fact_with_links(
    engine: &MemoryEngine,
    id: FactId,
    with_links: bool,
) -> Result<(Fact, Vec<MemoryLink>), MemoryError> {
    let fact = engine
        .get(id)?
        .ok_or_else(|| MemoryError::NotFound(format!("fact {}", id)))?;
    let links = if with_links {
        engine.links(id)?
    } else {
        Vec::new()
    };
    Ok((fact, links))
}

pub async fn lookup(args: LookupArgs, ctx: &Context) -> Result<Outcome> {
    let mut query = LookupQuery::entity(&args.entity)
        .include_superseded(args.include_superseded)
        .order(args.order.into());
    if let Some(key) = &args.key {
        query = query.with_key(key);
    }
    if let Some(tag) = &args.tag {
        query = query.with_tag(tag);
    }
    if let Some(scope) = args.scope.filter() {
        query = query.with_scope(scope);
    }
    if let Some(at) = args.as_of {
        query = query.as_of(at);
    }
    if let Some(limit) = args.limit {
        query = query.limit(limit);
    }

    let engine = ctx.open_engine().await?;
    let result = engine.lookup(&query);
    engine.close().await;
    let facts = result?;

    if ctx.json_output {
        print_json(&facts)?;
        return Ok(Outcome::Done);
    }

    let dim = Style::new().dim();
    if facts.is_empty() {
        println!("{}", dim.apply_to("No facts found"));
        return Ok(Outcome::Done);
    }
    let title = match &args.key {
        Some(key) => format!("{}.{}", args.entity, key),
        None => args.entity.clone(),
    };
    println!("{}", style(title).bold());
    println!("{}", dim.apply_to("─".repeat(50)));
    for (i, fact) in facts.iter().enumerate() {
        print_fact_line(i + 1, fact);
    }
    Ok(Outcome::Done)
}

pub async fn search(args: SearchArgs, ctx: &Context) -> Result<Outcome> {
    let mut filter = SearchFilter::default().include_superseded(args.include_superseded);
    if let Some(scope) = args.scope.filter() {
        filter = filter.with_scope(scope);
    }
    if let Some(at) = args.as_of {
        filter = filter.as_of(at);
    }
    filter.category = args.category;
    filter.tag = args.tag;

    let mut query = SearchQuery::new(&args.query).with_filter(filter);
    if let Some(limit) = args.limit {
        query = query.with_limit(limit);
    }
    if let Some(depth) = args.expand {
        query = query.expand_links(depth);
    }
    if args.rewrite {
        query = query.rewrite(true);
    } else if args.no_rewrite {
        query = query.rewrite(false);
    }

    let dim = Style::new().dim();
    if ctx.verbose && !ctx.json_output {
        println!("{}", dim.apply_to(format!("Searching: \"{}\"", args.query)));
        println!();
    }

    let engine = ctx.open_engine().await?;
    let result = engine.search(&query).await;
    engine.close().await;
    let results = result?;

    if ctx.json_output {
        print_json(&results)?;
        return Ok(Outcome::degraded_if(results.degraded));
    }

    if let Some(rewritten) = &results.rewritten_query {
        println!("{}", dim.apply_to(format!("Rewritten as: {}", rewritten)));
    }
    if results.hits.is_empty() {
        println!("{}", dim.apply_to("No results found"));
    } else {
        println!("{}", style("Search Results").bold());
        println!("{}", dim.apply_to("─".repeat(50)));
        println!();
        for (i, hit) in results.hits.iter().enumerate() {
            let source = match hit.source {
                HitSource::FullText => "keyword",
                HitSource::Vector => "semantic",
                HitSource::Both => "keyword+semantic",
                HitSource::Graph => "linked",
            };
            println!("{}. {}", style(i + 1).cyan(), truncate(&hit.fact.text, 70));
            let mut detail = format!("score {:.4}, {}, id {}", hit.score, source, hit.fact.id);
            if let Some(via) = hit.via {
                detail.push_str(&format!(", via {}", via));
            }
            if !hit.fact.is_current() {
                detail.push_str(", superseded");
            }
            println!("   {}", dim.apply_to(detail));
            println!();
        }
    }
    if results.degraded {
        print_degraded_notice();
    }
    Ok(Outcome::degraded_if(results.degraded))
}

pub async fn update(args: UpdateArgs, ctx: &Context) -> Result<Outcome> {
    let mut patch = FactPatch::default();
    if let Some(text) = args.text {
        patch = patch.text(text);
    }
    if let Some(category) = args.category {
        patch = patch.category(category);
    }
    if let Some(importance) = args.importance {
        patch = patch.importance(importance);
    }
    if let Some(class) = args.decay_class {
        patch = patch.decay_class(class);
    }
    if let Some(tags) = args.tags {
        patch = patch.tags(tags);
    }
    if let Some(summary) = args.summary {
        patch = patch.summary(summary);
    }
    if let (Some(entity), Some(key), Some(value)) = (args.entity, args.key, args.value) {
        patch = patch.triple(Triple { entity, key, value });
    }
    let engine = ctx.open_engine().await?;
    let result = engine.update(args.id, patch).await;
    engine.close().await;
    let fact = result?;

    if ctx.json_output {
        print_json(&fact)?;
    } else {
        println!("{} Updated {}", style("✓").green(), style(fact.id).cyan());
    }
    Ok(Outcome::Done)
}

pub async fn delete(args: DeleteArgs, ctx: &Context) -> Result<Outcome> {
    let engine = ctx.open_engine().await?;
    let result = engine.delete(args.id).await;
    engine.close().await;
    result?;

    if ctx.json_output {
        print_json(&serde_json::json!({ "deleted": args.id }))?;
    } else {
        println!("{} Deleted {}", style("✓").green(), style(args.id).cyan());
    }
    Ok(Outcome::Done)
}

// ─────────────────────────────────────────────────────────────────────────────
// Output
// ─────────────────────────────────────────────────────────────────────────────

fn print_store_outcome(outcome: &StoreOutcome, ctx: &Context) {
    let dim = Style::new().dim();
    let id = style(outcome.fact.id).cyan();
    match &outcome.action {
        StoreAction::Created => println!("{} Stored {}", style("✓").green(), id),
        StoreAction::Superseded { previous } => {
            println!("{} Stored {}", style("✓").green(), id);
            for old in previous {
                println!("  {}", dim.apply_to(format!("supersedes {}", old)));
            }
        }
        StoreAction::Reinforced => {
            println!("{} Reinforced existing fact {}", style("✓").green(), id)
        }
    }
    if ctx.verbose {
        println!(
            "  {}",
            dim.apply_to(format!(
                "{} / {}, importance {:.2}, embedded: {}",
                outcome.fact.category, outcome.fact.decay_class, outcome.fact.importance, outcome.embedded
            ))
        );
        if outcome.links_created > 0 {
            println!(
                "  {}",
                dim.apply_to(format!("{} related facts linked", outcome.links_created))
            );
        }
    }
    if let Some(err) = &outcome.embedding_error {
        println!("  {}", style(format!("embedding skipped: {}", err)).yellow());
    }
    if outcome.degraded() {
        print_degraded_notice();
    }
}

fn print_degraded_notice() {
    eprintln!(
        "{}",
        style("warning: vector index unavailable; results use full-text search only").yellow()
    );
}

fn print_fact_line(n: usize, fact: &Fact) {
    let dim = Style::new().dim();
    println!("{}. {}", style(n).cyan(), truncate(&fact.text, 70));
    let mut detail = format!(
        "{} | {} | {}",
        fact.id,
        fact.category,
        format_datetime(&fact.effective_date())
    );
    if !fact.is_current() {
        detail.push_str(" | superseded");
    }
    println!("   {}", dim.apply_to(detail));
}

fn print_fact_detail(fact: &Fact) {
    let dim = Style::new().dim();
    println!("{}", style(&fact.text).bold());
    println!("{}", dim.apply_to("─".repeat(50)));
    println!("  Id:          {}", style(fact.id).cyan());
    println!("  Category:    {}", fact.category);
    if let (Some(entity), Some(key), Some(value)) = (&fact.entity, &fact.key, &fact.value) {
        println!("  Triple:      {}.{} = {}", entity, key, value);
    }
    println!("  Importance:  {:.2}", fact.importance);
    println!("  Confidence:  {:.2}", fact.confidence);
    println!("  Decay:       {}", fact.decay_class);
    println!("  Scope:       {}", fact.scope);
    if !fact.tags.is_empty() {
        println!("  Tags:        {}", fact.tags.join(", "));
    }
    if let Some(summary) = &fact.summary {
        println!("  Summary:     {}", summary);
    }
    println!("  Created:     {}", format_datetime(&fact.created_at));
    if let Some(date) = &fact.source_date {
        println!("  Source date: {}", format_datetime(date));
    }
    match &fact.expires_at {
        Some(at) => println!("  Expires:     {}", format_datetime(at)),
        None => println!("  Expires:     {}", dim.apply_to("never")),
    }
    println!("  Recalled:    {} times", fact.recall_count);
    if let Some(old) = fact.supersedes_id {
        println!("  Supersedes:  {}", old);
    }
    if let Some(new) = fact.superseded_by {
        println!("  {}", style(format!("Superseded by {}", new)).yellow());
    }
}
