#![forbid(unsafe_code)]

//! **ztlctl-cli** – Command-line surface for the ztlctl vault engine.
//!
//! The CLI is a pure consumer of `ServiceResult`s: it parses arguments,
//! applies flag-level configuration overrides, invokes one engine operation,
//! renders the result (human text or `--json`), and exits 0 iff `ok`.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing_subscriber::EnvFilter;

use ztlctl_engine::{
    BatchMode, ContextRequest, CreateRequest, QueryFilter, SessionLogRequest, UpdateRequest, Vault,
};
use ztlctl_types::ServiceResult;

//─────────────────────────────
//  CLI structure
//─────────────────────────────

#[derive(Parser)]
#[command(name = "ztlctl")]
#[command(about = "Zettelkasten vault engine - files, index, and knowledge graph")]
#[command(version)]
struct Cli {
    /// Vault root directory
    #[arg(long, default_value = ".", global = true)]
    vault: PathBuf,

    /// Emit the raw ServiceResult as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Run event handlers inline (deterministic dispatch)
    #[arg(long, global = true)]
    sync: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a vault in the target directory
    Init,
    /// Create a note, reference, log, or task
    Create {
        /// Content kind: note, reference, log, task
        kind: String,
        /// Title
        title: String,
        /// Subtype (knowledge, decision, paper, article, book, tool)
        #[arg(long)]
        subtype: Option<String>,
        /// Topic directory under notes/
        #[arg(long)]
        topic: Option<String>,
        /// Scoped tag (repeatable)
        #[arg(long = "tag")]
        tags: Vec<String>,
        /// Alias (repeatable)
        #[arg(long = "alias")]
        aliases: Vec<String>,
        /// Body text; "-" reads stdin
        #[arg(long)]
        body: Option<String>,
        /// Initial relates-link target (repeatable)
        #[arg(long = "link")]
        links: Vec<String>,
        /// Owning session
        #[arg(long)]
        session: Option<String>,
        /// Extra frontmatter key=value (repeatable; e.g. priority=high)
        #[arg(long = "meta")]
        meta: Vec<String>,
    },
    /// Create many items from a JSON array file
    Batch {
        /// Path to a JSON array of create requests
        file: PathBuf,
        /// Per-item transactions instead of all-or-nothing
        #[arg(long)]
        partial: bool,
    },
    /// Update frontmatter, status, or body of a node
    Update {
        /// Node identifier
        id: String,
        /// New title
        #[arg(long)]
        title: Option<String>,
        /// Status transition
        #[arg(long)]
        status: Option<String>,
        /// Maturity (seed, budding, evergreen, none)
        #[arg(long)]
        maturity: Option<String>,
        /// Replacement body; "-" reads stdin
        #[arg(long)]
        body: Option<String>,
        /// Tag to add (repeatable)
        #[arg(long = "add-tag")]
        add_tags: Vec<String>,
        /// Tag to remove (repeatable)
        #[arg(long = "remove-tag")]
        remove_tags: Vec<String>,
        /// Relates-link target to add (repeatable)
        #[arg(long = "link")]
        links: Vec<String>,
        /// Extra frontmatter key=value (repeatable)
        #[arg(long = "meta")]
        meta: Vec<String>,
        /// Session attribution
        #[arg(long)]
        session: Option<String>,
    },
    /// Archive a node (file and edges are kept)
    Archive {
        /// Node identifier
        id: String,
        /// Session attribution
        #[arg(long)]
        session: Option<String>,
    },
    /// Supersede an accepted decision
    Supersede {
        /// Decision being superseded
        id: String,
        /// Title of the replacement decision
        #[arg(long)]
        title: String,
        /// Body of the replacement decision; "-" reads stdin
        #[arg(long)]
        body: Option<String>,
        /// Session attribution
        #[arg(long)]
        session: Option<String>,
    },
    /// Densify the graph with scored link suggestions
    Reweave {
        /// Source node; omitted reweaves every note and reference
        id: Option<String>,
        /// Preview without committing
        #[arg(long)]
        dry_run: bool,
        /// Remove edges previously marked stale
        #[arg(long)]
        prune: bool,
        /// Undo a batch (most recent when no id is given)
        #[arg(long, num_args = 0..=1, default_missing_value = "-1")]
        undo: Option<i64>,
    },
    /// Full-text search
    Search {
        /// Query text
        query: String,
        #[command(flatten)]
        filter: FilterArgs,
    },
    /// Fetch one node with links and backlinks
    Get {
        /// Node identifier
        id: String,
    },
    /// List nodes matching a filter
    List {
        #[command(flatten)]
        filter: FilterArgs,
    },
    /// Open tasks ranked by priority, impact, and effort
    WorkQueue,
    /// Decisions with supersession chains
    Decisions {
        #[command(flatten)]
        filter: FilterArgs,
    },
    /// Graph retrieval
    Graph {
        #[command(subcommand)]
        command: GraphCommands,
    },
    /// Session lifecycle and agent context
    Session {
        #[command(subcommand)]
        command: SessionCommands,
    },
    /// Integrity checking and recovery
    Check {
        /// Repair fixable findings: safe or aggressive
        #[arg(long, num_args = 0..=1, default_missing_value = "safe")]
        fix: Option<String>,
        /// Rebuild the index from files alone
        #[arg(long)]
        rebuild: bool,
        /// Restore the index from the most recent backup
        #[arg(long)]
        rollback: bool,
    },
    /// Flush the event write-ahead log
    Drain,
}

#[derive(clap::Args)]
struct FilterArgs {
    /// Content kind
    #[arg(long = "type")]
    kind: Option<String>,
    /// Subtype
    #[arg(long)]
    subtype: Option<String>,
    /// Tag (repeatable, OR semantics)
    #[arg(long = "tag")]
    tags: Vec<String>,
    /// Topic
    #[arg(long)]
    topic: Option<String>,
    /// Status
    #[arg(long)]
    status: Option<String>,
    /// Maturity
    #[arg(long)]
    maturity: Option<String>,
    /// Modified since (RFC3339 or day count)
    #[arg(long)]
    since: Option<String>,
    /// Space: self, notes, ops
    #[arg(long)]
    space: Option<String>,
    /// Include archived nodes
    #[arg(long)]
    archived: bool,
    /// Result limit
    #[arg(long)]
    limit: Option<usize>,
    /// Sort: relevance, recency, graph, priority, title, type, hybrid
    #[arg(long)]
    sort: Option<String>,
}

#[derive(Subcommand)]
enum GraphCommands {
    /// Spreading activation around a seed node
    Related {
        /// Seed node
        id: String,
        /// Hop cap
        #[arg(long)]
        depth: Option<usize>,
    },
    /// Community detection
    Themes,
    /// PageRank top-k (materializes metrics)
    Rank {
        /// How many nodes to return
        #[arg(long)]
        top: Option<usize>,
    },
    /// Shortest path between two nodes
    Path {
        /// Start node
        from: String,
        /// End node
        to: String,
    },
    /// Structural holes (lowest constraint)
    Gaps {
        /// How many nodes to return
        #[arg(long)]
        top: Option<usize>,
    },
    /// Bridges (highest betweenness)
    Bridges {
        /// How many nodes to return
        #[arg(long)]
        top: Option<usize>,
    },
}

#[derive(Subcommand)]
enum SessionCommands {
    /// Start a session
    Start,
    /// Append a log entry
    Log {
        /// Session identifier
        session: String,
        /// One-line summary
        summary: String,
        /// Entry kind (log, checkpoint, decision-made, ...)
        #[arg(long, default_value = "log")]
        kind: String,
        /// Full detail
        #[arg(long)]
        detail: Option<String>,
        /// Pin this entry against context reduction
        #[arg(long)]
        pinned: bool,
        /// Referenced node id (repeatable)
        #[arg(long = "ref")]
        refs: Vec<String>,
    },
    /// Close a session (reweave, sweep, check, drain)
    Close {
        /// Session identifier
        session: String,
    },
    /// Token-budgeted agent context payload
    Context {
        /// Session identifier
        #[arg(long)]
        session: Option<String>,
        /// Topic for the scoped layer
        #[arg(long)]
        topic: Option<String>,
        /// Token budget
        #[arg(long)]
        budget: Option<usize>,
        /// Bypass checkpoint-based reduction
        #[arg(long)]
        ignore_checkpoints: bool,
    },
    /// Compact session view
    Brief {
        /// Session identifier
        session: String,
    },
    /// Token-cost accounting
    Cost {
        /// Session identifier
        session: String,
    },
}

//─────────────────────────────
//  Entry point
//─────────────────────────────

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(cli.log_level.clone())),
        )
        .with_writer(std::io::stderr)
        .init();

    let result = match run(&cli).await {
        Ok(result) => result,
        Err(e) => ServiceResult::fail(
            "cli",
            ztlctl_types::ErrorCode::IoError,
            e.to_string(),
            Value::Null,
        ),
    };
    render(&cli, &result);
    ExitCode::from(result.exit_code() as u8)
}

async fn run(cli: &Cli) -> Result<ServiceResult> {
    if matches!(cli.command, Commands::Init) {
        return Ok(Vault::init(&cli.vault).await);
    }
    let mut vault = Vault::open(&cli.vault).await.map_err(|e| anyhow::anyhow!("{}", e))?;
    if cli.sync {
        let mut config = vault.config().clone();
        config.events.sync = true;
        vault.set_config(config);
    }

    let result = match &cli.command {
        Commands::Init => unreachable!("handled above"),
        Commands::Create {
            kind, title, subtype, topic, tags, aliases, body, links, session, meta,
        } => {
            vault
                .create(CreateRequest {
                    kind: kind.clone(),
                    subtype: subtype.clone(),
                    title: title.clone(),
                    topic: topic.clone(),
                    tags: tags.clone(),
                    aliases: aliases.clone(),
                    body: read_body_arg(body)?,
                    sections: Vec::new(),
                    links: links.clone(),
                    session: session.clone(),
                    meta: parse_meta(meta)?,
                })
                .await
        }
        Commands::Batch { file, partial } => {
            let text = std::fs::read_to_string(file)?;
            let items: Vec<CreateRequest> = serde_json::from_str(&text)?;
            let mode = if *partial { BatchMode::Partial } else { BatchMode::AllOrNothing };
            vault.create_batch(items, mode).await
        }
        Commands::Update {
            id, title, status, maturity, body, add_tags, remove_tags, links, meta, session,
        } => {
            vault
                .update(UpdateRequest {
                    id: id.clone(),
                    title: title.clone(),
                    status: status.clone(),
                    maturity: maturity.clone(),
                    body: read_body_arg(body)?,
                    add_tags: add_tags.clone(),
                    remove_tags: remove_tags.clone(),
                    aliases: None,
                    add_links: links.clone(),
                    meta: parse_meta(meta)?,
                    session: session.clone(),
                })
                .await
        }
        Commands::Archive { id, session } => vault.archive(id, session.as_deref()).await,
        Commands::Supersede { id, title, body, session } => {
            vault
                .supersede(
                    id,
                    CreateRequest {
                        kind: "note".into(),
                        subtype: Some("decision".into()),
                        title: title.clone(),
                        body: read_body_arg(body)?,
                        session: session.clone(),
                        ..CreateRequest::default()
                    },
                )
                .await
        }
        Commands::Reweave { id, dry_run, prune, undo } => {
            if let Some(batch) = undo {
                let batch = (*batch >= 0).then_some(*batch);
                vault.reweave_undo(batch).await
            } else if *prune {
                vault.reweave_prune().await
            } else {
                vault.reweave(id.as_deref(), *dry_run).await
            }
        }
        Commands::Search { query, filter } => vault.search(query, filter.to_filter()).await,
        Commands::Get { id } => vault.get(id).await,
        Commands::List { filter } => vault.list(filter.to_filter()).await,
        Commands::WorkQueue => vault.work_queue().await,
        Commands::Decisions { filter } => vault.decision_support(filter.to_filter()).await,
        Commands::Graph { command } => match command {
            GraphCommands::Related { id, depth } => vault.related(id, *depth).await,
            GraphCommands::Themes => vault.themes().await,
            GraphCommands::Rank { top } => vault.rank(*top).await,
            GraphCommands::Path { from, to } => vault.path(from, to).await,
            GraphCommands::Gaps { top } => vault.gaps(*top).await,
            GraphCommands::Bridges { top } => vault.bridges(*top).await,
        },
        Commands::Session { command } => match command {
            SessionCommands::Start => vault.session_start().await,
            SessionCommands::Log { session, summary, kind, detail, pinned, refs } => {
                vault
                    .session_log(SessionLogRequest {
                        session: session.clone(),
                        entry_kind: kind.clone(),
                        summary: summary.clone(),
                        detail: detail.clone(),
                        pinned: *pinned,
                        refs: refs.clone(),
                        meta: None,
                    })
                    .await
            }
            SessionCommands::Close { session } => vault.session_close(session).await,
            SessionCommands::Context { session, topic, budget, ignore_checkpoints } => {
                vault
                    .context(ContextRequest {
                        session: session.clone(),
                        topic: topic.clone(),
                        budget: *budget,
                        ignore_checkpoints: *ignore_checkpoints,
                    })
                    .await
            }
            SessionCommands::Brief { session } => vault.session_brief(session).await,
            SessionCommands::Cost { session } => vault.session_cost(session).await,
        },
        Commands::Check { fix, rebuild, rollback } => {
            if *rollback {
                vault.rollback().await
            } else if *rebuild {
                vault.rebuild().await
            } else if let Some(mode) = fix {
                vault.check_fix(mode == "aggressive").await
            } else {
                vault.check().await
            }
        }
        Commands::Drain => vault.drain().await,
    };
    Ok(result)
}

/// `--body -` reads stdin; anything else is literal text.
fn read_body_arg(body: &Option<String>) -> Result<Option<String>> {
    match body.as_deref() {
        Some("-") => {
            let mut buffer = String::new();
            std::io::Read::read_to_string(&mut std::io::stdin(), &mut buffer)?;
            Ok(Some(buffer))
        }
        Some(text) => Ok(Some(text.to_string())),
        None => Ok(None),
    }
}

fn parse_meta(meta: &[String]) -> Result<Vec<(String, String)>> {
    meta.iter()
        .map(|entry| {
            entry
                .split_once('=')
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .ok_or_else(|| anyhow::anyhow!("--meta expects key=value, got '{}'", entry))
        })
        .collect()
}

impl FilterArgs {
    fn to_filter(&self) -> QueryFilter {
        QueryFilter {
            kind: self.kind.clone(),
            subtype: self.subtype.clone(),
            tags: self.tags.clone(),
            topic: self.topic.clone(),
            status: self.status.clone(),
            maturity: self.maturity.clone(),
            since: self.since.clone(),
            space: self.space.clone(),
            include_archived: self.archived,
            limit: self.limit,
            sort: self.sort.clone(),
        }
    }
}

//─────────────────────────────
//  Rendering
//─────────────────────────────

fn render(cli: &Cli, result: &ServiceResult) {
    if cli.json {
        println!("{}", serde_json::to_string_pretty(result).unwrap_or_else(|_| "{}".into()));
        return;
    }
    if result.ok {
        println!("ok: {}", result.op);
        for (key, value) in &result.data {
            if key == "results" || key == "items" || key == "layers" {
                render_collection(value);
            } else {
                println!("  {}: {}", key, render_scalar(value));
            }
        }
    } else if let Some(error) = &result.error {
        eprintln!("error[{}]: {}", error.code.as_str(), error.message);
        if !error.detail.is_null() {
            eprintln!("  {}", error.detail);
        }
    }
    for warning in &result.warnings {
        eprintln!("warning: {}", warning);
    }
}

fn render_collection(value: &Value) {
    if let Value::Array(items) = value {
        for item in items {
            match item {
                Value::Object(map) => {
                    let id = map.get("id").map(render_scalar).unwrap_or_default();
                    let title = map
                        .get("title")
                        .or_else(|| map.get("text"))
                        .or_else(|| map.get("name"))
                        .map(render_scalar)
                        .unwrap_or_default();
                    let score = map
                        .get("score")
                        .and_then(Value::as_f64)
                        .map(|s| format!("  ({:.3})", s))
                        .unwrap_or_default();
                    println!("  {} {}{}", id, title, score);
                }
                other => println!("  {}", render_scalar(other)),
            }
        }
    }
}

fn render_scalar(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
