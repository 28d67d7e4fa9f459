//! Strata CLI
//!
//! Command-line front end for the Strata memory engine. Text is encoded here
//! and handed to the engine as vectors.

mod encoder;
mod jsonl;

use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, bail};
use chrono::Utc;
use clap::{Parser, Subcommand};
use colored::Colorize;
use tracing_subscriber::EnvFilter;

use strata_core::{
    CancelToken, Classification, ConsolidationReport, EngineConfig, IngestItem, Level,
    MemoryEngine, PutResult, QueryOutcome, QueryResult,
};

use crate::encoder::{CachedEncoder, Encoder, default_encoder};
use crate::jsonl::JsonlProducer;

/// Strata - Hierarchical Memory CLI
#[derive(Parser)]
#[command(name = "strata")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "CLI for the Strata hierarchical memory engine")]
#[command(long_about = "Strata stores memories at three levels (concept, context, episode), retrieves them by spreading activation over weighted connections, and consolidates them in the background.\n\nEnvironment:\n  STRATA_DATA_DIR    data directory\n  RUST_LOG           log level filter (e.g. debug, info, warn)")]
struct Cli {
    /// Custom data directory
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Store a new experience
    Store {
        /// Experience text to store
        text: String,
        /// Hierarchy level: concept, context or episode
        /// (default: the retrieval seed level)
        #[arg(long)]
        level: Option<Level>,
        /// Record id (default: experience::<uuid>)
        #[arg(long)]
        id: Option<String>,
        /// Parent record id
        #[arg(long)]
        parent: Option<String>,
        /// Initial importance in [0, 1]
        #[arg(long)]
        importance: Option<f64>,
    },

    /// Retrieve memories by spreading activation
    Retrieve {
        /// Query text
        query: String,
        /// Classifications to show (comma-separated: core,peripheral)
        #[arg(long, default_value = "core,peripheral")]
        types: String,
        /// Maximum results to show
        #[arg(long, default_value = "10")]
        limit: usize,
        /// Activation threshold override
        #[arg(long)]
        threshold: Option<f64>,
    },

    /// Ingest a JSON-lines file under a source namespace
    Ingest {
        /// Path to the .jsonl file
        file: PathBuf,
        /// Source namespace for incremental progress
        #[arg(long)]
        namespace: String,
        /// Ignore the stored progress and resend everything
        #[arg(long)]
        force_full: bool,
        /// Level for entries that do not name one (default: the retrieval
        /// seed level)
        #[arg(long)]
        level: Option<Level>,
    },

    /// Show system status
    Status {
        /// Show per-level and per-type breakdowns
        #[arg(long)]
        detailed: bool,
    },

    /// Check store reachability
    Health,

    /// Remove a memory and its connections
    Remove {
        /// Record id
        id: String,
    },

    /// Run a consolidation cycle
    Consolidate {
        /// Show what would change without writing
        #[arg(long)]
        dry_run: bool,
    },

    /// Run periodic consolidation until interrupted
    Daemon,

    /// Interactive store/retrieve loop on stdin
    Interactive {
        /// Custom prompt string
        #[arg(long, default_value = "strata> ")]
        prompt: String,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = match cli.command {
        Commands::Daemon => "info",
        _ => "warn",
    };
    init_logging(default_level);

    let mut config = EngineConfig::from_env();
    if let Some(dir) = cli.data_dir {
        config.data_dir = Some(dir);
    }

    match cli.command {
        Commands::Store {
            text,
            level,
            id,
            parent,
            importance,
        } => with_engine(config, |engine, encoder| {
            run_store(engine, encoder, text, level, id, parent, importance)
        }),
        Commands::Retrieve {
            query,
            types,
            limit,
            threshold,
        } => with_engine(config, |engine, encoder| {
            run_retrieve(engine, encoder, &query, &types, limit, threshold)
        }),
        Commands::Ingest {
            file,
            namespace,
            force_full,
            level,
        } => run_ingest(config, file, namespace, force_full, level),
        Commands::Status { detailed } => {
            with_engine(config, |engine, encoder| run_status(engine, encoder, detailed))
        }
        Commands::Health => with_engine(config, |engine, _| run_health(engine)),
        Commands::Remove { id } => with_engine(config, |engine, _| run_remove(engine, &id)),
        Commands::Consolidate { dry_run } => {
            with_engine(config, |engine, _| run_consolidate(engine, dry_run))
        }
        Commands::Daemon => run_daemon(config),
        Commands::Interactive { prompt } => {
            with_engine(config, |engine, encoder| run_interactive(engine, encoder, &prompt))
        }
    }
}

/// Logs go to stderr; stdout carries command output
fn init_logging(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .with_ansi(false)
        .init();
}

fn open_engine(config: EngineConfig) -> anyhow::Result<(MemoryEngine, CachedEncoder)> {
    let dimensions = config.dimensions;
    let engine = MemoryEngine::open_default(config).context("Failed to open memory store")?;
    let encoder = default_encoder(dimensions)?;
    Ok((engine, encoder))
}

/// Open, run `f`, and close even when `f` fails
fn with_engine<F>(config: EngineConfig, f: F) -> anyhow::Result<()>
where
    F: FnOnce(&MemoryEngine, &CachedEncoder) -> anyhow::Result<()>,
{
    let (engine, encoder) = open_engine(config)?;
    let result = f(&engine, &encoder);
    if let Err(e) = engine.close() {
        tracing::warn!("Failed to close engine cleanly: {}", e);
    }
    result
}

// ============================================================================
// STORE / RETRIEVE
// ============================================================================

fn run_store(
    engine: &MemoryEngine,
    encoder: &dyn Encoder,
    text: String,
    level: Option<Level>,
    id: Option<String>,
    parent: Option<String>,
    importance: Option<f64>,
) -> anyhow::Result<()> {
    if text.trim().is_empty() {
        bail!("Text cannot be empty");
    }

    let id = id.unwrap_or_else(|| format!("experience::{}", uuid::Uuid::new_v4()));
    // Bare records are only reachable as seeds
    let level = level.unwrap_or(engine.config().activation.seed_level);
    let vector = encoder.encode(&text)?;
    let mut item = IngestItem::new(id, text.clone(), vector, level);
    item.payload.parent_id = parent;
    item.payload.importance = importance;

    let result = engine.store().put(&item)?;

    println!("{}", "=== Strata Store ===".cyan().bold());
    println!();
    let decision = match &result {
        PutResult::Created(_) => "created".green(),
        PutResult::Existing(_) => "already stored".yellow(),
    };
    let record = result.record();
    println!("{}: {}", "Decision".white().bold(), decision);
    println!("{}: {}", "Memory ID".white().bold(), record.id);
    println!("{}: {}", "Level".white().bold(), record.level);
    println!("{}: {:.2}", "Importance".white().bold(), record.importance_score);
    println!();
    println!(
        "{}",
        format!("Memory {} ({})", decision, truncate(&text, 60)).green().bold()
    );
    Ok(())
}

fn run_retrieve(
    engine: &MemoryEngine,
    encoder: &dyn Encoder,
    query: &str,
    types: &str,
    limit: usize,
    threshold: Option<f64>,
) -> anyhow::Result<()> {
    if query.trim().is_empty() {
        bail!("Query cannot be empty");
    }
    let wanted = parse_types(types)?;
    let QueryOutcome { results, touched } = retrieve(engine, encoder, query, threshold)?;

    println!("{}", "=== Strata Retrieve ===".cyan().bold());
    println!();
    println!("{}: {}", "Query".white().bold(), query);
    println!("{}: {}", "Activated".white().bold(), results.len());

    let shown: Vec<&QueryResult> = results
        .iter()
        .filter(|r| wanted.contains(&r.classification))
        .take(limit)
        .collect();
    print_results(&shown);
    if !touched {
        println!();
        println!("{}", "Access was not recorded for these results.".yellow());
    }
    Ok(())
}

/// Encode `query` and run it with the configured parameters
fn retrieve(
    engine: &MemoryEngine,
    encoder: &dyn Encoder,
    query: &str,
    threshold: Option<f64>,
) -> anyhow::Result<QueryOutcome> {
    let mut params = engine.config().activation.clone();
    if let Some(threshold) = threshold {
        params.activation_threshold = threshold;
    }

    let probe = encoder.encode(query)?;
    Ok(engine.query_outcome(&probe, Some(&params))?)
}

fn parse_types(types: &str) -> anyhow::Result<Vec<Classification>> {
    let parsed = types
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<Classification>().map_err(anyhow::Error::msg))
        .collect::<anyhow::Result<Vec<_>>>()?;
    if parsed.is_empty() {
        bail!("--types must name at least one of: core, peripheral");
    }
    Ok(parsed)
}

fn print_results(results: &[&QueryResult]) {
    if results.is_empty() {
        println!();
        println!("{}", "No memories found.".dimmed());
        return;
    }

    for (label, class) in [
        ("Core", Classification::Core),
        ("Peripheral", Classification::Peripheral),
    ] {
        let group: Vec<&&QueryResult> = results.iter().filter(|r| r.classification == class).collect();
        if group.is_empty() {
            continue;
        }
        println!();
        let header = format!("{} ({})", label, group.len());
        match class {
            Classification::Core => println!("{}", header.green().bold()),
            Classification::Peripheral => println!("{}", header.yellow().bold()),
        }
        for result in group {
            println!(
                "  {} {} {}",
                format!("{:.3}", result.score).cyan(),
                result.id.dimmed(),
                truncate(&result.content, 80)
            );
        }
    }
}

// ============================================================================
// INGEST
// ============================================================================

fn run_ingest(
    config: EngineConfig,
    file: PathBuf,
    namespace: String,
    force_full: bool,
    level: Option<Level>,
) -> anyhow::Result<()> {
    let level = level.unwrap_or(config.activation.seed_level);
    let (engine, encoder) = open_engine(config)?;
    let engine = Arc::new(engine);
    let encoder = Arc::new(encoder);
    let cancel = CancelToken::new();

    let rt = tokio::runtime::Runtime::new()?;
    let result = rt.block_on({
        let engine = Arc::clone(&engine);
        let cancel = cancel.clone();
        async move {
            let interrupt = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    eprintln!("Interrupted, finishing current item...");
                    interrupt.cancel();
                }
            });

            tokio::task::spawn_blocking(move || {
                let producer = JsonlProducer::new(file, namespace, encoder.as_ref(), level);
                engine.gateway().sync_source(&producer, force_full, &cancel)
            })
            .await
        }
    });

    if let Err(e) = engine.close() {
        tracing::warn!("Failed to close engine cleanly: {}", e);
    }
    let report = result.context("Ingestion task failed")??;

    println!("{}", "=== Strata Ingest ===".cyan().bold());
    println!();
    println!("{}: {}", "Namespace".white().bold(), report.namespace);
    println!("{}: {}", "Ingested".white().bold(), report.ingested.to_string().green());
    println!("{}: {}", "Skipped".white().bold(), report.skipped);
    println!("{}: {}", "Failed".white().bold(), report.failed.len());
    println!("{}: {}ms", "Duration".white().bold(), report.duration_ms);

    if !report.failed.is_empty() {
        println!();
        println!("{}", "Failures:".yellow().bold());
        for failure in &report.failed {
            println!("  {} {}: {}", "!".yellow().bold(), failure.id, failure.error.yellow());
        }
    }
    if report.cancelled {
        println!();
        println!("{}", "Ingestion was cancelled; rerun to continue.".yellow());
    }
    if let Some(mark) = engine.gateway().get_latest_processed(&report.namespace) {
        println!();
        println!(
            "{}: {} @ {}",
            "Latest Processed".white().bold(),
            mark.last_id,
            mark.last_timestamp.format("%Y-%m-%d %H:%M:%S")
        );
    }
    Ok(())
}

// ============================================================================
// STATUS / HEALTH / REMOVE
// ============================================================================

fn run_status(engine: &MemoryEngine, encoder: &dyn Encoder, detailed: bool) -> anyhow::Result<()> {
    let stats = engine.stats()?;

    println!("{}", "=== Strata Status ===".cyan().bold());
    println!();
    println!("{}: {}", "Total Memories".white().bold(), stats.total_memories);
    println!("{}: {}", "Total Connections".white().bold(), stats.total_connections);
    println!("{}: {:.3}", "Average Importance".white().bold(), stats.average_importance);
    println!("{}: {}", "Indexed Vectors".white().bold(), engine.store().index().len());
    println!("{}: {}", "Encoder".white().bold(), encoder.name());
    println!("{}: {}", "Data Directory".white().bold(), engine.data_dir().display());

    if !detailed {
        return Ok(());
    }

    let total = stats.total_memories as usize;
    println!();
    println!("{}", "=== Levels ===".yellow().bold());
    for level in Level::ALL {
        let count = stats.memories_by_level.get(&level).copied().unwrap_or(0) as usize;
        print_distribution_bar(level.as_str(), count, total, "green");
    }

    println!();
    println!("{}", "=== Memory Types ===".magenta().bold());
    for memory_type in ["episodic", "semantic"] {
        let count = stats.memories_by_type.get(memory_type).copied().unwrap_or(0) as usize;
        print_distribution_bar(memory_type, count, total, "magenta");
    }

    println!();
    if let Some(oldest) = stats.oldest_memory {
        println!("{}: {}", "Oldest Memory".white().bold(), oldest.format("%Y-%m-%d %H:%M:%S"));
    }
    if let Some(newest) = stats.newest_memory {
        println!("{}: {}", "Newest Memory".white().bold(), newest.format("%Y-%m-%d %H:%M:%S"));
    }
    match engine.store().relational().last_consolidation_at()? {
        Some(at) => println!("{}: {}", "Last Consolidation".white().bold(), at.format("%Y-%m-%d %H:%M:%S")),
        None => println!("{}: {}", "Last Consolidation".white().bold(), "never".dimmed()),
    }
    Ok(())
}

/// Print a distribution bar
fn print_distribution_bar(label: &str, count: usize, total: usize, color: &str) {
    let percentage = if total > 0 {
        (count as f64 / total as f64) * 100.0
    } else {
        0.0
    };

    let bar_width: usize = 30;
    let filled = ((percentage / 100.0) * bar_width as f64) as usize;
    let empty = bar_width.saturating_sub(filled);

    let bar = format!("{}{}", "#".repeat(filled), "-".repeat(empty));
    let colored_bar = match color {
        "green" => bar.green(),
        "magenta" => bar.magenta(),
        _ => bar.white(),
    };

    println!("  {:10} [{:30}] {:>5} ({:>5.1}%)", label, colored_bar, count, percentage);
}

fn run_health(engine: &MemoryEngine) -> anyhow::Result<()> {
    let health = engine.health();

    println!("{}", "=== Strata Health Check ===".cyan().bold());
    println!();

    let status = if health.healthy {
        "HEALTHY".green().bold()
    } else {
        "UNAVAILABLE".red().bold()
    };
    let reachable = |ok: bool| if ok { "Reachable".green() } else { "Unreachable".red() };

    println!("{}: {}", "Status".white().bold(), status);
    println!("{}: {}", "Relational Store".white(), reachable(health.relational_ok));
    println!("{}: {}", "Vector Index".white(), reachable(health.index_ok));
    match health.relational_count {
        Some(count) => println!("{}: {}", "Records".white(), count),
        None => println!("{}: {}", "Records".white(), "unknown".dimmed()),
    }
    println!("{}: {}", "Indexed Vectors".white(), health.index_count);

    let reconciled = engine.reconciled();
    if reconciled.restored > 0 || reconciled.orphans_removed > 0 {
        println!(
            "{}: {} restored, {} orphans removed",
            "Repaired On Open".white(),
            reconciled.restored,
            reconciled.orphans_removed
        );
    }

    if !health.warnings.is_empty() {
        println!();
        println!("{}", "Warnings:".yellow().bold());
        for warning in &health.warnings {
            println!("  {} {}", "!".yellow().bold(), warning.yellow());
        }
    }

    if !health.healthy {
        bail!("Memory store is unavailable");
    }
    Ok(())
}

fn run_remove(engine: &MemoryEngine, id: &str) -> anyhow::Result<()> {
    engine.remove_record(id)?;
    println!("{} {}", "Removed".green().bold(), id);
    Ok(())
}

// ============================================================================
// CONSOLIDATION
// ============================================================================

fn run_consolidate(engine: &MemoryEngine, dry_run: bool) -> anyhow::Result<()> {
    println!("{}", "=== Strata Consolidation ===".cyan().bold());
    println!();

    let report = if dry_run {
        println!("Planning memory consolidation cycle (dry run)...");
        engine.scheduler().plan(Utc::now())?
    } else {
        println!("Running memory consolidation cycle...");
        engine.scheduler().run_once(Utc::now())?
    };
    println!();
    print_consolidation(&report);
    Ok(())
}

fn print_consolidation(report: &ConsolidationReport) {
    let prefix = if report.dry_run { "Would Be " } else { "" };
    let label = |name: &str| format!("{}{}", prefix, name);

    println!("{}: {}", "Memories Scanned".white().bold(), report.scanned);
    println!("{}: {}", label("Decayed").white().bold(), report.decayed);
    println!("{}: {}", label("Promoted").white().bold(), report.promoted);
    println!("{}: {}", label("Retired").white().bold(), report.retired);
    if !report.dry_run {
        println!("{}: {}", "Version Conflicts".white().bold(), report.version_conflicts);
        println!("{}: {}", "Connections Decayed".white().bold(), report.connections_decayed);
    }
    if report.errors > 0 {
        println!("{}: {}", "Errors".red().bold(), report.errors);
    }
    println!("{}: {}ms", "Duration".white().bold(), report.duration_ms);

    println!();
    let summary = format!(
        "Consolidation {}: {} memories scanned, {} promoted, {} retired in {}ms",
        if report.dry_run { "planned" } else { "complete" },
        report.scanned,
        report.promoted,
        report.retired,
        report.duration_ms
    );
    println!("{}", summary.green());
}

fn run_daemon(config: EngineConfig) -> anyhow::Result<()> {
    let (engine, _encoder) = open_engine(config)?;
    let interval = engine.config().consolidation.interval;

    println!("{}", "=== Strata Daemon ===".cyan().bold());
    println!();
    println!(
        "Consolidating every {:.1}h. Press Ctrl-C to stop.",
        interval.as_secs() as f64 / 3600.0
    );

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        engine.start_scheduler()?;
        tokio::signal::ctrl_c().await?;
        tracing::info!("Shutdown requested");
        if let Some(handle) = engine.take_scheduler() {
            handle.stop().await;
        }
        anyhow::Ok(())
    })?;

    engine.close()?;
    Ok(())
}

// ============================================================================
// INTERACTIVE
// ============================================================================

fn run_interactive(engine: &MemoryEngine, encoder: &CachedEncoder, prompt: &str) -> anyhow::Result<()> {
    println!("{}", "=== Strata Interactive ===".cyan().bold());
    print_interactive_help();

    let stdin = io::stdin();
    let mut stdout = io::stdout();
    let mut lines = stdin.lock().lines();

    loop {
        print!("{}", prompt);
        stdout.flush()?;
        let Some(line) = lines.next() else {
            println!();
            break;
        };
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let (command, rest) = match line.split_once(char::is_whitespace) {
            Some((command, rest)) => (command, rest.trim()),
            None => (line, ""),
        };

        let outcome = match command {
            "quit" | "exit" | "q" => break,
            "help" | "?" => {
                print_interactive_help();
                Ok(())
            }
            "store" => run_store(engine, encoder, rest.to_string(), None, None, None, None),
            "retrieve" | "recall" => {
                run_retrieve(engine, encoder, rest, "core,peripheral", 10, None)
            }
            "status" => run_status(engine, encoder, rest == "--detailed"),
            "consolidate" => run_consolidate(engine, rest == "--dry-run"),
            "remove" => run_remove(engine, rest),
            other => {
                println!("{} {}", "Unknown command:".red(), other);
                Ok(())
            }
        };
        if let Err(e) = outcome {
            println!("{} {}", "Error:".red().bold(), e);
        }
        println!();
    }
    Ok(())
}

fn print_interactive_help() {
    println!();
    println!("{}", "Commands:".white().bold());
    println!("  {} <text>         store an experience", "store".cyan());
    println!("  {} <query>     retrieve by activation", "retrieve".cyan());
    println!("  {} [--detailed]  show status", "status".cyan());
    println!("  {} [--dry-run] run consolidation", "consolidate".cyan());
    println!("  {} <id>          remove a memory", "remove".cyan());
    println!("  {}                 leave", "quit".cyan());
    println!();
}

/// Truncate a string for display (UTF-8 safe)
fn truncate(s: &str, max_chars: usize) -> String {
    let s = s.replace('\n', " ");
    if s.chars().count() <= max_chars {
        s
    } else {
        let truncated: String = s.chars().take(max_chars).collect();
        format!("{}...", truncated)
    }
}
