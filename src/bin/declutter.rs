//! # Declutter CLI - reversible photo cleanup
//!
//! Command-line front end for the declutter library.
//!
//! ## Features
//! - Scan a photo folder and report what was found
//! - Propose a plan: duplicates, classified shots and events
//! - Apply the plan through the move journal
//! - Undo single moves, the last move, or everything
//! - Inspect and acknowledge journal inconsistencies
//!
//! ## Usage
//! ```bash
//! # What is in here?
//! declutter --path ~/Pictures scan
//!
//! # Show the proposed moves and save them
//! declutter --path ~/Pictures plan --save plan.json
//!
//! # Execute the saved plan
//! declutter --path ~/Pictures apply --plan plan.json --yes
//!
//! # Changed your mind
//! declutter --path ~/Pictures undo --all
//! ```

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use colored::*;
use declutter::config::DeclutterConfig;
use declutter::events::CaptionMap;
use declutter::imaging::PhotoManifest;
use declutter::plan::LabelMap;
use declutter::types::{Classification, PhotoId, ProgressInfo};
use declutter::{
    CancelToken, Declutter, DeclutterBuilder, MoveRecord, OperationKind, Plan, PlanInputs, PlanOutcome,
};
use humantime::format_duration;
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

/// Declutter CLI - sort a photo folder into a reversible staging tree
#[derive(Parser)]
#[command(name = "declutter")]
#[command(version)]
#[command(about = "Find duplicates, group events and move photos into a staging folder, with undo")]
#[command(long_about = None)]
struct Cli {
    /// Photo folder (defaults to current)
    #[arg(short, long, global = true)]
    path: Option<PathBuf>,

    /// Staging folder (defaults to <path>/_declutter)
    #[arg(short, long, global = true)]
    staging: Option<PathBuf>,

    /// JSON configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the images and videos that would be considered
    Scan,

    /// Propose moves without touching anything
    Plan {
        #[command(flatten)]
        inputs: InputArgs,

        /// Write the plan as JSON to this file
        #[arg(long)]
        save: Option<PathBuf>,

        /// Print the plan as JSON instead of a summary
        #[arg(long)]
        json: bool,

        /// Number of moves to list
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },

    /// Execute a plan
    Apply {
        #[command(flatten)]
        inputs: InputArgs,

        /// Plan saved by `declutter plan --save`; recomputed when absent
        #[arg(long)]
        plan: Option<PathBuf>,

        /// Continue a partly applied plan
        #[arg(long)]
        resume: bool,

        /// Actually move files; without it only the summary is shown
        #[arg(short, long)]
        yes: bool,
    },

    /// Show the move journal
    #[command(alias = "log")]
    History {
        /// Show only the newest records
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Reverse applied moves
    Undo {
        /// Undo the most recent move still in effect
        #[arg(long, conflicts_with_all = ["all", "record"])]
        last: bool,

        /// Undo every move, newest first
        #[arg(long, conflicts_with = "record")]
        all: bool,

        /// Undo one journal record
        #[arg(long)]
        record: Option<u64>,
    },

    /// Compare the journal with the filesystem
    Reconcile,

    /// Accept the current inconsistencies and allow moves again
    Acknowledge,

    /// Forget journal records that no longer need undoing
    Prune {
        /// Last sequence number to drop
        #[arg(long)]
        through: u64,
    },
}

/// Where planning inputs come from
#[derive(Args)]
struct InputArgs {
    /// Precomputed fingerprints, labels and captions; skips image analysis
    #[arg(long, conflicts_with_all = ["labels", "captions"])]
    manifest: Option<PathBuf>,

    /// Classification labels: {"<path>": {"category": "...", "confidence": 0.9}}
    #[arg(long)]
    labels: Option<PathBuf>,

    /// Captions: {"<path>": "text"}
    #[arg(long)]
    captions: Option<PathBuf>,

    /// Override the event gap, e.g. "12h" or "2days"
    #[arg(long, value_parser = humantime::parse_duration)]
    gap: Option<Duration>,
}

fn main() {
    let cli = Cli::parse();

    // Set up logging
    let default_level = if cli.verbose { "declutter=debug" } else { "declutter=warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    // Disable colors if needed
    if std::env::var("NO_COLOR").is_ok() {
        colored::control::set_override(false);
    }

    if let Err(e) = run(cli) {
        eprintln!("{}: {:#}", "Error".red().bold(), e);
        std::process::exit(1);
    }
}

/// Main command runner
fn run(cli: Cli) -> anyhow::Result<()> {
    let root = cli.path.unwrap_or_else(|| PathBuf::from("."));
    let config = match &cli.config {
        Some(path) => DeclutterConfig::load(path)
            .with_context(|| format!("cannot load configuration {}", path.display()))?,
        None => DeclutterConfig::default(),
    };
    let session = Session {
        root,
        staging: cli.staging,
        config,
    };

    match cli.command {
        Commands::Scan => cmd_scan(&session),
        Commands::Plan {
            inputs,
            save,
            json,
            limit,
        } => cmd_plan(&session, &inputs, save.as_deref(), json, limit),
        Commands::Apply {
            inputs,
            plan,
            resume,
            yes,
        } => cmd_apply(&session, &inputs, plan.as_deref(), resume, yes),
        Commands::History { limit } => cmd_history(&session, limit),
        Commands::Undo { last, all, record } => cmd_undo(&session, last, all, record),
        Commands::Reconcile => cmd_reconcile(&session),
        Commands::Acknowledge => cmd_acknowledge(&session),
        Commands::Prune { through } => cmd_prune(&session, through),
    }
}

/// Global options shared by every command
struct Session {
    root: PathBuf,
    staging: Option<PathBuf>,
    config: DeclutterConfig,
}

impl Session {
    fn open(&self, gap: Option<Duration>, progress: Option<&ProgressBar>) -> anyhow::Result<Declutter> {
        let mut builder = DeclutterBuilder::new().config(self.config.clone());
        if let Some(gap) = gap {
            builder = builder.gap_threshold_secs(i64::try_from(gap.as_secs()).unwrap_or(i64::MAX));
        }
        if let Some(staging) = &self.staging {
            builder = builder.staging_root(staging.clone());
        }
        if let Some(pb) = progress {
            let pb = pb.clone();
            builder = builder.progress(Arc::new(move |info: ProgressInfo| {
                if let Some(total) = info.total {
                    pb.set_length(total as u64);
                }
                pb.set_position(info.processed as u64);
                pb.set_message(info.operation);
            }));
        }
        let declutter = builder
            .build(self.root.clone())
            .with_context(|| format!("cannot open {}", self.root.display()))?;

        let report = declutter.reconciliation();
        if report.blocks_mutation() {
            eprintln!("{} {}", "Warning:".yellow().bold(), report.summary().yellow());
            eprintln!(
                "  Inspect with {} and accept with {}",
                "declutter reconcile".yellow(),
                "declutter acknowledge".yellow()
            );
        }
        Ok(declutter)
    }
}

fn progress_bar() -> ProgressBar {
    let pb = ProgressBar::new(0);
    let style = ProgressStyle::with_template("{spinner:.green} {msg} [{bar:30.cyan/blue}] {pos}/{len}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=> ");
    pb.set_style(style);
    pb
}

/// Show what a scan finds
fn cmd_scan(session: &Session) -> anyhow::Result<()> {
    let declutter = session.open(None, None)?;
    let start = Instant::now();
    let scan = declutter.scan()?;

    println!("{}", "Scan results:".blue().bold());
    println!("  Root: {}", scan.root.display().to_string().cyan());
    println!("  Images: {}", scan.images.len().to_string().cyan());
    println!("  Videos: {}", scan.videos.len().to_string().cyan());
    println!("  Skipped: {}", scan.skipped.len().to_string().dimmed());
    println!("  Size: {}", declutter::utils::format_bytes(scan.total_size_bytes).cyan());
    println!("  Time: {}", format_duration(round_ms(start.elapsed())).to_string().cyan());

    let breakdown = scan.format_breakdown();
    if !breakdown.is_empty() {
        println!("\n{}", "Formats:".blue().bold());
        for (ext, count) in breakdown {
            println!("  {:<6} {}", ext, count);
        }
    }
    print_issues(scan.report.issues.iter().map(|i| (i.photo.as_path(), i.message.as_str())));
    Ok(())
}

/// Compute a plan and print it
fn cmd_plan(
    session: &Session,
    inputs: &InputArgs,
    save: Option<&Path>,
    json: bool,
    limit: usize,
) -> anyhow::Result<()> {
    let pb = (!json).then(progress_bar);
    let declutter = session.open(inputs.gap, pb.as_ref())?;
    let start = Instant::now();
    let outcome = compute_plan(&declutter, inputs)?;
    if let Some(pb) = &pb {
        pb.finish_and_clear();
    }

    if let Some(path) = save {
        let bytes = serde_json::to_vec_pretty(&outcome.plan)?;
        declutter::utils::atomic_write(path, &bytes)
            .with_context(|| format!("cannot write {}", path.display()))?;
    }
    if json {
        println!("{}", serde_json::to_string_pretty(&outcome.plan)?);
        return Ok(());
    }

    println!("{}", "Duplicates:".blue().bold());
    println!("  {}", outcome.dedup.summary());
    println!("{}", "Events:".blue().bold());
    println!(
        "  {} events, {} undated photos",
        outcome.segmentation.segments.len().to_string().cyan(),
        outcome.segmentation.undated.len().to_string().cyan()
    );
    for segment in outcome.segmentation.segments.iter().take(limit) {
        let marker = if segment.is_subdivided() {
            format!(" ({} sub-clusters)", segment.sub_clusters.len())
        } else {
            String::new()
        };
        println!("    {} {}{}", segment.label.cyan(), segment.len().to_string().dimmed(), marker.dimmed());
    }

    println!("{}", "Plan:".blue().bold());
    println!("  {}", outcome.plan.summary());
    for proposed in outcome.plan.iter().take(limit) {
        let destination = proposed
            .destination
            .strip_prefix(&outcome.plan.staging_root)
            .unwrap_or(&proposed.destination);
        println!(
            "    {} {} {} {}",
            relative(&proposed.photo, declutter.root()).display(),
            "->".dimmed(),
            destination.display().to_string().cyan(),
            format!("({})", proposed.reason).dimmed()
        );
    }
    if outcome.plan.len() > limit {
        println!("    {}", format!("... and {} more", outcome.plan.len() - limit).dimmed());
    }
    println!("  Time: {}", format_duration(round_ms(start.elapsed())).to_string().cyan());
    if let Some(path) = save {
        println!("{} Saved plan to {}", "✓".green().bold(), path.display().to_string().cyan());
    }
    print_issues(outcome.report.issues.iter().map(|i| (i.photo.as_path(), i.message.as_str())));
    Ok(())
}

/// Execute a saved or freshly computed plan
fn cmd_apply(
    session: &Session,
    inputs: &InputArgs,
    plan_path: Option<&Path>,
    resume: bool,
    yes: bool,
) -> anyhow::Result<()> {
    let pb = progress_bar();
    let declutter = session.open(inputs.gap, Some(&pb))?;
    let plan = match plan_path {
        Some(path) => {
            let bytes = std::fs::read(path).with_context(|| format!("cannot read {}", path.display()))?;
            serde_json::from_slice::<Plan>(&bytes)
                .with_context(|| format!("{} is not a plan", path.display()))?
        }
        None => compute_plan(&declutter, inputs)?.plan,
    };

    pb.suspend(|| println!("{}", plan.summary()));
    if plan.is_empty() || !yes {
        pb.finish_and_clear();
        if plan.is_empty() {
            println!("{}", "Nothing to do.".yellow());
        } else {
            println!("Re-run with {} to move the files.", "--yes".yellow());
        }
        return Ok(());
    }

    pb.reset();
    let start = Instant::now();
    let report = if resume {
        declutter.resume(&plan, CancelToken::new())?
    } else {
        declutter.apply(&plan)?
    };
    pb.finish_and_clear();

    let mark = if report.is_success() { "✓".green().bold() } else { "!".yellow().bold() };
    println!("{} {}", mark, report.summary());
    println!("  Time: {}", format_duration(round_ms(start.elapsed())).to_string().cyan());
    for failure in &report.failures {
        println!(
            "  {} {}: {}",
            "-".red(),
            failure.source.display(),
            failure.error.red()
        );
    }
    if !report.is_complete() {
        println!("Continue later with {}", "declutter apply --resume --yes".yellow());
    }
    Ok(())
}

/// Print the journal
fn cmd_history(session: &Session, limit: Option<usize>) -> anyhow::Result<()> {
    let declutter = session.open(None, None)?;
    let history = declutter.history();
    if history.is_empty() {
        println!("{}", "No moves recorded.".yellow());
        return Ok(());
    }

    println!("{}", "Journal:".blue().bold());
    let skip = limit.map_or(0, |n| history.len().saturating_sub(n));
    for record in &history[skip..] {
        print_record(record, declutter.root());
    }
    if skip > 0 {
        println!("{}", format!("Showing {} of {} records", history.len() - skip, history.len()).dimmed());
    }
    Ok(())
}

/// Reverse moves
fn cmd_undo(session: &Session, last: bool, all: bool, record: Option<u64>) -> anyhow::Result<()> {
    let declutter = session.open(None, None)?;
    let undone: Vec<MoveRecord> = match (last, all, record) {
        (_, true, _) => declutter.undo_all()?,
        (_, _, Some(seq)) => vec![declutter.undo(seq)?],
        (true, _, _) => declutter.undo_last()?.into_iter().collect(),
        _ => bail!("choose one of --last, --all or --record <SEQ>"),
    };

    if undone.is_empty() {
        println!("{}", "Nothing to undo.".yellow());
        return Ok(());
    }
    for record in &undone {
        print_record(record, declutter.root());
    }
    println!("{} Undid {} moves", "✓".green().bold(), undone.len().to_string().cyan());
    Ok(())
}

/// Re-run reconciliation and list the findings
fn cmd_reconcile(session: &Session) -> anyhow::Result<()> {
    let declutter = session.open(None, None)?;
    let report = declutter.reconcile()?;
    if report.is_consistent() {
        println!("{} {}", "✓".green().bold(), report.summary());
        return Ok(());
    }

    println!("{}", report.summary().yellow());
    for d in &report.discrepancies {
        let state = if d.acknowledged { "acknowledged".dimmed() } else { "open".red() };
        let seq = d.seq.map_or_else(|| "-".to_string(), |s| s.to_string());
        println!("  [{}] #{} {:?} {}: {}", state, seq, d.kind, d.path.display(), d.detail);
    }
    Ok(())
}

/// Accept the open findings
fn cmd_acknowledge(session: &Session) -> anyhow::Result<()> {
    let declutter = session.open(None, None)?;
    let report = declutter.acknowledge_inconsistencies()?;
    println!("{} {}", "✓".green().bold(), report.summary());
    Ok(())
}

/// Drop old journal records
fn cmd_prune(session: &Session, through: u64) -> anyhow::Result<()> {
    let declutter = session.open(None, None)?;
    let removed = declutter.prune_through(through)?;
    println!(
        "{} Dropped {} records; those moves can no longer be undone",
        "✓".green().bold(),
        removed.to_string().cyan()
    );
    Ok(())
}

// Helper functions

/// Plan from a manifest, or by scanning and analysing the folder
fn compute_plan(declutter: &Declutter, inputs: &InputArgs) -> anyhow::Result<PlanOutcome> {
    if let Some(path) = &inputs.manifest {
        let manifest = PhotoManifest::load(path)
            .with_context(|| format!("cannot load manifest {}", path.display()))?;
        return Ok(declutter.plan(&PlanInputs::from_manifest(&manifest))?);
    }

    let labels: LabelMap = match &inputs.labels {
        Some(path) => read_json_map::<Classification>(path)?
            .into_iter()
            .map(|(k, v)| Classification::new(v.category, v.confidence).map(|c| (k, c)))
            .collect::<declutter::Result<_>>()?,
        None => LabelMap::default(),
    };
    let captions: CaptionMap = match &inputs.captions {
        Some(path) => read_json_map::<String>(path)?.into_iter().collect(),
        None => CaptionMap::default(),
    };
    Ok(declutter.plan_directory_with(labels, captions)?)
}

fn read_json_map<T: serde::de::DeserializeOwned>(path: &Path) -> anyhow::Result<BTreeMap<PhotoId, T>> {
    let bytes = std::fs::read(path).with_context(|| format!("cannot read {}", path.display()))?;
    serde_json::from_slice(&bytes).with_context(|| format!("cannot parse {}", path.display()))
}

fn print_record(record: &MoveRecord, root: &Path) {
    let kind = match record.kind {
        OperationKind::Move => "move ".green(),
        OperationKind::Undo => "undo ".yellow(),
        OperationKind::Abort => "abort".red(),
    };
    let reverses = record
        .reverses
        .map_or_else(String::new, |seq| format!(" (reverses #{})", seq));
    println!(
        "  #{:<5} {} {} {} {} {}{}",
        record.seq.to_string().yellow(),
        kind,
        record.timestamp.format("%Y-%m-%d %H:%M:%S").to_string().dimmed(),
        record.source.strip_prefix(root).unwrap_or(&record.source).display(),
        "->".dimmed(),
        record.destination.strip_prefix(root).unwrap_or(&record.destination).display(),
        reverses.dimmed()
    );
}

fn print_issues<'a>(issues: impl Iterator<Item = (&'a Path, &'a str)>) {
    let issues: Vec<_> = issues.collect();
    if issues.is_empty() {
        return;
    }
    println!("\n{} {}", "Warnings:".yellow().bold(), issues.len());
    for (photo, message) in issues.iter().take(10) {
        println!("  - {}: {}", photo.display(), message.yellow());
    }
    if issues.len() > 10 {
        println!("  {}", format!("... and {} more", issues.len() - 10).dimmed());
    }
}

fn relative<'a>(photo: &'a PhotoId, root: &Path) -> &'a Path {
    photo.path().strip_prefix(root).unwrap_or(photo.path())
}

fn round_ms(duration: Duration) -> Duration {
    Duration::from_millis(duration.as_millis() as u64)
}
