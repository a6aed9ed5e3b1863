use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use dialoguer::Confirm;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

use vidcull::core::config::ConfigError;
use vidcull::core::history::HISTORY_FILE_NAME;
use vidcull::core::pipeline::FailureStage;
use vidcull::core::report::export_groups;
use vidcull::{
    ClipOnnxEmbedder, Config, Deduplicator, EmbeddingGenerator, GroupingStrategy, History,
    ProcessRunner, RestoreSelection, RunPhase, RunProgress, RunReport,
};

#[derive(Parser, Debug)]
#[command(name = "vidcull", version, about = "CLI for culling near-duplicate videos")]
struct Cli {
    /// JSON config file; flags override its values
    #[arg(short, long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log debug output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Duplicate workflows
    Duplicates {
        #[command(subcommand)]
        command: Dups,
    },

    /// Work with relocation history
    History {
        #[command(subcommand)]
        command: HistoryCmd,
    },
}

#[derive(Subcommand, Debug)]
enum Dups {
    /// Find and list duplicate groups without moving anything
    Scan {
        #[command(flatten)]
        run: RunArgs,
    },

    /// Keep the best copy of each group and move the rest into quarantine
    Cull {
        #[command(flatten)]
        run: RunArgs,
        /// Only show what would be moved
        #[arg(long)]
        dry_run: bool,
        /// Do not ask for confirmation
        #[arg(short, long)]
        yes: bool,
    },
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Directory to scan (repeatable, scanned in the given order)
    #[arg(short, long = "source", value_name = "DIR")]
    sources: Vec<PathBuf>,

    /// Directory duplicates are moved into
    #[arg(short, long, value_name = "DIR")]
    quarantine: Option<PathBuf>,

    /// CLIP visual encoder in ONNX format
    #[arg(short, long, value_name = "FILE")]
    model: Option<PathBuf>,

    /// Cosine similarity a video must exceed to join a group
    #[arg(short, long)]
    threshold: Option<f32>,

    /// Video extensions to include, comma separated
    #[arg(long, value_delimiter = ',', value_name = "EXT")]
    extensions: Option<Vec<String>>,

    /// Concurrent frame extractions
    #[arg(short, long)]
    workers: Option<usize>,

    /// Group by connected components instead of by seed
    #[arg(long)]
    transitive: bool,

    /// Directory for extracted frames
    #[arg(long, value_name = "DIR")]
    frame_dir: Option<PathBuf>,

    /// Keep extracted frames after embedding
    #[arg(long)]
    keep_frames: bool,

    /// Write duplicate groups to a JSON file
    #[arg(short, long, value_name = "FILE")]
    report: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum HistoryCmd {
    /// List all relocation records
    List {
        /// Quarantine directory holding the history
        #[arg(short, long, value_name = "DIR")]
        quarantine: Option<PathBuf>,
    },

    /// Move quarantined files back to where they were found
    Restore {
        /// Quarantine directory holding the history
        #[arg(short, long, value_name = "DIR")]
        quarantine: Option<PathBuf>,
        /// Restore a specific record index
        #[arg(long, conflicts_with = "all")]
        record: Option<usize>,
        /// Restore all records
        #[arg(long, conflicts_with = "record")]
        all: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let base = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };

    match cli.command {
        Commands::Duplicates { command } => match command {
            Dups::Scan { run } => {
                let config = apply(base, &run, false);
                println!("▶ Scanning for duplicate videos in: {}", sources(&config));
                let report = run_pipeline(config).await?;
                print_groups(&report);
                finish(&report, run.report.as_ref())?;
            }

            Dups::Cull { run, dry_run, yes } => {
                let config = apply(base, &run, !dry_run);
                println!("▶ Culling duplicate videos in: {}", sources(&config));
                if !dry_run && !config.keep_best {
                    println!("⚠️  keep_best is false in the config; running as a dry run.");
                }
                let dry_run = !config.keep_best;

                if !dry_run && !yes {
                    let proceed = Confirm::new()
                        .with_prompt(format!(
                            "Move lower quality duplicates into {}?",
                            config.quarantine_dir.display()
                        ))
                        .default(false)
                        .interact()
                        .context("Failed to read confirmation")?;
                    if !proceed {
                        println!("Aborted; no files were changed.");
                        return Ok(());
                    }
                }

                let quarantine = config.quarantine_dir.clone();
                let report = run_pipeline(config).await?;
                print_groups(&report);
                finish(&report, run.report.as_ref())?;

                if dry_run {
                    println!("\n⚠️  Dry-run only; no files were changed.");
                } else if report.move_count() > 0 {
                    println!(
                        "\n✅ Recorded cull history in {}",
                        quarantine.join(HISTORY_FILE_NAME).display()
                    );
                }
            }
        },

        Commands::History { command } => match command {
            HistoryCmd::List { quarantine } => {
                let history = History::new(&quarantine.unwrap_or(base.quarantine_dir));
                let records = history
                    .load()
                    .with_context(|| format!("Could not read {}", history.path().display()))?;

                if records.is_empty() {
                    println!("No relocation history in {}", history.path().display());
                    return Ok(());
                }

                println!("🗂️  Cull History:");
                for (i, stored) in records.iter().enumerate() {
                    let rec = &stored.record;
                    println!("[{}] {}", i, rec.timestamp);
                    println!("     kept: {}", rec.retained.display());
                    for entry in &rec.moves {
                        println!("     moved: {} → {}", entry.from.display(), entry.to.display());
                    }
                    println!();
                }
            }

            HistoryCmd::Restore {
                quarantine,
                record,
                all,
            } => {
                let history = History::new(&quarantine.unwrap_or(base.quarantine_dir));
                let selection = match (all, record) {
                    (true, _) => RestoreSelection::All,
                    (false, Some(index)) => RestoreSelection::Record(index),
                    (false, None) => RestoreSelection::Latest,
                };

                let summary = history
                    .restore(selection)
                    .with_context(|| format!("Failed to restore from {}", history.path().display()))?;

                for entry in &summary.restored {
                    println!("🔄 Restored {} → {}", entry.to.display(), entry.from.display());
                }
                for (entry, reason) in &summary.skipped {
                    eprintln!("⚠️  Skipped {}: {}", entry.to.display(), reason);
                }
                println!(
                    "🧹 Updated history, removed {} record(s)",
                    summary.records
                );
            }
        },
    }

    Ok(())
}

/// Layer command line flags over the loaded config.
fn apply(mut config: Config, args: &RunArgs, relocate: bool) -> Config {
    if !args.sources.is_empty() {
        config.source_dirs = args.sources.clone();
    }
    if let Some(dir) = &args.quarantine {
        config.quarantine_dir = dir.clone();
    }
    if let Some(model) = &args.model {
        config.model_path = model.clone();
    }
    if let Some(threshold) = args.threshold {
        config.similarity_threshold = threshold;
    }
    if let Some(extensions) = &args.extensions {
        config.extensions = extensions.clone();
    }
    if let Some(workers) = args.workers {
        config.workers = workers;
    }
    if args.transitive {
        config.grouping = GroupingStrategy::Transitive;
    }
    if let Some(dir) = &args.frame_dir {
        config.frame_dir = dir.clone();
    }
    if args.keep_frames {
        config.keep_frames = true;
    }
    config.keep_best = config.keep_best && relocate;
    config
}

fn sources(config: &Config) -> String {
    config
        .source_dirs
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

async fn run_pipeline(config: Config) -> Result<RunReport> {
    config.validate()?;

    let embedder = ClipOnnxEmbedder::load(&config.model_path, num_cpus::get())
        .map_err(|e| ConfigError::Model(e.to_string()))?;
    let generator = Arc::new(EmbeddingGenerator::new(embedder));

    let (progress_tx, progress_rx) = mpsc::unbounded_channel::<RunProgress>();
    let dedup = Deduplicator::new(config, Arc::new(ProcessRunner::new()), generator)
        .with_progress_sender(progress_tx);

    let token = dedup.get_cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\n⚠️  Cancelling; finishing the current step…");
            token.store(true, Ordering::Relaxed);
        }
    });

    let progress = tokio::spawn(show_progress(progress_rx));
    let start = Instant::now();
    let result = dedup.run().await;
    drop(dedup);
    let _ = progress.await;
    println!("⏱ Run took {:.2?}", start.elapsed());

    Ok(result?)
}

async fn show_progress(mut rx: mpsc::UnboundedReceiver<RunProgress>) {
    let bar = ProgressBar::new_spinner();
    bar.enable_steady_tick(Duration::from_millis(100));
    let mut phase = None;

    while let Some(progress) = rx.recv().await {
        if phase != Some(progress.phase) {
            phase = Some(progress.phase);
            let template = match progress.phase {
                RunPhase::Embedding | RunPhase::Resolving => {
                    "{spinner:.green} {msg} [{bar:40.cyan/blue}] {pos}/{len}"
                }
                _ => "{spinner:.green} {msg}",
            };
            if let Ok(style) = ProgressStyle::with_template(template) {
                bar.set_style(style.progress_chars("=> "));
            }
            bar.set_message(match progress.phase {
                RunPhase::Discovery => "Scanning for videos…",
                RunPhase::Embedding => "Extracting and embedding frames",
                RunPhase::Grouping => "Grouping similar videos…",
                RunPhase::Resolving => "Ranking and relocating duplicates",
                RunPhase::Complete => "Done",
            });
        }
        bar.set_length(progress.total as u64);
        bar.set_position(progress.processed as u64);
    }

    bar.finish_and_clear();
}

fn print_groups(report: &RunReport) {
    println!(
        "▶ {} video(s) found, {} embedded",
        report.discovered,
        report.embedded.len()
    );

    if report.groups.is_empty() {
        println!("No duplicates found.");
        return;
    }

    println!("Found {} duplicate group(s):", report.groups.len());
    for (i, outcome) in report.groups.iter().enumerate() {
        println!("\n✨ Group {}:", i + 1);
        let Some(resolved) = &outcome.resolution else {
            for member in &outcome.group.members {
                println!("   ▶ {}", member.display());
            }
            println!("   ⚠️  Not resolved (run cancelled)");
            continue;
        };

        match &resolved.keeper {
            Some(keeper) => println!("   🏆 Keeping → {}", keeper.display()),
            None => {
                for member in &outcome.group.members {
                    println!("   ▶ {}", member.display());
                }
                println!("   ⚠️  No member could be probed; left in place");
            }
        }
        for relocation in &resolved.relocations {
            if report.relocated {
                println!(
                    "   📦 Moved {} → {}",
                    relocation.from.display(),
                    relocation.to.display()
                );
            } else {
                println!(
                    "   📦 [dry-run] MOVE {} → {}",
                    relocation.from.display(),
                    relocation.to.display()
                );
            }
        }
        for failure in &resolved.failures {
            println!("   ⚠️  {}", failure.error);
        }
    }
}

fn finish(report: &RunReport, report_path: Option<&PathBuf>) -> Result<()> {
    if let Some(path) = report_path {
        export_groups(path, report.report_rows())
            .with_context(|| format!("Failed to write report {}", path.display()))?;
        println!("\n📄 Wrote duplicate groups to {}", path.display());
    }

    let skipped = report.failure_count(FailureStage::Extraction)
        + report.failure_count(FailureStage::Embedding);
    if skipped > 0 {
        println!("\n⚠️  {} video(s) could not be fingerprinted:", skipped);
        for failure in report
            .failures
            .iter()
            .filter(|f| matches!(f.stage, FailureStage::Extraction | FailureStage::Embedding))
        {
            println!("   {}: {}", failure.path.display(), failure.reason);
        }
    }

    if !report.completed {
        println!("\n⚠️  Run cancelled before it finished; completed moves were kept.");
    }
    Ok(())
}
