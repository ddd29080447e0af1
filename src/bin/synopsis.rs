#![forbid(unsafe_code)]

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use synopsis_harness::cache::SqliteSummaryCache;
use synopsis_harness::caller::GatewayCaller;
use synopsis_harness::checkpoint::SqliteCheckpointStore;
use synopsis_harness::config::SynopsisConfig;
use synopsis_harness::diff_report::{manifest_diff_to_payload, write_diff_json};
use synopsis_harness::engine::{Engine, EngineError, JsonlTraceSink, RunInterrupt};
use synopsis_harness::gateway::{ProviderGateway, TracingUsageSink};
use synopsis_harness::manifest::{canonical_repo_path, diff, ChurnWeighting, ManifestStore};
use synopsis_harness::summarizer::{RunOptions, Summarizer, SummarizerError};

#[derive(Parser)]
#[command(name = "synopsis", version, about = "Hierarchical repository summaries")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Summarize a repository
    Run {
        repo: PathBuf,
        /// JSON configuration file
        #[arg(long)]
        config: Option<PathBuf>,
        /// Write the full run outcome as JSON
        #[arg(long)]
        out: Option<PathBuf>,
        /// Resume a run; without an id, the newest unfinished run is used
        #[arg(long, num_args = 0..=1, default_missing_value = "")]
        resume: Option<String>,
        /// Start fresh even if an unfinished run exists
        #[arg(long, conflicts_with = "resume")]
        no_resume: bool,
        /// Re-summarize only files changed since the previous manifest
        #[arg(long)]
        diff_only: bool,
        /// Per-node JSONL trace
        #[arg(long)]
        trace: Option<PathBuf>,
        /// Write the diff against the previous run as JSON
        #[arg(long)]
        diff_out: Option<PathBuf>,
        /// Ask the strong tier for a prose digest of the changes
        #[arg(long)]
        digest: bool,
        #[arg(long)]
        cache: Option<PathBuf>,
        #[arg(long)]
        checkpoints: Option<PathBuf>,
        #[arg(long)]
        manifests: Option<PathBuf>,
        /// Manifests kept per repository
        #[arg(long)]
        keep: Option<usize>,
    },
    /// Diff two stored runs of a repository
    Diff {
        #[arg(long)]
        repo: PathBuf,
        /// Run id prefix of the older run
        #[arg(long)]
        old: String,
        /// Run id prefix of the newer run
        #[arg(long)]
        new: String,
        #[arg(long)]
        out: Option<PathBuf>,
        #[arg(long)]
        manifests: Option<PathBuf>,
    },
    /// List or prune stored run manifests
    Manifests {
        #[command(subcommand)]
        command: ManifestCommands,
    },
    /// Summary cache maintenance
    Cache {
        #[command(subcommand)]
        command: CacheCommands,
    },
}

#[derive(Subcommand)]
enum ManifestCommands {
    List {
        #[arg(long)]
        repo: PathBuf,
        #[arg(long)]
        manifests: Option<PathBuf>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    Prune {
        #[arg(long)]
        repo: PathBuf,
        #[arg(long)]
        keep: usize,
        #[arg(long)]
        manifests: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum CacheCommands {
    /// Export the cache to JSONL
    Export {
        #[arg(long)]
        db: Option<PathBuf>,
        #[arg(long)]
        out: PathBuf,
    },
    /// Prune the cache by age and/or size
    Prune {
        #[arg(long)]
        db: Option<PathBuf>,
        #[arg(long)]
        max_age_days: Option<u64>,
        #[arg(long)]
        max_rows: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("SYNOPSIS_LOG").unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            repo,
            config,
            out,
            resume,
            no_resume,
            diff_only,
            trace,
            diff_out,
            digest,
            cache,
            checkpoints,
            manifests,
            keep,
        } => {
            let mut config = SynopsisConfig::load_or_default(config.as_deref())?;
            if no_resume {
                config.engine.resume = false;
            }
            if resume.is_some() {
                config.engine.resume = true;
            }
            if let Some(path) = cache {
                config.storage.cache_path = path;
            }
            if let Some(path) = checkpoints {
                config.storage.checkpoint_path = path;
            }
            if let Some(dir) = manifests {
                config.storage.manifest_dir = dir;
            }
            if let Some(keep) = keep {
                config.storage.manifest_retention = keep;
            }

            let gateway = ProviderGateway::from_env(
                Arc::new(TracingUsageSink),
                config.gateway.gateway_config(),
            )?;
            let caller = Arc::new(GatewayCaller::new(Arc::new(gateway), config.tiers.models()));
            let summary_cache = Arc::new(SqliteSummaryCache::new(&config.storage.cache_path)?);
            let checkpoint_store =
                Arc::new(SqliteCheckpointStore::new(&config.storage.checkpoint_path)?);

            let mut engine = Engine::new(
                caller,
                summary_cache,
                checkpoint_store.clone(),
                config.engine.clone(),
            );
            let mut trace_worker = None;
            if let Some(path) = trace {
                let (sink, worker) = JsonlTraceSink::new(path)?;
                engine = engine.with_trace(Arc::new(sink));
                trace_worker = Some(worker);
            }

            let summarizer = Summarizer::new(
                engine,
                checkpoint_store,
                ManifestStore::new(&config.storage.manifest_dir)?,
                config.scan.clone(),
                config.storage.manifest_retention,
            );

            let interrupt = RunInterrupt::new();
            let on_signal = interrupt.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    eprintln!("[synopsis] interrupt received, stopping after in-flight work...");
                    on_signal.trigger();
                }
            });

            let options = RunOptions {
                repo: repo.clone(),
                repo_url: None,
                resume_run_id: resume.filter(|id| !id.is_empty()),
                diff_only,
                digest,
            };
            eprintln!("[synopsis] summarizing {}...", repo.display());
            let result = summarizer.run(&options, &interrupt).await;
            drop(summarizer);
            if let Some(worker) = trace_worker {
                worker.join()?;
            }

            let output = match result {
                Ok(output) => output,
                Err(SummarizerError::Engine(EngineError::Interrupted { run_id, completed })) => {
                    eprintln!(
                        "[synopsis] interrupted after {completed} nodes; resume with --resume {run_id}"
                    );
                    std::process::exit(130);
                }
                Err(e) => return Err(e.into()),
            };

            let stats = &output.outcome.stats;
            eprintln!(
                "[synopsis] run {}: {} nodes, {} remote calls ({} batched), {} cache hits, {} checkpoint hits, {} failed, ${:.4}",
                output.outcome.run_id,
                stats.nodes_total,
                stats.remote_calls,
                stats.batched_calls,
                stats.cache_hits,
                stats.checkpoint_hits,
                stats.failed,
                stats.estimated_cost_usd(),
            );
            for warning in &output.outcome.warnings {
                eprintln!("[synopsis] warning: {warning}");
            }
            eprintln!(
                "[synopsis] manifest written to {}",
                output.manifest_path.display()
            );

            if let Some(path) = out {
                write_json(&path, &output.outcome)?;
                eprintln!("[synopsis] outcome written to {}", path.display());
            }
            if let (Some(path), Some(payload)) = (diff_out, &output.diff) {
                write_diff_json(&path, payload)?;
                eprintln!("[synopsis] diff written to {}", path.display());
            }
            if let Some(note) = &output.change_note {
                println!("{note}\n");
            }
            println!("{}", output.outcome.root_summary);
        }
        Commands::Diff {
            repo,
            old,
            new,
            out,
            manifests,
        } => {
            let store = manifest_store(manifests)?;
            let repo_path = canonical_repo_path(&repo);
            let old_manifest = store
                .find_latest(&repo_path, Some(&old))?
                .ok_or_else(|| format!("no manifest matching run id {old}"))?;
            let new_manifest = store
                .find_latest(&repo_path, Some(&new))?
                .ok_or_else(|| format!("no manifest matching run id {new}"))?;
            let mut changes = diff(&old_manifest, &new_manifest);
            changes.sort_by_churn(ChurnWeighting::SummaryDelta, &[]);
            let payload =
                manifest_diff_to_payload(&changes, Some(&old_manifest.run_id), &new_manifest.run_id);
            match out {
                Some(path) => write_diff_json(&path, &payload)?,
                None => println!("{}", serde_json::to_string_pretty(&payload)?),
            }
        }
        Commands::Manifests { command } => match command {
            ManifestCommands::List {
                repo,
                manifests,
                limit,
            } => {
                let store = manifest_store(manifests)?;
                for m in store.find_all(&canonical_repo_path(&repo), limit)? {
                    println!(
                        "{}\t{}\t{} files\t${:.4}",
                        m.run_id, m.timestamp, m.total_files, m.api_cost_usd
                    );
                }
            }
            ManifestCommands::Prune {
                repo,
                keep,
                manifests,
            } => {
                if keep == 0 {
                    return Err("--keep must be >= 1".into());
                }
                let store = manifest_store(manifests)?;
                let removed = store.prune(&canonical_repo_path(&repo), keep)?;
                println!("removed {} manifests", removed.len());
            }
        },
        Commands::Cache { command } => match command {
            CacheCommands::Export { db, out } => {
                let path = db.unwrap_or_else(SqliteSummaryCache::default_path);
                let cache = SqliteSummaryCache::new(path)?;
                let rows = cache.export_jsonl(out).await?;
                println!("exported {rows} rows");
            }
            CacheCommands::Prune {
                db,
                max_age_days,
                max_rows,
            } => {
                if max_age_days.is_none() && max_rows.is_none() {
                    return Err("cache prune requires --max-age-days and/or --max-rows".into());
                }
                if matches!(max_rows, Some(0)) {
                    return Err("--max-rows must be >= 1".into());
                }
                let path = db.unwrap_or_else(SqliteSummaryCache::default_path);
                let cache = SqliteSummaryCache::new(path)?;
                let _lock = cache.lock_exclusive()?;
                let stats = cache.prune(max_age_days, max_rows).await?;
                println!(
                    "pruned {} rows; {} rows remain",
                    stats.deleted, stats.remaining
                );
            }
        },
    }

    Ok(())
}

fn manifest_store(dir: Option<PathBuf>) -> Result<ManifestStore, Box<dyn std::error::Error>> {
    Ok(ManifestStore::new(
        dir.unwrap_or_else(ManifestStore::default_dir),
    )?)
}

fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<(), Box<dyn std::error::Error>> {
    let writer = BufWriter::new(File::create(path)?);
    serde_json::to_writer_pretty(writer, value)?;
    Ok(())
}
