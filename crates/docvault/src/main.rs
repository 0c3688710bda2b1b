//! `dv`: index local documents and search them semantically.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result, anyhow, bail};
use chrono::Utc;
use clap::{Parser, Subcommand};
use docvault_core::collab::{Embedder, HashEmbedder, PlainTextParser};
use docvault_core::config::Config;
use docvault_core::logging::{LogConfig, init_logging};
use docvault_core::{
    ConsistencyCoordinator, ConsistencyReport, IndexingPipeline, PipelineReport, with_coordinator,
};
use serde_json::json;
use tracing::info;

#[derive(Parser, Debug)]
#[command(
    name = "dv",
    version,
    about = "Index local documents and search them semantically"
)]
struct Cli {
    /// Config file (defaults to $DOCVAULT_CONFIG, then the platform config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Data directory holding the vector index and metadata database
    #[arg(long, global = true, env = "DOCVAULT_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Print machine-readable JSON on stdout
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Index directories (all enabled registered directories when none given)
    Index {
        dirs: Vec<PathBuf>,
    },
    /// Search indexed chunks
    Search {
        query: String,
        /// Number of results
        #[arg(short, long, default_value_t = 5)]
        k: usize,
    },
    /// Compare the vector index with the metadata store
    Audit {
        /// Exit non-zero when the audit finds issues
        #[arg(long)]
        strict: bool,
    },
    /// Write a snapshot of both stores into DIR
    Export { dir: PathBuf },
    /// Replace the live stores with the snapshot in DIR
    Import { dir: PathBuf },
    /// Remove all indexed content (registered directories are kept)
    Clear,
    /// Drop tombstoned vectors and renumber slots
    Compact,
    /// Clear everything and re-index all enabled directories
    Rebuild,
    /// Manage registered directories
    Dirs {
        #[command(subcommand)]
        command: DirsCommand,
    },
    /// Show counts and file locations
    Status,
}

#[derive(Subcommand, Debug)]
enum DirsCommand {
    /// List registered directories
    List,
    /// Register a directory
    Add { path: PathBuf },
    /// Unregister a directory and delete its indexed content
    Remove { path: PathBuf },
    /// Include a directory in `dv index`
    Enable { path: PathBuf },
    /// Skip a directory in `dv index`
    Disable { path: PathBuf },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            if let Some(remediation) = err
                .chain()
                .find_map(|cause| cause.downcast_ref::<docvault_core::Error>())
                .and_then(docvault_core::Error::remediation)
            {
                eprint!("{}", remediation.render_plain());
            }
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let mut config = Config::load(cli.config.as_deref()).context("failed to load config")?;
    if let Some(dir) = &cli.data_dir {
        config = config.with_data_dir(dir);
    }

    let mut log_config = LogConfig::from(&config.general);
    if let Some(level) = &cli.log_level {
        log_config.level.clone_from(level);
    }
    init_logging(&log_config).context("failed to initialize logging")?;

    let json = cli.json;
    with_coordinator(config, |coord| Ok(dispatch(coord, cli.command, json)))?
}

fn dispatch(coord: &ConsistencyCoordinator, command: Commands, json: bool) -> Result<()> {
    match command {
        Commands::Index { dirs } => {
            let roots = if dirs.is_empty() {
                coord
                    .enabled_directories()?
                    .into_iter()
                    .map(|d| PathBuf::from(d.path))
                    .collect()
            } else {
                dirs
            };
            if roots.is_empty() {
                bail!("no directories to index; pass one or run `dv dirs add <path>`");
            }
            let reports = index_roots(coord, &roots)?;
            print_index_reports(&reports, json)
        }
        Commands::Search { query, k } => {
            let embedder = HashEmbedder::new(coord.dimension());
            let vector = embedder
                .embed(&query)
                .map_err(|e| anyhow!("failed to embed query: {e}"))?;
            let hits = coord.search(&vector, k)?;
            if json {
                return print_json(&hits);
            }
            if hits.is_empty() {
                println!("No results.");
            }
            for (rank, hit) in hits.iter().enumerate() {
                println!(
                    "{}. {} #{} (score {:.4})",
                    rank + 1,
                    hit.source_id,
                    hit.chunk_index,
                    hit.similarity_score
                );
                println!("   {}", preview(&hit.chunk_text, 120));
            }
            Ok(())
        }
        Commands::Audit { strict } => {
            let report = coord.audit_consistency()?;
            if json {
                print_json(&report)?;
            } else {
                print_audit(&report);
            }
            if strict && !report.ok {
                coord.ensure_consistent()?;
            }
            Ok(())
        }
        Commands::Export { dir } => {
            let (index, metadata) = snapshot_paths(coord, &dir);
            let manifest = coord
                .export_snapshot(&index, &metadata)
                .with_context(|| format!("export to {} failed", dir.display()))?;
            if json {
                return print_json(&manifest);
            }
            println!(
                "Exported {} vectors and {} rows to {}",
                manifest.vector_count,
                manifest.row_count,
                dir.display()
            );
            Ok(())
        }
        Commands::Import { dir } => {
            let (index, metadata) = snapshot_paths(coord, &dir);
            let outcome = coord
                .import_snapshot(&index, &metadata)
                .with_context(|| format!("import from {} failed", dir.display()))?;
            if json {
                return print_json(&outcome);
            }
            println!(
                "Imported {} vectors and {} rows from {}",
                outcome.report.vector_count,
                outcome.report.row_count,
                dir.display()
            );
            if outcome.degraded {
                println!("Warning: the imported snapshot is inconsistent.");
                print_audit(&outcome.report);
            }
            println!("Previous state saved to {}", outcome.metadata_backup.display());
            Ok(())
        }
        Commands::Clear => {
            coord.clear_all()?;
            if json {
                return print_json(&json!({ "cleared": true }));
            }
            println!("Cleared all indexed content.");
            Ok(())
        }
        Commands::Compact => {
            let outcome = coord.compact()?;
            if json {
                return print_json(&outcome);
            }
            println!(
                "Removed {} vectors, moved {} rows; {} vectors remain.",
                outcome.removed_vectors, outcome.moved_rows, outcome.vector_count
            );
            Ok(())
        }
        Commands::Rebuild => {
            coord.clear_all()?;
            let roots: Vec<PathBuf> = coord
                .enabled_directories()?
                .into_iter()
                .map(|d| PathBuf::from(d.path))
                .collect();
            let reports = index_roots(coord, &roots)?;
            print_index_reports(&reports, json)
        }
        Commands::Dirs { command } => dispatch_dirs(coord, command, json),
        Commands::Status => {
            let stats = coord.stats()?;
            if json {
                return print_json(&stats);
            }
            println!("dimension:   {}", stats.dimension);
            println!("vectors:     {}", stats.vector_count);
            println!("rows:        {}", stats.row_count);
            println!("tombstones:  {}", stats.tombstone_count);
            println!("documents:   {}", stats.source_count);
            println!("directories: {}", stats.directory_count);
            println!("index:       {}", stats.index_path.display());
            println!("metadata:    {}", stats.metadata_path.display());
            Ok(())
        }
    }
}

fn dispatch_dirs(coord: &ConsistencyCoordinator, command: DirsCommand, json: bool) -> Result<()> {
    match command {
        DirsCommand::List => {
            let dirs = coord.list_directories()?;
            if json {
                return print_json(&dirs);
            }
            if dirs.is_empty() {
                println!("No directories registered.");
            }
            for dir in dirs {
                let state = if dir.enabled { "enabled" } else { "disabled" };
                let updated = dir
                    .last_update
                    .map_or_else(|| "never".to_string(), |t| t.to_rfc3339());
                println!(
                    "{}  [{state}]  {} documents, updated {updated}",
                    dir.path, dir.doc_count
                );
            }
            Ok(())
        }
        DirsCommand::Add { path } => {
            let root = root_key(&path);
            let added = coord.add_directory(&root)?;
            if json {
                return print_json(&json!({ "path": root, "added": added }));
            }
            if added {
                println!("Registered {root}");
            } else {
                println!("{root} is already registered");
            }
            Ok(())
        }
        DirsCommand::Remove { path } => {
            let root = root_key(&path);
            let outcome = coord.remove_directory(&root)?;
            if json {
                return print_json(&outcome);
            }
            println!("Removed {root}; {} vector slots freed", outcome.freed_slots);
            if let Some(compaction) = outcome.compaction {
                println!("Compacted: {} vectors removed", compaction.removed_vectors);
            }
            Ok(())
        }
        DirsCommand::Enable { path } => set_enabled(coord, &path, true, json),
        DirsCommand::Disable { path } => set_enabled(coord, &path, false, json),
    }
}

fn set_enabled(coord: &ConsistencyCoordinator, path: &Path, enabled: bool, json: bool) -> Result<()> {
    let root = root_key(path);
    let current = coord
        .directory(&root)?
        .ok_or_else(|| anyhow!("{root} is not registered; run `dv dirs add {root}`"))?;
    coord.set_directory_status(&root, enabled, current.last_update, current.doc_count)?;
    if json {
        return print_json(&json!({ "path": root, "enabled": enabled }));
    }
    println!("{root} {}", if enabled { "enabled" } else { "disabled" });
    Ok(())
}

fn index_roots(
    coord: &ConsistencyCoordinator,
    roots: &[PathBuf],
) -> Result<Vec<(String, PipelineReport)>> {
    let parser = PlainTextParser::from_config(&coord.config().indexing);
    let embedder = HashEmbedder::new(coord.dimension());
    let batch_size = coord.config().indexing.batch_size;

    let mut reports = Vec::with_capacity(roots.len());
    for root in roots {
        let key = root_key(root);
        let files = parser
            .scan_directory(Path::new(&key))
            .with_context(|| format!("failed to scan {key}"))?;
        coord.add_directory(&key)?;

        let mut pipeline = IndexingPipeline::new(coord, batch_size);
        pipeline.index_files(&parser, &embedder, &files);
        let report = pipeline.finish();
        let enabled = coord.directory(&key)?.is_none_or(|d| d.enabled);
        coord.set_directory_status(
            &key,
            enabled,
            Some(Utc::now()),
            report.indexed_documents as u64,
        )?;
        info!(
            path = %key,
            documents = report.indexed_documents,
            failed = report.failed_documents(),
            "Directory indexed"
        );
        reports.push((key, report));
    }
    Ok(reports)
}

fn print_index_reports(reports: &[(String, PipelineReport)], json: bool) -> Result<()> {
    if json {
        let entries: Vec<_> = reports
            .iter()
            .map(|(path, report)| json!({ "path": path, "report": report }))
            .collect();
        return print_json(&entries);
    }
    for (path, report) in reports {
        println!(
            "{path}: {} documents, {} chunks indexed",
            report.indexed_documents, report.indexed_chunks
        );
        for rejected in &report.rejected {
            println!("  rejected {}: {}", rejected.source_id, rejected.reason);
        }
        for failed in &report.failed_files {
            println!("  failed {}: {}", failed.path.display(), failed.error);
        }
        for batch in &report.failed_batches {
            println!("  batch of {} failed: {}", batch.source_ids.len(), batch.error);
        }
    }
    Ok(())
}

fn print_audit(report: &ConsistencyReport) {
    println!("status:      {}", if report.ok { "ok" } else { "INCONSISTENT" });
    println!("vectors:     {}", report.vector_count);
    println!("slots:       {}", report.distinct_slot_count);
    println!("rows:        {}", report.row_count);
    println!("tombstones:  {}", report.tombstone_count);
    if let Some((min, max)) = report.slot_range {
        println!("slot range:  {min}..={max}");
    }
    for issue in &report.issues {
        println!("  - {issue}");
    }
}

fn print_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Snapshot file locations inside an export directory, named like the live files.
fn snapshot_paths(coord: &ConsistencyCoordinator, dir: &Path) -> (PathBuf, PathBuf) {
    let storage = &coord.config().storage;
    (dir.join(&storage.index_file), dir.join(&storage.metadata_file))
}

/// Registry key for a directory: its canonical path when it exists.
fn root_key(path: &Path) -> String {
    std::fs::canonicalize(path)
        .unwrap_or_else(|_| path.to_path_buf())
        .display()
        .to_string()
}

fn preview(text: &str, max_chars: usize) -> String {
    let flat: String = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= max_chars {
        flat
    } else {
        let cut: String = flat.chars().take(max_chars).collect();
        format!("{cut}...")
    }
}
