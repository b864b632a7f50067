mod output;

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use clap::{ArgAction, Parser, Subcommand};
use output::{
    GcOutput, InitOutput, MaterializeOutput, OutputWriter, PathOutput, PoolGcStats, ScanOutput,
    StatOutput, StatsOutput, StoreOutput, StoredObject, ValidateOutput, format_bytes,
};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::SystemTime;
use stow_core::{
    CasConfiguration, CasPool, ContentHash, ContentManifest, DownloadReporter, GarbageCollector,
    GcOptions, LiveSet, LocalFilePrimitives, Materializer, ObjectStore, ValidationOptions,
    Validator, WorkspaceStrategy, scan_installation,
};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use url::Url;

const EXIT_ERROR: u8 = 1;
const EXIT_FILES_FAILED: u8 = 2;

/// Stow - content-addressed object store and workspace materializer
#[derive(Parser)]
#[command(name = "stow")]
#[command(about = "Content-addressed object store and workspace materializer", long_about = None)]
#[command(version)]
struct Cli {
    /// JSON configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Primary pool directory (defaults to STOW_ROOT env var or ./stow-store)
    #[arg(short, long, global = true)]
    root: Option<PathBuf>,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the configured pools
    Init {
        /// Also initialize an installation pool at this directory
        #[arg(long)]
        installation: Option<PathBuf>,
    },

    /// Store files in a pool (use "-" to read stdin)
    Store {
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        #[arg(long, default_value = "primary", value_parser = parse_pool)]
        pool: CasPool,
    },

    /// Print the path of a stored object
    Path {
        hash: ContentHash,

        #[arg(long, default_value = "primary", value_parser = parse_pool)]
        pool: CasPool,
    },

    /// Show object metadata
    Stat {
        hash: ContentHash,

        #[arg(long, default_value = "primary", value_parser = parse_pool)]
        pool: CasPool,
    },

    /// Show pool statistics
    Stats {
        /// Also report how much the given manifests share
        #[arg(long)]
        manifest: Vec<PathBuf>,
    },

    /// Delete objects no manifest references
    Gc {
        /// Manifests whose content is live
        #[arg(long)]
        manifest: Vec<PathBuf>,

        /// Report what would be deleted without deleting
        #[arg(long)]
        dry_run: bool,

        /// Override the configured grace period (e.g. "1h", "7days")
        #[arg(long)]
        grace_period: Option<humantime::Duration>,
    },

    /// Verify stored objects against their hashes
    Validate {
        /// Report objects these manifests need but the pool lacks
        #[arg(long)]
        manifest: Vec<PathBuf>,

        /// Move corrupted objects aside
        #[arg(long)]
        quarantine: bool,
    },

    /// Describe an installation directory as a manifest
    Scan {
        dir: PathBuf,

        #[arg(long, default_value = "base")]
        id: String,

        #[arg(long, default_value = "0")]
        version: String,

        /// Write the manifest here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Build a workspace from a manifest
    Materialize {
        #[arg(long)]
        manifest: PathBuf,

        #[arg(long)]
        target: PathBuf,

        #[arg(long, default_value_t = WorkspaceStrategy::HybridSymlink)]
        strategy: WorkspaceStrategy,

        /// Directory base installation paths are resolved against
        #[arg(long)]
        base: Option<PathBuf>,

        /// Maximum number of files processed at once
        #[arg(long)]
        workers: Option<usize>,
    },
}

fn parse_pool(s: &str) -> std::result::Result<CasPool, String> {
    CasPool::parse(s).ok_or_else(|| format!("unknown pool '{}' (primary, installation)", s))
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let writer = OutputWriter::new(cli.json);
    match run(cli, &writer).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            writer.write_error(&e, EXIT_ERROR);
            ExitCode::from(EXIT_ERROR)
        }
    }
}

fn init_tracing(verbose: u8) {
    let default_level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(cli: Cli, writer: &OutputWriter) -> Result<u8> {
    let config = load_config(cli.config.as_deref(), cli.root)?;

    match cli.command {
        Commands::Init { installation } => cmd_init(config, installation, writer),
        Commands::Store { paths, pool } => cmd_store(config, paths, pool, writer).await,
        Commands::Path { hash, pool } => cmd_path(config, &hash, pool, writer),
        Commands::Stat { hash, pool } => cmd_stat(config, &hash, pool, writer),
        Commands::Stats { manifest } => cmd_stats(config, &manifest, writer),
        Commands::Gc {
            manifest,
            dry_run,
            grace_period,
        } => cmd_gc(config, &manifest, dry_run, grace_period, writer).await,
        Commands::Validate {
            manifest,
            quarantine,
        } => cmd_validate(config, &manifest, quarantine, writer).await,
        Commands::Scan {
            dir,
            id,
            version,
            output,
        } => cmd_scan(config, dir, id, version, output, writer).await,
        Commands::Materialize {
            manifest,
            target,
            strategy,
            base,
            workers,
        } => cmd_materialize(config, &manifest, target, strategy, base, workers, writer).await,
    }
}

/// Configuration file first, then `--root` > STOW_ROOT > ./stow-store for the primary pool.
fn load_config(path: Option<&Path>, root: Option<PathBuf>) -> Result<CasConfiguration> {
    let env_root = || std::env::var("STOW_ROOT").ok().map(PathBuf::from);

    match path {
        Some(path) => {
            let mut config = CasConfiguration::from_path(path)
                .with_context(|| format!("Failed to load configuration {}", path.display()))?;
            if let Some(root) = root {
                config.pools.primary = root;
            }
            Ok(config)
        }
        None => {
            let root = root
                .or_else(env_root)
                .unwrap_or_else(|| PathBuf::from("./stow-store"));
            Ok(CasConfiguration::new(root))
        }
    }
}

fn open_store(config: CasConfiguration) -> Result<ObjectStore> {
    let root = config.pools.primary.clone();
    ObjectStore::open(config)
        .with_context(|| format!("Failed to open store at {}", root.display()))
}

fn load_manifests(paths: &[PathBuf]) -> Result<Vec<ContentManifest>> {
    paths
        .iter()
        .map(|path| {
            ContentManifest::from_path(path)
                .with_context(|| format!("Failed to load manifest {}", path.display()))
        })
        .collect()
}

/// Cancel `token` on Ctrl-C.
fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted, cancelling");
            child.cancel();
        }
    });
    token
}

fn display_time(time: SystemTime) -> String {
    DateTime::<Local>::from(time)
        .format("%Y-%m-%d %H:%M:%S")
        .to_string()
}

fn cmd_init(
    mut config: CasConfiguration,
    installation: Option<PathBuf>,
    writer: &OutputWriter,
) -> Result<u8> {
    if let Some(installation) = installation {
        config.pools.installation = Some(installation);
    }
    let store = open_store(config)?;
    let config = store.config();

    let output = InitOutput {
        success: true,
        result_code: 0,
        root: config.pools.primary.clone(),
        installation_root: config.pools.installation.clone(),
        algorithm: config.algorithm.to_string(),
    };
    writer.write(&output, || {
        let mut text = format!("Initialized stow store at {}\n", output.root.display());
        if let Some(installation) = &output.installation_root {
            text.push_str(&format!("Installation pool: {}\n", installation.display()));
        }
        text.push_str(&format!("Algorithm: {}\n", output.algorithm));
        text
    })?;
    Ok(0)
}

async fn cmd_store(
    config: CasConfiguration,
    paths: Vec<PathBuf>,
    pool: CasPool,
    writer: &OutputWriter,
) -> Result<u8> {
    let store = open_store(config)?;
    let mut objects = Vec::with_capacity(paths.len());

    for path in paths {
        let (hash, source) = if path == Path::new("-") {
            if atty::is(atty::Stream::Stdin) {
                anyhow::bail!("Refusing to read object content from a terminal; pipe data into stdin");
            }
            let mut stdin = tokio::io::stdin();
            let hash = store
                .store_reader(&mut stdin, pool)
                .await
                .context("Failed to store stdin")?;
            (hash, "-".to_string())
        } else {
            let hash = store
                .store_file(&path, pool)
                .await
                .with_context(|| format!("Failed to store {}", path.display()))?;
            (hash, path.display().to_string())
        };

        objects.push(StoredObject {
            hash,
            source,
            path: store.object_path(&hash, pool)?,
        });
    }

    let output = StoreOutput {
        success: true,
        result_code: 0,
        pool,
        objects,
    };
    writer.write(&output, || {
        output
            .objects
            .iter()
            .map(|object| format!("{} {}\n", object.hash, object.source))
            .collect()
    })?;
    Ok(0)
}

fn cmd_path(
    config: CasConfiguration,
    hash: &ContentHash,
    pool: CasPool,
    writer: &OutputWriter,
) -> Result<u8> {
    let store = open_store(config)?;
    let path = store
        .get_path(hash, pool)
        .with_context(|| format!("Object not found in {} pool: {}", pool, hash))?;

    let output = PathOutput {
        success: true,
        result_code: 0,
        hash: *hash,
        pool,
        path,
    };
    writer.write(&output, || format!("{}\n", output.path.display()))?;
    Ok(0)
}

fn cmd_stat(
    config: CasConfiguration,
    hash: &ContentHash,
    pool: CasPool,
    writer: &OutputWriter,
) -> Result<u8> {
    let store = open_store(config)?;
    let object = store
        .object(hash, pool)?
        .with_context(|| format!("Object not found in {} pool: {}", pool, hash))?;

    let output = StatOutput {
        success: true,
        result_code: 0,
        path: store.object_path(hash, pool)?,
        created_at_human: display_time(object.created_at),
        last_accessed_at_human: display_time(object.last_accessed_at),
        object,
    };
    writer.write(&output, || {
        format!(
            "Hash: {}\nPool: {}\nSize: {} ({} bytes)\nCreated: {}\nLast accessed: {}\nPath: {}\n",
            output.object.hash,
            output.object.pool,
            format_bytes(output.object.size_bytes),
            output.object.size_bytes,
            output.created_at_human,
            output.last_accessed_at_human,
            output.path.display(),
        )
    })?;
    Ok(0)
}

fn cmd_stats(config: CasConfiguration, manifests: &[PathBuf], writer: &OutputWriter) -> Result<u8> {
    let store = open_store(config)?;
    let manifests = load_manifests(manifests)?;

    let mut pools = Vec::new();
    let mut references = Vec::new();
    for pool in CasPool::ALL.into_iter().filter(|pool| store.has_pool(*pool)) {
        pools.push(store.stats(pool)?);
        if !manifests.is_empty() {
            references.push(store.reference_stats(pool, &manifests)?);
        }
    }

    let output = StatsOutput {
        success: true,
        result_code: 0,
        pools,
        references,
    };
    writer.write(&output, || {
        let mut text = String::new();
        for stats in &output.pools {
            text.push_str(&format!(
                "{} pool: {} objects, {}\n",
                stats.pool,
                stats.object_count,
                format_bytes(stats.total_size)
            ));
            text.push_str(&format!(
                "  hits: {}, misses: {}, hit rate: {:.1}%, deduplicated: {}\n",
                stats.hits,
                stats.misses,
                stats.hit_rate * 100.0,
                format_bytes(stats.space_saved)
            ));
        }
        for stats in &output.references {
            text.push_str(&format!(
                "{} pool references: {} ({} logical, {} physical, {} saved)\n",
                stats.pool,
                stats.references,
                format_bytes(stats.logical_size),
                format_bytes(stats.physical_size),
                format_bytes(stats.space_saved)
            ));
        }
        text
    })?;
    Ok(0)
}

async fn cmd_gc(
    config: CasConfiguration,
    manifests: &[PathBuf],
    dry_run: bool,
    grace_period: Option<humantime::Duration>,
    writer: &OutputWriter,
) -> Result<u8> {
    let store = open_store(config)?;
    let live = LiveSet::from_manifests(&load_manifests(manifests)?);
    if live.is_empty() {
        tracing::warn!("no live content given, every object past the grace period is garbage");
    }

    let mut collector = GarbageCollector::new(store.clone());
    if let Some(grace_period) = grace_period {
        collector = collector.with_grace_period(grace_period.into())?;
    }

    let cancel = cancel_on_ctrl_c();
    let mut pools = Vec::new();
    for pool in CasPool::ALL.into_iter().filter(|pool| store.has_pool(*pool)) {
        let stats = collector
            .collect(pool, &live, GcOptions { dry_run }, &cancel)
            .await
            .with_context(|| format!("Failed to collect garbage in {} pool", pool))?;
        pools.push(PoolGcStats { pool, stats });
    }

    let output = GcOutput {
        success: true,
        result_code: 0,
        dry_run,
        live_objects: live.len(),
        pools,
    };
    writer.write(&output, || {
        let mut text = String::new();
        if dry_run {
            text.push_str("Dry run - no objects deleted\n");
        }
        let verb = if dry_run { "Would delete" } else { "Deleted" };
        for pool in &output.pools {
            text.push_str(&format!(
                "{} pool: {} {} of {} objects, freeing {}\n",
                pool.pool,
                verb,
                pool.stats.objects_deleted,
                pool.stats.objects_scanned,
                format_bytes(pool.stats.bytes_freed)
            ));
            text.push_str(&format!(
                "  retained: {} live, {} within grace period; {} temp files removed\n",
                pool.stats.retained_live, pool.stats.retained_young, pool.stats.temp_files_removed
            ));
            if pool.stats.cancelled {
                text.push_str("  cancelled before completion\n");
            }
        }
        text
    })?;
    Ok(0)
}

async fn cmd_validate(
    config: CasConfiguration,
    manifests: &[PathBuf],
    quarantine: bool,
    writer: &OutputWriter,
) -> Result<u8> {
    let store = open_store(config)?;
    let expected = if manifests.is_empty() {
        None
    } else {
        Some(LiveSet::from_manifests(&load_manifests(manifests)?))
    };
    let options = ValidationOptions {
        expected,
        quarantine_corrupted: quarantine,
    };

    let validator = Validator::new(store.clone());
    let mut pools = Vec::new();
    for pool in CasPool::ALL.into_iter().filter(|pool| store.has_pool(*pool)) {
        pools.push(
            validator
                .validate(pool, &options)
                .await
                .with_context(|| format!("Failed to validate {} pool", pool))?,
        );
    }

    let valid = pools.iter().all(|result| result.is_valid());
    let result_code = if valid { 0 } else { EXIT_FILES_FAILED };
    let output = ValidateOutput {
        success: valid,
        result_code,
        pools,
    };
    writer.write(&output, || {
        let mut text = String::new();
        for result in &output.pools {
            text.push_str(&format!(
                "{} pool: {} objects checked, {} issues{}\n",
                result.pool,
                result.objects_checked,
                result.issues.len(),
                if result.quarantined > 0 {
                    format!(", {} quarantined", result.quarantined)
                } else {
                    String::new()
                }
            ));
            for issue in &result.issues {
                let subject = issue
                    .hash
                    .map(|hash| hash.to_string())
                    .or_else(|| issue.path.as_ref().map(|path| path.display().to_string()))
                    .unwrap_or_default();
                text.push_str(&format!("  {} {}: {}\n", issue.kind, subject, issue.message));
            }
        }
        text
    })?;
    Ok(result_code)
}

async fn cmd_scan(
    config: CasConfiguration,
    dir: PathBuf,
    id: String,
    version: String,
    output_path: Option<PathBuf>,
    writer: &OutputWriter,
) -> Result<u8> {
    // Pools living inside the scanned tree are not part of the installation.
    let exclude: Vec<PathBuf> = [Some(config.pools.primary), config.pools.installation]
        .into_iter()
        .flatten()
        .filter(|pool| pool.starts_with(&dir))
        .collect();

    let scan_root = dir.clone();
    let manifest = tokio::task::spawn_blocking(move || {
        let exclude: Vec<&Path> = exclude.iter().map(PathBuf::as_path).collect();
        scan_installation(&scan_root, id, version, &exclude)
    })
    .await?
    .with_context(|| format!("Failed to scan {}", dir.display()))?;

    let json = manifest.to_json()?;
    if let Some(path) = &output_path {
        std::fs::write(path, &json)
            .with_context(|| format!("Failed to write manifest {}", path.display()))?;
    } else if !writer.is_json() {
        println!("{}", json);
        return Ok(0);
    }

    let output = ScanOutput {
        success: true,
        result_code: 0,
        root: dir,
        files: manifest.len(),
        total_size: manifest.files().iter().filter_map(|file| file.size).sum(),
        output: output_path,
    };
    writer.write(&output, || {
        format!(
            "Scanned {} files ({}) into {}\n",
            output.files,
            format_bytes(output.total_size),
            output
                .output
                .as_ref()
                .map(|path| path.display().to_string())
                .unwrap_or_default()
        )
    })?;
    Ok(0)
}

/// Logs download progress.
struct LogReporter;

impl DownloadReporter for LogReporter {
    fn on_download_start(&self, url: &Url, total_bytes: Option<u64>) {
        match total_bytes {
            Some(total) => tracing::info!("downloading {} ({})", url, format_bytes(total)),
            None => tracing::info!("downloading {}", url),
        }
    }

    fn on_download_complete(&self, url: &Url) {
        tracing::info!("downloaded {}", url);
    }
}

async fn cmd_materialize(
    config: CasConfiguration,
    manifest_path: &Path,
    target: PathBuf,
    strategy: WorkspaceStrategy,
    base: Option<PathBuf>,
    workers: Option<usize>,
    writer: &OutputWriter,
) -> Result<u8> {
    let manifest = ContentManifest::from_path(manifest_path)
        .with_context(|| format!("Failed to load manifest {}", manifest_path.display()))?;
    let store = open_store(config)?;

    let mut materializer = Materializer::new(store, Arc::new(LocalFilePrimitives::new()))
        .with_download_reporter(Arc::new(LogReporter));
    if let Some(base) = base {
        materializer = materializer.with_base_path(base);
    }
    if let Some(workers) = workers {
        materializer = materializer.with_max_workers(workers);
    }

    let cancel = cancel_on_ctrl_c();
    let started = std::time::Instant::now();
    let result = materializer
        .materialize(&manifest, &target, strategy, &cancel)
        .await
        .with_context(|| format!("Failed to materialize into {}", target.display()))?;
    tracing::info!(
        "materialized {} in {}",
        manifest.id(),
        humantime::format_duration(std::time::Duration::from_millis(
            started.elapsed().as_millis() as u64
        ))
    );

    let result_code = if result.is_success() {
        0
    } else {
        EXIT_FILES_FAILED
    };
    let output = MaterializeOutput::new(target, strategy, result, result_code);
    writer.write(&output, || {
        let mut text = String::new();
        for outcome in &output.outcomes {
            if let Some(error) = &outcome.error {
                text.push_str(&format!(
                    "failed   {} ({:?}): {}\n",
                    outcome.relative_path.display(),
                    outcome.stage,
                    error
                ));
            } else if outcome.is_degraded() {
                text.push_str(&format!(
                    "degraded {} ({} instead of {})\n",
                    outcome.relative_path.display(),
                    outcome
                        .action_taken
                        .map(|action| action.to_string())
                        .unwrap_or_default(),
                    outcome
                        .preferred
                        .map(|action| action.to_string())
                        .unwrap_or_default(),
                ));
            }
        }
        text.push_str(&format!(
            "Materialized {} into {} ({}): {} placed, {} degraded, {} failed\n",
            manifest.id(),
            output.target.display(),
            output.strategy,
            output.placed,
            output.degraded,
            output.failed
        ));
        if output.cancelled {
            text.push_str("Cancelled before completion\n");
        }
        text
    })?;
    Ok(result_code)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_store_accepts_stdin_marker() {
        let cli = Cli::try_parse_from(["stow", "store", "-", "--pool", "installation"]).unwrap();
        match cli.command {
            Commands::Store { paths, pool } => {
                assert_eq!(paths, vec![PathBuf::from("-")]);
                assert_eq!(pool, CasPool::Installation);
            }
            _ => panic!("expected the store command"),
        }
    }

    #[tokio::test]
    async fn test_stdin_handle_is_available() {
        // Creating the handle does not read from it.
        let _stdin: tokio::io::Stdin = tokio::io::stdin();
    }
}
