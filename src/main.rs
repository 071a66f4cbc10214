mod session;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use seekr_config::Config;
use seekr_index::branch::{parse_head, resolve_head_path};
use seekr_index::{
    BranchWatcher, BranchWatcherConfig, FileEvent, FileWatcher, IndexError, IndexState, IndexStatus,
    WatcherConfig,
};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::session::Session;

#[derive(Parser)]
#[command(name = "seekr", version, about = "Semantic and keyword code search over a live workspace")]
struct Cli {
    /// Workspace root
    #[arg(short = 'C', long, global = true, default_value = ".")]
    workspace: PathBuf,

    /// Extra configuration file, layered above the user and workspace files
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Keep vectors and fingerprints in memory instead of Qdrant and disk
    #[arg(long, global = true)]
    memory: bool,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Index changed files (everything on the first run)
    Index {
        /// Drop the existing index and rebuild it
        #[arg(long)]
        force: bool,
    },
    /// Search the index
    Search {
        query: String,
        /// Only return results under this workspace-relative directory
        #[arg(long)]
        dir: Option<String>,
        /// Print results as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show index and branch state
    Status,
    /// Index, then follow branch and file changes until Ctrl-C
    Watch,
    /// Print the effective configuration
    Config,
}

fn init_logging(verbose: bool) {
    let default = if verbose {
        "seekr=debug,seekr_index=debug"
    } else {
        "seekr=info,seekr_index=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = Config::load(Some(cli.workspace.as_path()), cli.config.as_deref())
        .context("Failed to load configuration")?;

    match cli.command {
        Commands::Index { force } => cmd_index(&cli.workspace, config, cli.memory, force).await,
        Commands::Search { query, dir, json } => {
            cmd_search(&cli.workspace, config, cli.memory, &query, dir.as_deref(), json).await
        }
        Commands::Status => cmd_status(&cli.workspace, config, cli.memory).await,
        Commands::Watch => cmd_watch(&cli.workspace, config, cli.memory).await,
        Commands::Config => {
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
    }
}

/// Log progress until the orchestrator leaves the indexing states.
fn spawn_progress(mut rx: watch::Receiver<IndexStatus>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut last = 0;
        while rx.changed().await.is_ok() {
            let status = rx.borrow_and_update().clone();
            if status.state == IndexState::Indexing && status.processed != last {
                last = status.processed;
                info!("{}/{} files", status.processed, status.total);
            }
            if matches!(status.state, IndexState::Indexed | IndexState::Error | IndexState::Standby) {
                break;
            }
        }
    })
}

async fn run_index(session: &Session, force: bool) -> Result<()> {
    let progress = spawn_progress(session.orchestrator.subscribe());
    let result = if force {
        session.orchestrator.force_reindex().await
    } else {
        session.orchestrator.start_indexing().await
    };
    progress.abort();

    let stats = result.context("Indexing failed")?;
    println!(
        "Indexed {} files: {} changed, {} deleted, {} skipped, {} segments in {}ms",
        stats.files_scanned,
        stats.files_changed,
        stats.files_deleted,
        stats.files_skipped,
        stats.segments_upserted,
        stats.duration_ms
    );
    if stats.batches_failed > 0 {
        println!(
            "{} batches failed to embed and will be retried on the next run",
            stats.batches_failed
        );
    }
    Ok(())
}

async fn cmd_index(root: &Path, config: Config, memory: bool, force: bool) -> Result<()> {
    let session = Session::open(root, config, memory).await?;
    let result = run_index(&session, force).await;
    session.orchestrator.dispose().await;
    result
}

async fn cmd_search(
    root: &Path,
    config: Config,
    memory: bool,
    query: &str,
    dir: Option<&str>,
    json: bool,
) -> Result<()> {
    let session = Session::open(root, config, memory).await?;
    // A fresh in-memory store has nothing to search yet; an on-disk index is
    // brought up to date first.
    run_index(&session, false).await?;

    let results = match session.search.search(query, dir, Some(&session.root)).await {
        Ok(results) => results,
        Err(IndexError::SearchUnavailable { state }) => {
            anyhow::bail!("Search is unavailable: the index is {}", state)
        }
        Err(e) => return Err(e).context("Search failed"),
    };
    session.orchestrator.dispose().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&results)?);
        return Ok(());
    }
    if results.is_empty() {
        println!("No matches for '{}'", query);
        return Ok(());
    }
    for result in &results {
        let name = result.identifier.as_deref().unwrap_or("");
        println!(
            "{}:{}-{} {} {} (score {:.3})",
            result.file_path, result.start_line, result.end_line, result.kind, name, result.score
        );
    }
    Ok(())
}

async fn cmd_status(root: &Path, config: Config, memory: bool) -> Result<()> {
    let root = root
        .canonicalize()
        .with_context(|| format!("Workspace {} does not exist", root.display()))?;
    let store = session::build_store(&config, &root, memory)?;
    let fingerprints = session::open_fingerprints(&config, &root, memory).await?;

    println!("Workspace:    {}", root.display());
    println!("Collection:   {}", store.collection_name());
    match store.collection_exists().await {
        Ok(true) => {
            let complete = store.has_indexed_data().await.unwrap_or(false);
            println!(
                "Index:        {}",
                if complete { "complete" } else { "incomplete" }
            );
        }
        Ok(false) => println!("Index:        not created"),
        Err(e) => println!("Index:        unreachable ({})", e),
    }
    println!("Fingerprints: {}", fingerprints.len().await);

    let branch = resolve_head_path(&root)
        .and_then(|head| std::fs::read_to_string(head).ok())
        .and_then(|contents| parse_head(&contents));
    println!("Branch:       {}", branch.as_deref().unwrap_or("(none)"));
    fingerprints.dispose().await;
    Ok(())
}

async fn cmd_watch(root: &Path, config: Config, memory: bool) -> Result<()> {
    let session = Session::open(root, config, memory).await?;
    if let Err(e) = run_index(&session, false).await {
        warn!("Initial indexing failed: {:#}", e);
    }

    let branch = BranchWatcher::new(
        &session.root,
        BranchWatcherConfig {
            enabled: session.config.branch.enabled,
            debounce: Duration::from_millis(session.config.branch.debounce_ms),
        },
        session.orchestrator.clone(),
    );
    branch.initialize().await.context("Failed to watch git HEAD")?;

    let mut files = FileWatcher::new(
        session.root.clone(),
        WatcherConfig {
            debounce: Duration::from_millis(session.config.watcher.debounce_ms),
            extensions: session.config.index.extensions.clone(),
        },
    );
    let mut events = if session.config.watcher.enabled {
        Some(files.start().context("Failed to watch workspace")?)
    } else {
        None
    };

    println!("Watching {} (Ctrl-C to stop)", session.root.display());
    let orchestrator = Arc::clone(&session.orchestrator);
    loop {
        let next = async {
            match events.as_mut() {
                Some(rx) => rx.recv().await,
                None => std::future::pending::<Option<Vec<FileEvent>>>().await,
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            batch = next => {
                let Some(batch) = batch else { break };
                if let Err(e) = orchestrator.apply_file_events(&batch).await {
                    warn!("Failed to apply {} file changes: {}", batch.len(), e);
                }
            }
        }
    }

    info!("Shutting down");
    files.stop();
    branch.dispose().await;
    orchestrator.dispose().await;
    Ok(())
}
