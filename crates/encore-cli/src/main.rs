//! # encore
//!
//! Command-line front end over the retrieval core: index a corpus with
//! checkpointing, resume an interrupted run, query a corpus, and push
//! messages through the turn queue against the mock provider.

#![deny(unsafe_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use encore_core::ApiKey;
use encore_core::format::format_user;
use encore_embeddings::{
    CheckpointStore, EmbeddingError, EmbeddingService, EmbeddingTaskManager, HashEmbeddingService,
    LargeValueStore, MemoryLargeStore, MemorySmallStore, NoProgress, ProgressEvent, SearchParams,
    SmallValueStore, SqliteLargeStore, SqliteSmallStore, TaskOptions, TaskReport, VectorStore,
};
use encore_resilience::{BudgetDefaults, BudgetManager};
use encore_runtime::{
    MockProvider, ProviderConfig, ProviderTurnHandler, TurnOptions, TurnQueue, TurnQueueConfig,
};
use encore_settings::{EncoreSettings, load_settings_from_path, settings_path};
use parking_lot::Mutex;
use tracing::{info, warn};

/// Music-history analyzer core.
#[derive(Parser, Debug)]
#[command(name = "encore", version, about = "Index, search, and chat over listening history")]
struct Cli {
    /// Settings file (default: `~/.encore/settings.json`).
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    /// `SQLite` file for checkpoints (overrides `storage.largeDbPath`).
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Emit JSON log lines.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Embed every line of a file. Ctrl-C cancels and keeps the checkpoint.
    Index {
        /// Corpus file, one chunk per line.
        corpus: PathBuf,
        /// Items per batch (overrides `embedding.batchSize`).
        #[arg(long)]
        batch_size: Option<usize>,
    },
    /// Continue from the stored checkpoint.
    Resume,
    /// Print the stored checkpoint metadata.
    Status,
    /// Drop the stored checkpoint.
    Discard,
    /// Embed a corpus and search it.
    Query {
        /// Corpus file, one chunk per line.
        corpus: PathBuf,
        /// Query text.
        text: String,
        /// Maximum hits (overrides `search.defaultLimit`).
        #[arg(long)]
        limit: Option<usize>,
        /// Minimum similarity (overrides `search.defaultThreshold`).
        #[arg(long, allow_negative_numbers = true)]
        threshold: Option<f32>,
    },
    /// Send messages through the turn queue in order.
    Ask {
        /// Messages, one turn each.
        #[arg(required = true)]
        messages: Vec<String>,
        /// Per-turn budget in ms.
        #[arg(long)]
        budget_ms: Option<u64>,
    },
}

fn load(cli: &Cli) -> Result<EncoreSettings> {
    let path = cli.settings.clone().unwrap_or_else(settings_path);
    let settings = load_settings_from_path(&path)
        .with_context(|| format!("Failed to load settings from {}", path.display()))?;
    Ok(settings)
}

fn init_logging(settings: &EncoreSettings, json: bool) {
    if json || settings.logging.json {
        encore_core::logging::init_json_subscriber(&settings.logging.level);
    } else {
        encore_core::logging::init_subscriber(&settings.logging.level);
    }
}

fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    Ok(())
}

/// Checkpoint stores: `SQLite` when a database path is configured, memory
/// otherwise.
fn checkpoint_store(cli: &Cli, settings: &EncoreSettings) -> Result<CheckpointStore> {
    let quota = settings.storage.small_quota_bytes;
    let db = cli
        .db
        .clone()
        .or_else(|| settings.storage.large_db_path.as_ref().map(PathBuf::from));

    let (small, large): (Arc<dyn SmallValueStore>, Arc<dyn LargeValueStore>) = match db {
        Some(path) => {
            ensure_parent_dir(&path)?;
            let small = SqliteSmallStore::open(&path, quota)
                .with_context(|| format!("Failed to open {}", path.display()))?;
            let large = SqliteLargeStore::open(&path)
                .with_context(|| format!("Failed to open {}", path.display()))?;
            info!(path = %path.display(), "using sqlite checkpoint store");
            (Arc::new(small), Arc::new(large))
        }
        None => {
            warn!("no database configured; checkpoints will not survive this process");
            (Arc::new(MemorySmallStore::new(quota)), Arc::new(MemoryLargeStore::new()))
        }
    };
    Ok(CheckpointStore::new(
        small,
        large,
        settings.embedding.inline_threshold_bytes,
    ))
}

fn task_manager(
    settings: &EncoreSettings,
    embedder: Arc<HashEmbeddingService>,
    checkpoints: CheckpointStore,
) -> Arc<EmbeddingTaskManager> {
    let manager = EmbeddingTaskManager::new(embedder, Arc::new(Mutex::new(VectorStore::new())), checkpoints)
        .with_budgets(BudgetManager::new(), &BudgetDefaults::from_settings(&settings.budgets));
    Arc::new(manager)
}

fn read_corpus(path: &Path) -> Result<Vec<String>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read corpus: {}", path.display()))?;
    Ok(raw.lines().map(str::to_owned).collect())
}

fn print_progress(event: &ProgressEvent) {
    if let Some(milestone) = event.milestones.last() {
        eprintln!("{milestone:>3}%  {}/{}", event.processed, event.total);
    }
}

/// Cancel the task on Ctrl-C.
fn cancel_on_interrupt(manager: &Arc<EmbeddingTaskManager>) {
    let manager = Arc::clone(manager);
    drop(tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("cancelling; the checkpoint is kept for `encore resume`");
            manager.cancel();
        }
    }));
}

fn report(result: std::result::Result<TaskReport, EmbeddingError>) -> Result<()> {
    match result {
        Ok(report) => {
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Err(EmbeddingError::Cancelled) => {
            eprintln!("cancelled");
            Ok(())
        }
        Err(e) => {
            let message = format_user(&e.into());
            eprintln!("{} {}: {}", message.icon, message.headline, message.body);
            if let Some(hint) = message.hint {
                eprintln!("   {hint}");
            }
            bail!("embedding task failed")
        }
    }
}

async fn index(cli: &Cli, settings: &EncoreSettings, corpus: &Path, batch_size: Option<usize>) -> Result<()> {
    let embedder = Arc::new(HashEmbeddingService::new(settings.embedding.dimensions));
    let manager = task_manager(settings, embedder, checkpoint_store(cli, settings)?);
    let mut options = TaskOptions::from_settings(settings);
    if let Some(n) = batch_size {
        options.batch_size = n.max(1);
    }

    manager.ensure_ready(&NoProgress).await?;
    cancel_on_interrupt(&manager);
    report(manager.start(read_corpus(corpus)?, &options, &print_progress).await)
}

async fn resume(cli: &Cli, settings: &EncoreSettings) -> Result<()> {
    let embedder = Arc::new(HashEmbeddingService::new(settings.embedding.dimensions));
    let manager = task_manager(settings, embedder, checkpoint_store(cli, settings)?);
    let options = TaskOptions::from_settings(settings);

    manager.ensure_ready(&NoProgress).await?;
    cancel_on_interrupt(&manager);
    report(manager.resume(&options, &print_progress).await)
}

async fn query(
    settings: &EncoreSettings,
    corpus: &Path,
    text: &str,
    limit: Option<usize>,
    threshold: Option<f32>,
) -> Result<()> {
    let embedder = Arc::new(HashEmbeddingService::new(settings.embedding.dimensions));
    let checkpoints = CheckpointStore::new(
        Arc::new(MemorySmallStore::new(settings.storage.small_quota_bytes)),
        Arc::new(MemoryLargeStore::new()),
        settings.embedding.inline_threshold_bytes,
    );
    let manager = task_manager(settings, Arc::clone(&embedder), checkpoints);
    let _ = manager
        .start(read_corpus(corpus)?, &TaskOptions::from_settings(settings), &NoProgress)
        .await?;

    let mut params = SearchParams::from_settings(&settings.search);
    params.limit = limit.unwrap_or(params.limit);
    params.threshold = threshold.unwrap_or(params.threshold);

    let vector = embedder.embed_single(text).await?;
    let hits = manager.store().lock().search_with(&vector, &params);
    println!("{}", serde_json::to_string_pretty(&hits)?);
    Ok(())
}

async fn ask(settings: &EncoreSettings, messages: Vec<String>, budget_ms: Option<u64>) -> Result<()> {
    let provider = Arc::new(MockProvider::new().with_latency(5, 50));
    let handler = ProviderTurnHandler::new(provider, ApiKey::new("mock-key"), ProviderConfig::default())
        .with_system_prompt("You answer questions about the user's listening history.");
    let queue = TurnQueue::new(
        Arc::new(handler),
        BudgetManager::new(),
        TurnQueueConfig::from_settings(settings),
    );

    let options = TurnOptions {
        budget_ms,
        ..TurnOptions::default()
    };
    let handles: Vec<_> = messages
        .into_iter()
        .map(|m| queue.push(m, options.clone()))
        .collect();

    let mut failed = 0;
    for handle in handles {
        match handle.await {
            Ok(response) => println!("{}", response.content().unwrap_or_default()),
            Err(err) => {
                failed += 1;
                let message = format_user(&err);
                eprintln!("{} {}: {}", message.icon, message.headline, message.body);
            }
        }
    }
    eprintln!("{}", serde_json::to_string(&queue.metrics())?);
    if failed > 0 {
        bail!("{failed} turn(s) failed");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = load(&cli)?;
    init_logging(&settings, cli.json_logs);

    match &cli.command {
        Command::Index { corpus, batch_size } => index(&cli, &settings, corpus, *batch_size).await,
        Command::Resume => resume(&cli, &settings).await,
        Command::Status => {
            let checkpoints = checkpoint_store(&cli, &settings)?;
            match checkpoints.peek()? {
                Some(meta) => println!("{}", serde_json::to_string_pretty(&meta)?),
                None => println!("no checkpoint"),
            }
            Ok(())
        }
        Command::Discard => {
            let checkpoints = checkpoint_store(&cli, &settings)?;
            checkpoints.clear().await?;
            println!("checkpoint discarded");
            Ok(())
        }
        Command::Query {
            corpus,
            text,
            limit,
            threshold,
        } => query(&settings, corpus, text, *limit, *threshold).await,
        Command::Ask { messages, budget_ms } => ask(&settings, messages.clone(), *budget_ms).await,
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_index_with_globals() {
        let cli = Cli::try_parse_from(["encore", "index", "history.txt", "--batch-size", "8", "--db", "/tmp/e.db"]).unwrap();
        assert_eq!(cli.db.as_deref(), Some(Path::new("/tmp/e.db")));
        match cli.command {
            Command::Index { corpus, batch_size } => {
                assert_eq!(corpus, PathBuf::from("history.txt"));
                assert_eq!(batch_size, Some(8));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn ask_requires_a_message() {
        assert!(Cli::try_parse_from(["encore", "ask"]).is_err());
    }

    #[test]
    fn corpus_keeps_blank_lines_as_items() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("corpus.txt");
        std::fs::write(&path, "first\n\nthird\n").unwrap();
        assert_eq!(read_corpus(&path).unwrap(), vec!["first", "", "third"]);
    }

    #[tokio::test]
    async fn sqlite_checkpoints_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("state").join("encore.db");
        let cli = Cli::try_parse_from(["encore", "--db", db.to_str().unwrap(), "status"]).unwrap();
        let settings = EncoreSettings::default();

        let store = checkpoint_store(&cli, &settings).unwrap();
        let meta = encore_embeddings::CheckpointMeta::new(
            encore_core::TaskId::new(),
            2,
            1,
            vec![0],
        );
        let _ = store.save(meta, &["a".to_owned(), "b".to_owned()]).await.unwrap();

        let reopened = checkpoint_store(&cli, &settings).unwrap();
        let peeked = reopened.peek().unwrap().unwrap();
        assert_eq!(peeked.processed_count, 1);
        assert_eq!(peeked.total_count, 2);
    }
}
