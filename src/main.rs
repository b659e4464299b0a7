use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use semindex::chunker::{ChunkKind, ChunkerRegistry};
use semindex::config::Config;
use semindex::db::{LexicalSearcher, SearchOptions, SearchResult, SqliteStorage, Storage};
use semindex::indexer::{IndexError, IndexManager, ProgressEvent, UploadProgressEvent};

#[derive(Parser, Debug)]
#[command(name = "semindex")]
#[command(about = "Build and search a semantic index of a source tree")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// JSON configuration file
    #[arg(long, short = 'c', default_value = "semindex.json", global = true)]
    config: PathBuf,

    /// Database path (overrides the configuration)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Hide progress bars
    #[arg(long, short = 'q', global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Index a directory, skipping files that are unchanged since the last run
    Index(IndexArgs),

    /// Re-index changed files and drop deleted ones
    Update(FilterArgs),

    /// Show index statistics
    Status,

    /// Search the index
    Search(SearchArgs),
}

#[derive(Args, Debug)]
struct FilterArgs {
    /// Root directory
    root: PathBuf,

    /// Only index files matching this glob (repeatable)
    #[arg(long = "include")]
    includes: Vec<String>,

    /// Skip files and directories matching this glob (repeatable)
    #[arg(long = "exclude")]
    excludes: Vec<String>,

    /// Skip common test files and directories
    #[arg(long)]
    exclude_tests: bool,

    /// Tag every chunk with this domain
    #[arg(long)]
    domain: Option<String>,
}

#[derive(Args, Debug)]
struct IndexArgs {
    #[command(flatten)]
    filters: FilterArgs,

    /// Clear the index and re-process every file
    #[arg(long)]
    force: bool,

    /// Chunks per embedding call across files (0 embeds per file)
    #[arg(long)]
    embed_batch_size: Option<usize>,

    /// Chunks per storage write (0 writes each commit at once)
    #[arg(long)]
    batch_size: Option<usize>,

    /// Concurrent storage writes
    #[arg(long)]
    parallel: Option<usize>,
}

#[derive(Args, Debug)]
struct SearchArgs {
    query: String,

    /// Number of results (defaults to the configured search_top_k)
    #[arg(long, short = 'k')]
    top_k: Option<usize>,

    /// Keyword search instead of vector similarity
    #[arg(long)]
    lexical: bool,

    /// Minimum score
    #[arg(long)]
    threshold: Option<f64>,

    /// function, method, struct, interface or file
    #[arg(long)]
    kind: Option<ChunkKind>,

    #[arg(long)]
    language: Option<String>,

    #[arg(long)]
    path_prefix: Option<String>,
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn progress_bar(quiet: bool) -> ProgressBar {
    if quiet {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(0);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("  {bar:40.cyan/blue} {pos}/{len} files {msg}")
            .expect("valid template")
            .progress_chars("█▓░"),
    );
    pb
}

/// Cancels `token` on Ctrl-C. The run stops after the file or batch in flight.
fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("failed to listen for Ctrl-C: {e}");
            return;
        }
        warn!("Interrupted, finishing the current unit of work");
        token.cancel();
    });
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("failed to encode output")?
    );
    Ok(())
}

fn print_results(results: &[SearchResult]) {
    if results.is_empty() {
        println!("No results.");
        return;
    }
    for (i, result) in results.iter().enumerate() {
        let chunk = &result.chunk;
        println!(
            "{}. {} [{}] {}:{}-{} (score {:.3})",
            i + 1,
            chunk.name,
            chunk.kind,
            chunk.file_path,
            chunk.start_line,
            chunk.end_line,
            result.score
        );
        println!("   {}", chunk.preview());
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let config = Config::load(&cli.config)?;
    config.validate()?;
    let db_path = cli
        .db
        .clone()
        .unwrap_or_else(|| PathBuf::from(&config.db_path));

    let embedder = config.model.build_embedder()?;
    let storage = Arc::new(
        SqliteStorage::open(&db_path, embedder.dimensions())
            .with_context(|| format!("failed to open database: {}", db_path.display()))?,
    );
    let registry = ChunkerRegistry::with_defaults(&config.chunking)
        .context("failed to initialise chunkers")?;

    let token = CancellationToken::new();
    let manager = IndexManager::new(storage.clone(), Arc::clone(&embedder), registry)
        .with_cancellation(token.clone());

    match cli.command {
        Command::Index(args) => {
            let mut opts = config.indexing.index_options(args.force);
            let filters = args.filters;
            opts.includes.extend(filters.includes);
            opts.excludes.extend(filters.excludes);
            opts.exclude_tests |= filters.exclude_tests;
            if filters.domain.is_some() {
                opts.domain = filters.domain;
            }
            if let Some(n) = args.embed_batch_size {
                opts.embed_batch_size = n;
            }
            if let Some(n) = args.batch_size {
                opts.batch_size = n;
            }
            if let Some(n) = args.parallel {
                opts.parallel = n;
            }

            let pb = progress_bar(cli.quiet || cli.json);
            let files_pb = pb.clone();
            opts.on_progress = Some(Arc::new(move |e: &ProgressEvent| {
                files_pb.set_length(e.total as u64);
                files_pb.set_position(e.current as u64);
                files_pb.set_message(format!("{} chunks", e.chunks_total));
            }));
            let batches_pb = pb.clone();
            opts.on_upload_progress = Some(Arc::new(move |e: &UploadProgressEvent| {
                batches_pb.set_message(format!(
                    "batch {}/{} ({} chunks, eta {}s)",
                    e.current,
                    e.total,
                    e.chunks_uploaded,
                    e.eta.as_secs()
                ));
            }));

            cancel_on_ctrl_c(token);
            let outcome = manager.index(&filters.root, &opts).await;
            pb.finish_and_clear();
            let result = match outcome {
                Err(IndexError::Cancelled) => {
                    bail!("indexing cancelled; run again to resume")
                }
                other => other.context("indexing failed")?,
            };

            if cli.json {
                print_json(&result)?;
            } else {
                println!("Files processed: {}", result.files_processed);
                println!("Files unchanged: {}", result.files_unchanged);
                println!("Files failed:    {}", result.files_skipped);
                println!("Chunks created:  {}", result.chunks_created);
                for error in &result.errors {
                    println!("  {error}");
                }
            }
        }
        Command::Update(filters) => {
            let mut opts = config.indexing.update_options();
            opts.includes.extend(filters.includes);
            opts.excludes.extend(filters.excludes);
            opts.exclude_tests |= filters.exclude_tests;
            if filters.domain.is_some() {
                opts.domain = filters.domain;
            }

            cancel_on_ctrl_c(token);
            let result = match manager.update(&filters.root, &opts).await {
                Err(IndexError::Cancelled) => bail!("update cancelled; run again to resume"),
                other => other.context("update failed")?,
            };

            if cli.json {
                print_json(&result)?;
            } else {
                println!("Files updated:  {}", result.files_updated);
                println!("Files removed:  {}", result.files_removed);
                println!("Chunks created: {}", result.chunks_created);
                println!("Chunks removed: {}", result.chunks_removed);
                for error in &result.errors {
                    println!("  {error}");
                }
            }
        }
        Command::Status => {
            let stats = manager.status().await.context("failed to read status")?;
            if cli.json {
                print_json(&stats)?;
            } else {
                println!("Files indexed: {}", stats.files_indexed);
                println!("Chunks:        {}", stats.chunks_total);
                println!(
                    "Model:         {}",
                    stats.embedding_model.as_deref().unwrap_or("-")
                );
                match stats.last_updated {
                    Some(at) => println!("Last updated:  {}", at.to_rfc3339()),
                    None => println!("Last updated:  never"),
                }
            }
        }
        Command::Search(args) => {
            let opts = SearchOptions {
                top_k: args.top_k.unwrap_or(config.search_top_k),
                threshold: args.threshold,
                kind: args.kind,
                language: args.language,
                path_prefix: args.path_prefix,
            };
            let results = if args.lexical {
                storage.lexical_search(&args.query, &opts)?
            } else {
                let query = args.query.clone();
                let embedder = Arc::clone(&embedder);
                let vector = tokio::task::spawn_blocking(move || embedder.embed(&query))
                    .await
                    .context("embedding task failed")??;
                Storage::search(storage.as_ref(), &vector, &opts)?
            };
            info!(results = results.len(), "Search finished");

            if cli.json {
                print_json(&results)?;
            } else {
                print_results(&results);
            }
        }
    }

    Ok(())
}
