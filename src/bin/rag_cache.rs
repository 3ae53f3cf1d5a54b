use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};

use rag_chatbot::config::{EmbeddingBackend, Settings};
use rag_chatbot::indexer::extractor::{looks_like_pdf, PdfExtractor};
use rag_chatbot::indexer::walker::walk_pdfs;
use rag_chatbot::proxy::ProviderClient;
use rag_chatbot::rag::cache::{fingerprint, ContentCache};
use rag_chatbot::rag::embeddings::{Embedder, LocalEmbedder};
use rag_chatbot::rag::ingestion::IngestionPipeline;
use rag_chatbot::rag::vector_index::IndexOptions;
use rag_chatbot::rag::vector_store::VectorStore;

#[derive(Parser, Debug)]
#[command(name = "rag-cache")]
#[command(about = "Manage the content-addressed index cache")]
struct Cli {
    /// Cache root (defaults to the configured cache_dir)
    #[arg(long, env = "CACHE_DIR", global = true)]
    cache_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Index every PDF under a directory into the cache, skipping cached ones
    Warm {
        #[arg(short, long)]
        dir: PathBuf,
    },
    /// Print the cache fingerprint of a file
    Fingerprint { file: PathBuf },
    /// Delete every cache entry
    Clear,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = Settings::load()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cache = ContentCache::new(cli.cache_dir.unwrap_or_else(|| settings.cache_dir.clone()));

    match cli.command {
        Command::Warm { dir } => warm(&settings, cache, dir).await,
        Command::Fingerprint { file } => {
            let content = tokio::fs::read(&file).await?;
            let fp = fingerprint(&content);
            let state = if cache.has(&fp) { "cached" } else { "not cached" };
            println!("{}  {}  ({})", fp, file.display(), state);
            Ok(())
        }
        Command::Clear => {
            cache.clear()?;
            println!("Cleared {}", cache.root().display());
            Ok(())
        }
    }
}

async fn warm(settings: &Settings, cache: ContentCache, dir: PathBuf) -> Result<()> {
    if !dir.exists() {
        anyhow::bail!("Directory does not exist: {}", dir.display());
    }

    let embedder: Arc<dyn Embedder> = match settings.embedding_backend {
        EmbeddingBackend::Remote => Arc::new(ProviderClient::new(settings)?),
        EmbeddingBackend::Local => Arc::new(LocalEmbedder::new(&settings.local_model_dir)?),
    };

    // Build into a scratch index so a running server's active index is untouched.
    let scratch = settings.temp_dir.join("rag-cache-warm");
    let store = Arc::new(VectorStore::new(
        scratch,
        embedder,
        IndexOptions::from_settings(settings),
    ));
    let pipeline = IngestionPipeline::new(store.clone(), cache, Arc::new(PdfExtractor), settings);

    println!("Scanning directory: {}", dir.display());
    let files = walk_pdfs(&dir);
    println!("Found {} PDF files", files.len());
    if files.is_empty() {
        return Ok(());
    }

    let pb = ProgressBar::new(files.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")?
            .progress_chars("#>-"),
    );

    let mut indexed = 0usize;
    let mut skipped = 0usize;
    let mut total_chunks = 0usize;
    let mut failed: Vec<(PathBuf, String)> = Vec::new();

    for path in &files {
        pb.set_message(path.file_name().unwrap_or_default().to_string_lossy().to_string());

        let content = match tokio::fs::read(path).await {
            Ok(content) => content,
            Err(e) => {
                failed.push((path.clone(), e.to_string()));
                pb.inc(1);
                continue;
            }
        };
        if !looks_like_pdf(&content) {
            failed.push((path.clone(), "not a PDF".to_string()));
            pb.inc(1);
            continue;
        }

        let fp = fingerprint(&content);
        if pipeline.cache().has(&fp) {
            skipped += 1;
            pb.inc(1);
            continue;
        }

        match pipeline.ingest(path, Some(&fp)).await {
            Ok(outcome) => {
                indexed += 1;
                total_chunks += outcome.chunk_count().unwrap_or(0);
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "warm failed");
                failed.push((path.clone(), e.to_string()));
            }
        }
        pb.inc(1);
    }

    pb.finish_with_message("done");
    store.clear().await?;

    println!("\nCache warm complete!");
    println!("  Indexed:        {}", indexed);
    println!("  Already cached: {}", skipped);
    println!("  Failed:         {}", failed.len());
    println!("  Total chunks:   {}", total_chunks);
    println!("  Cache root:     {}", pipeline.cache().root().display());

    if !failed.is_empty() {
        println!("\nFailed files:");
        for (path, err) in &failed {
            println!("  {}: {}", path.display(), err);
        }
    }

    Ok(())
}
