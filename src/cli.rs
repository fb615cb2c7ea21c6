//! CLI surface: `build` (offline chunk/embed/HNSW pipeline), `query` (one-shot
//! search), and `serve` (keeps the query engine warm, reading queries from
//! stdin) — the closest non-browser analogue of a resident worker.

use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;

use crate::cache::AssetCache;
use crate::chunk::{chunk_body, ChunkConfig};
use crate::config::Config;
use crate::embedder::{Embedder, RemoteConfig};
use crate::engine::Engine;
use crate::fusion::{FusedResult, Mode};
use crate::manifest::{BuildOutput, ChunkMeta};
use crate::types::Document;

/// Graph connectivity the build pipeline uses when no finer control is
/// exposed at the CLI surface (spec.md §6 doesn't surface these as flags).
const DEFAULT_M: usize = 16;
const DEFAULT_EF_CONSTRUCTION: usize = 200;

#[derive(Parser)]
#[command(name = "hybridsearch")]
#[command(about = "Hybrid lexical + semantic search over a static-site corpus")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Debug-level logging, regardless of RUST_LOG.
    #[arg(long, global = true)]
    pub verbose: bool,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
pub enum ModeArg {
    Lexical,
    Semantic,
}

impl From<ModeArg> for Mode {
    fn from(m: ModeArg) -> Self {
        match m {
            ModeArg::Lexical => Mode::Lexical,
            ModeArg::Semantic => Mode::Semantic,
        }
    }
}

#[derive(Subcommand)]
pub enum Command {
    /// Chunk, embed, and index a JSONL corpus into a manifest + shard bundle.
    Build {
        /// One JSON `Document` per line.
        #[arg(long)]
        jsonl: PathBuf,
        /// Embedding model id (a Hugging Face repo id for the local backend).
        #[arg(long)]
        model: String,
        /// Output directory for manifest.json, shard-*.bin, and graph.bin.
        #[arg(long)]
        out: PathBuf,
        #[arg(long, default_value = "fp32")]
        dtype: String,
        #[arg(long)]
        dims: usize,
        #[arg(long, default_value_t = 4096)]
        shard_size: usize,
        #[arg(long, default_value_t = 512)]
        chunk_size: usize,
        #[arg(long, default_value_t = 128)]
        chunk_overlap: usize,
        #[arg(long)]
        no_chunking: bool,
        #[arg(long)]
        use_vllm: bool,
        #[arg(long)]
        vllm_url: Option<String>,
        #[arg(long, default_value_t = 4)]
        concurrency: usize,
        #[arg(long, default_value_t = 32)]
        batch_size: usize,
        /// Suppress the progress bar.
        #[arg(long)]
        quiet: bool,
    },
    /// Run a single query against a built manifest bundle.
    Query {
        /// URL (or local-server URL) the manifest and its assets are served from.
        #[arg(long)]
        manifest_url: String,
        /// The same JSONL corpus the bundle was built from, for the lexical index.
        #[arg(long)]
        jsonl: PathBuf,
        #[arg(long)]
        model: String,
        query: String,
        #[arg(long, default_value_t = 10)]
        k: usize,
        #[arg(long, value_enum, default_value_t = ModeArg::Semantic)]
        mode: ModeArg,
    },
    /// Load a manifest bundle once and answer repeated queries from stdin,
    /// one per line, until EOF.
    Serve {
        #[arg(long)]
        manifest_url: String,
        #[arg(long)]
        jsonl: PathBuf,
        #[arg(long)]
        model: String,
        #[arg(long, default_value_t = 10)]
        k: usize,
        #[arg(long, value_enum, default_value_t = ModeArg::Semantic)]
        mode: ModeArg,
    },
}

pub fn run_with(cli: Cli) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;

    match cli.command {
        Command::Build {
            jsonl,
            model,
            out,
            dtype,
            dims,
            shard_size,
            chunk_size,
            chunk_overlap,
            no_chunking,
            use_vllm,
            vllm_url,
            concurrency,
            batch_size,
            quiet,
        } => {
            if dtype != "fp32" {
                bail!("unsupported dtype {dtype:?}: only fp32 is supported");
            }
            runtime.block_on(cmd_build(BuildArgs {
                jsonl,
                model,
                out,
                dims,
                shard_size,
                chunk_size,
                chunk_overlap,
                no_chunking,
                use_vllm,
                vllm_url,
                concurrency,
                batch_size,
                quiet,
            }))
        }
        Command::Query { manifest_url, jsonl, model, query, k, mode } => {
            runtime.block_on(cmd_query(manifest_url, jsonl, model, query, k, mode.into()))
        }
        Command::Serve { manifest_url, jsonl, model, k, mode } => {
            runtime.block_on(cmd_serve(manifest_url, jsonl, model, k, mode.into()))
        }
    }
}

struct BuildArgs {
    jsonl: PathBuf,
    model: String,
    out: PathBuf,
    dims: usize,
    shard_size: usize,
    chunk_size: usize,
    chunk_overlap: usize,
    no_chunking: bool,
    use_vllm: bool,
    vllm_url: Option<String>,
    concurrency: usize,
    batch_size: usize,
    quiet: bool,
}

fn spinner(quiet: bool, message: &'static str) -> ProgressBar {
    if quiet {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new_spinner();
    pb.set_style(ProgressStyle::default_spinner().template("{spinner:.cyan} {msg}").unwrap());
    pb.set_message(message);
    pb.enable_steady_tick(std::time::Duration::from_millis(100));
    pb
}

fn read_documents(path: &std::path::Path) -> Result<Vec<Document>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    text.lines()
        .filter(|l| !l.trim().is_empty())
        .map(|line| serde_json::from_str(line).context("parsing a JSONL document row"))
        .collect()
}

async fn cmd_build(args: BuildArgs) -> Result<()> {
    let documents = read_documents(&args.jsonl)?;
    info!(count = documents.len(), "loaded documents");

    let chunk_cfg = ChunkConfig {
        size: args.chunk_size,
        overlap: args.chunk_overlap,
        disabled: args.no_chunking,
    };

    let mut ids = Vec::new();
    let mut titles = Vec::new();
    let mut chunk_metadata = std::collections::HashMap::new();
    let mut texts = Vec::new();

    for doc in &documents {
        let chunks = chunk_body(&doc.slug, &doc.body, &chunk_cfg)
            .with_context(|| format!("chunking document {}", doc.slug))?;
        for chunk in chunks {
            let slug = chunk.slug();
            chunk_metadata.insert(
                slug.clone(),
                ChunkMeta { parent_slug: chunk.parent_slug.clone(), chunk_id: chunk.chunk_id },
            );
            ids.push(slug);
            titles.push(doc.title.clone());
            texts.push(chunk.text);
        }
    }
    info!(count = ids.len(), "chunked into rows");

    let embedder = if args.use_vllm {
        let cfg = RemoteConfig {
            url: args
                .vllm_url
                .or_else(|| std::env::var("VLLM_URL").or_else(|_| std::env::var("VLLM_EMBED_URL")).ok())
                .context("--use-vllm requires --vllm-url or VLLM_URL/VLLM_EMBED_URL")?,
            model: args.model.clone(),
            concurrency: args.concurrency,
            batch_size: args.batch_size,
        };
        Embedder::remote(args.model.clone(), cfg)
    } else {
        Embedder::local(args.model.clone(), args.dims)?
    };

    let embed_pb = spinner(args.quiet, "embedding rows");
    let vectors = embedder.embed_passages(&texts).await;
    let vectors = match vectors {
        Ok(v) => v,
        Err(e) => {
            embed_pb.finish_and_clear();
            println!("  {} Embedding: {}", "[✗]".red(), e);
            return Err(e.into());
        }
    };
    if vectors.iter().any(|v| v.dim() != args.dims) {
        embed_pb.finish_and_clear();
        bail!("embedder returned a vector with the wrong dimension (expected {})", args.dims);
    }
    let mut flat = Vec::with_capacity(vectors.len() * args.dims);
    for v in &vectors {
        flat.extend_from_slice(v.as_slice());
    }
    embed_pb.finish_and_clear();
    info!(rows = vectors.len(), dims = args.dims, "embedded rows");
    println!("  {} {} rows embedded at {} dims", "[✓]".green(), vectors.len(), args.dims);

    let graph_pb = spinner(args.quiet, "building HNSW graph");
    let flat_vectors = crate::hnsw::FlatVectors::new(&flat, args.dims);
    let graph = crate::hnsw::build_graph(&flat_vectors, DEFAULT_M, DEFAULT_EF_CONSTRUCTION);
    graph_pb.finish_and_clear();
    info!(entry_point = graph.entry_point, max_level = graph.max_level, "built HNSW graph");
    println!("  {} graph built, entry point {}, max level {}", "[✓]".green(), graph.entry_point, graph.max_level);

    let out = BuildOutput {
        dims: args.dims,
        shard_size_rows: args.shard_size,
        ids,
        titles: Some(titles),
        chunk_metadata: Some(chunk_metadata),
        vectors: &flat,
        graph: &graph,
    };
    let manifest = crate::manifest::write_build_output(&args.out, &out)?;
    info!(rows = manifest.rows, path = %args.out.display(), "wrote build output");
    println!("  {} wrote {} rows to {}", "[✓]".green(), manifest.rows, args.out.display());
    Ok(())
}

async fn manifest_dims(client: &reqwest::Client, manifest_url: &str) -> Result<usize> {
    let bytes = client.get(manifest_url).send().await?.error_for_status()?.bytes().await?;
    let manifest: crate::manifest::Manifest = serde_json::from_slice(&bytes)?;
    Ok(manifest.dims)
}

async fn build_engine(manifest_url: &str, jsonl: &std::path::Path, model: &str) -> Result<(Engine, reqwest::Client, AssetCache, Vec<Document>)> {
    let client = reqwest::Client::new();
    let cache_path = dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("hybridsearch")
        .join("assets.db");
    if let Some(parent) = cache_path.parent() {
        std::fs::create_dir_all(parent).ok();
    }
    let cache = AssetCache::open(&cache_path).await.context("opening asset cache")?;

    let documents = read_documents(jsonl)?;

    let embedder = if let Some(cfg) = RemoteConfig::from_env(model.to_string()) {
        Embedder::remote(model.to_string(), cfg)
    } else {
        let dims = manifest_dims(&client, manifest_url).await?;
        Embedder::local(model.to_string(), dims)?
    };

    let engine = Engine::new(Arc::new(embedder));
    engine
        .init(&documents, &client, &cache, manifest_url, |p| {
            info!(loaded = p.loaded_rows, total = p.total_rows, "loading assets");
        })
        .await?;

    Ok((engine, client, cache, documents))
}

fn print_results(results: &[FusedResult]) -> Result<()> {
    let json = serde_json::to_string_pretty(results)?;
    println!("{json}");
    Ok(())
}

async fn cmd_query(
    manifest_url: String,
    jsonl: PathBuf,
    model: String,
    query: String,
    k: usize,
    mode: Mode,
) -> Result<()> {
    let (engine, _client, _cache, _documents) = build_engine(&manifest_url, &jsonl, &model).await?;
    match engine.search(&query, mode, k).await? {
        crate::engine::SearchOutcome::Ready(results) => print_results(&results),
        crate::engine::SearchOutcome::Superseded => {
            bail!("query was superseded (unexpected for a one-shot run)")
        }
    }
}

async fn cmd_serve(manifest_url: String, jsonl: PathBuf, model: String, k: usize, mode: Mode) -> Result<()> {
    let (engine, _client, _cache, _documents) = build_engine(&manifest_url, &jsonl, &model).await?;
    eprintln!("ready, reading queries from stdin");

    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let line = line.context("reading stdin")?;
        let query = line.trim();
        if query.is_empty() {
            continue;
        }
        match engine.search(query, mode, k).await {
            Ok(crate::engine::SearchOutcome::Ready(results)) => {
                print_results(&results)?;
            }
            Ok(crate::engine::SearchOutcome::Superseded) => {
                eprintln!("{{\"error\":\"superseded\"}}");
            }
            Err(e) => {
                eprintln!("{{\"error\":{:?}}}", e.to_string());
            }
        }
        std::io::stdout().flush().ok();
    }
    Ok(())
}

/// Apply `.hybridsearch.toml`/user-config defaults that weren't overridden by
/// an explicit CLI flag. Mirrors the layered-config pattern config.rs uses.
pub fn apply_config_defaults(project_root: &std::path::Path) -> Config {
    Config::load(project_root)
}
