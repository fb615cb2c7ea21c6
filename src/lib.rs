//! # hybridsearch
//!
//! Hybrid full-text + approximate-nearest-neighbor search for static-site
//! content. An offline pipeline chunks, embeds, and indexes a corpus into a
//! portable asset bundle (manifest + vector shards + HNSW graph); a query
//! engine loads that bundle and fuses lexical and semantic rankings with
//! Reciprocal Rank Fusion.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use hybridsearch::cache::AssetCache;
//! use hybridsearch::embedder::Embedder;
//! use hybridsearch::engine::Engine;
//! use hybridsearch::fusion::Mode;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let embedder = Arc::new(Embedder::local("intfloat/e5-base-v2", 768)?);
//! let engine = Engine::new(embedder);
//! let client = reqwest::Client::new();
//! let cache = AssetCache::in_memory().await?;
//!
//! engine.init(&[], &client, &cache, "https://example.test/manifest.json", |_| {}).await?;
//! engine.search("parse configuration file", Mode::Semantic, 5).await?;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod chunk;
pub mod config;
pub mod embedder;
pub mod engine;
pub mod fusion;
pub mod hnsw;
pub mod lexical;
pub mod loader;
pub mod manifest;
pub(crate) mod math;
pub mod scheduler;
pub mod types;

pub use cache::AssetCache;
pub use chunk::{chunk_body, ChunkConfig};
pub use config::Config;
pub use embedder::{Embedder, RemoteConfig};
pub use engine::{Engine, EngineError, SearchOutcome};
pub use fusion::{fuse, FusedResult, FusionWeights, Mode};
pub use hnsw::{build_graph, search as hnsw_search, HnswGraph, SearchHit};
pub use lexical::{tokenize, LexicalIndex};
pub use loader::{load as load_assets, AbortSignal, LoadedAssets, LoadProgress};
pub use manifest::{write_build_output, BuildOutput, Manifest};
pub use types::{Chunk, Document, Vector};
