//! Query engine: the owner of loaded assets (vector buffer, HNSW graph,
//! lexical index) that serves `init`/`search`/`reset` requests per the
//! worker message protocol, enforcing supersession by sequence token at each
//! suspension point.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::RwLock;

use crate::cache::AssetCache;
use crate::embedder::{Embedder, EmbedderError};
use crate::fusion::{self, FusedResult, FusionWeights, Mode};
use crate::hnsw::{search as hnsw_search, FlatVectors};
use crate::lexical::{tokenize, DocumentFields, LexicalIndex};
use crate::loader::{self, AbortSignal, LoadedAssets, LoaderError};
use crate::scheduler::SequenceCounter;
use crate::types::Document;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Loader(#[from] LoaderError),
    #[error(transparent)]
    Embedder(#[from] EmbedderError),
    #[error("engine has not completed init")]
    NotReady,
}

/// A completed `search` either carries results or was silently superseded by
/// a later call, per the supersession policy — never an error.
#[derive(Debug, Clone, PartialEq)]
pub enum SearchOutcome {
    Ready(Vec<FusedResult>),
    Superseded,
}

/// Candidate breadth fed into per-field lexical search and the HNSW searcher
/// before fusion narrows down to the top N.
const CANDIDATE_K: usize = 50;

struct Assets {
    loaded: LoadedAssets,
    lexical: LexicalIndex,
}

/// Owns everything a query needs: the semantic assets fetched via the
/// loader, the lexical index built over the documents handed to `init`
/// (held locally rather than fetched, unlike the vector shards), the model
/// instance (lazily constructed inside `Embedder`, reused across queries),
/// and the sequence counter that arbitrates supersession.
pub struct Engine {
    embedder: Arc<Embedder>,
    weights: FusionWeights,
    assets: RwLock<Option<Assets>>,
    sequence: SequenceCounter,
    abort: RwLock<AbortSignal>,
}

impl Engine {
    pub fn new(embedder: Arc<Embedder>) -> Self {
        Self::with_weights(embedder, FusionWeights::default())
    }

    pub fn with_weights(embedder: Arc<Embedder>, weights: FusionWeights) -> Self {
        Self {
            embedder,
            weights,
            assets: RwLock::new(None),
            sequence: SequenceCounter::new(),
            abort: RwLock::new(AbortSignal::new()),
        }
    }

    /// `init`: fetch the manifest-described vector assets, building the
    /// lexical index over `documents` locally. Supersedes any load or query
    /// already in flight.
    pub async fn init(
        &self,
        documents: &[Document],
        client: &reqwest::Client,
        cache: &AssetCache,
        manifest_url: &str,
        on_progress: impl FnMut(loader::LoadProgress),
    ) -> Result<(), EngineError> {
        let abort = self.reset().await;
        let loaded = loader::load(client, cache, manifest_url, &abort, on_progress).await?;
        let lexical = build_lexical_index(documents);

        *self.assets.write().await = Some(Assets { loaded, lexical });
        Ok(())
    }

    /// `reset`: abort whatever load or query is in flight and discard
    /// loaded state, returning the fresh abort signal the next `init`
    /// should use.
    pub async fn reset(&self) -> AbortSignal {
        let mut guard = self.abort.write().await;
        guard.abort();
        let fresh = AbortSignal::new();
        *guard = fresh.clone();
        *self.assets.write().await = None;
        fresh
    }

    pub fn is_ready(&self) -> bool {
        self.assets.try_read().map(|g| g.is_some()).unwrap_or(false)
    }

    /// `search`: lexical candidates are gathered first (cheap, synchronous);
    /// the semantic path runs only in semantic mode, since it is the sole
    /// suspension point here (embedding the query). Every suspension point
    /// re-checks the sequence token and returns `Superseded` if a later
    /// search has already started.
    pub async fn search(&self, query: &str, mode: Mode, k: usize) -> Result<SearchOutcome, EngineError> {
        let token = self.sequence.next();
        let breadth = k.max(CANDIDATE_K);

        let guard = self.assets.read().await;
        let Some(assets) = guard.as_ref() else {
            return Err(EngineError::NotReady);
        };

        let field_hits = assets.lexical.search(query, breadth);
        let query_tokens = tokenize(query);

        let semantic_hits = if mode == Mode::Semantic {
            let query_vec = self.embedder.embed_query(query).await?;
            if !self.sequence.is_current(token) {
                return Ok(SearchOutcome::Superseded);
            }
            let vectors = FlatVectors::new(&assets.loaded.vectors, assets.loaded.manifest.dims);
            let ef_default = 64usize.max(4 * assets.loaded.manifest.hnsw.m);
            hnsw_search(&assets.loaded.graph, &vectors, query_vec.as_slice(), breadth, ef_default)
        } else {
            Vec::new()
        };

        if !self.sequence.is_current(token) {
            return Ok(SearchOutcome::Superseded);
        }

        let results = fusion::fuse(
            mode,
            &self.weights,
            &assets.lexical,
            &field_hits,
            &query_tokens,
            &semantic_hits,
            &assets.loaded.manifest.ids,
            assets.loaded.manifest.chunk_metadata.as_ref(),
        );
        Ok(SearchOutcome::Ready(results))
    }
}

fn build_lexical_index(documents: &[Document]) -> LexicalIndex {
    let ids: Vec<String> = documents.iter().map(|d| d.slug.clone()).collect();
    let fields: Vec<DocumentFields> = documents
        .iter()
        .map(|d| DocumentFields {
            title: &d.title,
            content: &d.body,
            tags: &d.tags,
            aliases: &d.aliases,
        })
        .collect();
    LexicalIndex::build(ids, &fields)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedder::RemoteConfig;
    use crate::hnsw::{build_graph, FlatVectors as BuildVectors};
    use crate::manifest::{write_build_output, BuildOutput};

    fn sample_documents() -> Vec<Document> {
        vec![
            Document {
                slug: "intro-to-cats".into(),
                title: "Intro to Cats".into(),
                tags: vec!["pets".into()],
                aliases: vec![],
                body: "Cats are independent companions.".into(),
            },
            Document {
                slug: "dog-training".into(),
                title: "Dog Training".into(),
                tags: vec!["pets".into()],
                aliases: vec![],
                body: "Training a dog takes patience.".into(),
            },
            Document {
                slug: "cat-grooming".into(),
                title: "Grooming Tips".into(),
                tags: vec!["pets".into(), "cat".into()],
                aliases: vec![],
                body: "Brushing a cat regularly prevents mats.".into(),
            },
        ]
    }

    /// Builds a tiny manifest whose row order matches `sample_documents()`
    /// one-to-one (chunking disabled, one row per document) and serves it
    /// from an in-process mock HTTP server.
    fn sample_manifest_server(docs: &[Document]) -> (httpmock::MockServer, tempfile::TempDir) {
        let dims = 4;
        let mut data = Vec::with_capacity(docs.len() * dims);
        for i in 0..docs.len() {
            let mut row = vec![0.0f32; dims];
            for (j, v) in row.iter_mut().enumerate() {
                *v = ((i * 5 + j) as f32 * 0.037).cos();
            }
            let norm: f32 = row.iter().map(|x| x * x).sum::<f32>().sqrt();
            if norm > 0.0 {
                for v in &mut row {
                    *v /= norm;
                }
            }
            data.extend(row);
        }
        let vecs = BuildVectors::new(&data, dims);
        let graph = build_graph(&vecs, 4, 30);
        let ids: Vec<String> = docs.iter().map(|d| d.slug.clone()).collect();

        let dir = tempfile::tempdir().unwrap();
        let out = BuildOutput {
            dims,
            shard_size_rows: 10,
            ids,
            titles: None,
            chunk_metadata: None,
            vectors: &data,
            graph: &graph,
        };
        write_build_output(dir.path(), &out).unwrap();

        let server = httpmock::MockServer::start();
        let manifest_json = std::fs::read(dir.path().join("manifest.json")).unwrap();
        let manifest: crate::manifest::Manifest = serde_json::from_slice(&manifest_json).unwrap();

        server.mock(|when, then| {
            when.method(httpmock::Method::GET).path("/manifest.json");
            then.status(200).body(manifest_json);
        });
        for shard in &manifest.vectors.shards {
            let bytes = std::fs::read(dir.path().join(&shard.path)).unwrap();
            server.mock(|when, then| {
                when.method(httpmock::Method::GET).path(format!("/{}", shard.path));
                then.status(200).body(bytes);
            });
        }
        let graph_bytes = std::fs::read(dir.path().join(&manifest.hnsw.graph.path)).unwrap();
        server.mock(|when, then| {
            when.method(httpmock::Method::GET).path(format!("/{}", manifest.hnsw.graph.path));
            then.status(200).body(graph_bytes);
        });

        (server, dir)
    }

    fn remote_embedder(embeddings_url: String) -> Arc<Embedder> {
        let cfg = RemoteConfig { url: embeddings_url, model: "test-model".into(), concurrency: 1, batch_size: 8 };
        Arc::new(Embedder::remote("test-model", cfg))
    }

    #[tokio::test]
    async fn search_before_init_is_not_ready() {
        let embedder = remote_embedder("http://127.0.0.1:1/v1/embeddings".into());
        let engine = Engine::new(embedder);
        let err = engine.search("cat", Mode::Lexical, 10).await.unwrap_err();
        assert!(matches!(err, EngineError::NotReady));
    }

    #[tokio::test]
    async fn lexical_mode_ranks_title_boosted_document_first() {
        let docs = sample_documents();
        let (server, _dir) = sample_manifest_server(&docs);
        let embedder = remote_embedder(server.url("/v1/embeddings"));
        let engine = Engine::new(embedder);

        let client = reqwest::Client::new();
        let cache = AssetCache::in_memory().await.unwrap();
        engine.init(&docs, &client, &cache, &server.url("/manifest.json"), |_| {}).await.unwrap();

        let outcome = engine.search("cat", Mode::Lexical, 10).await.unwrap();
        let SearchOutcome::Ready(results) = outcome else { panic!("expected Ready") };

        assert!(results.iter().any(|r| r.doc_id == "intro-to-cats"));
        assert!(results.iter().any(|r| r.doc_id == "cat-grooming"));
        assert_eq!(results[0].doc_id, "intro-to-cats");
    }

    #[tokio::test]
    async fn tag_filter_query_restricts_to_tagged_documents() {
        let docs = sample_documents();
        let (server, _dir) = sample_manifest_server(&docs);
        let embedder = remote_embedder(server.url("/v1/embeddings"));
        let engine = Engine::new(embedder);

        let client = reqwest::Client::new();
        let cache = AssetCache::in_memory().await.unwrap();
        engine.init(&docs, &client, &cache, &server.url("/manifest.json"), |_| {}).await.unwrap();

        let outcome = engine.search("#pets", Mode::Lexical, 10).await.unwrap();
        let SearchOutcome::Ready(results) = outcome else { panic!("expected Ready") };
        let ids: Vec<&str> = results.iter().map(|r| r.doc_id.as_str()).collect();
        assert_eq!(ids.len(), 3);
        assert!(ids.contains(&"intro-to-cats"));
        assert!(ids.contains(&"dog-training"));
        assert!(ids.contains(&"cat-grooming"));
    }

    #[tokio::test]
    async fn semantic_mode_uses_embedder_and_attaches_percentages() {
        let docs = sample_documents();
        let (server, _dir) = sample_manifest_server(&docs);
        server.mock(|when, then| {
            when.method(httpmock::Method::POST).path("/v1/embeddings");
            then.status(200).json_body(serde_json::json!({
                "data": [{ "embedding": [1.0, 0.0, 0.0, 0.0] }]
            }));
        });
        let embedder = remote_embedder(server.url("/v1/embeddings"));
        let engine = Engine::new(embedder);

        let client = reqwest::Client::new();
        let cache = AssetCache::in_memory().await.unwrap();
        engine.init(&docs, &client, &cache, &server.url("/manifest.json"), |_| {}).await.unwrap();

        let outcome = engine.search("cat", Mode::Semantic, 10).await.unwrap();
        let SearchOutcome::Ready(results) = outcome else { panic!("expected Ready") };
        assert!(!results.is_empty());
        assert!(results[0].max_sem_percent.is_some());
    }

    #[tokio::test]
    async fn a_reset_supersedes_the_loaded_state() {
        let docs = sample_documents();
        let (server, _dir) = sample_manifest_server(&docs);
        let embedder = remote_embedder(server.url("/v1/embeddings"));
        let engine = Engine::new(embedder);

        let client = reqwest::Client::new();
        let cache = AssetCache::in_memory().await.unwrap();
        engine.init(&docs, &client, &cache, &server.url("/manifest.json"), |_| {}).await.unwrap();
        assert!(engine.is_ready());

        engine.reset().await;
        assert!(!engine.is_ready());
        let err = engine.search("cat", Mode::Lexical, 10).await.unwrap_err();
        assert!(matches!(err, EngineError::NotReady));
    }
}
