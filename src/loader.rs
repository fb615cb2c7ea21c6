//! Query-side asset loader: fetch the manifest plus its shards and graph
//! blob, consulting a persistent content-addressed cache, and assemble a
//! single contiguous fp32 vector buffer for the searcher.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;

use crate::cache::{AssetCache, CacheError};
use crate::hnsw::HnswGraph;
use crate::manifest::{graph_from_manifest, Manifest, ManifestError};

#[derive(Error, Debug)]
pub enum LoaderError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("cache error: {0}")]
    Cache(#[from] CacheError),
    #[error("manifest error: {0}")]
    Manifest(#[from] ManifestError),
    #[error("graph error: {0}")]
    Graph(#[from] crate::hnsw::HnswError),
    #[error("fetched shard has {actual} bytes, manifest declares {expected}")]
    ShardLengthMismatch { expected: u64, actual: u64 },
    #[error("load was aborted")]
    Aborted,
}

/// Cooperative abort signal shared between a worker and its in-flight loads.
/// Checked at each suspension point (spec's "suspension points" list) rather
/// than preempting network I/O — matches the scheduler's supersession model.
#[derive(Clone, Default)]
pub struct AbortSignal(Arc<AtomicBool>);

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abort(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<(), LoaderError> {
        if self.is_aborted() {
            Err(LoaderError::Aborted)
        } else {
            Ok(())
        }
    }
}

/// Emitted after each shard is fetched, per the `loadedRows`/`totalRows` pair.
#[derive(Debug, Clone, Copy)]
pub struct LoadProgress {
    pub loaded_rows: usize,
    pub total_rows: usize,
}

/// The fully assembled in-memory index a query worker holds for its session.
pub struct LoadedAssets {
    pub manifest: Manifest,
    /// Row-major, `rows * dims` contiguous buffer.
    pub vectors: Vec<f32>,
    pub graph: HnswGraph,
}

/// Fetch and assemble everything a manifest describes. `on_progress` fires
/// once per shard; the graph fetch has no progress event of its own.
pub async fn load(
    client: &reqwest::Client,
    cache: &AssetCache,
    manifest_url: &str,
    abort: &AbortSignal,
    mut on_progress: impl FnMut(LoadProgress),
) -> Result<LoadedAssets, LoaderError> {
    abort.check()?;
    let manifest_bytes = fetch_bytes(client, manifest_url).await?;
    let manifest: Manifest =
        serde_json::from_slice(&manifest_bytes).map_err(ManifestError::Json)?;

    let base = base_url(manifest_url);
    let dims = manifest.dims;
    let mut vectors = vec![0.0f32; manifest.rows * dims];

    let mut loaded_rows = 0usize;
    for shard in &manifest.vectors.shards {
        abort.check()?;
        let shard_url = join_url(&base, &shard.path);
        let bytes = fetch_cached(client, cache, &shard_url, &shard.sha256).await?;

        if bytes.len() as u64 != shard.byte_length {
            return Err(LoaderError::ShardLengthMismatch {
                expected: shard.byte_length,
                actual: bytes.len() as u64,
            });
        }

        let floats = bytes_to_f32(&bytes);
        let dst_start = shard.row_offset * dims;
        vectors[dst_start..dst_start + floats.len()].copy_from_slice(&floats);

        loaded_rows += shard.rows;
        on_progress(LoadProgress { loaded_rows, total_rows: manifest.rows });
    }

    abort.check()?;
    let graph_url = join_url(&base, &manifest.hnsw.graph.path);
    let graph_bytes = fetch_cached(client, cache, &graph_url, &manifest.hnsw.graph.sha256).await?;
    let graph = graph_from_manifest(&manifest, &graph_bytes)?;

    Ok(LoadedAssets { manifest, vectors, graph })
}

async fn fetch_bytes(client: &reqwest::Client, url: &str) -> Result<Vec<u8>, LoaderError> {
    let response = client.get(url).send().await?;
    let bytes = response.error_for_status()?.bytes().await?;
    Ok(bytes.to_vec())
}

/// Check the cache before going to the network; populate it on a miss. A
/// hash mismatch between the cached bytes and the manifest's declared hash
/// is never possible by construction since the cache is keyed by that hash —
/// a wrong-hash lookup is simply a miss.
async fn fetch_cached(
    client: &reqwest::Client,
    cache: &AssetCache,
    url: &str,
    expected_sha256: &str,
) -> Result<Vec<u8>, LoaderError> {
    if let Some(bytes) = cache.get(expected_sha256).await? {
        return Ok(bytes);
    }
    let bytes = fetch_bytes(client, url).await?;
    cache.put(expected_sha256, url, &bytes).await?;
    Ok(bytes)
}

fn base_url(manifest_url: &str) -> String {
    match manifest_url.rfind('/') {
        Some(idx) => manifest_url[..idx].to_string(),
        None => String::new(),
    }
}

fn join_url(base: &str, relative: &str) -> String {
    if relative.starts_with("http://") || relative.starts_with("https://") {
        relative.to_string()
    } else if base.is_empty() {
        relative.to_string()
    } else {
        format!("{base}/{relative}")
    }
}

/// Reinterpret little-endian shard bytes as `f32`s, attempting a zero-copy
/// cast first and falling back to manual decoding when the buffer isn't
/// 4-byte aligned.
fn bytes_to_f32(bytes: &[u8]) -> Vec<f32> {
    match bytemuck::try_cast_slice::<u8, f32>(bytes) {
        Ok(floats) => floats.to_vec(),
        Err(_) => bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hnsw::{build_graph, write_graph_blob, FlatVectors};
    use crate::manifest::{BuildOutput, write_build_output};

    fn sample_dir() -> (tempfile::TempDir, Manifest) {
        let dims = 4;
        let rows = 6;
        let mut data = Vec::with_capacity(rows * dims);
        for i in 0..rows {
            let mut row = vec![0.0f32; dims];
            for (j, v) in row.iter_mut().enumerate() {
                *v = ((i * 7 + j) as f32 * 0.041).sin();
            }
            let norm: f32 = row.iter().map(|x| x * x).sum::<f32>().sqrt();
            if norm > 0.0 {
                for v in &mut row {
                    *v /= norm;
                }
            }
            data.extend(row);
        }
        let vecs = FlatVectors::new(&data, dims);
        let graph = build_graph(&vecs, 4, 30);
        let ids: Vec<String> = (0..rows).map(|i| format!("doc-{i}")).collect();
        let dir = tempfile::tempdir().unwrap();
        let out = BuildOutput {
            dims,
            shard_size_rows: 4,
            ids,
            titles: None,
            chunk_metadata: None,
            vectors: &data,
            graph: &graph,
        };
        let manifest = write_build_output(dir.path(), &out).unwrap();
        let _ = write_graph_blob(&graph);
        (dir, manifest)
    }

    #[tokio::test]
    async fn loads_manifest_shards_and_graph_from_a_file_url_server() {
        let (dir, manifest) = sample_dir();
        let server = httpmock::MockServer::start();

        let manifest_json = std::fs::read(dir.path().join("manifest.json")).unwrap();
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

        let client = reqwest::Client::new();
        let cache = AssetCache::in_memory().await.unwrap();
        let abort = AbortSignal::new();
        let mut events = Vec::new();

        let loaded = load(&client, &cache, &server.url("/manifest.json"), &abort, |p| {
            events.push(p);
        })
        .await
        .unwrap();

        assert_eq!(loaded.vectors.len(), manifest.rows * manifest.dims);
        assert_eq!(events.len(), manifest.vectors.shards.len());
        assert_eq!(events.last().unwrap().loaded_rows, manifest.rows);
    }

    #[tokio::test]
    async fn second_load_hits_cache_and_skips_the_network() {
        let (dir, manifest) = sample_dir();
        let server = httpmock::MockServer::start();

        let manifest_json = std::fs::read(dir.path().join("manifest.json")).unwrap();
        let manifest_mock = server.mock(|when, then| {
            when.method(httpmock::Method::GET).path("/manifest.json");
            then.status(200).body(manifest_json);
        });
        let mut shard_mocks = Vec::new();
        for shard in &manifest.vectors.shards {
            let bytes = std::fs::read(dir.path().join(&shard.path)).unwrap();
            let mock = server.mock(|when, then| {
                when.method(httpmock::Method::GET).path(format!("/{}", shard.path));
                then.status(200).body(bytes);
            });
            shard_mocks.push(mock);
        }
        let graph_bytes = std::fs::read(dir.path().join(&manifest.hnsw.graph.path)).unwrap();
        let graph_mock = server.mock(|when, then| {
            when.method(httpmock::Method::GET).path(format!("/{}", manifest.hnsw.graph.path));
            then.status(200).body(graph_bytes);
        });

        let client = reqwest::Client::new();
        let cache = AssetCache::in_memory().await.unwrap();
        let abort = AbortSignal::new();

        load(&client, &cache, &server.url("/manifest.json"), &abort, |_| {}).await.unwrap();
        load(&client, &cache, &server.url("/manifest.json"), &abort, |_| {}).await.unwrap();

        for mock in &shard_mocks {
            mock.assert_hits(1);
        }
        graph_mock.assert_hits(1);
        manifest_mock.assert_hits(2);
    }

    #[tokio::test]
    async fn abort_before_start_short_circuits() {
        let client = reqwest::Client::new();
        let cache = AssetCache::in_memory().await.unwrap();
        let abort = AbortSignal::new();
        abort.abort();

        let err = load(&client, &cache, "http://127.0.0.1:1/manifest.json", &abort, |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, LoaderError::Aborted));
    }

    #[test]
    fn shard_path_joins_relative_to_manifest_base() {
        assert_eq!(join_url("https://cdn.test/assets", "shard-0.bin"), "https://cdn.test/assets/shard-0.bin");
        assert_eq!(join_url("https://cdn.test/assets", "https://other.test/x.bin"), "https://other.test/x.bin");
    }
}
