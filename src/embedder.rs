//! Embedding generation: a local ort + tokenizers backend and a remote
//! OpenAI-compatible batched backend behind one `Embedder` facade.

use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use lru::LruCache;
use ndarray::Array2;
use once_cell::sync::OnceCell;
use ort::ep::ExecutionProvider as OrtExecutionProvider;
use ort::session::Session;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::Vector;

#[derive(Error, Debug)]
pub enum EmbedderError {
    #[error("model not found: {0}")]
    ModelNotFound(String),
    #[error("tokenizer error: {0}")]
    TokenizerError(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("huggingface hub error: {0}")]
    HfHubError(String),
    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("query text is empty")]
    EmptyQuery,
    #[error("remote embedding request failed permanently: {0}")]
    RemotePermanent(String),
    #[error("remote embedding request failed after retries: {0}")]
    RemoteExhausted(String),
}

impl From<ort::Error> for EmbedderError {
    fn from(e: ort::Error) -> Self {
        EmbedderError::InferenceFailed(e.to_string())
    }
}

/// Query/passage prefix pair applied by substring match on the model id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PrefixPair {
    query: &'static str,
    passage: &'static str,
}

fn prefixes_for(model_id: &str) -> PrefixPair {
    let lower = model_id.to_lowercase();
    if lower.contains("e5") {
        return PrefixPair { query: "query: ", passage: "passage: " };
    }
    if lower.contains("qwen") && lower.contains("embedding") {
        return PrefixPair {
            query: "Instruct: Given a web search query, retrieve relevant passages that answer the query\nQuery: ",
            passage: "",
        };
    }
    if lower.contains("embeddinggemma") {
        return PrefixPair {
            query: "task: search result | query: ",
            passage: "title: none | text: ",
        };
    }
    PrefixPair { query: "", passage: "" }
}

/// Which execution provider an ort session was committed with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionProvider {
    CUDA { device_id: i32 },
    TensorRT { device_id: i32 },
    CPU,
}

impl std::fmt::Display for ExecutionProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionProvider::CUDA { device_id } => write!(f, "CUDA:{device_id}"),
            ExecutionProvider::TensorRT { device_id } => write!(f, "TensorRT:{device_id}"),
            ExecutionProvider::CPU => write!(f, "CPU"),
        }
    }
}

/// Local ONNX inference backend: tokenize, run, mean-pool, L2-normalize.
pub struct LocalEmbedder {
    session: OnceCell<Mutex<Session>>,
    tokenizer: OnceCell<tokenizers::Tokenizer>,
    model_path: PathBuf,
    tokenizer_path: PathBuf,
    provider: ExecutionProvider,
    max_length: usize,
    dims: usize,
}

impl LocalEmbedder {
    pub fn new(model_id: &str, dims: usize) -> Result<Self, EmbedderError> {
        let (model_path, tokenizer_path) = ensure_model(model_id)?;
        Ok(Self {
            session: OnceCell::new(),
            tokenizer: OnceCell::new(),
            model_path,
            tokenizer_path,
            provider: select_provider(),
            max_length: 512,
            dims,
        })
    }

    pub fn provider(&self) -> ExecutionProvider {
        self.provider
    }

    fn session(&self) -> Result<std::sync::MutexGuard<'_, Session>, EmbedderError> {
        let session = self
            .session
            .get_or_try_init(|| create_session(&self.model_path, self.provider).map(Mutex::new))?;
        Ok(session.lock().unwrap_or_else(|p| p.into_inner()))
    }

    fn tokenizer(&self) -> Result<&tokenizers::Tokenizer, EmbedderError> {
        self.tokenizer.get_or_try_init(|| {
            tokenizers::Tokenizer::from_file(&self.tokenizer_path)
                .map_err(|e| EmbedderError::TokenizerError(e.to_string()))
        })
    }

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vector>, EmbedderError> {
        use ort::value::Tensor;

        let _span = tracing::info_span!("embed_batch", count = texts.len()).entered();

        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let encodings = self
            .tokenizer()?
            .encode_batch(texts.to_vec(), true)
            .map_err(|e| EmbedderError::TokenizerError(e.to_string()))?;

        let input_ids: Vec<Vec<i64>> = encodings
            .iter()
            .map(|e| e.get_ids().iter().map(|&id| id as i64).collect())
            .collect();
        let attention_mask: Vec<Vec<i64>> = encodings
            .iter()
            .map(|e| e.get_attention_mask().iter().map(|&m| m as i64).collect())
            .collect();

        let max_len = input_ids
            .iter()
            .map(|v| v.len())
            .max()
            .unwrap_or(0)
            .min(self.max_length)
            .max(1);

        let input_ids_arr = pad_2d_i64(&input_ids, max_len, 0);
        let attention_mask_arr = pad_2d_i64(&attention_mask, max_len, 0);
        let token_type_ids_arr = Array2::<i64>::zeros((texts.len(), max_len));

        let input_ids_tensor = Tensor::from_array(input_ids_arr)?;
        let attention_mask_tensor = Tensor::from_array(attention_mask_arr)?;
        let token_type_ids_tensor = Tensor::from_array(token_type_ids_arr)?;

        let mut session = self.session()?;
        let outputs = session.run(ort::inputs![
            "input_ids" => input_ids_tensor,
            "attention_mask" => attention_mask_tensor,
            "token_type_ids" => token_type_ids_tensor,
        ])?;

        let (shape, data) = outputs["last_hidden_state"].try_extract_tensor::<f32>()?;
        let model_dim = *shape
            .last()
            .ok_or_else(|| EmbedderError::InferenceFailed("missing hidden-state dim".into()))?
            as usize;
        if model_dim != self.dims {
            return Err(EmbedderError::DimensionMismatch {
                expected: self.dims,
                actual: model_dim,
            });
        }

        let batch_size = texts.len();
        let mut results = Vec::with_capacity(batch_size);

        for (i, mask_vec) in attention_mask.iter().enumerate().take(batch_size) {
            let mut sum = vec![0.0f32; model_dim];
            let mut count = 0.0f32;

            for j in 0..max_len {
                let mask = mask_vec.get(j).copied().unwrap_or(0) as f32;
                if mask > 0.0 {
                    count += mask;
                    let offset = i * max_len * model_dim + j * model_dim;
                    for (k, sum_val) in sum.iter_mut().enumerate() {
                        *sum_val += data[offset + k] * mask;
                    }
                }
            }
            if count > 0.0 {
                for sum_val in &mut sum {
                    *sum_val /= count;
                }
            }

            let mut v = Vector::new(sum);
            v.normalize();
            results.push(v);
        }

        Ok(results)
    }
}

/// Remote batched backend: OpenAI-compatible `/v1/embeddings`, bounded by a
/// concurrency-limited pool of in-flight requests and retried per batch.
pub struct RemoteEmbedder {
    client: reqwest::Client,
    url: String,
    model: String,
    batch_size: usize,
    semaphore: Arc<tokio::sync::Semaphore>,
}

#[derive(Debug, Clone)]
pub struct RemoteConfig {
    pub url: String,
    pub model: String,
    pub concurrency: usize,
    pub batch_size: usize,
}

impl RemoteConfig {
    /// Read `VLLM_URL`/`VLLM_EMBED_URL`, `VLLM_CONCURRENCY`, `VLLM_BATCH_SIZE`,
    /// gated on `USE_VLLM`. Returns `None` if the remote backend isn't enabled.
    pub fn from_env(model: String) -> Option<Self> {
        let use_vllm = std::env::var("USE_VLLM")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        if !use_vllm {
            return None;
        }
        let url = std::env::var("VLLM_URL")
            .or_else(|_| std::env::var("VLLM_EMBED_URL"))
            .ok()?;
        let concurrency = std::env::var("VLLM_CONCURRENCY")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(4);
        let batch_size = std::env::var("VLLM_BATCH_SIZE")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(32);
        Some(Self { url, model, concurrency, batch_size })
    }
}

enum RemoteAttempt {
    Transient(String),
    Permanent(String),
}

impl RemoteEmbedder {
    pub fn new(cfg: RemoteConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: cfg.url,
            model: cfg.model,
            batch_size: cfg.batch_size.max(1),
            semaphore: Arc::new(tokio::sync::Semaphore::new(cfg.concurrency.max(1))),
        }
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vector>, EmbedderError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let mut out = Vec::with_capacity(texts.len());
        for chunk in texts.chunks(self.batch_size) {
            let _permit = self
                .semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| EmbedderError::RemoteExhausted(e.to_string()))?;
            out.extend(self.send_with_retry(chunk).await?);
        }
        Ok(out)
    }

    async fn send_with_retry(&self, chunk: &[String]) -> Result<Vec<Vector>, EmbedderError> {
        const MAX_ATTEMPTS: u32 = 3;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.send_once(chunk).await {
                Ok(v) => return Ok(v),
                Err(RemoteAttempt::Permanent(msg)) => return Err(EmbedderError::RemotePermanent(msg)),
                Err(RemoteAttempt::Transient(msg)) => {
                    if attempt >= MAX_ATTEMPTS {
                        return Err(EmbedderError::RemoteExhausted(msg));
                    }
                    tokio::time::sleep(Duration::from_millis(200 * 2u64.pow(attempt - 1))).await;
                }
            }
        }
    }

    async fn send_once(&self, chunk: &[String]) -> Result<Vec<Vector>, RemoteAttempt> {
        #[derive(Serialize)]
        struct Req<'a> {
            model: &'a str,
            input: &'a [String],
        }
        #[derive(Deserialize)]
        struct RespItem {
            embedding: Vec<f32>,
        }
        #[derive(Deserialize)]
        struct Resp {
            data: Vec<RespItem>,
        }

        let body = Req { model: &self.model, input: chunk };
        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| RemoteAttempt::Transient(e.to_string()))?;

        let status = response.status();
        if status.is_server_error() {
            return Err(RemoteAttempt::Transient(format!("server error: {status}")));
        }
        if status.is_client_error() {
            let text = response.text().await.unwrap_or_default();
            return Err(RemoteAttempt::Permanent(format!("client error {status}: {text}")));
        }

        let parsed: Resp = response
            .json()
            .await
            .map_err(|e| RemoteAttempt::Permanent(format!("invalid response body: {e}")))?;

        Ok(parsed
            .data
            .into_iter()
            .map(|item| {
                let mut v = Vector::new(item.embedding);
                v.normalize();
                v
            })
            .collect())
    }
}

enum Backend {
    Local(Arc<LocalEmbedder>),
    Remote(RemoteEmbedder),
}

/// The embedding driver exposed to the rest of the pipeline. Applies the
/// model-family prefix table, query-side LRU caching, and backend dispatch.
pub struct Embedder {
    backend: Backend,
    model_id: String,
    query_cache: Mutex<LruCache<String, Vector>>,
}

impl Embedder {
    pub fn local(model_id: impl Into<String>, dims: usize) -> Result<Self, EmbedderError> {
        let model_id = model_id.into();
        let local = LocalEmbedder::new(&model_id, dims)?;
        Ok(Self::with_backend(model_id, Backend::Local(Arc::new(local))))
    }

    pub fn remote(model_id: impl Into<String>, cfg: RemoteConfig) -> Self {
        let model_id = model_id.into();
        Self::with_backend(model_id, Backend::Remote(RemoteEmbedder::new(cfg)))
    }

    fn with_backend(model_id: String, backend: Backend) -> Self {
        Self {
            backend,
            model_id,
            query_cache: Mutex::new(LruCache::new(NonZeroUsize::new(100).unwrap())),
        }
    }

    /// Embed a batch of document passages. Build time only — always applies
    /// the passage-side prefix.
    pub async fn embed_passages(&self, texts: &[String]) -> Result<Vec<Vector>, EmbedderError> {
        let prefix = prefixes_for(&self.model_id).passage;
        let prefixed: Vec<String> = texts.iter().map(|t| format!("{prefix}{t}")).collect();
        match &self.backend {
            Backend::Local(local) => {
                let local = Arc::clone(local);
                tokio::task::spawn_blocking(move || local.embed_batch(&prefixed))
                    .await
                    .map_err(|e| EmbedderError::InferenceFailed(e.to_string()))?
            }
            Backend::Remote(remote) => remote.embed_batch(&prefixed).await,
        }
    }

    /// Embed a single query. Query time only — always applies the query-side
    /// prefix, and is cached by the (unprefixed, trimmed) query text.
    pub async fn embed_query(&self, text: &str) -> Result<Vector, EmbedderError> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Err(EmbedderError::EmptyQuery);
        }

        if let Some(cached) = self
            .query_cache
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(trimmed)
        {
            return Ok(cached.clone());
        }

        let prefix = prefixes_for(&self.model_id).query;
        let prefixed = format!("{prefix}{trimmed}");
        let results = match &self.backend {
            Backend::Local(local) => {
                let local = Arc::clone(local);
                let prefixed = prefixed.clone();
                tokio::task::spawn_blocking(move || local.embed_batch(&[prefixed]))
                    .await
                    .map_err(|e| EmbedderError::InferenceFailed(e.to_string()))??
            }
            Backend::Remote(remote) => remote.embed_batch(&[prefixed]).await?,
        };
        let vector = results
            .into_iter()
            .next()
            .ok_or_else(|| EmbedderError::InferenceFailed("empty batch result".into()))?;

        self.query_cache
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .put(trimmed.to_string(), vector.clone());
        Ok(vector)
    }
}

fn ensure_model(model_id: &str) -> Result<(PathBuf, PathBuf), EmbedderError> {
    use hf_hub::api::sync::Api;

    let api = Api::new().map_err(|e| EmbedderError::HfHubError(e.to_string()))?;
    let repo = api.model(model_id.to_string());

    let model_path = repo
        .get("onnx/model.onnx")
        .map_err(|e| EmbedderError::HfHubError(e.to_string()))?;
    let tokenizer_path = repo
        .get("onnx/tokenizer.json")
        .map_err(|e| EmbedderError::HfHubError(e.to_string()))?;

    Ok((model_path, tokenizer_path))
}

fn select_provider() -> ExecutionProvider {
    use ort::ep::{TensorRT, CUDA};

    let cuda = CUDA::default();
    if cuda.is_available().unwrap_or(false) {
        return ExecutionProvider::CUDA { device_id: 0 };
    }
    let tensorrt = TensorRT::default();
    if tensorrt.is_available().unwrap_or(false) {
        return ExecutionProvider::TensorRT { device_id: 0 };
    }
    ExecutionProvider::CPU
}

fn create_session(model_path: &Path, provider: ExecutionProvider) -> Result<Session, EmbedderError> {
    use ort::ep::{TensorRT, CUDA};

    let builder = Session::builder()?;
    let session = match provider {
        ExecutionProvider::CUDA { device_id } => builder
            .with_execution_providers([CUDA::default().with_device_id(device_id).build()])?
            .commit_from_file(model_path)?,
        ExecutionProvider::TensorRT { device_id } => builder
            .with_execution_providers([
                TensorRT::default().with_device_id(device_id).build(),
                CUDA::default().with_device_id(device_id).build(),
            ])?
            .commit_from_file(model_path)?,
        ExecutionProvider::CPU => builder.commit_from_file(model_path)?,
    };
    Ok(session)
}

fn pad_2d_i64(inputs: &[Vec<i64>], max_len: usize, pad_value: i64) -> Array2<i64> {
    let batch_size = inputs.len();
    let mut arr = Array2::from_elem((batch_size, max_len), pad_value);
    for (i, seq) in inputs.iter().enumerate() {
        for (j, &val) in seq.iter().take(max_len).enumerate() {
            arr[[i, j]] = val;
        }
    }
    arr
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn e5_family_gets_query_passage_prefixes() {
        let p = prefixes_for("intfloat/e5-base-v2");
        assert_eq!(p.query, "query: ");
        assert_eq!(p.passage, "passage: ");
    }

    #[test]
    fn qwen_embedding_gets_instruct_query_prefix_and_no_passage_prefix() {
        let p = prefixes_for("Qwen/Qwen3-Embedding-0.6B");
        assert!(p.query.starts_with("Instruct:"));
        assert_eq!(p.passage, "");
    }

    #[test]
    fn embeddinggemma_gets_its_own_prefixes() {
        let p = prefixes_for("google/embeddinggemma-300m");
        assert_eq!(p.query, "task: search result | query: ");
        assert_eq!(p.passage, "title: none | text: ");
    }

    #[test]
    fn unknown_family_gets_no_prefixes() {
        let p = prefixes_for("some/other-model");
        assert_eq!(p.query, "");
        assert_eq!(p.passage, "");
    }

    #[tokio::test]
    async fn embed_query_rejects_empty_text() {
        let cfg = RemoteConfig {
            url: "http://127.0.0.1:1/v1/embeddings".into(),
            model: "test-model".into(),
            concurrency: 1,
            batch_size: 8,
        };
        let embedder = Embedder::remote("test-model", cfg);
        let err = embedder.embed_query("   ").await.unwrap_err();
        assert!(matches!(err, EmbedderError::EmptyQuery));
    }

    #[tokio::test]
    async fn remote_backend_retries_transient_then_succeeds() {
        let server = httpmock::MockServer::start();
        let dim = 4;
        let success_body = serde_json::json!({
            "data": [{ "embedding": vec![1.0f32; dim] }]
        });

        let fail_mock = server.mock(|when, then| {
            when.method(httpmock::Method::POST).path("/v1/embeddings");
            then.status(503);
        });

        // httpmock serves mocks in registration order per matching request;
        // delete the failing mock after first use and register the success
        // mock so the retry observes a different response.
        let cfg = RemoteConfig {
            url: server.url("/v1/embeddings"),
            model: "test-model".into(),
            concurrency: 1,
            batch_size: 8,
        };
        let remote = RemoteEmbedder::new(cfg);

        let texts = vec!["hello".to_string()];
        let first = remote.send_once(&texts).await;
        assert!(matches!(first, Err(RemoteAttempt::Transient(_))));
        fail_mock.delete();

        server.mock(|when, then| {
            when.method(httpmock::Method::POST).path("/v1/embeddings");
            then.status(200).json_body(success_body.clone());
        });
        let second = remote.send_once(&texts).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].dim(), dim);
    }

    #[tokio::test]
    async fn remote_backend_aborts_on_client_error_without_retry() {
        let server = httpmock::MockServer::start();
        server.mock(|when, then| {
            when.method(httpmock::Method::POST).path("/v1/embeddings");
            then.status(400).body("bad request");
        });

        let cfg = RemoteConfig {
            url: server.url("/v1/embeddings"),
            model: "test-model".into(),
            concurrency: 1,
            batch_size: 8,
        };
        let remote = RemoteEmbedder::new(cfg);
        let err = remote
            .send_with_retry(&["hello".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, EmbedderError::RemotePermanent(_)));
    }

    #[tokio::test]
    async fn remote_batch_embeddings_are_l2_normalized() {
        let server = httpmock::MockServer::start();
        server.mock(|when, then| {
            when.method(httpmock::Method::POST).path("/v1/embeddings");
            then.status(200).json_body(serde_json::json!({
                "data": [
                    { "embedding": [3.0, 4.0] },
                    { "embedding": [0.0, 0.0] }
                ]
            }));
        });

        let cfg = RemoteConfig {
            url: server.url("/v1/embeddings"),
            model: "test-model".into(),
            concurrency: 2,
            batch_size: 8,
        };
        let embedder = Embedder::remote("test-model", cfg);
        let out = embedder
            .embed_passages(&["a".to_string(), "b".to_string()])
            .await
            .unwrap();
        assert!((out[0].norm() - 1.0).abs() < 1e-5);
        assert_eq!(out[1].as_slice(), &[0.0, 0.0]);
    }

    /// Requires a real ONNX model download from the Hugging Face Hub.
    #[tokio::test]
    #[ignore]
    async fn local_backend_embeds_and_normalizes() {
        let embedder = Embedder::local("intfloat/e5-base-v2", 768).unwrap();
        let out = embedder
            .embed_passages(&["hello world".to_string()])
            .await
            .unwrap();
        assert_eq!(out[0].dim(), 768);
        assert!((out[0].norm() - 1.0).abs() < 1e-4);
    }
}
