//! Embedding collaborator contract and providers.
//!
//! The engine consumes embeddings through the [`Embedder`] trait: a batch
//! of texts goes in, one result per text comes out, in input order. A
//! whole call may fail (network, timeout, rate limit), which is reported
//! as a retryable [`SyncError::Transient`]; individual items may also be
//! rejected (malformed or oversized input), which is reported per item so
//! the rest of the batch still goes through.
//!
//! Providers:
//! - **[`HashEmbedder`]**: deterministic feature-hashing bag of words. No
//!   network; used in tests and for offline indexes.
//! - **[`OpenAIEmbedder`]**: `POST /v1/embeddings`.
//! - **[`OllamaEmbedder`]**: `POST /api/embed` on a local Ollama.
//!
//! Retries are not done here; callers wrap [`Embedder::embed`] in a
//! [`Backoff`](crate::retry::Backoff).
//!
//! Also provides vector utilities:
//! - [`cosine_similarity`] for ranking
//! - [`vec_to_blob`] / [`blob_to_vec`] for SQLite BLOB storage

use anyhow::{bail, Result};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::time::Duration;

use crate::config::EmbeddingConfig;
use crate::error::{SyncError, SyncResult};

/// Outcome for one input text.
pub type ItemEmbedding = std::result::Result<Vec<f32>, String>;

#[async_trait]
pub trait Embedder: Send + Sync {
    /// Model identifier (e.g. `"text-embedding-3-small"`).
    fn model_name(&self) -> &str;

    /// Output dimensionality; fixed per model.
    fn dims(&self) -> usize;

    /// Embed `texts`. The returned vector has exactly `texts.len()` entries.
    async fn embed(&self, texts: &[String]) -> SyncResult<Vec<ItemEmbedding>>;
}

/// Embed a single query text.
pub async fn embed_query(embedder: &dyn Embedder, text: &str) -> SyncResult<Vec<f32>> {
    let mut results = embedder.embed(&[text.to_string()]).await?;
    match results.pop() {
        Some(Ok(vector)) => Ok(vector),
        Some(Err(reason)) => Err(SyncError::Other(anyhow::anyhow!(
            "query embedding rejected: {}",
            reason
        ))),
        None => Err(SyncError::Other(anyhow::anyhow!("Empty embedding response"))),
    }
}

// ============ Hash Embedder ============

/// Deterministic bag-of-words embedder.
///
/// Every lowercase alphanumeric token is hashed into one of `dims`
/// buckets with a sign bit; the result is L2-normalized. Texts sharing
/// vocabulary land close together, which is enough for reproducible
/// retrieval tests and small offline deployments.
pub struct HashEmbedder {
    dims: usize,
}

impl HashEmbedder {
    pub fn new(dims: usize) -> Self {
        Self { dims: dims.max(1) }
    }

    pub fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dims];
        for token in tokenize(text) {
            let digest = Sha256::digest(token.as_bytes());
            let mut bucket = [0u8; 8];
            bucket.copy_from_slice(&digest[..8]);
            let index = (u64::from_le_bytes(bucket) % self.dims as u64) as usize;
            let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
            v[index] += sign;
        }
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > f32::EPSILON {
            for x in &mut v {
                *x /= norm;
            }
        }
        v
    }
}

fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
}

#[async_trait]
impl Embedder for HashEmbedder {
    fn model_name(&self) -> &str {
        "hash"
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> SyncResult<Vec<ItemEmbedding>> {
        Ok(texts.iter().map(|t| Ok(self.embed_one(t))).collect())
    }
}

// ============ HTTP providers ============

/// One HTTP attempt outcome, before per-item isolation.
enum CallError {
    /// 429, 5xx or network failure.
    Transient(String),
    /// Any other 4xx: the request itself was refused.
    Rejected(String),
}

fn http_client(timeout_secs: u64) -> SyncResult<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| SyncError::Other(e.into()))
}

async fn post_json(
    request: reqwest::RequestBuilder,
    label: &str,
) -> std::result::Result<serde_json::Value, CallError> {
    let response = request
        .send()
        .await
        .map_err(|e| CallError::Transient(format!("{} connection error: {}", label, e)))?;
    let status = response.status();

    if status.is_success() {
        return response
            .json()
            .await
            .map_err(|e| CallError::Transient(format!("{} response decode error: {}", label, e)));
    }

    let body_text = response.text().await.unwrap_or_default();
    let message = format!("{} API error {}: {}", label, status, body_text);
    if status.as_u16() == 429 || status.is_server_error() {
        Err(CallError::Transient(message))
    } else {
        Err(CallError::Rejected(message))
    }
}

/// Run `call` on the whole batch; if the provider refuses the batch,
/// retry item by item so one bad input cannot sink its neighbours.
async fn embed_isolating<F, Fut>(
    collaborator: &'static str,
    texts: &[String],
    call: F,
) -> SyncResult<Vec<ItemEmbedding>>
where
    F: Fn(Vec<String>) -> Fut,
    Fut: std::future::Future<Output = std::result::Result<Vec<Vec<f32>>, CallError>>,
{
    match call(texts.to_vec()).await {
        Ok(vectors) if vectors.len() == texts.len() => Ok(vectors.into_iter().map(Ok).collect()),
        Ok(vectors) => Err(SyncError::transient(
            collaborator,
            format!("expected {} embeddings, got {}", texts.len(), vectors.len()),
        )),
        Err(CallError::Transient(msg)) => Err(SyncError::transient(collaborator, msg)),
        Err(CallError::Rejected(msg)) if texts.len() == 1 => Ok(vec![Err(msg)]),
        Err(CallError::Rejected(_)) => {
            let mut out = Vec::with_capacity(texts.len());
            for text in texts {
                match call(vec![text.clone()]).await {
                    Ok(mut v) if v.len() == 1 => out.push(Ok(v.remove(0))),
                    Ok(_) => out.push(Err("malformed embedding response".to_string())),
                    Err(CallError::Rejected(msg)) => out.push(Err(msg)),
                    Err(CallError::Transient(msg)) => {
                        return Err(SyncError::transient(collaborator, msg))
                    }
                }
            }
            Ok(out)
        }
    }
}

/// Embedder backed by the OpenAI embeddings API.
///
/// Requires the `OPENAI_API_KEY` environment variable.
pub struct OpenAIEmbedder {
    model: String,
    dims: usize,
    api_key: String,
    client: reqwest::Client,
}

impl OpenAIEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for OpenAI provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow::anyhow!("embedding.dims required for OpenAI provider"))?;
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))?;

        Ok(Self {
            model,
            dims,
            api_key,
            client: http_client(config.timeout_secs)?,
        })
    }

    async fn call(&self, input: Vec<String>) -> std::result::Result<Vec<Vec<f32>>, CallError> {
        let body = serde_json::json!({ "model": self.model, "input": input });
        let request = self
            .client
            .post("https://api.openai.com/v1/embeddings")
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body);
        let json = post_json(request, "OpenAI").await?;
        parse_openai_response(&json).map_err(|e| CallError::Transient(e.to_string()))
    }
}

#[async_trait]
impl Embedder for OpenAIEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> SyncResult<Vec<ItemEmbedding>> {
        embed_isolating("openai", texts, |input| self.call(input)).await
    }
}

/// Extract `data[].embedding`, ordered by `data[].index`.
fn parse_openai_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| anyhow::anyhow!("Invalid OpenAI response: missing data array"))?;

    let mut indexed = Vec::with_capacity(data.len());
    for (position, item) in data.iter().enumerate() {
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| anyhow::anyhow!("Invalid OpenAI response: missing embedding"))?;
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(position);
        indexed.push((index, json_floats(embedding)));
    }

    indexed.sort_by_key(|(i, _)| *i);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

/// Embedder backed by a local Ollama instance (`/api/embed`).
pub struct OllamaEmbedder {
    model: String,
    dims: usize,
    url: String,
    client: reqwest::Client,
}

impl OllamaEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for Ollama provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow::anyhow!("embedding.dims required for Ollama provider"))?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| "http://localhost:11434".to_string());

        Ok(Self {
            model,
            dims,
            url,
            client: http_client(config.timeout_secs)?,
        })
    }

    async fn call(&self, input: Vec<String>) -> std::result::Result<Vec<Vec<f32>>, CallError> {
        let body = serde_json::json!({ "model": self.model, "input": input });
        let request = self
            .client
            .post(format!("{}/api/embed", self.url))
            .json(&body);
        let json = post_json(request, "Ollama").await?;
        parse_ollama_response(&json).map_err(|e| CallError::Transient(e.to_string()))
    }
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> SyncResult<Vec<ItemEmbedding>> {
        embed_isolating("ollama", texts, |input| self.call(input)).await
    }
}

fn parse_ollama_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let embeddings = json
        .get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| anyhow::anyhow!("Invalid Ollama response: missing embeddings array"))?;

    embeddings
        .iter()
        .map(|e| {
            e.as_array()
                .map(|a| json_floats(a))
                .ok_or_else(|| anyhow::anyhow!("Invalid Ollama response: embedding is not an array"))
        })
        .collect()
}

fn json_floats(values: &[serde_json::Value]) -> Vec<f32> {
    values
        .iter()
        .map(|v| v.as_f64().unwrap_or(0.0) as f32)
        .collect()
}

/// Build the configured [`Embedder`].
///
/// | `provider` | Embedder |
/// |------------|----------|
/// | `"hash"`   | [`HashEmbedder`] (`dims` defaults to 256) |
/// | `"openai"` | [`OpenAIEmbedder`] |
/// | `"ollama"` | [`OllamaEmbedder`] |
///
/// `"disabled"` is an error: the engine cannot index without vectors.
pub fn create_embedder(config: &EmbeddingConfig) -> Result<Box<dyn Embedder>> {
    match config.provider.as_str() {
        "hash" => Ok(Box::new(HashEmbedder::new(config.dims.unwrap_or(256)))),
        "openai" => Ok(Box::new(OpenAIEmbedder::new(config)?)),
        "ollama" => Ok(Box::new(OllamaEmbedder::new(config)?)),
        "disabled" => bail!(
            "Embedding provider is disabled. Set [embedding] provider to hash, openai, or ollama."
        ),
        other => bail!("Unknown embedding provider: {}", other),
    }
}

/// Encode a float vector as little-endian `f32` bytes.
///
/// ```rust
/// use kb_sync::embedding::{blob_to_vec, vec_to_blob};
///
/// let v = vec![1.0f32, -2.5, 3.125];
/// let blob = vec_to_blob(&v);
/// assert_eq!(blob.len(), 12);
/// assert_eq!(blob_to_vec(&blob), v);
/// ```
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Reverse of [`vec_to_blob`]. Trailing bytes that do not form a whole
/// `f32` are ignored.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

/// Cosine similarity in `[-1.0, 1.0]`; `0.0` for empty, zero or
/// mismatched-length vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let (mut dot, mut norm_a, mut norm_b) = (0.0f32, 0.0f32, 0.0f32);
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }
    dot / denom
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hash_embedder_is_deterministic_and_normalized() {
        let e = HashEmbedder::new(64);
        let texts = vec!["Rotate the signing keys".to_string(), "".to_string()];
        let a = e.embed(&texts).await.unwrap();
        let b = e.embed(&texts).await.unwrap();
        assert_eq!(a, b);

        let v = a[0].as_ref().unwrap();
        assert_eq!(v.len(), 64);
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);

        // Empty text embeds to the zero vector rather than failing.
        assert!(a[1].as_ref().unwrap().iter().all(|x| *x == 0.0));
    }

    #[test]
    fn hash_embedder_ranks_shared_vocabulary_higher() {
        let e = HashEmbedder::new(256);
        let q = e.embed_one("database backup schedule");
        let near = e.embed_one("The database backup schedule runs nightly");
        let far = e.embed_one("Holiday party in the cafeteria");
        assert!(cosine_similarity(&q, &near) > cosine_similarity(&q, &far));
    }

    #[test]
    fn openai_response_is_reordered_by_index() {
        let json = serde_json::json!({
            "data": [
                {"index": 1, "embedding": [2.0, 2.0]},
                {"index": 0, "embedding": [1.0, 1.0]},
            ]
        });
        let v = parse_openai_response(&json).unwrap();
        assert_eq!(v, vec![vec![1.0, 1.0], vec![2.0, 2.0]]);
    }

    #[test]
    fn ollama_response_requires_embeddings() {
        assert!(parse_ollama_response(&serde_json::json!({})).is_err());
        let v = parse_ollama_response(&serde_json::json!({"embeddings": [[0.5]]})).unwrap();
        assert_eq!(v, vec![vec![0.5]]);
    }

    #[tokio::test]
    async fn rejected_batch_is_isolated_per_item() {
        let texts = vec!["ok".to_string(), "bad".to_string(), "ok too".to_string()];
        let out = embed_isolating("test", &texts, |input: Vec<String>| async move {
            if input.len() > 1 || input[0] == "bad" {
                Err(CallError::Rejected("400 bad input".to_string()))
            } else {
                Ok(vec![vec![1.0]])
            }
        })
        .await
        .unwrap();
        assert!(out[0].is_ok());
        assert_eq!(out[1], Err("400 bad input".to_string()));
        assert!(out[2].is_ok());
    }

    #[tokio::test]
    async fn transient_failure_fails_the_call() {
        let texts = vec!["a".to_string()];
        let err = embed_isolating("test", &texts, |_| async {
            Err::<Vec<Vec<f32>>, _>(CallError::Transient("503".to_string()))
        })
        .await
        .unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn disabled_provider_cannot_be_created() {
        assert!(create_embedder(&EmbeddingConfig::default()).is_err());
    }

    #[test]
    fn test_vec_blob_roundtrip() {
        let vec = vec![1.0f32, -2.5, 3.125, 0.0, -0.001];
        assert_eq!(blob_to_vec(&vec_to_blob(&vec)), vec);
    }

    #[test]
    fn test_cosine_edge_cases() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert!((cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
    }
}
