//! Embedding providers.
//!
//! The directive generator and the knowledge curator never compute
//! embeddings themselves; they go through [`EmbeddingProvider`].
//!
//! | Provider | Use |
//! |---|---|
//! | [`HashingEmbedder`] | Deterministic bag-of-words feature hashing. Default; no network. |
//! | [`HttpEmbedder`] | Any OpenAI-compatible `/v1/embeddings` endpoint (Ollama, vLLM, …). |
//!
//! # Example
//!
//! ```rust,no_run
//! use mothership_runtime::providers::{EmbeddingProvider, HttpEmbedder};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let embedder = HttpEmbedder::new("http://localhost:11434", "nomic-embed-text");
//! let vector = embedder.embed("math: solve 2x+3=7").await?;
//! # Ok(()) }
//! ```

use async_trait::async_trait;
use mothership_types::MothershipError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ─────────────────────────────────────────────────────────────────────────────
// Error type
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Unexpected response format: {0}")]
    BadResponse(String),
}

impl From<ProviderError> for MothershipError {
    fn from(err: ProviderError) -> Self {
        MothershipError::Provider(err.to_string())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Trait
// ─────────────────────────────────────────────────────────────────────────────

/// Maps text to a dense vector. Implementations must return vectors of a
/// fixed dimension for the lifetime of a knowledge base.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError>;
}

// ─────────────────────────────────────────────────────────────────────────────
// HashingEmbedder
// ─────────────────────────────────────────────────────────────────────────────

/// 64-bit FNV-1a. Stable across processes and platforms.
pub(crate) fn fnv1a64(bytes: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    bytes.iter().fold(OFFSET, |hash, b| (hash ^ u64::from(*b)).wrapping_mul(PRIME))
}

/// Bag-of-words feature hashing into `dims` buckets, L2-normalised.
///
/// Texts sharing words land close together; texts sharing nothing are
/// (nearly) orthogonal. Good enough to route directives without a model.
#[derive(Debug, Clone, Copy)]
pub struct HashingEmbedder {
    dims: usize,
}

impl HashingEmbedder {
    pub const DEFAULT_DIMS: usize = 256;

    pub fn new(dims: usize) -> Self {
        Self { dims: dims.max(1) }
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    pub fn embed_sync(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dims];
        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let token = token.to_lowercase();
            let bucket = (fnv1a64(token.as_bytes()) % self.dims as u64) as usize;
            vector[bucket] += 1.0;
        }
        let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            vector.iter_mut().for_each(|x| *x /= norm);
        }
        vector
    }
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(Self::DEFAULT_DIMS)
    }
}

#[async_trait]
impl EmbeddingProvider for HashingEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        Ok(self.embed_sync(text))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// HttpEmbedder
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a str,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Deserialize)]
struct EmbeddingDatum {
    embedding: Vec<f32>,
}

/// Client for an OpenAI-compatible `/v1/embeddings` endpoint.
pub struct HttpEmbedder {
    base_url: String,
    model: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl HttpEmbedder {
    /// `base_url` without the `/v1` suffix, e.g. `"http://localhost:11434"`.
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            api_key: None,
            client: reqwest::Client::new(),
        }
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn endpoint(&self) -> String {
        format!("{}/v1/embeddings", self.base_url)
    }
}

#[async_trait]
impl EmbeddingProvider for HttpEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        let body = EmbeddingRequest {
            model: &self.model,
            input: text,
        };
        let mut request = self.client.post(self.endpoint()).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response: EmbeddingResponse = request
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let embedding = response
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| ProviderError::BadResponse("empty data array".into()))?;
        if embedding.is_empty() {
            return Err(ProviderError::BadResponse("empty embedding".into()));
        }
        Ok(embedding)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cosine(a: &[f32], b: &[f32]) -> f32 {
        a.iter().zip(b).map(|(x, y)| x * y).sum()
    }

    #[test]
    fn fnv_is_stable() {
        assert_eq!(fnv1a64(b""), 0xcbf2_9ce4_8422_2325);
        assert_eq!(fnv1a64(b"a"), 0xaf63_dc4c_8601_ec8c);
    }

    #[test]
    fn hashing_is_deterministic_and_normalised() {
        let e = HashingEmbedder::default();
        let a = e.embed_sync("Solve the Math problem");
        let b = e.embed_sync("solve the math PROBLEM");
        assert_eq!(a, b);
        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn shared_words_raise_similarity() {
        let e = HashingEmbedder::default();
        let query = e.embed_sync("math: solve 2x+3=7");
        let related = e.embed_sync("Explain how to solve each math problem step by step");
        let unrelated = e.embed_sync("Weather forecast for tomorrow afternoon");
        assert!(cosine(&query, &related) > cosine(&query, &unrelated));
    }

    #[test]
    fn blank_text_is_zero_vector() {
        let v = HashingEmbedder::new(8).embed_sync("  ,, ");
        assert!(v.iter().all(|x| *x == 0.0));
    }

    #[test]
    fn endpoint_strips_trailing_slash() {
        let e = HttpEmbedder::new("http://localhost:11434/", "nomic-embed-text");
        assert_eq!(e.endpoint(), "http://localhost:11434/v1/embeddings");
    }

    #[test]
    fn provider_error_maps_to_provider_kind() {
        let err: MothershipError = ProviderError::BadResponse("x".into()).into();
        assert_eq!(err.kind(), "provider");
    }
}
