//! ============================================================================
//! Embedding Client - Vector embeddings for semantic memory search
//! ============================================================================
//! Wraps an OpenAI-compatible /embeddings endpoint. Every call carries a
//! bounded timeout; token usage is tracked with atomic counters so the
//! orchestrator can report estimated cost.
//! ============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::EmbeddingConfig;
use crate::error::{MemoryError, Result};

/// Default embedding model (OpenAI compatible)
pub const DEFAULT_EMBEDDING_MODEL: &str = "text-embedding-3-small";

/// Expected embedding dimension for text-embedding-3-small
pub const EMBEDDING_DIM: usize = 1536;

/// Cost per 1K tokens for the default embedding model, USD
const COST_PER_1K_TOKENS: f64 = 0.00002;

/// Cumulative provider usage at a point in time
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct UsageSnapshot {
    pub requests: u64,
    pub total_tokens: u64,
    pub estimated_cost: f64,
}

impl UsageSnapshot {
    /// Combine usage from several providers into one boundary report.
    pub fn merged(self, other: UsageSnapshot) -> UsageSnapshot {
        UsageSnapshot {
            requests: self.requests + other.requests,
            total_tokens: self.total_tokens + other.total_tokens,
            estimated_cost: self.estimated_cost + other.estimated_cost,
        }
    }

    /// Usage accrued since an earlier snapshot of the same counters. The
    /// counters are client-lifetime cumulative; boundary reports must carry
    /// only what the reported call actually spent.
    pub fn since(self, earlier: UsageSnapshot) -> UsageSnapshot {
        UsageSnapshot {
            requests: self.requests.saturating_sub(earlier.requests),
            total_tokens: self.total_tokens.saturating_sub(earlier.total_tokens),
            estimated_cost: (self.estimated_cost - earlier.estimated_cost).max(0.0),
        }
    }
}

/// Atomic usage counters shared across calls on one client
#[derive(Debug, Default)]
pub(crate) struct UsageCounters {
    requests: AtomicU64,
    tokens: AtomicU64,
}

impl UsageCounters {
    pub(crate) fn record(&self, tokens: u64) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.tokens.fetch_add(tokens, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self, cost_per_1k: f64) -> UsageSnapshot {
        let tokens = self.tokens.load(Ordering::Relaxed);
        UsageSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            total_tokens: tokens,
            estimated_cost: tokens as f64 / 1000.0 * cost_per_1k,
        }
    }
}

/// Embedding client for generating text vectors
pub struct EmbeddingClient {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
    dimension: usize,
    usage: UsageCounters,
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest {
    model: String,
    input: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
    model: String,
    usage: Option<EmbeddingUsage>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    index: usize,
}

#[derive(Debug, Deserialize)]
#[allow(dead_code)]
struct EmbeddingUsage {
    prompt_tokens: u32,
    total_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: ErrorDetail,
}

#[derive(Debug, Deserialize)]
#[allow(dead_code)]
struct ErrorDetail {
    message: String,
    #[serde(rename = "type")]
    error_type: Option<String>,
}

impl EmbeddingClient {
    /// Create an embedding client from config. Fails when no API key is set
    /// or the HTTP client cannot be constructed.
    pub fn new(config: &EmbeddingConfig, timeout: Duration) -> Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| MemoryError::Provider("no embedding API key configured".into()))?;

        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| MemoryError::Provider(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            api_key,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            dimension: config.dimension,
            usage: UsageCounters::default(),
        })
    }

    /// Create a client with an explicit key and base URL (tests, custom providers)
    pub fn new_custom(
        api_key: String,
        base_url: String,
        model: String,
        dimension: usize,
        timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| MemoryError::Provider(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
            dimension,
            usage: UsageCounters::default(),
        })
    }

    /// Generate embeddings for multiple texts
    pub async fn embed(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(vec![]);
        }

        debug!("Generating embeddings for {} texts", texts.len());

        let request = EmbeddingRequest {
            model: self.model.clone(),
            input: texts,
        };

        let response = self
            .client
            .post(format!("{}/embeddings", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(|e| MemoryError::Provider(format!("embedding request failed: {}", e)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| MemoryError::Provider(format!("failed to read response body: {}", e)))?;

        if !status.is_success() {
            if let Ok(error) = serde_json::from_str::<ErrorResponse>(&body) {
                return Err(MemoryError::Provider(format!(
                    "embedding API error ({}): {}",
                    status, error.error.message
                )));
            }
            return Err(MemoryError::Provider(format!(
                "embedding API error ({}): {}",
                status, body
            )));
        }

        let embedding_response: EmbeddingResponse = serde_json::from_str(&body).map_err(|e| {
            MemoryError::Parse(format!("failed to parse embedding response: {}", e))
        })?;

        if let Some(usage) = &embedding_response.usage {
            self.usage.record(usage.total_tokens as u64);
            debug!(
                "Embedding tokens used: {} (model: {})",
                usage.total_tokens, embedding_response.model
            );
        } else {
            self.usage.record(0);
        }

        // Sort by index and extract embeddings
        let mut embeddings: Vec<(usize, Vec<f32>)> = embedding_response
            .data
            .into_iter()
            .map(|d| (d.index, d.embedding))
            .collect();
        embeddings.sort_by_key(|(idx, _)| *idx);

        let vectors: Vec<Vec<f32>> = embeddings.into_iter().map(|(_, e)| e).collect();

        // Dimensionality must be constant per provider configuration
        for v in &vectors {
            if v.len() != self.dimension {
                return Err(MemoryError::Validation(format!(
                    "embedding dimension mismatch: expected {}, got {}",
                    self.dimension,
                    v.len()
                )));
            }
        }

        Ok(vectors)
    }

    /// Generate embedding for a single text
    pub async fn embed_single(&self, text: &str) -> Result<Vec<f32>> {
        let embeddings = self.embed(vec![text.to_string()]).await?;
        embeddings
            .into_iter()
            .next()
            .ok_or_else(|| MemoryError::Provider("no embedding returned".into()))
    }

    /// Expected vector dimensionality
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Current model name
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Base URL in use
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Cumulative usage for this client
    pub fn usage(&self) -> UsageSnapshot {
        self.usage.snapshot(COST_PER_1K_TOKENS)
    }
}

/// Cosine similarity between two vectors.
///
/// Returns 0.0 for mismatched lengths or zero-norm vectors rather than
/// propagating an error; retrieval treats that as "not relevant".
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        warn!(
            "cosine_similarity on mismatched vectors ({} vs {})",
            a.len(),
            b.len()
        );
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot / (norm_a * norm_b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_client(base_url: &str) -> EmbeddingClient {
        EmbeddingClient::new_custom(
            "test-key".to_string(),
            base_url.to_string(),
            DEFAULT_EMBEDDING_MODEL.to_string(),
            3,
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[test]
    fn test_client_requires_api_key() {
        let cfg = EmbeddingConfig::default();
        assert!(EmbeddingClient::new(&cfg, Duration::from_secs(5)).is_err());
    }

    #[test]
    fn test_cosine_self_similarity_is_maximal() {
        let v = vec![0.3, -0.7, 0.2, 0.9];
        let sim = cosine_similarity(&v, &v);
        assert!((sim - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_symmetry() {
        let a = vec![0.1, 0.5, -0.3];
        let b = vec![0.7, -0.2, 0.4];
        assert!((cosine_similarity(&a, &b) - cosine_similarity(&b, &a)).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_degenerate_inputs() {
        assert_eq!(cosine_similarity(&[0.1, 0.2], &[0.1]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
    }

    #[tokio::test]
    async fn test_empty_input() {
        let client = test_client("http://localhost:1");
        let result = client.embed(vec![]).await;
        assert!(result.is_ok());
        assert!(result.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_embed_parses_response_and_tracks_usage() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .and(header("Authorization", "Bearer test-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [
                    {"embedding": [0.0, 1.0, 0.0], "index": 1},
                    {"embedding": [1.0, 0.0, 0.0], "index": 0}
                ],
                "model": "text-embedding-3-small",
                "usage": {"prompt_tokens": 7, "total_tokens": 7}
            })))
            .mount(&server)
            .await;

        let client = test_client(&server.uri());
        let vectors = client
            .embed(vec!["a".to_string(), "b".to_string()])
            .await
            .unwrap();

        // Results come back sorted by index regardless of wire order
        assert_eq!(vectors[0], vec![1.0, 0.0, 0.0]);
        assert_eq!(vectors[1], vec![0.0, 1.0, 0.0]);

        let usage = client.usage();
        assert_eq!(usage.requests, 1);
        assert_eq!(usage.total_tokens, 7);
        assert!(usage.estimated_cost > 0.0);
    }

    // The counters are shared across every call on the client (including
    // retrieval's query embeddings); per-call reporting must delta against a
    // snapshot rather than re-report the cumulative totals.
    #[tokio::test]
    async fn test_usage_since_reports_only_new_calls() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [{"embedding": [0.1, 0.2, 0.3], "index": 0}],
                "model": "text-embedding-3-small",
                "usage": {"prompt_tokens": 7, "total_tokens": 7}
            })))
            .mount(&server)
            .await;

        let client = test_client(&server.uri());
        client.embed_single("first").await.unwrap();
        let mid = client.usage();
        client.embed_single("second").await.unwrap();

        let second_only = client.usage().since(mid);
        assert_eq!(second_only.requests, 1);
        assert_eq!(second_only.total_tokens, 7);
        assert_eq!(client.usage().total_tokens, 14);
    }

    #[tokio::test]
    async fn test_embed_dimension_mismatch_is_validation_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [{"embedding": [0.1, 0.2], "index": 0}],
                "model": "text-embedding-3-small",
                "usage": {"prompt_tokens": 2, "total_tokens": 2}
            })))
            .mount(&server)
            .await;

        let client = test_client(&server.uri());
        let err = client.embed_single("hi").await.unwrap_err();
        assert!(matches!(err, MemoryError::Validation(_)));
    }

    #[tokio::test]
    async fn test_provider_error_mapping() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .respond_with(ResponseTemplate::new(401).set_body_json(serde_json::json!({
                "error": {"message": "bad key", "type": "auth"}
            })))
            .mount(&server)
            .await;

        let client = test_client(&server.uri());
        let err = client.embed_single("hi").await.unwrap_err();
        assert!(matches!(err, MemoryError::Provider(_)));
        assert!(err.to_string().contains("bad key"));
    }
}
