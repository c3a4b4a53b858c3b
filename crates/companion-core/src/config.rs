//! ============================================================================
//! Configuration - Provider endpoints, store location, tuning knobs
//! ============================================================================
//! Deserializable with per-field defaults; `from_env()` builds a config from
//! environment variables (load a .env file with dotenvy before calling).
//! ============================================================================

use serde::{Deserialize, Serialize};

/// Configuration for the embedding provider client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// OpenAI-compatible base URL (e.g. https://api.openai.com/v1)
    #[serde(default = "default_embedding_base_url")]
    pub base_url: String,

    /// Embedding model name
    #[serde(default = "default_embedding_model")]
    pub model: String,

    /// Expected vector dimensionality; constant per provider configuration
    #[serde(default = "default_embedding_dim")]
    pub dimension: usize,

    /// API key; not serialized back out
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            base_url: default_embedding_base_url(),
            model: default_embedding_model(),
            dimension: default_embedding_dim(),
            api_key: None,
        }
    }
}

/// Configuration for the extraction model provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionConfig {
    /// OpenAI-compatible base URL for chat completions
    #[serde(default = "default_extraction_base_url")]
    pub base_url: String,

    /// Chat model used for memory extraction
    #[serde(default = "default_extraction_model")]
    pub model: String,

    /// API key; when absent the engine runs the keyword extractor only
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,

    /// Number of recent memories included in the extraction prompt
    #[serde(default = "default_context_memories")]
    pub max_context_memories: usize,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            base_url: default_extraction_base_url(),
            model: default_extraction_model(),
            api_key: None,
            max_context_memories: default_context_memories(),
        }
    }
}

/// Top-level configuration for the memory subsystem
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Qdrant endpoint URL
    #[serde(default = "default_qdrant_url")]
    pub qdrant_url: String,

    /// Qdrant collection name
    #[serde(default = "default_collection")]
    pub collection: String,

    #[serde(default)]
    pub embedding: EmbeddingConfig,

    #[serde(default)]
    pub extraction: ExtractionConfig,

    /// Minimum similarity score for retrieval (tuned per embedding model)
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f32,

    /// Maximum memories returned by search
    #[serde(default = "default_search_limit")]
    pub search_limit: u64,

    /// Recent memories fetched as reconciliation/extraction context
    #[serde(default = "default_recent_limit")]
    pub recent_limit: u64,

    /// Bounded timeout applied to every external call, in seconds
    #[serde(default = "default_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            qdrant_url: default_qdrant_url(),
            collection: default_collection(),
            embedding: EmbeddingConfig::default(),
            extraction: ExtractionConfig::default(),
            similarity_threshold: default_similarity_threshold(),
            search_limit: default_search_limit(),
            recent_limit: default_recent_limit(),
            request_timeout_secs: default_timeout_secs(),
        }
    }
}

impl MemoryConfig {
    /// Build a config from environment variables, falling back to defaults.
    ///
    /// Recognized variables: QDRANT_URL, MEMORY_COLLECTION,
    /// EMBEDDING_BASE_URL, EMBEDDING_MODEL, EMBEDDING_DIM, EMBEDDING_API_KEY,
    /// MODEL_BASE_URL, EXTRACTION_MODEL, MODEL_API_KEY,
    /// SIMILARITY_THRESHOLD, SEARCH_LIMIT, REQUEST_TIMEOUT_SECS.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(v) = std::env::var("QDRANT_URL") {
            cfg.qdrant_url = v;
        }
        if let Ok(v) = std::env::var("MEMORY_COLLECTION") {
            cfg.collection = v;
        }
        if let Ok(v) = std::env::var("EMBEDDING_BASE_URL") {
            cfg.embedding.base_url = v;
        }
        if let Ok(v) = std::env::var("EMBEDDING_MODEL") {
            cfg.embedding.model = v;
        }
        if let Ok(v) = std::env::var("EMBEDDING_DIM") {
            if let Ok(dim) = v.parse() {
                cfg.embedding.dimension = dim;
            }
        }
        if let Ok(v) = std::env::var("EMBEDDING_API_KEY") {
            if !v.is_empty() {
                cfg.embedding.api_key = Some(v);
            }
        }
        if let Ok(v) = std::env::var("MODEL_BASE_URL") {
            cfg.extraction.base_url = v;
        }
        if let Ok(v) = std::env::var("EXTRACTION_MODEL") {
            cfg.extraction.model = v;
        }
        if let Ok(v) = std::env::var("MODEL_API_KEY") {
            if !v.is_empty() {
                cfg.extraction.api_key = Some(v);
            }
        }
        if let Ok(v) = std::env::var("SIMILARITY_THRESHOLD") {
            if let Ok(t) = v.parse() {
                cfg.similarity_threshold = t;
            }
        }
        if let Ok(v) = std::env::var("SEARCH_LIMIT") {
            if let Ok(n) = v.parse() {
                cfg.search_limit = n;
            }
        }
        if let Ok(v) = std::env::var("REQUEST_TIMEOUT_SECS") {
            if let Ok(n) = v.parse() {
                cfg.request_timeout_secs = n;
            }
        }

        cfg
    }
}

fn default_qdrant_url() -> String {
    "http://localhost:6334".into()
}

fn default_collection() -> String {
    "companion_memories".into()
}

fn default_embedding_base_url() -> String {
    "https://api.openai.com/v1".into()
}

fn default_embedding_model() -> String {
    "text-embedding-3-small".into()
}

fn default_embedding_dim() -> usize {
    1536
}

fn default_extraction_base_url() -> String {
    "https://api.x.ai/v1".into()
}

fn default_extraction_model() -> String {
    "grok-3-mini".into()
}

fn default_context_memories() -> usize {
    10
}

fn default_similarity_threshold() -> f32 {
    crate::retrieval::DEFAULT_SIMILARITY_THRESHOLD
}

fn default_search_limit() -> u64 {
    5
}

fn default_recent_limit() -> u64 {
    50
}

fn default_timeout_secs() -> u64 {
    30
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = MemoryConfig::default();
        assert_eq!(cfg.collection, "companion_memories");
        assert_eq!(cfg.embedding.dimension, 1536);
        assert_eq!(cfg.search_limit, 5);
        assert!(cfg.similarity_threshold > 0.0 && cfg.similarity_threshold < 0.1);
        assert!(cfg.embedding.api_key.is_none());
    }

    #[test]
    fn test_partial_deserialization_fills_defaults() {
        let cfg: MemoryConfig =
            serde_json::from_str(r#"{"qdrant_url": "http://qdrant:6334"}"#).unwrap();
        assert_eq!(cfg.qdrant_url, "http://qdrant:6334");
        assert_eq!(cfg.embedding.model, "text-embedding-3-small");
        assert_eq!(cfg.extraction.max_context_memories, 10);
    }
}
