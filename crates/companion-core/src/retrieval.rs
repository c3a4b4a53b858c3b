//! ============================================================================
//! Retrieval Service - Threshold-tuned semantic search over the store
//! ============================================================================
//! Embeds a query, runs one owner-scoped similarity search, filters by
//! threshold, and returns ranked snippets with diagnostics. Retrieval never
//! raises to the caller: embedding or store failure yields an empty result
//! and the agent proceeds with zero memories.
//! ============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, warn};

use crate::embeddings::EmbeddingClient;
use crate::store::{MemoryStore, ScoredMemory};
use crate::types::{MemoryType, OwnerScope};

/// Minimum cosine-similarity score for a stored memory to count as relevant.
///
/// Empirically tuned against this embedding space, where relevant matches
/// score roughly 0.03-0.51: an "intuitive" threshold like 0.65 returns
/// nothing. Re-derive this constant whenever the embedding provider changes.
pub const DEFAULT_SIMILARITY_THRESHOLD: f32 = 0.02;

/// Default number of memories returned by search
pub const DEFAULT_SEARCH_LIMIT: u64 = 5;

/// Query-embedding cache capacity; cleared wholesale when exceeded
const EMBEDDING_CACHE_CAPACITY: usize = 256;

/// Search parameters; defaults mirror the tuned production values
#[derive(Debug, Clone)]
pub struct SearchOptions {
    pub threshold: f32,
    pub limit: u64,
    pub type_filter: Option<MemoryType>,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_SIMILARITY_THRESHOLD,
            limit: DEFAULT_SEARCH_LIMIT,
            type_filter: None,
        }
    }
}

/// Per-search diagnostics surfaced at the boundary
#[derive(Debug, Clone, Serialize)]
pub struct SearchDiagnostics {
    /// Matches surviving threshold and limit
    pub total_found: usize,
    /// Mean search latency across this service's lifetime, milliseconds
    pub average_latency_ms: f64,
    /// Query-embedding cache hit ratio across this service's lifetime
    pub cache_hit_ratio: f32,
}

/// Retrieval service over the memory store
pub struct RetrievalService {
    store: Arc<MemoryStore>,
    embeddings: Arc<EmbeddingClient>,
    query_cache: Mutex<HashMap<String, Vec<f32>>>,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    total_latency_ms: AtomicU64,
    searches: AtomicU64,
}

impl RetrievalService {
    pub fn new(store: Arc<MemoryStore>, embeddings: Arc<EmbeddingClient>) -> Self {
        Self {
            store,
            embeddings,
            query_cache: Mutex::new(HashMap::new()),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            total_latency_ms: AtomicU64::new(0),
            searches: AtomicU64::new(0),
        }
    }

    /// Ranked, threshold-filtered semantic search scoped to one owner.
    ///
    /// Never fails; any provider or store error is logged and an empty
    /// result is returned with diagnostics.
    pub async fn search(
        &self,
        query: &str,
        owner: &OwnerScope,
        options: &SearchOptions,
    ) -> (Vec<ScoredMemory>, SearchDiagnostics) {
        let started = Instant::now();

        let embedding = match self.query_embedding(query).await {
            Some(e) => e,
            None => return (Vec::new(), self.finish(started, 0)),
        };

        let hits = match self
            .store
            .search_scored(
                owner,
                embedding,
                options.limit,
                options.threshold,
                options.type_filter,
            )
            .await
        {
            Ok(hits) => hits,
            Err(e) => {
                warn!("Memory search failed, returning zero memories: {}", e);
                return (Vec::new(), self.finish(started, 0));
            }
        };

        // The store already applies the threshold; rank and cap locally so
        // ordering never depends on the datastore's insertion order.
        let ranked = rank_and_filter(hits, options.threshold, options.limit as usize);
        let diagnostics = self.finish(started, ranked.len());

        debug!(
            "Search for owner {} returned {} memories",
            owner, diagnostics.total_found
        );

        (ranked, diagnostics)
    }

    /// Embed a query through the bounded cache. Returns None on provider
    /// failure (already logged).
    async fn query_embedding(&self, query: &str) -> Option<Vec<f32>> {
        if let Some(cached) = self
            .query_cache
            .lock()
            .ok()
            .and_then(|cache| cache.get(query).cloned())
        {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
            return Some(cached);
        }
        self.cache_misses.fetch_add(1, Ordering::Relaxed);

        match self.embeddings.embed_single(query).await {
            Ok(embedding) => {
                if let Ok(mut cache) = self.query_cache.lock() {
                    if cache.len() >= EMBEDDING_CACHE_CAPACITY {
                        cache.clear();
                    }
                    cache.insert(query.to_string(), embedding.clone());
                }
                Some(embedding)
            }
            Err(e) => {
                warn!("Query embedding failed, returning zero memories: {}", e);
                None
            }
        }
    }

    fn finish(&self, started: Instant, total_found: usize) -> SearchDiagnostics {
        let elapsed_ms = started.elapsed().as_millis() as u64;
        self.total_latency_ms.fetch_add(elapsed_ms, Ordering::Relaxed);
        let searches = self.searches.fetch_add(1, Ordering::Relaxed) + 1;

        let hits = self.cache_hits.load(Ordering::Relaxed);
        let misses = self.cache_misses.load(Ordering::Relaxed);

        SearchDiagnostics {
            total_found,
            average_latency_ms: self.total_latency_ms.load(Ordering::Relaxed) as f64
                / searches as f64,
            cache_hit_ratio: cache_hit_ratio(hits, misses),
        }
    }
}

/// Drop hits below the threshold, rank the rest by score descending, cap at
/// `limit`. Pure; the ranking contract of the subsystem.
pub fn rank_and_filter(
    mut hits: Vec<ScoredMemory>,
    threshold: f32,
    limit: usize,
) -> Vec<ScoredMemory> {
    hits.retain(|h| h.score >= threshold);
    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    hits.truncate(limit);
    hits
}

fn cache_hit_ratio(hits: u64, misses: u64) -> f32 {
    let total = hits + misses;
    if total == 0 {
        0.0
    } else {
        hits as f32 / total as f32
    }
}

/// Format ranked snippets for prompt injection by the orchestration consumer.
pub fn format_snippets_for_prompt(memories: &[ScoredMemory]) -> String {
    if memories.is_empty() {
        return String::new();
    }

    let mut formatted = String::from("\n<user_context>\nWhat you remember about this user:\n");

    for scored in memories {
        formatted.push_str(&format!(
            "- [{}] {}\n",
            scored.memory.memory_type.display_name(),
            scored.memory.text
        ));
    }

    formatted.push_str("</user_context>\n");
    formatted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MemoryRecord, MemoryType, OwnerScope};

    fn scored(text: &str, score: f32) -> ScoredMemory {
        ScoredMemory {
            memory: MemoryRecord::new(
                OwnerScope::new("u1", "c1"),
                text,
                MemoryType::Semantic,
                0.5,
            ),
            score,
        }
    }

    #[test]
    fn test_rank_and_filter_fixture_scores() {
        // Fixture distribution from threshold tuning: only 0.01 falls below
        let hits = vec![
            scored("a", 0.04),
            scored("b", 0.51),
            scored("c", 0.01),
            scored("d", 0.29),
        ];

        let ranked = rank_and_filter(hits, DEFAULT_SIMILARITY_THRESHOLD, 5);

        assert_eq!(ranked.len(), 3);
        assert_eq!(ranked[0].score, 0.51);
        assert_eq!(ranked[1].score, 0.29);
        assert_eq!(ranked[2].score, 0.04);
    }

    #[test]
    fn test_rank_and_filter_respects_limit() {
        let hits = vec![scored("a", 0.5), scored("b", 0.4), scored("c", 0.3)];
        let ranked = rank_and_filter(hits, 0.02, 2);
        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].score, 0.5);
    }

    #[test]
    fn test_naive_high_threshold_returns_nothing() {
        // The defect a 0.65 "intuitive" threshold causes in this space
        let hits = vec![scored("a", 0.51), scored("b", 0.29), scored("c", 0.04)];
        assert!(rank_and_filter(hits, 0.65, 5).is_empty());
    }

    #[test]
    fn test_cache_hit_ratio() {
        assert_eq!(cache_hit_ratio(0, 0), 0.0);
        assert_eq!(cache_hit_ratio(1, 1), 0.5);
        assert_eq!(cache_hit_ratio(3, 1), 0.75);
    }

    #[test]
    fn test_format_snippets() {
        let snippets = vec![scored("User works at Acme", 0.4)];
        let formatted = format_snippets_for_prompt(&snippets);
        assert!(formatted.contains("User works at Acme"));
        assert!(formatted.contains("[Fact]"));
        assert!(formatted.contains("<user_context>"));

        assert!(format_snippets_for_prompt(&[]).is_empty());
    }
}
