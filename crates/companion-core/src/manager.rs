//! ============================================================================
//! Memory Manager - Orchestration boundary for the memory subsystem
//! ============================================================================
//! Wires the embedding client, store, extraction engine, reconciliation
//! controller, and retrieval service into the operations the orchestration
//! consumer calls: process_exchange, search, health_check, plus owner-scoped
//! maintenance. Extraction and retrieval are independent; callers may run
//! them concurrently on the same manager.
//! ============================================================================

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::MemoryConfig;
use crate::embeddings::{EmbeddingClient, UsageSnapshot};
use crate::error::Result;
use crate::extraction::ExtractionEngine;
use crate::reconcile::ReconciliationController;
use crate::retrieval::{RetrievalService, SearchDiagnostics, SearchOptions};
use crate::store::{CollectionStats, MemoryStore, ScoredMemory};
use crate::types::{
    ExtractionMethod, MemoryRecord, OwnerScope, ProcessingMetrics, UpdateOperation,
};

/// Outcome of processing one message exchange
#[derive(Debug, Clone, Serialize)]
pub struct ExchangeOutcome {
    /// Ids persisted by ADD/UPDATE, in candidate order
    pub stored_ids: Vec<Uuid>,
    /// Decision taken for each candidate, in candidate order
    pub operations: Vec<UpdateOperation>,
    pub method: ExtractionMethod,
    pub confidence: f32,
    pub requires_validation: bool,
    pub metrics: ProcessingMetrics,
    /// Provider usage accrued by this exchange (embedding + extraction model)
    pub usage: UsageSnapshot,
}

/// Outcome of one semantic search
#[derive(Debug, Clone, Serialize)]
pub struct SearchOutcome {
    pub memories: Vec<ScoredMemory>,
    pub diagnostics: SearchDiagnostics,
}

/// Subsystem health
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub details: Vec<String>,
}

/// Memory manager combining extraction, reconciliation, and retrieval
pub struct MemoryManager {
    store: Arc<MemoryStore>,
    embeddings: Arc<EmbeddingClient>,
    extraction: ExtractionEngine,
    reconciler: ReconciliationController,
    retrieval: RetrievalService,
    config: MemoryConfig,
}

impl MemoryManager {
    /// Create a manager from config. Fails only when a provider client
    /// cannot be constructed or the store is unreachable at startup.
    pub async fn new(config: MemoryConfig) -> Result<Self> {
        let timeout = Duration::from_secs(config.request_timeout_secs);

        let embeddings = Arc::new(EmbeddingClient::new(&config.embedding, timeout)?);
        let store = Arc::new(
            MemoryStore::new(
                &config.qdrant_url,
                &config.collection,
                config.embedding.dimension,
                timeout,
            )
            .await?,
        );
        let extraction = ExtractionEngine::new(&config.extraction, timeout)?;
        let reconciler = ReconciliationController::new(store.clone(), embeddings.clone());
        let retrieval = RetrievalService::new(store.clone(), embeddings.clone());

        info!(
            "Memory manager ready (collection: {}, embedding: {} {}-dim)",
            config.collection, config.embedding.model, config.embedding.dimension
        );

        Ok(Self {
            store,
            embeddings,
            extraction,
            reconciler,
            retrieval,
            config,
        })
    }

    /// Extract candidate memories from one exchange and reconcile them
    /// against the store.
    ///
    /// Degrades rather than fails: provider and parse errors fall back to
    /// keyword extraction, per-candidate persistence errors are skipped, and
    /// a context-fetch failure just means extraction runs without context.
    pub async fn process_exchange(
        &self,
        owner: &OwnerScope,
        user_message: &str,
        agent_response: &str,
    ) -> ExchangeOutcome {
        // The usage counters are client-lifetime (and the embedding client is
        // shared with retrieval); report only what this exchange spends.
        let usage_before = self.embeddings.usage().merged(self.extraction.usage());

        let recent = match self
            .store
            .recent_memories(owner, self.config.recent_limit)
            .await
        {
            Ok(records) => records,
            Err(e) => {
                warn!("Could not fetch recent memories for {}: {}", owner, e);
                Vec::new()
            }
        };

        let extraction_started = Instant::now();
        let extraction = self
            .extraction
            .extract(user_message, agent_response, &recent)
            .await;
        let extraction_ms = extraction_started.elapsed().as_millis() as u64;

        let reconcile_started = Instant::now();
        let (stored_ids, operations) = self
            .reconciler
            .reconcile_batch(owner, &extraction.candidates, &recent)
            .await;
        let reconcile_ms = reconcile_started.elapsed().as_millis() as u64;

        let metrics = ProcessingMetrics {
            extraction_ms,
            reconcile_ms,
            candidates_extracted: extraction.candidates.len(),
            candidates_persisted: stored_ids.len(),
            candidates_skipped: extraction.candidates.len() - stored_ids.len(),
        };

        info!(
            "Processed exchange for {}: {} candidates, {} persisted ({:?})",
            owner, metrics.candidates_extracted, metrics.candidates_persisted, extraction.method
        );

        ExchangeOutcome {
            stored_ids,
            operations,
            method: extraction.method,
            confidence: extraction.confidence,
            requires_validation: extraction.requires_validation,
            metrics,
            usage: self
                .embeddings
                .usage()
                .merged(self.extraction.usage())
                .since(usage_before),
        }
    }

    /// Semantic search scoped to one owner. Never fails; an empty result is
    /// the degraded outcome.
    pub async fn search(
        &self,
        query: &str,
        owner: &OwnerScope,
        options: Option<SearchOptions>,
    ) -> SearchOutcome {
        let options = options.unwrap_or_else(|| self.default_search_options());
        let (memories, diagnostics) = self.retrieval.search(query, owner, &options).await;
        SearchOutcome {
            memories,
            diagnostics,
        }
    }

    /// Search options derived from config (threshold and limit knobs)
    pub fn default_search_options(&self) -> SearchOptions {
        SearchOptions {
            threshold: self.config.similarity_threshold,
            limit: self.config.search_limit,
            type_filter: None,
        }
    }

    /// Recent memories for an owner, newest first
    pub async fn list_memories(&self, owner: &OwnerScope, limit: u64) -> Result<Vec<MemoryRecord>> {
        self.store.recent_memories(owner, limit).await
    }

    /// Delete every memory belonging to an owner
    pub async fn forget_owner(&self, owner: &OwnerScope) -> Result<()> {
        self.store.delete_owner_memories(owner).await
    }

    /// Collection statistics
    pub async fn stats(&self) -> Result<CollectionStats> {
        self.store.stats().await
    }

    /// Check subsystem health: the store must be reachable; provider
    /// configuration is reported as detail.
    pub async fn health_check(&self) -> HealthReport {
        let mut details = Vec::new();

        let store_ok = self.store.health_check().await;
        details.push(if store_ok {
            format!("store: ok (collection {})", self.store.collection())
        } else {
            "store: unreachable".to_string()
        });
        details.push(format!(
            "embedding: {} ({}-dim)",
            self.embeddings.model(),
            self.embeddings.dimension()
        ));

        HealthReport {
            status: if store_ok {
                HealthStatus::Healthy
            } else {
                HealthStatus::Unhealthy
            },
            details,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MemoryType;

    // End-to-end against live Qdrant and a real embedding API; run with:
    //   QDRANT_URL=... EMBEDDING_API_KEY=... cargo test -- --ignored
    #[tokio::test]
    #[ignore = "Requires running Qdrant and an embedding API key"]
    async fn test_exchange_then_search_ranks_relevant_memory_first() {
        let mut config = MemoryConfig::from_env();
        config.collection = "companion_memories_e2e".to_string();

        let manager = MemoryManager::new(config).await.unwrap();
        let owner = OwnerScope::new("e2e_user", "e2e_companion");
        manager.forget_owner(&owner).await.unwrap();

        let outcome = manager
            .process_exchange(
                &owner,
                "My name is Alex and I work at Acme as an engineer.",
                "Nice to meet you, Alex!",
            )
            .await;
        assert!(!outcome.stored_ids.is_empty());

        // Unrelated memory to rank against
        let second = manager
            .process_exchange(&owner, "I love hiking in autumn.", "Autumn hikes are lovely.")
            .await;
        // Usage is per exchange: one embedding per persisted candidate plus
        // at most one model call, never the first exchange's totals on top
        assert!(second.usage.requests <= second.metrics.candidates_persisted as u64 + 1);

        let results = manager
            .search("what do you know about my job", &owner, None)
            .await;
        assert!(!results.memories.is_empty());
        assert!(
            results.memories[0].memory.text.contains("Acme"),
            "top memory was: {}",
            results.memories[0].memory.text
        );

        let report = manager.health_check().await;
        assert_eq!(report.status, HealthStatus::Healthy);

        manager.forget_owner(&owner).await.unwrap();
    }

    #[tokio::test]
    #[ignore = "Requires running Qdrant and an embedding API key"]
    async fn test_type_filtered_search() {
        let config = MemoryConfig::from_env();
        let manager = MemoryManager::new(config).await.unwrap();
        let owner = OwnerScope::new("e2e_user_types", "e2e_companion");

        manager
            .process_exchange(&owner, "I love pizza", "Who doesn't!")
            .await;

        let options = SearchOptions {
            type_filter: Some(MemoryType::Preference),
            ..manager.default_search_options()
        };
        let results = manager.search("food", &owner, Some(options)).await;
        for scored in &results.memories {
            assert_eq!(scored.memory.memory_type, MemoryType::Preference);
        }

        manager.forget_owner(&owner).await.unwrap();
    }
}
