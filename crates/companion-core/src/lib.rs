//! ============================================================================
//! COMPANION-CORE: Conversational memory subsystem
//! ============================================================================
//! Extracts durable facts, preferences, and emotional signals from each
//! message exchange, reconciles them against a Qdrant-backed memory store,
//! and serves the most relevant subset back into generation requests via
//! semantic search.
//!
//! ## Architecture
//! ```text
//! Exchange → Extraction Engine → candidates → Reconciliation → ADD/UPDATE/DELETE/NOOP
//!                (one model call,                 (lexical heuristics,
//!                 keyword fallback)                sole store writer)
//!
//! Query → Embedding Client → Store search → threshold filter → ranked snippets
//! ```
//!
//! Memory is an enhancement, never a hard dependency: every provider or
//! store failure degrades to fallback extraction or zero retrieved memories,
//! and the companion keeps responding.
//!
//! ## Usage
//! ```rust,ignore
//! use companion_core::{MemoryConfig, MemoryManager, OwnerScope};
//!
//! let manager = MemoryManager::new(MemoryConfig::from_env()).await?;
//! let owner = OwnerScope::new("user-1", "companion-1");
//!
//! // After each exchange
//! let outcome = manager.process_exchange(&owner, user_msg, agent_msg).await;
//!
//! // Before generating the next reply
//! let results = manager.search(user_msg, &owner, None).await;
//! let context = companion_core::retrieval::format_snippets_for_prompt(&results.memories);
//! ```
//! ============================================================================

pub mod config;
pub mod embeddings;
pub mod error;
pub mod extraction;
pub mod manager;
pub mod reconcile;
pub mod retrieval;
pub mod store;
pub mod types;

// Re-export the boundary types for convenience
pub use config::{EmbeddingConfig, ExtractionConfig, MemoryConfig};
pub use embeddings::{cosine_similarity, EmbeddingClient, UsageSnapshot};
pub use error::{MemoryError, Result};
pub use extraction::ExtractionEngine;
pub use manager::{ExchangeOutcome, HealthReport, HealthStatus, MemoryManager, SearchOutcome};
pub use reconcile::ReconciliationController;
pub use retrieval::{
    format_snippets_for_prompt, RetrievalService, SearchDiagnostics, SearchOptions,
    DEFAULT_SIMILARITY_THRESHOLD,
};
pub use store::{CollectionStats, MemoryStore, ScoredMemory};
pub use types::{
    CandidateMemory, EmotionalContext, ExtractedEntities, ExtractionMethod, ExtractionResult,
    MemoryOp, MemoryRecord, MemoryType, OwnerScope, ProcessingMetrics, UpdateOperation,
};
