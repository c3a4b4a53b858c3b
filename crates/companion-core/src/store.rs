//! ============================================================================
//! Memory Store - Qdrant vector database adapter
//! ============================================================================
//! Persists memory records and delegates approximate-nearest-neighbor search
//! to Qdrant. Every search hit passes through an explicit point-to-record
//! mapping step; the similarity score is copied from the scored point field
//! and never defaulted (a silently-defaulted score collapses ranking to
//! insertion order).
//! ============================================================================

use std::collections::HashMap;
use std::time::Duration;

use qdrant_client::qdrant::{
    point_id::PointIdOptions, points_selector::PointsSelectorOneOf, Condition,
    CreateCollectionBuilder, DeletePointsBuilder, Distance, Filter, PointId, PointStruct,
    ScoredPoint, ScrollPointsBuilder, SearchPointsBuilder, UpsertPointsBuilder, Value,
    VectorParamsBuilder,
};
use qdrant_client::Qdrant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{MemoryError, Result};
use crate::types::{
    EmotionalContext, ExtractedEntities, MemoryRecord, MemoryType, OwnerScope,
};

/// Default collection name for memories
pub const DEFAULT_COLLECTION: &str = "companion_memories";

// Payload field names; the persisted row contract of the subsystem.
pub const FIELD_USER_ID: &str = "user_id";
pub const FIELD_COMPANION_ID: &str = "companion_id";
pub const FIELD_TEXT: &str = "memory_text";
pub const FIELD_TYPE: &str = "memory_type";
pub const FIELD_IMPORTANCE: &str = "importance_score";
pub const FIELD_EMOTIONAL_CONTEXT: &str = "emotional_context";
pub const FIELD_ENTITIES: &str = "extracted_entities";
pub const FIELD_KEYWORDS: &str = "search_keywords";
pub const FIELD_CREATED_AT: &str = "created_at";
pub const FIELD_LAST_ACCESSED: &str = "last_accessed_at";
pub const FIELD_ACCESS_COUNT: &str = "access_count";

/// A memory record paired with the similarity score the store emitted for it
#[derive(Debug, Clone, serde::Serialize)]
pub struct ScoredMemory {
    pub memory: MemoryRecord,
    pub score: f32,
}

impl ScoredMemory {
    /// Map a Qdrant scored point into a record + score.
    ///
    /// Returns None when the point lacks a UUID id or required payload
    /// fields; such points are logged and dropped by the caller. The score
    /// is taken verbatim from the point.
    pub fn from_scored_point(point: ScoredPoint) -> Option<Self> {
        let score = point.score;
        let id = extract_uuid_from_point_id(point.id?)?;
        let memory = record_from_payload(id, &point.payload)?;
        Some(Self { memory, score })
    }
}

/// Collection statistics
#[derive(Debug, Clone, serde::Serialize)]
pub struct CollectionStats {
    pub points_count: u64,
}

/// Memory store backed by Qdrant
pub struct MemoryStore {
    client: Qdrant,
    collection: String,
    dimension: usize,
}

impl MemoryStore {
    /// Create a new memory store, connecting to Qdrant and ensuring the
    /// collection exists with the configured vector dimensionality.
    pub async fn new(
        url: &str,
        collection: &str,
        dimension: usize,
        timeout: Duration,
    ) -> Result<Self> {
        debug!("Connecting to Qdrant at {}", url);

        let client = Qdrant::from_url(url)
            .timeout(timeout)
            .build()
            .map_err(|e| MemoryError::Persistence(format!("failed to create Qdrant client: {}", e)))?;

        let store = Self {
            client,
            collection: collection.to_string(),
            dimension,
        };

        store.ensure_collection().await?;

        Ok(store)
    }

    /// Ensure the memories collection exists
    async fn ensure_collection(&self) -> Result<()> {
        let exists = self
            .client
            .collection_exists(&self.collection)
            .await
            .map_err(|e| {
                MemoryError::Persistence(format!("failed to check collection existence: {}", e))
            })?;

        if !exists {
            info!("Creating collection: {}", self.collection);

            self.client
                .create_collection(
                    CreateCollectionBuilder::new(&self.collection).vectors_config(
                        VectorParamsBuilder::new(self.dimension as u64, Distance::Cosine),
                    ),
                )
                .await
                .map_err(|e| {
                    MemoryError::Persistence(format!("failed to create collection: {}", e))
                })?;

            info!("Collection {} created successfully", self.collection);
        } else {
            debug!("Collection {} already exists", self.collection);
        }

        Ok(())
    }

    /// Persist a record (ADD) or overwrite it in place (UPDATE; same id).
    pub async fn upsert_record(&self, record: &MemoryRecord) -> Result<()> {
        if record.embedding.is_empty() {
            return Err(MemoryError::Validation(
                "cannot store memory without embedding".into(),
            ));
        }
        if record.embedding.len() != self.dimension {
            return Err(MemoryError::Validation(format!(
                "embedding dimension mismatch: expected {}, got {}",
                self.dimension,
                record.embedding.len()
            )));
        }

        debug!(
            "Storing memory {} for owner {}",
            record.id, record.owner
        );

        let point = PointStruct::new(
            record.id.to_string(),
            record.embedding.clone(),
            payload_from_record(record),
        );

        self.client
            .upsert_points(UpsertPointsBuilder::new(&self.collection, vec![point]))
            .await
            .map_err(|e| MemoryError::Persistence(format!("failed to upsert memory: {}", e)))?;

        debug!("Memory {} stored successfully", record.id);
        Ok(())
    }

    /// Scored similarity search scoped to one owner.
    ///
    /// Requests up to `limit` results at or above `threshold`; an optional
    /// type filter narrows the search.
    pub async fn search_scored(
        &self,
        owner: &OwnerScope,
        query_embedding: Vec<f32>,
        limit: u64,
        threshold: f32,
        type_filter: Option<MemoryType>,
    ) -> Result<Vec<ScoredMemory>> {
        debug!(
            "Searching memories for owner {} (limit: {}, threshold: {})",
            owner, limit, threshold
        );

        let filter = owner_filter(owner, type_filter);

        let search_result = self
            .client
            .search_points(
                SearchPointsBuilder::new(&self.collection, query_embedding, limit)
                    .filter(filter)
                    .score_threshold(threshold)
                    .with_payload(true),
            )
            .await
            .map_err(|e| MemoryError::Persistence(format!("failed to search memories: {}", e)))?;

        let mut dropped = 0usize;
        let memories: Vec<ScoredMemory> = search_result
            .result
            .into_iter()
            .filter_map(|point| {
                let mapped = ScoredMemory::from_scored_point(point);
                if mapped.is_none() {
                    dropped += 1;
                }
                mapped
            })
            .collect();

        if dropped > 0 {
            warn!("Dropped {} search hits with malformed payloads", dropped);
        }

        debug!("Found {} matching memories", memories.len());
        Ok(memories)
    }

    /// Most recent memories for an owner, newest first (non-semantic).
    pub async fn recent_memories(&self, owner: &OwnerScope, limit: u64) -> Result<Vec<MemoryRecord>> {
        debug!("Getting recent memories for owner {} (limit: {})", owner, limit);

        let filter = owner_filter(owner, None);

        let scroll_result = self
            .client
            .scroll(
                ScrollPointsBuilder::new(&self.collection)
                    .filter(filter)
                    .limit(scroll_limit(limit))
                    .with_payload(true),
            )
            .await
            .map_err(|e| MemoryError::Persistence(format!("failed to scroll memories: {}", e)))?;

        let mut memories: Vec<MemoryRecord> = scroll_result
            .result
            .into_iter()
            .filter_map(|point| {
                let id = extract_uuid_from_point_id(point.id?)?;
                record_from_payload(id, &point.payload)
            })
            .collect();

        // Scroll order is unspecified; newest first for context building
        memories.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        debug!("Retrieved {} memories for owner {}", memories.len(), owner);
        Ok(memories)
    }

    /// Delete a specific memory by id (DELETE execution)
    pub async fn delete_record(&self, memory_id: &Uuid) -> Result<()> {
        debug!("Deleting memory {}", memory_id);

        self.client
            .delete_points(
                DeletePointsBuilder::new(&self.collection).points(vec![memory_id.to_string()]),
            )
            .await
            .map_err(|e| MemoryError::Persistence(format!("failed to delete memory: {}", e)))?;

        Ok(())
    }

    /// Delete all memories for an owner
    pub async fn delete_owner_memories(&self, owner: &OwnerScope) -> Result<()> {
        info!("Deleting all memories for owner {}", owner);

        let filter = owner_filter(owner, None);

        self.client
            .delete_points(
                DeletePointsBuilder::new(&self.collection)
                    .points(PointsSelectorOneOf::Filter(filter)),
            )
            .await
            .map_err(|e| MemoryError::Persistence(format!("failed to delete memories: {}", e)))?;

        info!("Deleted memories for owner {}", owner);
        Ok(())
    }

    /// Collection statistics
    pub async fn stats(&self) -> Result<CollectionStats> {
        let info = self
            .client
            .collection_info(&self.collection)
            .await
            .map_err(|e| MemoryError::Persistence(format!("failed to get collection info: {}", e)))?;

        Ok(CollectionStats {
            points_count: info
                .result
                .map(|r| r.points_count.unwrap_or(0))
                .unwrap_or(0),
        })
    }

    /// Check if the store is reachable
    pub async fn health_check(&self) -> bool {
        match self.client.health_check().await {
            Ok(_) => true,
            Err(e) => {
                warn!("Qdrant health check failed: {}", e);
                false
            }
        }
    }

    /// Configured collection name
    pub fn collection(&self) -> &str {
        &self.collection
    }
}

/// Scroll limits are u32 on the wire; clamp rather than truncate.
fn scroll_limit(limit: u64) -> u32 {
    limit.min(u32::MAX as u64) as u32
}

/// Owner-scoped filter, optionally narrowed by memory type
fn owner_filter(owner: &OwnerScope, type_filter: Option<MemoryType>) -> Filter {
    let mut conditions = vec![
        Condition::matches(FIELD_USER_ID, owner.user_id.clone()),
        Condition::matches(FIELD_COMPANION_ID, owner.companion_id.clone()),
    ];
    if let Some(t) = type_filter {
        conditions.push(Condition::matches(FIELD_TYPE, t.to_string()));
    }
    Filter::must(conditions)
}

/// Build the persisted payload row from a record.
pub(crate) fn payload_from_record(record: &MemoryRecord) -> HashMap<String, Value> {
    // Structured fields travel as JSON strings inside the payload
    let emotional = record
        .emotional_context
        .as_ref()
        .and_then(|c| serde_json::to_string(c).ok())
        .unwrap_or_default();
    let entities = serde_json::to_string(&record.entities).unwrap_or_default();
    let keywords = serde_json::to_string(&record.keywords).unwrap_or_default();

    [
        (FIELD_USER_ID.to_string(), Value::from(record.owner.user_id.clone())),
        (
            FIELD_COMPANION_ID.to_string(),
            Value::from(record.owner.companion_id.clone()),
        ),
        (FIELD_TEXT.to_string(), Value::from(record.text.clone())),
        (FIELD_TYPE.to_string(), Value::from(record.memory_type.to_string())),
        (
            FIELD_IMPORTANCE.to_string(),
            Value::from(record.importance as f64),
        ),
        (FIELD_EMOTIONAL_CONTEXT.to_string(), Value::from(emotional)),
        (FIELD_ENTITIES.to_string(), Value::from(entities)),
        (FIELD_KEYWORDS.to_string(), Value::from(keywords)),
        (FIELD_CREATED_AT.to_string(), Value::from(record.created_at)),
        (
            FIELD_LAST_ACCESSED.to_string(),
            Value::from(record.last_accessed_at),
        ),
        (
            FIELD_ACCESS_COUNT.to_string(),
            Value::from(record.access_count as i64),
        ),
    ]
    .into_iter()
    .collect()
}

/// Rebuild a record from a payload row. Returns None when the row is missing
/// required fields; numeric fields default conservatively.
pub(crate) fn record_from_payload(
    id: Uuid,
    payload: &HashMap<String, Value>,
) -> Option<MemoryRecord> {
    let owner = OwnerScope {
        user_id: get_string(payload, FIELD_USER_ID)?,
        companion_id: get_string(payload, FIELD_COMPANION_ID)?,
    };

    let emotional_context: Option<EmotionalContext> = get_string(payload, FIELD_EMOTIONAL_CONTEXT)
        .filter(|s| !s.is_empty())
        .and_then(|s| serde_json::from_str(&s).ok());
    let entities: ExtractedEntities = get_string(payload, FIELD_ENTITIES)
        .and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or_default();
    let keywords: Vec<String> = get_string(payload, FIELD_KEYWORDS)
        .and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or_default();

    Some(MemoryRecord {
        id,
        owner,
        text: get_string(payload, FIELD_TEXT)?,
        memory_type: get_string(payload, FIELD_TYPE)?
            .parse()
            .unwrap_or(MemoryType::Conversational),
        importance: (get_f64(payload, FIELD_IMPORTANCE).unwrap_or(0.5) as f32).clamp(0.0, 1.0),
        emotional_context,
        embedding: vec![], // Not returned in search results
        keywords,
        entities,
        created_at: get_i64(payload, FIELD_CREATED_AT).unwrap_or(0),
        last_accessed_at: get_i64(payload, FIELD_LAST_ACCESSED).unwrap_or(0),
        access_count: get_i64(payload, FIELD_ACCESS_COUNT).unwrap_or(0) as u32,
    })
}

// Helper to extract UUID from PointId
fn extract_uuid_from_point_id(point_id: PointId) -> Option<Uuid> {
    match point_id.point_id_options? {
        PointIdOptions::Uuid(uuid_str) => Uuid::parse_str(&uuid_str).ok(),
        PointIdOptions::Num(_) => None, // We use UUID strings, not numeric IDs
    }
}

// Helper functions to extract values from payload
fn get_string(payload: &HashMap<String, Value>, key: &str) -> Option<String> {
    payload.get(key).and_then(|v| v.as_str().map(|s| s.to_string()))
}

fn get_f64(payload: &HashMap<String, Value>, key: &str) -> Option<f64> {
    payload.get(key).and_then(|v| v.as_double())
}

fn get_i64(payload: &HashMap<String, Value>, key: &str) -> Option<i64> {
    payload.get(key).and_then(|v| v.as_integer())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record() -> MemoryRecord {
        MemoryRecord::new(
            OwnerScope::new("user-1", "companion-1"),
            "User works at Acme as an engineer",
            MemoryType::Semantic,
            0.9,
        )
        .with_keywords(vec!["works".into(), "acme".into(), "engineer".into()])
        .with_emotional_context(EmotionalContext::new("pride", 0.4))
    }

    #[test]
    fn test_payload_round_trip() {
        let record = sample_record();
        let payload = payload_from_record(&record);
        let restored = record_from_payload(record.id, &payload).unwrap();

        assert_eq!(restored.owner, record.owner);
        assert_eq!(restored.text, record.text);
        assert_eq!(restored.memory_type, record.memory_type);
        assert!((restored.importance - record.importance).abs() < 1e-6);
        assert_eq!(restored.keywords, record.keywords);
        assert_eq!(restored.emotional_context, record.emotional_context);
        assert_eq!(restored.created_at, record.created_at);
        assert_eq!(restored.access_count, record.access_count);
    }

    // Guard against the historical defect class where a score field-name
    // mismatch silently defaulted every score: the emitted score must survive
    // the mapping step exactly.
    #[test]
    fn test_scored_point_mapping_preserves_score() {
        let record = sample_record();
        let point = ScoredPoint {
            id: Some(PointId::from(record.id.to_string())),
            payload: payload_from_record(&record),
            score: 0.37,
            ..Default::default()
        };

        let scored = ScoredMemory::from_scored_point(point).unwrap();
        assert_eq!(scored.score, 0.37);
        assert_eq!(scored.memory.id, record.id);
        assert_eq!(scored.memory.text, record.text);
    }

    #[test]
    fn test_scored_point_without_payload_is_dropped() {
        let point = ScoredPoint {
            id: Some(PointId::from(Uuid::new_v4().to_string())),
            payload: HashMap::new(),
            score: 0.5,
            ..Default::default()
        };
        assert!(ScoredMemory::from_scored_point(point).is_none());
    }

    #[test]
    fn test_numeric_point_id_is_rejected() {
        let point = ScoredPoint {
            id: Some(PointId::from(42u64)),
            payload: payload_from_record(&sample_record()),
            score: 0.5,
            ..Default::default()
        };
        assert!(ScoredMemory::from_scored_point(point).is_none());
    }

    #[test]
    fn test_scroll_limit_clamps_oversized_values() {
        assert_eq!(scroll_limit(10), 10);
        assert_eq!(scroll_limit(u32::MAX as u64), u32::MAX);
        assert_eq!(scroll_limit(u64::MAX), u32::MAX);
    }

    #[test]
    fn test_unknown_type_defaults_to_conversational() {
        let record = sample_record();
        let mut payload = payload_from_record(&record);
        payload.insert(FIELD_TYPE.to_string(), Value::from("exotic".to_string()));
        let restored = record_from_payload(record.id, &payload).unwrap();
        assert_eq!(restored.memory_type, MemoryType::Conversational);
    }

    // Integration tests require a running Qdrant instance
    #[tokio::test]
    #[ignore = "Requires a running Qdrant instance"]
    async fn test_store_and_search() {
        let store = MemoryStore::new(
            "http://localhost:6334",
            "companion_memories_test",
            4,
            Duration::from_secs(10),
        )
        .await
        .unwrap();

        let record = MemoryRecord::new(
            OwnerScope::new("test_user", "test_companion"),
            "Test memory content",
            MemoryType::Semantic,
            0.9,
        )
        .with_embedding(vec![0.1, 0.2, 0.3, 0.4]);

        store.upsert_record(&record).await.unwrap();

        let results = store
            .search_scored(
                &record.owner,
                vec![0.1, 0.2, 0.3, 0.4],
                10,
                0.0,
                None,
            )
            .await
            .unwrap();

        assert!(!results.is_empty());
        assert_eq!(results[0].memory.text, "Test memory content");

        // Cleanup
        store.delete_record(&record.id).await.unwrap();
    }
}
