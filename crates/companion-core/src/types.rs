//! ============================================================================
//! Memory Types - Data structures for conversation memory
//! ============================================================================
//! Defines memory records, extraction candidates, reconciliation operations,
//! and per-run diagnostics. These types are serialized to JSON at the
//! orchestration boundary.
//! ============================================================================

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Confidence below which an extraction result is flagged for validation
pub const VALIDATION_CONFIDENCE: f32 = 0.7;

/// The (user, companion) pair partitioning all memory records
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OwnerScope {
    pub user_id: String,
    pub companion_id: String,
}

impl OwnerScope {
    pub fn new(user_id: impl Into<String>, companion_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            companion_id: companion_id.into(),
        }
    }
}

impl std::fmt::Display for OwnerScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.user_id, self.companion_id)
    }
}

/// Types of memories that can be stored
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryType {
    /// General conversational context
    Conversational,
    /// Events and experiences the user shared
    Episodic,
    /// Durable facts about the user (name, job, relationships)
    Semantic,
    /// Emotional states and signals
    Emotional,
    /// Likes, dislikes, and stated preferences
    Preference,
    /// Significant moments in the relationship
    Milestone,
    /// Situational context (travel, current projects)
    Contextual,
}

impl MemoryType {
    /// Display name for prompt injection
    pub fn display_name(&self) -> &'static str {
        match self {
            MemoryType::Conversational => "Conversation",
            MemoryType::Episodic => "Event",
            MemoryType::Semantic => "Fact",
            MemoryType::Emotional => "Emotion",
            MemoryType::Preference => "Preference",
            MemoryType::Milestone => "Milestone",
            MemoryType::Contextual => "Context",
        }
    }
}

impl std::fmt::Display for MemoryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MemoryType::Conversational => "conversational",
            MemoryType::Episodic => "episodic",
            MemoryType::Semantic => "semantic",
            MemoryType::Emotional => "emotional",
            MemoryType::Preference => "preference",
            MemoryType::Milestone => "milestone",
            MemoryType::Contextual => "contextual",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for MemoryType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "conversational" | "conversation" => Ok(MemoryType::Conversational),
            "episodic" | "event" => Ok(MemoryType::Episodic),
            "semantic" | "fact" => Ok(MemoryType::Semantic),
            "emotional" | "emotion" => Ok(MemoryType::Emotional),
            "preference" => Ok(MemoryType::Preference),
            "milestone" => Ok(MemoryType::Milestone),
            "contextual" | "context" => Ok(MemoryType::Contextual),
            _ => Err(format!("Unknown memory type: {}", s)),
        }
    }
}

/// Emotional signal attached to a memory
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EmotionalContext {
    /// Primary emotion label ("joy", "frustration", ...)
    pub emotion: String,
    /// Intensity in [0, 1]
    pub intensity: f32,
}

impl EmotionalContext {
    pub fn new(emotion: impl Into<String>, intensity: f32) -> Self {
        Self {
            emotion: emotion.into(),
            intensity: intensity.clamp(0.0, 1.0),
        }
    }
}

/// Named entities extracted alongside a memory
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractedEntities {
    #[serde(default)]
    pub people: Vec<String>,
    #[serde(default)]
    pub places: Vec<String>,
    #[serde(default)]
    pub topics: Vec<String>,
    #[serde(default)]
    pub activities: Vec<String>,
}

impl ExtractedEntities {
    pub fn is_empty(&self) -> bool {
        self.people.is_empty()
            && self.places.is_empty()
            && self.topics.is_empty()
            && self.activities.is_empty()
    }
}

/// A single memory record as persisted in the vector store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryRecord {
    /// Unique identifier; never changes after ADD
    pub id: Uuid,
    /// Owner scope
    pub owner: OwnerScope,
    /// The actual memory content
    pub text: String,
    /// Type of memory
    pub memory_type: MemoryType,
    /// Importance score (0.0 - 1.0)
    pub importance: f32,
    /// Optional emotional signal
    #[serde(skip_serializing_if = "Option::is_none")]
    pub emotional_context: Option<EmotionalContext>,
    /// Vector embedding (not serialized to the boundary)
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub embedding: Vec<f32>,
    /// Significant words used by the lexical pre-filter
    #[serde(default)]
    pub keywords: Vec<String>,
    /// Named entities
    #[serde(default)]
    pub entities: ExtractedEntities,
    /// Unix timestamp when the memory was created
    pub created_at: i64,
    /// Unix timestamp when the memory was last accessed
    pub last_accessed_at: i64,
    /// Number of times this memory was retrieved or updated
    pub access_count: u32,
}

impl MemoryRecord {
    /// Create a new memory record. Importance is clamped into [0, 1].
    pub fn new(
        owner: OwnerScope,
        text: impl Into<String>,
        memory_type: MemoryType,
        importance: f32,
    ) -> Self {
        let now = chrono::Utc::now().timestamp();
        Self {
            id: Uuid::new_v4(),
            owner,
            text: text.into(),
            memory_type,
            importance: importance.clamp(0.0, 1.0),
            emotional_context: None,
            embedding: Vec::new(),
            keywords: Vec::new(),
            entities: ExtractedEntities::default(),
            created_at: now,
            last_accessed_at: now,
            access_count: 0,
        }
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = embedding;
        self
    }

    pub fn with_keywords(mut self, keywords: Vec<String>) -> Self {
        self.keywords = keywords;
        self
    }

    pub fn with_entities(mut self, entities: ExtractedEntities) -> Self {
        self.entities = entities;
        self
    }

    pub fn with_emotional_context(mut self, ctx: EmotionalContext) -> Self {
        self.emotional_context = Some(ctx);
        self
    }

    /// Bump access bookkeeping (UPDATE execution and retrieval hits)
    pub fn touch(&mut self) {
        self.last_accessed_at = chrono::Utc::now().timestamp();
        self.access_count = self.access_count.saturating_add(1);
    }
}

/// An extracted, not-yet-reconciled memory entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateMemory {
    pub text: String,
    pub memory_type: MemoryType,
    /// Importance score, clamped into [0, 1] at validation
    pub importance: f32,
    #[serde(default)]
    pub entities: ExtractedEntities,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub emotional_context: Option<EmotionalContext>,
}

impl CandidateMemory {
    pub fn new(text: impl Into<String>, memory_type: MemoryType, importance: f32) -> Self {
        Self {
            text: text.into(),
            memory_type,
            importance: importance.clamp(0.0, 1.0),
            entities: ExtractedEntities::default(),
            emotional_context: None,
        }
    }
}

/// How an extraction result was produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionMethod {
    /// Model call succeeded and the response passed the schema contract
    Model,
    /// Model path failed; deterministic extractor took over
    Fallback,
    /// No model configured; cue extractor ran directly
    Keyword,
}

/// Ordered candidates from one exchange, with extraction metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionResult {
    pub candidates: Vec<CandidateMemory>,
    /// Overall confidence in [0, 1]
    pub confidence: f32,
    pub method: ExtractionMethod,
    /// True whenever confidence < 0.7; downstream policy may suppress
    /// low-confidence ADDs
    pub requires_validation: bool,
}

impl ExtractionResult {
    pub fn new(candidates: Vec<CandidateMemory>, confidence: f32, method: ExtractionMethod) -> Self {
        let confidence = confidence.clamp(0.0, 1.0);
        Self {
            candidates,
            confidence,
            method,
            requires_validation: confidence < VALIDATION_CONFIDENCE,
        }
    }

    /// Empty result (no detectable cues, or nothing worth keeping)
    pub fn empty(method: ExtractionMethod) -> Self {
        Self::new(Vec::new(), 0.0, method)
    }
}

/// Reconciliation decision for one candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MemoryOp {
    Add,
    Update,
    Delete,
    Noop,
}

/// A reconciliation decision plus the reasoning behind it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateOperation {
    pub op: MemoryOp,
    /// Target memory id for UPDATE/DELETE
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<Uuid>,
    pub reason: String,
    pub confidence: f32,
}

impl UpdateOperation {
    pub fn add(reason: impl Into<String>, confidence: f32) -> Self {
        Self {
            op: MemoryOp::Add,
            target: None,
            reason: reason.into(),
            confidence,
        }
    }

    pub fn update(target: Uuid, reason: impl Into<String>, confidence: f32) -> Self {
        Self {
            op: MemoryOp::Update,
            target: Some(target),
            reason: reason.into(),
            confidence,
        }
    }
}

/// Ephemeral per-run timings and counts; diagnostics only, never persisted
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessingMetrics {
    pub extraction_ms: u64,
    pub reconcile_ms: u64,
    pub candidates_extracted: usize,
    pub candidates_persisted: usize,
    pub candidates_skipped: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_clamps_importance() {
        let owner = OwnerScope::new("u1", "c1");
        let high = MemoryRecord::new(owner.clone(), "text", MemoryType::Semantic, 1.7);
        assert_eq!(high.importance, 1.0);
        let low = MemoryRecord::new(owner, "text", MemoryType::Semantic, -0.2);
        assert_eq!(low.importance, 0.0);
    }

    #[test]
    fn test_emotional_context_clamps_intensity() {
        assert_eq!(EmotionalContext::new("joy", 2.0).intensity, 1.0);
        assert_eq!(EmotionalContext::new("joy", -1.0).intensity, 0.0);
    }

    #[test]
    fn test_memory_type_parsing() {
        assert_eq!("preference".parse::<MemoryType>().unwrap(), MemoryType::Preference);
        assert_eq!("Fact".parse::<MemoryType>().unwrap(), MemoryType::Semantic);
        assert_eq!("emotional".parse::<MemoryType>().unwrap(), MemoryType::Emotional);
        assert!("unknown".parse::<MemoryType>().is_err());
    }

    #[test]
    fn test_requires_validation_threshold() {
        let below = ExtractionResult::new(vec![], 0.6, ExtractionMethod::Fallback);
        assert!(below.requires_validation);
        let above = ExtractionResult::new(vec![], 0.85, ExtractionMethod::Model);
        assert!(!above.requires_validation);
    }

    #[test]
    fn test_touch_bumps_bookkeeping() {
        let mut record = MemoryRecord::new(
            OwnerScope::new("u1", "c1"),
            "likes tea",
            MemoryType::Preference,
            0.5,
        );
        let before = record.access_count;
        record.touch();
        assert_eq!(record.access_count, before + 1);
        assert!(record.last_accessed_at >= record.created_at);
    }
}
