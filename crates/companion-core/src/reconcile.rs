//! ============================================================================
//! Reconciliation Controller - ADD/UPDATE/DELETE/NOOP against the store
//! ============================================================================
//! Maps each extracted candidate onto an operation against existing similar
//! memories using a cheap lexical heuristic (no second model call, no vector
//! query), then executes it. This is the only component that writes to the
//! store. A persistence failure on one candidate is logged and skipped; the
//! batch continues in list order.
//! ============================================================================

use std::sync::Arc;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::embeddings::EmbeddingClient;
use crate::error::Result;
use crate::store::MemoryStore;
use crate::types::{CandidateMemory, MemoryOp, MemoryRecord, OwnerScope, UpdateOperation};

/// Significant-word overlap above which a candidate refines an existing memory
pub const OVERLAP_UPDATE_THRESHOLD: f32 = 0.6;

/// Words ignored by the lexical heuristics
const STOPWORDS: &[&str] = &[
    "this", "that", "these", "those", "with", "from", "have", "been", "were",
    "they", "them", "their", "about", "would", "could", "should", "really",
    "very", "just", "always", "every", "when", "what", "where", "which",
    "there", "here", "your", "mine", "user", "user's",
];

/// Lowercased words of 4+ letters, stopwords removed, order preserved,
/// deduplicated. The "significant words" of the reconciliation heuristics
/// and the keyword set persisted on each record.
pub fn significant_words(text: &str) -> Vec<String> {
    let mut seen = Vec::new();
    for word in text.split(|c: char| !c.is_alphanumeric() && c != '\'') {
        let w = word.trim_matches('\'').to_lowercase();
        if w.len() < 4 || STOPWORDS.contains(&w.as_str()) {
            continue;
        }
        if !seen.contains(&w) {
            seen.push(w);
        }
    }
    seen
}

/// Fraction of the candidate's significant words present in the existing text
pub fn word_overlap(candidate_text: &str, existing_text: &str) -> f32 {
    let candidate_words = significant_words(candidate_text);
    if candidate_words.is_empty() {
        return 0.0;
    }
    let existing_words = significant_words(existing_text);
    let shared = candidate_words
        .iter()
        .filter(|w| existing_words.contains(w))
        .count();
    shared as f32 / candidate_words.len() as f32
}

/// Whether the text carries a negation cue ("not" / "n't")
pub fn has_negation(text: &str) -> bool {
    text.split(|c: char| !c.is_alphanumeric() && c != '\'')
        .any(|w| {
            let w = w.to_lowercase();
            w == "not" || w.ends_with("n't")
        })
}

/// Cheap lexical pre-filter: existing memories sharing at least one
/// significant word with the candidate. Deliberately not the vector index,
/// to keep this step low-latency.
pub fn find_similar<'a>(
    candidate: &CandidateMemory,
    existing: &'a [MemoryRecord],
) -> Vec<&'a MemoryRecord> {
    let candidate_words = significant_words(&candidate.text);
    if candidate_words.is_empty() {
        return Vec::new();
    }

    existing
        .iter()
        .filter(|record| {
            let words = if record.keywords.is_empty() {
                significant_words(&record.text)
            } else {
                record.keywords.clone()
            };
            candidate_words.iter().any(|w| words.contains(w))
        })
        .collect()
}

/// Decide how a candidate maps onto the existing similar memories.
///
/// Intentionally a cheap syntactic heuristic rather than a second model call
/// per candidate; it trades reconciliation precision for latency and cost
/// and can falsely merge unrelated memories that share vocabulary.
pub fn determine_operation(
    candidate: &CandidateMemory,
    existing_similar: &[&MemoryRecord],
) -> UpdateOperation {
    // 1. Nothing similar: a genuinely new memory
    if existing_similar.is_empty() {
        return UpdateOperation::add("no similar memory found", 0.9);
    }

    // 2. Heavy word overlap: same fact, refined wording
    for record in existing_similar {
        let overlap = word_overlap(&candidate.text, &record.text);
        if overlap > OVERLAP_UPDATE_THRESHOLD {
            return UpdateOperation::update(
                record.id,
                format!("refines existing memory (overlap {:.2})", overlap),
                0.8,
            );
        }
    }

    // 3. Same type, opposite negation: contradiction correction
    let candidate_negated = has_negation(&candidate.text);
    for record in existing_similar {
        if record.memory_type == candidate.memory_type
            && has_negation(&record.text) != candidate_negated
        {
            return UpdateOperation::update(record.id, "contradiction correction", 0.7);
        }
    }

    // 4. Related vocabulary but a distinct memory
    UpdateOperation::add("distinct from similar memories", 0.8)
}

/// Executes reconciliation decisions; the sole writer to the memory store.
pub struct ReconciliationController {
    store: Arc<MemoryStore>,
    embeddings: Arc<EmbeddingClient>,
}

impl ReconciliationController {
    pub fn new(store: Arc<MemoryStore>, embeddings: Arc<EmbeddingClient>) -> Self {
        Self { store, embeddings }
    }

    /// Execute one operation for a candidate.
    ///
    /// ADD embeds and persists a new record, returning its id. UPDATE
    /// overwrites text/importance/emotional-context on the target (with a
    /// fresh embedding for the new text), bumps access bookkeeping, and
    /// returns the existing id. DELETE removes the target point. NOOP does
    /// nothing. DELETE and NOOP return None.
    pub async fn execute_operation(
        &self,
        owner: &OwnerScope,
        op: &UpdateOperation,
        candidate: &CandidateMemory,
        existing: &[MemoryRecord],
    ) -> Result<Option<Uuid>> {
        match op.op {
            MemoryOp::Add => {
                let embedding = self.embeddings.embed_single(&candidate.text).await?;
                let record = MemoryRecord::new(
                    owner.clone(),
                    candidate.text.clone(),
                    candidate.memory_type,
                    candidate.importance,
                )
                .with_embedding(embedding)
                .with_keywords(significant_words(&candidate.text))
                .with_entities(candidate.entities.clone());

                let record = match &candidate.emotional_context {
                    Some(ctx) => record.with_emotional_context(ctx.clone()),
                    None => record,
                };

                self.store.upsert_record(&record).await?;
                info!("Added memory {} for owner {}", record.id, owner);
                Ok(Some(record.id))
            }
            MemoryOp::Update => {
                let Some(target) = op.target else {
                    warn!("UPDATE without target id; skipping");
                    return Ok(None);
                };
                let Some(existing_record) = existing.iter().find(|r| r.id == target) else {
                    warn!("UPDATE target {} not in context; skipping", target);
                    return Ok(None);
                };

                let mut record = existing_record.clone();
                record.text = candidate.text.clone();
                record.importance = candidate.importance.clamp(0.0, 1.0);
                record.keywords = significant_words(&candidate.text);
                if candidate.emotional_context.is_some() {
                    record.emotional_context = candidate.emotional_context.clone();
                }
                record.touch();
                record.embedding = self.embeddings.embed_single(&record.text).await?;

                self.store.upsert_record(&record).await?;
                info!("Updated memory {} for owner {} ({})", target, owner, op.reason);
                Ok(Some(target))
            }
            MemoryOp::Delete => {
                if let Some(target) = op.target {
                    self.store.delete_record(&target).await?;
                    info!("Deleted memory {} for owner {}", target, owner);
                }
                Ok(None)
            }
            MemoryOp::Noop => {
                debug!("NOOP for candidate: {}", candidate.text);
                Ok(None)
            }
        }
    }

    /// Reconcile a batch of candidates in list order.
    ///
    /// Returns the ids persisted plus the decision taken for each candidate.
    /// A failed operation yields no id and never aborts the batch.
    pub async fn reconcile_batch(
        &self,
        owner: &OwnerScope,
        candidates: &[CandidateMemory],
        recent: &[MemoryRecord],
    ) -> (Vec<Uuid>, Vec<UpdateOperation>) {
        let mut stored = Vec::new();
        let mut operations = Vec::new();

        for candidate in candidates {
            let similar = find_similar(candidate, recent);
            let op = determine_operation(candidate, &similar);
            debug!(
                "Reconciled '{}' -> {:?} ({})",
                candidate.text, op.op, op.reason
            );

            match self.execute_operation(owner, &op, candidate, recent).await {
                Ok(Some(id)) => stored.push(id),
                Ok(None) => {}
                Err(e) => {
                    warn!("Skipping candidate '{}': {}", candidate.text, e);
                }
            }
            operations.push(op);
        }

        (stored, operations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MemoryType;

    fn record(text: &str, memory_type: MemoryType) -> MemoryRecord {
        MemoryRecord::new(OwnerScope::new("u1", "c1"), text, memory_type, 0.5)
            .with_keywords(significant_words(text))
    }

    fn candidate(text: &str, memory_type: MemoryType) -> CandidateMemory {
        CandidateMemory::new(text, memory_type, 0.5)
    }

    #[test]
    fn test_significant_words_filters_short_and_stopwords() {
        let words = significant_words("I really love hiking in the autumn with friends");
        assert!(words.contains(&"love".to_string()));
        assert!(words.contains(&"hiking".to_string()));
        assert!(words.contains(&"autumn".to_string()));
        assert!(!words.contains(&"really".to_string()));
        assert!(!words.contains(&"the".to_string()));
    }

    #[test]
    fn test_word_overlap_on_refined_phrasing() {
        let overlap = word_overlap("I love hiking in autumn", "I really love hiking every autumn");
        assert!(overlap > OVERLAP_UPDATE_THRESHOLD, "overlap was {}", overlap);
    }

    #[test]
    fn test_word_overlap_unrelated() {
        let overlap = word_overlap("I love hiking in autumn", "User works at Acme");
        assert_eq!(overlap, 0.0);
    }

    #[test]
    fn test_negation_detection() {
        assert!(has_negation("User does not like coffee"));
        assert!(has_negation("User doesn't like coffee"));
        assert!(!has_negation("User noted the coffee order"));
        assert!(!has_negation("User likes coffee"));
    }

    #[test]
    fn test_no_similar_always_adds() {
        let op = determine_operation(&candidate("User loves sailing", MemoryType::Preference), &[]);
        assert_eq!(op.op, MemoryOp::Add);
        assert_eq!(op.confidence, 0.9);
    }

    #[test]
    fn test_high_overlap_updates() {
        let existing = record("I love hiking in autumn", MemoryType::Preference);
        let similar = vec![&existing];
        let op = determine_operation(
            &candidate("I really love hiking every autumn", MemoryType::Preference),
            &similar,
        );
        assert_eq!(op.op, MemoryOp::Update);
        assert_eq!(op.target, Some(existing.id));
        assert_eq!(op.confidence, 0.8);
    }

    #[test]
    fn test_contradiction_updates() {
        let existing = record("User likes coffee strong in the morning", MemoryType::Preference);
        let similar = vec![&existing];
        let op = determine_operation(
            &candidate("User does not drink coffee anymore", MemoryType::Preference),
            &similar,
        );
        assert_eq!(op.op, MemoryOp::Update);
        assert_eq!(op.target, Some(existing.id));
        assert_eq!(op.confidence, 0.7);
    }

    #[test]
    fn test_related_but_distinct_adds() {
        // Shares "coffee" but low overlap, same polarity, no contradiction
        let existing = record("User likes coffee strong in the morning", MemoryType::Preference);
        let similar = vec![&existing];
        let op = determine_operation(
            &candidate(
                "User visited a coffee plantation during the Colombia trip",
                MemoryType::Episodic,
            ),
            &similar,
        );
        assert_eq!(op.op, MemoryOp::Add);
        assert_eq!(op.confidence, 0.8);
    }

    #[test]
    fn test_find_similar_uses_lexical_filter() {
        let records = vec![
            record("User works at Acme as an engineer", MemoryType::Semantic),
            record("User loves hiking in autumn", MemoryType::Preference),
        ];
        let hits = find_similar(
            &candidate("User got promoted at Acme", MemoryType::Milestone),
            &records,
        );
        assert_eq!(hits.len(), 1);
        assert!(hits[0].text.contains("Acme"));
    }

    #[test]
    fn test_find_similar_empty_candidate_matches_nothing() {
        let records = vec![record("User loves hiking", MemoryType::Preference)];
        let hits = find_similar(&candidate("ok", MemoryType::Conversational), &records);
        assert!(hits.is_empty());
    }
}
