//! ============================================================================
//! Extraction Engine - Candidate memories from a message exchange
//! ============================================================================
//! Issues exactly one chat-completion call per exchange under a strict JSON
//! output contract, validates and clamps each candidate individually, and
//! falls back to a deterministic cue-based extractor on any provider or
//! parse failure. The fallback path never fails; worst case it returns zero
//! candidates.
//! ============================================================================

use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::ExtractionConfig;
use crate::embeddings::UsageSnapshot;
use crate::error::{MemoryError, Result};
use crate::types::{
    CandidateMemory, EmotionalContext, ExtractionMethod, ExtractionResult, MemoryRecord,
    MemoryType,
};

/// Confidence assigned when the model path succeeds
const MODEL_CONFIDENCE: f32 = 0.85;

/// Confidence assigned to cue-based extraction (always requires validation)
const FALLBACK_CONFIDENCE: f32 = 0.6;

/// Model-reported confidence below which the model output is discarded
const LOW_SIGNAL_CONFIDENCE: f32 = 0.5;

/// Cost per 1K tokens for the extraction model, USD
const COST_PER_1K_TOKENS: f64 = 0.0003;

/// Per-memory text budget inside the extraction prompt
const CONTEXT_SNIPPET_CHARS: usize = 160;

/// Extraction engine with an optional model provider.
///
/// Without a configured API key the engine runs the cue extractor directly
/// (`ExtractionMethod::Keyword`); with one, the cue extractor is the failure
/// path (`ExtractionMethod::Fallback`).
pub struct ExtractionEngine {
    model: Option<ModelClient>,
    max_context_memories: usize,
}

struct ModelClient {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
    usage: crate::embeddings::UsageCounters,
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
#[allow(dead_code)]
struct ChatUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
}

/// One item of the model's JSON contract, before validation
#[derive(Debug, Deserialize)]
struct RawCandidate {
    text: Option<String>,
    #[serde(rename = "type", alias = "memory_type")]
    memory_type: Option<String>,
    importance: Option<f32>,
    #[serde(default)]
    entities: Option<crate::types::ExtractedEntities>,
    emotional_context: Option<RawEmotionalContext>,
}

#[derive(Debug, Deserialize)]
struct RawEmotionalContext {
    emotion: Option<String>,
    intensity: Option<f32>,
}

impl ExtractionEngine {
    /// Create an extraction engine from config. A missing API key is not an
    /// error; it selects the keyword-only path.
    pub fn new(config: &ExtractionConfig, timeout: Duration) -> Result<Self> {
        let model = match config.api_key.clone().filter(|k| !k.is_empty()) {
            Some(api_key) => {
                let client = Client::builder().timeout(timeout).build().map_err(|e| {
                    MemoryError::Provider(format!("failed to build HTTP client: {}", e))
                })?;
                Some(ModelClient {
                    client,
                    api_key,
                    base_url: config.base_url.trim_end_matches('/').to_string(),
                    model: config.model.clone(),
                    usage: Default::default(),
                })
            }
            None => {
                debug!("No extraction model API key; using keyword extraction only");
                None
            }
        };

        Ok(Self {
            model,
            max_context_memories: config.max_context_memories,
        })
    }

    /// Extract candidate memories from one exchange.
    ///
    /// Never fails: every provider or parse error degrades to the cue-based
    /// extractor.
    pub async fn extract(
        &self,
        user_message: &str,
        agent_response: &str,
        recent: &[MemoryRecord],
    ) -> ExtractionResult {
        let Some(model) = &self.model else {
            let candidates = keyword_extract(user_message);
            if candidates.is_empty() {
                return ExtractionResult::empty(ExtractionMethod::Keyword);
            }
            return ExtractionResult::new(candidates, FALLBACK_CONFIDENCE, ExtractionMethod::Keyword);
        };

        let prompt = build_prompt(user_message, agent_response, recent, self.max_context_memories);

        match model.call(&prompt).await {
            Ok(raw) => match parse_candidates(&raw) {
                Ok((candidates, reported)) => {
                    if let Some(c) = reported {
                        if c < LOW_SIGNAL_CONFIDENCE {
                            debug!("Model signalled low confidence ({}); falling back", c);
                            return self.fallback(user_message);
                        }
                    }
                    let confidence = reported.unwrap_or(MODEL_CONFIDENCE);
                    ExtractionResult::new(candidates, confidence, ExtractionMethod::Model)
                }
                Err(e) => {
                    warn!("Extraction output rejected: {}", e);
                    self.fallback(user_message)
                }
            },
            Err(e) => {
                warn!("Extraction model call failed: {}", e);
                self.fallback(user_message)
            }
        }
    }

    fn fallback(&self, user_message: &str) -> ExtractionResult {
        let candidates = keyword_extract(user_message);
        if candidates.is_empty() {
            return ExtractionResult::empty(ExtractionMethod::Fallback);
        }
        ExtractionResult::new(candidates, FALLBACK_CONFIDENCE, ExtractionMethod::Fallback)
    }

    /// Cumulative model-provider usage (zero when no model is configured)
    pub fn usage(&self) -> UsageSnapshot {
        self.model
            .as_ref()
            .map(|m| m.usage.snapshot(COST_PER_1K_TOKENS))
            .unwrap_or_default()
    }
}

impl ModelClient {
    /// One chat-completion call; the single model call for this exchange.
    async fn call(&self, prompt: &str) -> Result<String> {
        debug!("Calling extraction model with {} chars", prompt.len());

        let request = ChatRequest {
            model: self.model.clone(),
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: prompt.to_string(),
            }],
            temperature: 0.2,
            max_tokens: 1024,
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(|e| MemoryError::Provider(format!("extraction model call failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(MemoryError::Provider(format!(
                "extraction model error {}: {}",
                status, body
            )));
        }

        let chat_response: ChatResponse = response
            .json()
            .await
            .map_err(|e| MemoryError::Parse(format!("failed to parse model response: {}", e)))?;

        if let Some(usage) = &chat_response.usage {
            self.usage.record(usage.total_tokens as u64);
        } else {
            self.usage.record(0);
        }

        chat_response
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| MemoryError::Provider("no response from model".into()))
    }
}

/// Bounded extraction prompt: last N memories plus the new exchange, with
/// the strict output schema.
fn build_prompt(
    user_message: &str,
    agent_response: &str,
    recent: &[MemoryRecord],
    max_context: usize,
) -> String {
    let mut context = String::new();
    for record in recent.iter().take(max_context) {
        context.push_str(&format!(
            "- [{}] {}\n",
            record.memory_type,
            truncate(&record.text, CONTEXT_SNIPPET_CHARS)
        ));
    }
    if context.is_empty() {
        context.push_str("(none)\n");
    }

    format!(
        "You extract durable memories about the user from a conversation exchange.\n\n\
        Known memories:\n{}\n\
        New exchange:\n\
        User: {}\n\
        Companion: {}\n\n\
        Extract new facts, preferences, events, emotions, milestones, or context \
        about the user. Skip anything already covered by known memories.\n\n\
        Respond with ONLY a JSON array (no prose, no markdown). Each item:\n\
        {{\"text\": \"...\", \"type\": \"conversational|episodic|semantic|emotional|preference|milestone|contextual\", \
        \"importance\": 0.0-1.0, \
        \"entities\": {{\"people\": [], \"places\": [], \"topics\": [], \"activities\": []}}, \
        \"emotional_context\": {{\"emotion\": \"...\", \"intensity\": 0.0-1.0}} or null}}\n\
        Return [] when nothing is worth remembering.",
        context, user_message, agent_response
    )
}

/// Validate the model output against the extraction contract.
///
/// Accepts either a top-level JSON array or an object carrying `memories`
/// (and optionally `confidence`). Malformed items are dropped individually;
/// only a response with no usable array at all is a parse error.
fn parse_candidates(raw: &str) -> Result<(Vec<CandidateMemory>, Option<f32>)> {
    let cleaned = strip_code_fence(raw);

    let value: serde_json::Value = serde_json::from_str(cleaned)
        .map_err(|e| MemoryError::Parse(format!("not valid JSON: {}", e)))?;

    let (items, reported) = match value {
        serde_json::Value::Array(items) => (items, None),
        serde_json::Value::Object(ref obj) => {
            let items = obj
                .get("memories")
                .and_then(|m| m.as_array())
                .cloned()
                .ok_or_else(|| MemoryError::Parse("no memories array in object".into()))?;
            let reported = obj
                .get("confidence")
                .and_then(|c| c.as_f64())
                .map(|c| (c as f32).clamp(0.0, 1.0));
            (items, reported)
        }
        _ => return Err(MemoryError::Parse("expected a JSON array".into())),
    };

    let mut candidates = Vec::new();
    for item in items {
        match validate_item(item) {
            Some(candidate) => candidates.push(candidate),
            None => debug!("Dropping malformed extraction item"),
        }
    }

    Ok((candidates, reported))
}

/// Validate a single item: non-empty text, recognized type, clamped numerics.
fn validate_item(item: serde_json::Value) -> Option<CandidateMemory> {
    let raw: RawCandidate = serde_json::from_value(item).ok()?;

    let text = raw.text?.trim().to_string();
    if text.is_empty() {
        return None;
    }

    let memory_type: MemoryType = raw.memory_type?.parse().ok()?;

    let mut candidate = CandidateMemory::new(text, memory_type, raw.importance.unwrap_or(0.5));
    if let Some(entities) = raw.entities {
        candidate.entities = entities;
    }
    if let Some(ctx) = raw.emotional_context {
        if let Some(emotion) = ctx.emotion.filter(|e| !e.trim().is_empty()) {
            candidate.emotional_context =
                Some(EmotionalContext::new(emotion, ctx.intensity.unwrap_or(0.5)));
        }
    }

    Some(candidate)
}

/// Strip a markdown code fence the model sometimes wraps JSON in.
fn strip_code_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(inner) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let inner = inner.strip_prefix("json").unwrap_or(inner);
    inner.strip_suffix("```").unwrap_or(inner).trim()
}

// ============================================================================
// Deterministic cue-based extraction (the fallback path)
// ============================================================================

/// Extract candidates from cue phrases alone. Deterministic; never fails.
pub fn keyword_extract(message: &str) -> Vec<CandidateMemory> {
    let mut candidates = Vec::new();

    if let Some(fact) = extract_fact_cue(message) {
        candidates.push(CandidateMemory::new(fact, MemoryType::Semantic, 0.9));
    }
    if let Some(pref) = extract_preference_cue(message) {
        candidates.push(CandidateMemory::new(pref, MemoryType::Preference, 0.8));
    }
    if let Some((text, emotion)) = extract_emotion_cue(message) {
        let mut candidate = CandidateMemory::new(text, MemoryType::Emotional, 0.7);
        candidate.emotional_context = Some(EmotionalContext::new(emotion, 0.6));
        candidates.push(candidate);
    }

    candidates
}

/// Case-insensitive cue search safe for multibyte text.
///
/// Lowercasing can change a character's UTF-8 length ('İ' becomes two
/// characters), so byte offsets found in a lowercased copy are not valid
/// indices into the original. Matching here is done per character against
/// the ASCII pattern; the returned (start, end) byte offsets index into
/// `content` itself.
fn find_cue(content: &str, pattern: &str) -> Option<(usize, usize)> {
    let pat: Vec<char> = pattern.chars().collect();
    let chars: Vec<(usize, char)> = content.char_indices().collect();

    'starts: for start in 0..chars.len() {
        let mut i = start;
        for &p in &pat {
            let Some(&(_, c)) = chars.get(i) else {
                continue 'starts;
            };
            let mut lowered = c.to_lowercase();
            // Multi-character lowercase expansions never match ASCII cues
            if lowered.next() != Some(p) || lowered.next().is_some() {
                continue 'starts;
            }
            i += 1;
        }
        let end = chars.get(i).map(|&(idx, _)| idx).unwrap_or(content.len());
        return Some((chars[start].0, end));
    }

    None
}

fn extract_fact_cue(content: &str) -> Option<String> {
    // "my name is X", "I work at X", "I live in X"
    let patterns = [
        ("my name is ", "User's name is"),
        ("i work at ", "User works at"),
        ("i work as ", "User works as"),
        ("i live in ", "User lives in"),
        ("i'm from ", "User is from"),
    ];

    for (pattern, label) in patterns {
        if let Some((_, end)) = find_cue(content, pattern) {
            let rest = &content[end..];
            let fact: String = rest
                .chars()
                .take_while(|c| *c != '.' && *c != '!' && *c != '?' && *c != ',')
                .collect();
            let fact = fact.trim();
            if !fact.is_empty() && fact.len() < 120 {
                return Some(format!("{} {}", label, fact));
            }
        }
    }

    None
}

fn extract_preference_cue(content: &str) -> Option<String> {
    let patterns = [
        "i prefer ",
        "i love ",
        "i like ",
        "i hate ",
        "i don't like ",
        "my favorite ",
    ];

    for pattern in patterns {
        if let Some((start, _)) = find_cue(content, pattern) {
            let rest = &content[start..];
            let pref: String = rest
                .chars()
                .take_while(|c| *c != '.' && *c != '!' && *c != '?')
                .collect();
            let pref = pref.trim();
            if pref.len() > 8 && pref.len() < 200 {
                return Some(format!("User preference: {}", pref));
            }
        }
    }

    None
}

fn extract_emotion_cue(content: &str) -> Option<(String, &'static str)> {
    let patterns = ["i feel ", "i'm feeling ", "i felt ", "makes me "];

    // Earliest cue in the message wins, not the first in table order
    let (start, _) = patterns
        .iter()
        .filter_map(|p| find_cue(content, p))
        .min_by_key(|(start, _)| *start)?;

    let lower = content.to_lowercase();
    let emotions: [(&str, &str); 8] = [
        ("happy", "joy"),
        ("excited", "excitement"),
        ("sad", "sadness"),
        ("lonely", "loneliness"),
        ("anxious", "anxiety"),
        ("stressed", "stress"),
        ("angry", "anger"),
        ("proud", "pride"),
    ];
    let label = emotions
        .iter()
        .find(|(word, _)| lower.contains(word))
        .map(|(_, label)| *label)
        .unwrap_or("unspecified");

    let rest = &content[start..];
    let text: String = rest
        .chars()
        .take_while(|c| *c != '.' && *c != '!' && *c != '?')
        .collect();
    let text = text.trim();
    if text.len() > 6 && text.len() < 200 {
        Some((format!("User emotional state: {}", text), label))
    } else {
        None
    }
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        s.to_string()
    } else {
        match s.char_indices().nth(max_len) {
            Some((idx, _)) => format!("{}...", &s[..idx]),
            None => s.to_string(),
        }
    }
}
