//! Knowledge Extractor - LLM-driven triple extraction
//!
//! Uses a single strict-JSON completion call to pull objective, reusable
//! knowledge triples out of conversation messages. User-specific facts are
//! filtered out in strict mode; extraction failures degrade to "nothing
//! extracted".

use std::sync::{Arc, OnceLock, RwLock};
use std::time::Duration;

use regex::Regex;
use serde::Deserialize;

use crate::knowledge::models::{
    ExtractionResult, KnowledgeIntent, KnowledgeSource, KnowledgeTriple,
};
use crate::llm::{ChatCompleter, ChatMessage, parse_json_reply};

// ============================================================================
// PROMPT
// ============================================================================

const EXTRACTION_PROMPT: &str = r#"You are a knowledge extraction system. Your task is to extract ONLY objective, generalizable knowledge from conversations - knowledge that would be useful for anyone, not specific to any individual user.

## Task
1. First, classify the content:
   - User-specific information: name, age, birthday, location, job, personal preferences, opinions -> DO NOT EXTRACT
   - Objective knowledge: facts about entities, technical information, processes, workflows, domain knowledge -> EXTRACT
2. If it contains objective knowledge, extract it as triples: (subject, predicate, object)
3. Each triple should represent reusable knowledge that could benefit any conversation

## What to EXTRACT (objective knowledge)
- Technical facts about tools, languages, frameworks (e.g., "Python was created by Guido van Rossum")
- Process/workflow knowledge (e.g., "CI/CD pipelines typically include testing and deployment stages")
- API/tool capabilities (e.g., "GPT-4 has 128k context window")
- Causal relationships (e.g., "Memory leaks can cause application crashes")

## What NOT to EXTRACT (user-specific)
- Personal identifiers: name, age, birthday, phone, email, address
- Personal preferences: "I prefer...", "My favorite..."
- Current state: "I'm working on...", "I live in..."
- Opinions and questions

## Examples

Input: "My name is John and I'm 25 years old"
Output:
```json
{"is_factual": false, "intent": "statement", "triples": [], "confidence": 0.0, "reasoning": "Personal user information"}
```

Input: "Claude 3.5 Sonnet has a context window of 200k tokens"
Output:
```json
{"is_factual": true, "intent": "statement", "triples": [{"subject": "Claude 3.5 Sonnet", "predicate": "context_window", "object": "200k tokens"}], "confidence": 0.95, "reasoning": "Technical fact about an AI model"}
```

Input: "Actually, GPT-4 now supports 128k context, not 32k"
Output:
```json
{"is_factual": true, "intent": "correction", "triples": [{"subject": "GPT-4", "predicate": "context_window", "object": "128k"}], "confidence": 0.9, "reasoning": "Correction of a technical fact"}
```

Input: "Python was created by Guido van Rossum and released in 1991"
Output:
```json
{"is_factual": true, "intent": "statement", "triples": [{"subject": "Python", "predicate": "created_by", "object": "Guido van Rossum"}, {"subject": "Python", "predicate": "release_year", "object": "1991"}], "confidence": 0.95, "reasoning": "Historical facts about a programming language"}
```

Input: "I think Python is the best language"
Output:
```json
{"is_factual": false, "intent": "opinion", "triples": [], "confidence": 0.0, "reasoning": "Subjective opinion"}
```

## Guidelines
- Subject: the main entity, concept, or process (NEVER "user")
- Predicate: the relationship in snake_case (e.g., "created_by", "has_feature", "requires")
- Object: the value, related entity, or outcome
- Confidence: 0.9+ for well-known facts, 0.7-0.9 for domain knowledge, below 0.7 for uncertain claims

## Message to Analyze
{message}

## Response
Respond with ONLY valid JSON, no additional text:"#;

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Configuration for knowledge extraction
#[derive(Debug, Clone)]
pub struct ExtractorConfig {
    /// Minimum overall confidence to accept an extraction
    pub min_confidence: f64,
    /// Extract from assistant messages (search results, explanations)
    pub extract_from_agent: bool,
    /// Limit triples per message
    pub max_triples_per_message: usize,
    /// Filter out user-specific information
    pub strict_mode: bool,
    /// Budget for the completion call
    pub llm_timeout: Duration,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            min_confidence: 0.7,
            extract_from_agent: true,
            max_triples_per_message: 5,
            strict_mode: true,
            llm_timeout: Duration::from_secs(60),
        }
    }
}

/// Who produced the message being analyzed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageRole {
    User,
    Assistant,
}

/// Predicates that carry user-specific information and never enter the
/// global knowledge base
const USER_SPECIFIC_PREDICATES: [&str; 28] = [
    "name", "age", "birthday", "birth_date", "location", "address", "city", "country", "email",
    "phone", "phone_number", "job", "workplace", "employer", "occupation", "preference",
    "ui_preference", "editor", "favorite", "likes", "dislikes", "hobby", "hobbies", "interest",
    "interests", "goal", "goals", "current_project",
];

/// Markers that indicate a message is relaying external search results
const SEARCH_INDICATORS: [&str; 12] = [
    "根据搜索",
    "搜索结果",
    "查询结果",
    "search result",
    "according to",
    "based on my search",
    "i found that",
    "官方文档",
    "documentation",
    "wikipedia",
    "source:",
    "reference:",
];

// ============================================================================
// WIRE SHAPE
// ============================================================================

#[derive(Debug, Deserialize)]
struct RawTriple {
    #[serde(default)]
    subject: String,
    #[serde(default)]
    predicate: String,
    #[serde(default)]
    object: String,
}

#[derive(Debug, Deserialize)]
struct ExtractionReply {
    #[serde(default)]
    is_factual: bool,
    #[serde(default)]
    intent: String,
    #[serde(default)]
    triples: Vec<RawTriple>,
    #[serde(default)]
    confidence: f64,
    #[serde(default)]
    #[allow(dead_code)]
    reasoning: Option<String>,
}

fn predicate_cleanup_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[^a-z0-9_]").expect("valid regex"))
}

fn predicate_space_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[\s\-]+").expect("valid regex"))
}

/// Normalize a predicate to a lowercase ASCII snake_case identifier
pub fn normalize_predicate(predicate: &str) -> String {
    let lowered = predicate.to_lowercase();
    let underscored = predicate_space_re().replace_all(lowered.trim(), "_");
    predicate_cleanup_re().replace_all(&underscored, "").to_string()
}

// ============================================================================
// EXTRACTOR
// ============================================================================

/// LLM-driven knowledge triple extractor
pub struct KnowledgeExtractor {
    config: ExtractorConfig,
    completer: RwLock<Option<Arc<dyn ChatCompleter>>>,
}

impl KnowledgeExtractor {
    pub fn new(config: ExtractorConfig) -> Self {
        Self {
            config,
            completer: RwLock::new(None),
        }
    }

    /// Install the completion capability
    pub fn set_completer(&self, completer: Arc<dyn ChatCompleter>) {
        if let Ok(mut guard) = self.completer.write() {
            *guard = Some(completer);
        }
    }

    pub fn is_available(&self) -> bool {
        self.completer.read().map(|g| g.is_some()).unwrap_or(false)
    }

    /// Extract knowledge triples from a message.
    ///
    /// Short messages, gated roles, low-confidence extractions, and LLM
    /// failures all yield a non-factual result.
    pub async fn extract(
        &self,
        message: &str,
        session_id: &str,
        user_id: &str,
        role: MessageRole,
    ) -> ExtractionResult {
        if message.trim().len() < 10 {
            return ExtractionResult::nonfactual(message);
        }
        if role == MessageRole::Assistant && !self.config.extract_from_agent {
            return ExtractionResult::nonfactual(message);
        }
        let completer = self.completer.read().ok().and_then(|g| g.clone());
        let Some(completer) = completer else {
            return ExtractionResult::nonfactual(message);
        };

        let prompt = EXTRACTION_PROMPT.replace("{message}", message);
        let messages = [ChatMessage::user(prompt)];
        let call = completer.complete(&messages);
        let reply = match tokio::time::timeout(self.config.llm_timeout, call).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(e)) => {
                tracing::warn!("Knowledge extraction failed: {}", e);
                return ExtractionResult::nonfactual(message);
            }
            Err(_) => {
                tracing::warn!("Knowledge extraction timed out");
                return ExtractionResult::nonfactual(message);
            }
        };

        let mut result = self.parse_reply(&reply, message);

        // Tag sources by role and intent
        for triple in &mut result.triples {
            triple.session_id = session_id.to_string();
            triple.user_id = user_id.to_string();
            triple.source = match role {
                MessageRole::Assistant => {
                    if is_search_result(message) {
                        KnowledgeSource::AgentSearch
                    } else {
                        KnowledgeSource::AgentSummary
                    }
                }
                MessageRole::User => {
                    if result.intent == KnowledgeIntent::Correction {
                        KnowledgeSource::UserCorrection
                    } else {
                        KnowledgeSource::UserStated
                    }
                }
            };
        }

        result
    }

    /// Extract knowledge from multiple messages sequentially
    pub async fn batch_extract(
        &self,
        messages: &[String],
        session_id: &str,
        user_id: &str,
        role: MessageRole,
    ) -> Vec<ExtractionResult> {
        let mut results = Vec::with_capacity(messages.len());
        for message in messages {
            results.push(self.extract(message, session_id, user_id, role).await);
        }
        results
    }

    fn parse_reply(&self, reply: &str, original_message: &str) -> ExtractionResult {
        let parsed: ExtractionReply = match parse_json_reply(reply) {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::debug!("Discarding unparseable extraction reply: {}", e);
                return ExtractionResult::nonfactual(original_message);
            }
        };

        if parsed.confidence < self.config.min_confidence {
            return ExtractionResult::nonfactual(original_message);
        }

        let intent = KnowledgeIntent::parse_name(&parsed.intent);
        let mut triples = vec![];
        for raw in parsed.triples.into_iter().take(self.config.max_triples_per_message) {
            let subject = raw.subject.trim().to_string();
            let predicate = normalize_predicate(&raw.predicate);
            let object = raw.object.trim().to_string();
            if subject.is_empty() || predicate.is_empty() || object.is_empty() {
                continue;
            }

            if self.config.strict_mode {
                if subject.to_lowercase() == "user" {
                    continue;
                }
                if USER_SPECIFIC_PREDICATES.contains(&predicate.as_str()) {
                    continue;
                }
            }

            let mut triple = KnowledgeTriple::new(subject, predicate, object);
            triple.confidence = parsed.confidence;
            triples.push(triple);
        }

        if triples.is_empty() {
            return ExtractionResult::nonfactual(original_message);
        }

        ExtractionResult {
            is_factual: parsed.is_factual,
            intent,
            triples,
            confidence: parsed.confidence,
            raw_message: original_message.to_string(),
        }
    }
}

/// Whether a message relays search/external data results
fn is_search_result(message: &str) -> bool {
    let lower = message.to_lowercase();
    SEARCH_INDICATORS.iter().any(|marker| lower.contains(marker))
}

// ============================================================================
// TESTS
// ============================================================================
