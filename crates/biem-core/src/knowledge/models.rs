//! Data models for the knowledge pipeline
//!
//! Knowledge is stored as globally unique `(subject, predicate)` triples
//! with version history. Unlike episodic memory, triples are shared across
//! users; `user_id` records the contributor only.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// INTENT AND SOURCE
// ============================================================================

/// Intent behind a knowledge statement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum KnowledgeIntent {
    /// Normal factual statement
    #[default]
    Statement,
    /// Correcting previous information
    Correction,
    /// Asking about knowledge
    Question,
    /// Subjective opinion (not stored as fact)
    Opinion,
}

impl KnowledgeIntent {
    pub fn parse_name(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "correction" => KnowledgeIntent::Correction,
            "question" => KnowledgeIntent::Question,
            "opinion" => KnowledgeIntent::Opinion,
            _ => KnowledgeIntent::Statement,
        }
    }
}

/// Source/confidence class of a piece of knowledge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum KnowledgeSource {
    /// Extracted from normal chat
    #[default]
    Conversation,
    /// User explicitly stated
    UserStated,
    /// User corrected the agent's information
    UserCorrection,
    /// User confirmed an update
    UserVerified,
    /// Agent inferred from context
    AgentInferred,
    /// From the agent's search results
    AgentSearch,
    /// Agent's summary of external information
    AgentSummary,
}

impl KnowledgeSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            KnowledgeSource::Conversation => "conversation",
            KnowledgeSource::UserStated => "user_stated",
            KnowledgeSource::UserCorrection => "user_correction",
            KnowledgeSource::UserVerified => "user_verified",
            KnowledgeSource::AgentInferred => "agent_inferred",
            KnowledgeSource::AgentSearch => "agent_search",
            KnowledgeSource::AgentSummary => "agent_summary",
        }
    }

    pub fn parse_name(s: &str) -> Self {
        match s {
            "user_stated" => KnowledgeSource::UserStated,
            "user_correction" => KnowledgeSource::UserCorrection,
            "user_verified" => KnowledgeSource::UserVerified,
            "agent_inferred" => KnowledgeSource::AgentInferred,
            "agent_search" => KnowledgeSource::AgentSearch,
            "agent_summary" => KnowledgeSource::AgentSummary,
            _ => KnowledgeSource::Conversation,
        }
    }

    /// Whether this knowledge came from the agent rather than the user
    pub fn is_agent(&self) -> bool {
        matches!(
            self,
            KnowledgeSource::AgentInferred
                | KnowledgeSource::AgentSearch
                | KnowledgeSource::AgentSummary
        )
    }
}

impl std::fmt::Display for KnowledgeSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// TRIPLE
// ============================================================================

/// A knowledge triple `(subject, predicate, object)`.
///
/// Uniqueness is global on the lowercased `(subject, predicate)` pair; the
/// `object` is versioned, with prior values kept in order of occurrence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KnowledgeTriple {
    pub id: String,
    /// Entity: "GPT-4", "Python"
    pub subject: String,
    /// Relation in snake_case: "context_window", "created_by"
    pub predicate: String,
    /// Value: "128k tokens", "Guido van Rossum"
    pub object: String,

    pub confidence: f64,
    pub source: KnowledgeSource,

    /// Incremented on value change
    pub version: u32,
    /// Prior object values, oldest first
    pub previous_values: Vec<String>,

    pub session_id: String,
    /// Contributor attribution only; no effect on uniqueness or retrieval
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    /// Embedding for semantic search (optional)
    #[serde(default)]
    pub vector: Vec<f32>,
}

impl Default for KnowledgeTriple {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            subject: String::new(),
            predicate: String::new(),
            object: String::new(),
            confidence: 0.8,
            source: KnowledgeSource::Conversation,
            version: 1,
            previous_values: vec![],
            session_id: String::new(),
            user_id: String::new(),
            created_at: now,
            updated_at: now,
            vector: vec![],
        }
    }
}

impl KnowledgeTriple {
    pub fn new(
        subject: impl Into<String>,
        predicate: impl Into<String>,
        object: impl Into<String>,
    ) -> Self {
        Self {
            subject: subject.into(),
            predicate: predicate.into(),
            object: object.into(),
            ..Default::default()
        }
    }

    /// Readable text form used for embedding
    pub fn to_text(&self) -> String {
        format!("{} {} {}", self.subject, self.predicate, self.object)
    }

    /// Human-readable display format
    pub fn display(&self) -> String {
        format!("({}, {}, {})", self.subject, self.predicate, self.object)
    }

    /// Whether two triples address the same `(subject, predicate)` key
    pub fn same_key(&self, other: &KnowledgeTriple) -> bool {
        self.subject.to_lowercase() == other.subject.to_lowercase()
            && self.predicate.to_lowercase() == other.predicate.to_lowercase()
    }
}

// ============================================================================
// EXTRACTION AND CONFLICT RESULTS
// ============================================================================

/// Result of knowledge extraction from a message
#[derive(Debug, Clone, Default)]
pub struct ExtractionResult {
    /// Whether the message contained factual content
    pub is_factual: bool,
    pub intent: KnowledgeIntent,
    pub triples: Vec<KnowledgeTriple>,
    /// Overall extraction confidence
    pub confidence: f64,
    /// Original message
    pub raw_message: String,
}

impl ExtractionResult {
    pub fn nonfactual(raw_message: impl Into<String>) -> Self {
        Self {
            raw_message: raw_message.into(),
            ..Default::default()
        }
    }
}

/// Result of conflict detection between knowledge triples
#[derive(Debug, Clone, Default)]
pub struct ConflictResult {
    pub has_conflict: bool,
    pub existing_triple: Option<KnowledgeTriple>,
    pub new_triple: Option<KnowledgeTriple>,
    /// "value_change" for direct object conflicts
    pub conflict_type: String,
    /// Human-readable suggestion for the user
    pub suggestion: String,
}

// ============================================================================
// UPDATE EVENTS AND PENDING UPDATES
// ============================================================================

/// Append-only audit record of a triple change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KnowledgeUpdateEvent {
    pub id: String,
    pub triple_id: String,
    pub old_value: String,
    pub new_value: String,
    /// "user_correction", "new_information", or a source name
    pub reason: String,
    /// Whether the update was confirmed by the user
    pub confirmed: bool,
    pub session_id: String,
    pub contributor_id: String,
    pub timestamp: DateTime<Utc>,
}

impl Default for KnowledgeUpdateEvent {
    fn default() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            triple_id: String::new(),
            old_value: String::new(),
            new_value: String::new(),
            reason: String::new(),
            confirmed: false,
            session_id: String::new(),
            contributor_id: String::new(),
            timestamp: Utc::now(),
        }
    }
}

/// Seconds a pending update stays valid before it can be discarded
const PENDING_UPDATE_TTL_SECS: i64 = 300;

/// A knowledge update awaiting user confirmation
#[derive(Debug, Clone)]
pub struct PendingUpdate {
    pub id: String,
    pub new_triple: KnowledgeTriple,
    pub existing_triple: Option<KnowledgeTriple>,
    /// Message shown to the user
    pub confirmation_message: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl PendingUpdate {
    pub fn new(
        new_triple: KnowledgeTriple,
        existing_triple: Option<KnowledgeTriple>,
        confirmation_message: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            new_triple,
            existing_triple,
            confirmation_message: confirmation_message.into(),
            created_at: now,
            expires_at: now + Duration::seconds(PENDING_UPDATE_TTL_SECS),
        }
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }
}

// ============================================================================
// TESTS
// ============================================================================
