//! LLM Capability Seam
//!
//! The engine consumes two external capabilities: a text embedder and a chat
//! completion function. Everything else the engine wants from a model
//! (importance scoring, consolidation summaries, causal inference, conflict
//! verification) is a small trait that a host wires up at startup, usually by
//! adapting a [`ChatCompleter`]. Every component tolerates an absent
//! capability and degrades instead of failing.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::memory::node::ConflictKind;

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Errors from external model calls
#[non_exhaustive]
#[derive(Debug, Clone, thiserror::Error)]
pub enum LlmError {
    /// The backing service failed or was unreachable
    #[error("LLM backend error: {0}")]
    Backend(String),
    /// The call exceeded its configured budget
    #[error("LLM call timed out after {0} seconds")]
    Timeout(u64),
    /// The model reply could not be parsed into the expected shape
    #[error("Unparseable LLM reply: {0}")]
    Unparseable(String),
    /// No implementation was wired for this capability
    #[error("Capability not configured")]
    NotConfigured,
}

// ============================================================================
// CHAT TYPES
// ============================================================================

/// Role of a chat message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

/// A single message in a completion request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

// ============================================================================
// CORE CAPABILITIES
// ============================================================================

/// Text embedding capability: `embed(text) -> vector<f32>`
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed a single text
    async fn embed(&self, text: &str) -> Result<Vec<f32>, LlmError>;

    /// Embed a batch of texts in one backend call where supported
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, LlmError> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.embed(text).await?);
        }
        Ok(out)
    }
}

/// Chat completion capability: `complete(messages) -> text`
#[async_trait]
pub trait ChatCompleter: Send + Sync {
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String, LlmError>;
}

// ============================================================================
// DERIVED CAPABILITIES
// ============================================================================

/// Scores content importance in `[0, 1]`
#[async_trait]
pub trait ImportanceScorer: Send + Sync {
    async fn score(&self, content: &str) -> Result<f64, LlmError>;
}

/// Summarizes a cluster of memory contents into a single consolidated fact
#[async_trait]
pub trait Consolidator: Send + Sync {
    async fn consolidate(&self, contents: &[String]) -> Result<String, LlmError>;
}

/// Estimates the confidence in `[0, 1]` that `cause` causes `effect`
#[async_trait]
pub trait CausalInferencer: Send + Sync {
    async fn infer(&self, cause: &str, effect: &str) -> Result<f64, LlmError>;
}

/// Verdict returned by conflict verification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictVerdict {
    #[serde(default)]
    pub is_conflict: bool,
    #[serde(default)]
    pub conflict_type: ConflictKind,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub confidence: f64,
}

/// Decides whether two memory statements conflict
#[async_trait]
pub trait ConflictVerifier: Send + Sync {
    async fn verify(&self, content_a: &str, content_b: &str) -> Result<ConflictVerdict, LlmError>;
}

// ============================================================================
// JSON EXTRACTION
// ============================================================================

/// Extract the JSON payload from a model reply.
///
/// Tolerates fenced code blocks (with or without a `json` tag) and lenient
/// leading/trailing prose around a bare object.
pub fn extract_json_block(text: &str) -> Option<String> {
    let trimmed = text.trim();

    // Fenced block, ```json or plain ```
    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        let after = after.strip_prefix("json").unwrap_or(after);
        if let Some(end) = after.find("```") {
            let inner = after[..end].trim();
            if !inner.is_empty() {
                return Some(inner.to_string());
            }
        }
    }

    // Bare object, possibly with surrounding prose
    let open = trimmed.find('{')?;
    let close = trimmed.rfind('}')?;
    if close > open {
        return Some(trimmed[open..=close].to_string());
    }

    None
}

/// Parse a model reply into `T`, tolerating fenced code blocks
pub fn parse_json_reply<T: serde::de::DeserializeOwned>(text: &str) -> Result<T, LlmError> {
    let payload =
        extract_json_block(text).ok_or_else(|| LlmError::Unparseable(truncate_reply(text)))?;
    serde_json::from_str(&payload).map_err(|e| LlmError::Unparseable(e.to_string()))
}

fn truncate_reply(text: &str) -> String {
    text.chars().take(200).collect()
}

// ============================================================================
// CONFLICT VERIFIER ADAPTER
// ============================================================================

const CONFLICT_VERIFY_PROMPT: &str = r#"Analyze whether these two memory statements contain conflicting information.

Statement A (existing):
{content_a}

Statement B (new):
{content_b}

Determine if they:
1. Contradict each other (opposing facts)
2. One updates/supersedes the other
3. One refines/adds detail to the other
4. No conflict (compatible information)

Respond in JSON format:
{
    "is_conflict": true/false,
    "conflict_type": "contradiction" | "update" | "refinement" | "none",
    "description": "Brief explanation of the conflict or compatibility",
    "confidence": 0.0-1.0
}"#;

/// [`ConflictVerifier`] implemented over a chat completion capability
pub struct LlmConflictVerifier {
    completer: Arc<dyn ChatCompleter>,
}

impl LlmConflictVerifier {
    pub fn new(completer: Arc<dyn ChatCompleter>) -> Self {
        Self { completer }
    }
}

#[async_trait]
impl ConflictVerifier for LlmConflictVerifier {
    async fn verify(&self, content_a: &str, content_b: &str) -> Result<ConflictVerdict, LlmError> {
        let prompt = CONFLICT_VERIFY_PROMPT
            .replace("{content_a}", content_a)
            .replace("{content_b}", content_b);

        let reply = self.completer.complete(&[ChatMessage::user(prompt)]).await?;

        match parse_json_reply::<ConflictVerdict>(&reply) {
            Ok(verdict) => Ok(verdict),
            Err(_) => {
                // Infer from free text when the model ignores the schema
                let lower = reply.to_lowercase();
                let is_conflict = lower.contains("conflict") && !lower.contains("no conflict");
                Ok(ConflictVerdict {
                    is_conflict,
                    conflict_type: if is_conflict {
                        ConflictKind::Contradiction
                    } else {
                        ConflictKind::None
                    },
                    description: truncate_reply(&reply),
                    confidence: 0.5,
                })
            }
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
