//! Knowledge Conflict Detection and Confirmation
//!
//! A conflict is *direct* when an incoming triple shares the lowercased
//! `(subject, predicate)` key with a stored triple but carries a different
//! object. Conflicting updates are parked in the confirmation manager until
//! the user confirms or rejects them, either explicitly or through a
//! closed-vocabulary natural-language response.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::knowledge::models::{ConflictResult, KnowledgeSource, KnowledgeTriple, PendingUpdate};
use crate::knowledge::store::KnowledgeStore;
use crate::storage::Result;

// ============================================================================
// CONFLICT DETECTOR
// ============================================================================

/// Configuration for knowledge conflict detection
#[derive(Debug, Clone)]
pub struct KnowledgeConflictConfig {
    /// Semantic threshold for "about the same thing" (future predicate
    /// equivalence checks)
    pub similarity_threshold: f64,
}

impl Default for KnowledgeConflictConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.7,
        }
    }
}

/// Detects conflicts between new and stored knowledge triples
pub struct KnowledgeConflictDetector {
    store: Arc<KnowledgeStore>,
    #[allow(dead_code)]
    config: KnowledgeConflictConfig,
}

impl KnowledgeConflictDetector {
    pub fn new(store: Arc<KnowledgeStore>, config: KnowledgeConflictConfig) -> Self {
        Self { store, config }
    }

    /// Check whether a new triple conflicts with existing knowledge
    pub async fn check(&self, new_triple: &KnowledgeTriple) -> Result<ConflictResult> {
        if !self.store.is_available() {
            return Ok(ConflictResult::default());
        }

        let conflicts = self.store.find_potential_conflicts(new_triple).await?;
        for existing in conflicts {
            if is_direct_conflict(new_triple, &existing) {
                let suggestion = generate_suggestion(&existing, new_triple);
                return Ok(ConflictResult {
                    has_conflict: true,
                    existing_triple: Some(existing),
                    new_triple: Some(new_triple.clone()),
                    conflict_type: "value_change".to_string(),
                    suggestion,
                });
            }
        }

        Ok(ConflictResult::default())
    }

    /// Check several triples in sequence
    pub async fn check_batch(&self, triples: &[KnowledgeTriple]) -> Result<Vec<ConflictResult>> {
        let mut results = Vec::with_capacity(triples.len());
        for triple in triples {
            results.push(self.check(triple).await?);
        }
        Ok(results)
    }
}

/// Same key, different object value
fn is_direct_conflict(new: &KnowledgeTriple, existing: &KnowledgeTriple) -> bool {
    new.same_key(existing) && new.object.to_lowercase() != existing.object.to_lowercase()
}

fn generate_suggestion(existing: &KnowledgeTriple, new: &KnowledgeTriple) -> String {
    let display_predicate = existing.predicate.replace('_', " ");
    format!(
        "I have recorded that {}'s {} is {}. You mentioned {}. Has this information been updated?",
        existing.subject, display_predicate, existing.object, new.object
    )
}

// ============================================================================
// CONFIRMATION MANAGER
// ============================================================================

/// Classification of a user's reply to a confirmation prompt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseClass {
    Positive,
    Negative,
    Unrecognized,
}

const POSITIVE_WORDS: [&str; 8] = ["yes", "y", "ok", "okay", "confirm", "update", "sure", "correct"];
const NEGATIVE_WORDS: [&str; 6] = ["no", "n", "nope", "cancel", "keep", "reject"];
const POSITIVE_MARKERS: [&str; 8] = ["是", "是的", "对", "对的", "确认", "更新", "确定", "好的"];
const NEGATIVE_MARKERS: [&str; 6] = ["不", "不是", "否", "取消", "算了", "不用"];

/// Manages pending knowledge updates awaiting user confirmation
pub struct ConfirmationManager {
    store: Arc<KnowledgeStore>,
    pending: Mutex<HashMap<String, PendingUpdate>>,
}

impl ConfirmationManager {
    pub fn new(store: Arc<KnowledgeStore>) -> Self {
        Self {
            store,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Park a pending update; returns the key used to resolve it later
    pub fn add_pending(
        &self,
        new_triple: KnowledgeTriple,
        existing_triple: Option<KnowledgeTriple>,
        confirmation_message: impl Into<String>,
    ) -> String {
        let key = format!("pending_{}", new_triple.id);
        let update = PendingUpdate::new(new_triple, existing_triple, confirmation_message);
        if let Ok(mut pending) = self.pending.lock() {
            pending.insert(key.clone(), update);
        }
        key
    }

    pub fn get_pending(&self, key: &str) -> Option<PendingUpdate> {
        self.pending.lock().ok().and_then(|p| p.get(key).cloned())
    }

    pub fn has_pending(&self) -> bool {
        self.pending.lock().map(|p| !p.is_empty()).unwrap_or(false)
    }

    pub fn pending_keys(&self) -> Vec<String> {
        self.pending
            .lock()
            .map(|p| p.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Drop entries past their expiry; returns how many were discarded
    pub fn purge_expired(&self) -> usize {
        let Ok(mut pending) = self.pending.lock() else {
            return 0;
        };
        let before = pending.len();
        pending.retain(|_, update| !update.is_expired());
        before - pending.len()
    }

    pub fn clear_all(&self) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.clear();
        }
    }

    /// Confirm and execute a pending update.
    ///
    /// Updating an existing triple goes through the atomic update-plus-
    /// history path; a brand-new triple is stored as user-verified.
    pub async fn confirm(&self, key: &str, session_id: &str) -> Result<bool> {
        let update = {
            let Ok(mut pending) = self.pending.lock() else {
                return Ok(false);
            };
            pending.remove(key)
        };
        let Some(update) = update else {
            return Ok(false);
        };

        match update.existing_triple {
            Some(existing) => {
                self.store
                    .update(
                        &existing.id,
                        &update.new_triple.object,
                        KnowledgeSource::UserVerified,
                        1.0,
                        session_id,
                    )
                    .await?;
            }
            None => {
                let mut triple = update.new_triple;
                triple.source = KnowledgeSource::UserVerified;
                triple.confidence = 1.0;
                self.store.store(&triple).await?;
            }
        }
        Ok(true)
    }

    /// Discard a pending update
    pub fn reject(&self, key: &str) -> bool {
        self.pending
            .lock()
            .map(|mut p| p.remove(key).is_some())
            .unwrap_or(false)
    }

    /// Confirmation prompt for a detected conflict
    pub fn generate_confirmation_prompt(&self, conflict: &ConflictResult) -> String {
        let (Some(existing), Some(new)) = (&conflict.existing_triple, &conflict.new_triple) else {
            return String::new();
        };
        let display_predicate = existing.predicate.replace('_', " ");
        format!(
            "I have recorded that {}'s {} is {}.\n\nYou mentioned {}. Has this information been updated?",
            existing.subject, display_predicate, existing.object, new.object
        )
    }

    /// Classify a natural-language reply against the closed vocabulary.
    ///
    /// ASCII words match whole tokens; CJK markers match by containment.
    /// Anything else is unrecognized and leaves pending updates untouched.
    pub fn classify_response(&self, message: &str) -> ResponseClass {
        let lower = message.to_lowercase();
        let tokens: Vec<&str> = lower
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .collect();

        let is_positive = POSITIVE_WORDS.iter().any(|w| tokens.contains(w))
            || POSITIVE_MARKERS.iter().any(|m| lower.contains(m));
        let is_negative = NEGATIVE_WORDS.iter().any(|w| tokens.contains(w))
            || NEGATIVE_MARKERS.iter().any(|m| lower.contains(m));

        if is_positive {
            ResponseClass::Positive
        } else if is_negative {
            ResponseClass::Negative
        } else {
            ResponseClass::Unrecognized
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
