//! Knowledge Learning Plugin - Conversation-flow integration
//!
//! The entry point for the global knowledge pipeline: extract triples from
//! a message, gate them through conflict detection, auto-store the
//! uncontested ones, and park conflicting updates for user confirmation.
//! Knowledge is shared across users; only attribution is per-user.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::knowledge::conflict::{
    ConfirmationManager, KnowledgeConflictConfig, KnowledgeConflictDetector, ResponseClass,
};
use crate::knowledge::extractor::{ExtractorConfig, KnowledgeExtractor, MessageRole};
use crate::knowledge::models::{ConflictResult, KnowledgeTriple};
use crate::knowledge::store::{KnowledgeStore, KnowledgeStoreConfig, KnowledgeStoreStats};
use crate::knowledge::vector_store::{
    KnowledgeVectorConfig, KnowledgeVectorStats, KnowledgeVectorStore,
};
use crate::llm::ChatCompleter;
use crate::memory::encoder::Encoder;
use crate::storage::Result;

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Configuration for the knowledge learning plugin
#[derive(Debug, Clone)]
pub struct KnowledgePluginConfig {
    pub store: KnowledgeStoreConfig,
    pub vector: KnowledgeVectorConfig,
    pub extractor: ExtractorConfig,
    pub conflict: KnowledgeConflictConfig,

    /// Store triples that have no conflicts without asking
    pub auto_store: bool,
    /// Process assistant messages too
    pub extract_from_agent: bool,
    /// Max knowledge items included in a context block
    pub max_context_items: usize,
    /// Enable the triple vector store
    pub enable_vector_search: bool,

    /// Contributor attribution for this session
    pub user_id: String,
    pub session_id: String,
}

impl Default for KnowledgePluginConfig {
    fn default() -> Self {
        Self {
            store: KnowledgeStoreConfig::default(),
            vector: KnowledgeVectorConfig::default(),
            extractor: ExtractorConfig::default(),
            conflict: KnowledgeConflictConfig::default(),
            auto_store: true,
            extract_from_agent: false,
            max_context_items: 10,
            enable_vector_search: true,
            user_id: String::new(),
            session_id: String::new(),
        }
    }
}

/// What processing a message resulted in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessAction {
    None,
    Stored,
    Conflict,
}

/// Result of processing a message for knowledge
#[derive(Debug, Clone)]
pub struct ProcessResult {
    pub action: ProcessAction,
    pub triples_stored: Vec<KnowledgeTriple>,
    pub conflicts: Vec<ConflictResult>,
    pub confirmation_prompts: Vec<String>,
    pub pending_keys: Vec<String>,
}

impl ProcessResult {
    fn none() -> Self {
        Self {
            action: ProcessAction::None,
            triples_stored: vec![],
            conflicts: vec![],
            confirmation_prompts: vec![],
            pending_keys: vec![],
        }
    }

    pub fn has_pending_confirmation(&self) -> bool {
        !self.pending_keys.is_empty()
    }
}

/// Aggregated plugin statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KnowledgePluginStats {
    pub store: KnowledgeStoreStats,
    pub pending_confirmations: usize,
    pub vector: Option<KnowledgeVectorStats>,
}

// ============================================================================
// PLUGIN
// ============================================================================

/// Main integration point for knowledge learning
pub struct KnowledgeLearningPlugin {
    config: KnowledgePluginConfig,
    store: Arc<KnowledgeStore>,
    vector: RwLock<Option<Arc<KnowledgeVectorStore>>>,
    extractor: Arc<KnowledgeExtractor>,
    detector: KnowledgeConflictDetector,
    confirmation: ConfirmationManager,
    initialized: AtomicBool,
}

impl KnowledgeLearningPlugin {
    pub fn new(config: KnowledgePluginConfig) -> Self {
        let store = Arc::new(KnowledgeStore::new(config.store.clone()));
        let extractor = Arc::new(KnowledgeExtractor::new(config.extractor.clone()));
        let detector = KnowledgeConflictDetector::new(store.clone(), config.conflict.clone());
        let confirmation = ConfirmationManager::new(store.clone());

        Self {
            config,
            store,
            vector: RwLock::new(None),
            extractor,
            detector,
            confirmation,
            initialized: AtomicBool::new(false),
        }
    }

    /// Connect the backing stores and wire capabilities.
    ///
    /// A relational connection failure disables knowledge learning for the
    /// process; a vector connection failure only disables semantic search.
    pub async fn initialize(
        &self,
        completer: Option<Arc<dyn ChatCompleter>>,
        encoder: Option<Arc<Encoder>>,
    ) -> Result<()> {
        if let Err(e) = self.store.connect().await {
            tracing::warn!("Knowledge store unavailable, learning disabled: {}", e);
            return Ok(());
        }

        if self.config.enable_vector_search {
            let vector = Arc::new(KnowledgeVectorStore::new(self.config.vector.clone()));
            match vector.connect().await {
                Ok(()) => {
                    if let Some(encoder) = encoder {
                        vector.set_encoder(encoder);
                    }
                    if let Ok(mut guard) = self.vector.write() {
                        *guard = Some(vector);
                    }
                }
                Err(e) => {
                    tracing::warn!("Knowledge vector search disabled: {}", e);
                }
            }
        }

        if let Some(completer) = completer {
            self.extractor.set_completer(completer);
        }

        self.initialized.store(true, Ordering::Release);
        Ok(())
    }

    pub async fn shutdown(&self) -> Result<()> {
        if self.store.is_available() {
            self.store.disconnect().await?;
        }
        let vector = self.vector.read().ok().and_then(|g| g.clone());
        if let Some(vector) = vector {
            vector.disconnect().await?;
        }
        self.initialized.store(false, Ordering::Release);
        Ok(())
    }

    pub fn is_available(&self) -> bool {
        self.initialized.load(Ordering::Acquire) && self.store.is_available()
    }

    /// The backing triple store
    pub fn store(&self) -> &Arc<KnowledgeStore> {
        &self.store
    }

    /// The confirmation manager, for hosts driving resolution directly
    pub fn confirmation(&self) -> &ConfirmationManager {
        &self.confirmation
    }

    fn vector_store(&self) -> Option<Arc<KnowledgeVectorStore>> {
        self.vector.read().ok().and_then(|g| g.clone())
    }

    // ========================================================================
    // MESSAGE PROCESSING
    // ========================================================================

    /// Process a message for knowledge extraction and storage.
    ///
    /// Conflicting triples become pending confirmations, except that
    /// agent-sourced triples with strictly higher confidence than the
    /// stored value auto-update without asking.
    pub async fn process_message(&self, message: &str, role: MessageRole) -> Result<ProcessResult> {
        if !self.is_available() {
            return Ok(ProcessResult::none());
        }
        if role == MessageRole::Assistant && !self.config.extract_from_agent {
            return Ok(ProcessResult::none());
        }

        let extraction = self
            .extractor
            .extract(message, &self.config.session_id, &self.config.user_id, role)
            .await;
        if !extraction.is_factual || extraction.triples.is_empty() {
            return Ok(ProcessResult::none());
        }

        let mut stored = vec![];
        let mut conflicts = vec![];
        let mut prompts = vec![];
        let mut pending_keys = vec![];

        for triple in extraction.triples {
            let conflict = self.detector.check(&triple).await?;

            if conflict.has_conflict {
                let existing_confidence = conflict
                    .existing_triple
                    .as_ref()
                    .map(|t| t.confidence)
                    .unwrap_or(0.0);

                if triple.source.is_agent() && triple.confidence > existing_confidence {
                    // Fresher agent knowledge replaces the value directly
                    let updated = self.store_triple(&triple).await?;
                    stored.push(updated);
                    continue;
                }

                let prompt = self.confirmation.generate_confirmation_prompt(&conflict);
                let key = self.confirmation.add_pending(
                    triple,
                    conflict.existing_triple.clone(),
                    prompt.clone(),
                );
                conflicts.push(conflict);
                prompts.push(prompt);
                pending_keys.push(key);
            } else if self.config.auto_store {
                let updated = self.store_triple(&triple).await?;
                stored.push(updated);
            }
        }

        let action = if !conflicts.is_empty() {
            ProcessAction::Conflict
        } else if !stored.is_empty() {
            ProcessAction::Stored
        } else {
            ProcessAction::None
        };

        Ok(ProcessResult {
            action,
            triples_stored: stored,
            conflicts,
            confirmation_prompts: prompts,
            pending_keys,
        })
    }

    async fn store_triple(&self, triple: &KnowledgeTriple) -> Result<KnowledgeTriple> {
        let stored = self.store.store(triple).await?;
        if let Some(vector) = self.vector_store() {
            if let Err(e) = vector.store(&stored).await {
                tracing::warn!("Failed to index triple vector: {}", e);
            }
        }
        Ok(stored)
    }

    /// Interpret a user's reply to outstanding confirmation prompts.
    ///
    /// Returns `(handled, reply)`; an unrecognized reply is not handled and
    /// leaves the pending updates in place.
    pub async fn process_confirmation_response(&self, message: &str) -> Result<(bool, String)> {
        if !self.confirmation.has_pending() {
            return Ok((false, String::new()));
        }

        match self.confirmation.classify_response(message) {
            ResponseClass::Positive => {
                for key in self.confirmation.pending_keys() {
                    self.confirmation.confirm(&key, &self.config.session_id).await?;
                }
                Ok((true, "Understood, the knowledge has been updated.".to_string()))
            }
            ResponseClass::Negative => {
                for key in self.confirmation.pending_keys() {
                    self.confirmation.reject(&key);
                }
                Ok((true, "Understood, keeping the existing records.".to_string()))
            }
            ResponseClass::Unrecognized => Ok((false, String::new())),
        }
    }

    /// Explicitly confirm or reject a pending update by key
    pub async fn confirm_update(&self, key: &str, confirmed: bool) -> Result<bool> {
        if confirmed {
            self.confirmation.confirm(key, &self.config.session_id).await
        } else {
            Ok(self.confirmation.reject(key))
        }
    }

    // ========================================================================
    // RETRIEVAL
    // ========================================================================

    /// Relevant knowledge context for a query, formatted for prompt
    /// injection. Vector search is preferred; full-text is the fallback.
    pub async fn get_context_for_query(
        &self,
        query: &str,
        max_items: Option<usize>,
    ) -> Result<String> {
        if !self.is_available() {
            return Ok(String::new());
        }
        let max_items = max_items.unwrap_or(self.config.max_context_items);

        let mut triples = vec![];
        if let Some(vector) = self.vector_store() {
            for (triple_id, _) in vector.search(query, max_items, 0.5).await? {
                if let Some(triple) = self.store.get(&triple_id).await? {
                    triples.push(triple);
                }
            }
        }
        if triples.is_empty() {
            triples = self.store.search(query, max_items).await?;
        }
        if triples.is_empty() {
            return Ok(String::new());
        }

        let mut lines = vec!["## Learned Knowledge".to_string()];
        for t in &triples {
            let tag = if t.confidence >= 1.0 {
                "[verified]".to_string()
            } else {
                format!("[{}]", t.source)
            };
            lines.push(format!("- {} {}", t.display(), tag));
        }
        Ok(lines.join("\n"))
    }

    /// All stored knowledge, bounded
    pub async fn get_all_knowledge(&self, limit: usize) -> Result<Vec<KnowledgeTriple>> {
        if !self.is_available() {
            return Ok(vec![]);
        }
        self.store.get_all(limit).await
    }

    /// Everything known about a subject
    pub async fn get_knowledge_about(&self, subject: &str) -> Result<Vec<KnowledgeTriple>> {
        if !self.is_available() {
            return Ok(vec![]);
        }
        self.store.query_by_subject(subject, 20).await
    }

    pub async fn get_stats(&self) -> Result<KnowledgePluginStats> {
        let store = self.store.get_stats().await?;
        Ok(KnowledgePluginStats {
            store,
            pending_confirmations: self.confirmation.pending_keys().len(),
            vector: self.vector_store().map(|v| v.stats()),
        })
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{ChatMessage, LlmError};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Completer that replays scripted replies in order
    struct ScriptedCompleter {
        replies: Mutex<VecDeque<String>>,
    }

    impl ScriptedCompleter {
        fn new(replies: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.iter().map(|r| r.to_string()).collect()),
            })
        }
    }

    #[async_trait]
    impl ChatCompleter for ScriptedCompleter {
        async fn complete(&self, _messages: &[ChatMessage]) -> std::result::Result<String, LlmError> {
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| LlmError::Backend("script exhausted".to_string()))
        }
    }

    const STATEMENT_32K: &str = r#"{"is_factual": true, "intent": "statement", "triples": [{"subject": "GPT-4", "predicate": "context_window", "object": "32k"}], "confidence": 0.9}"#;
    const CORRECTION_128K: &str = r#"{"is_factual": true, "intent": "correction", "triples": [{"subject": "GPT-4", "predicate": "context_window", "object": "128k"}], "confidence": 0.9}"#;

    async fn plugin_with_replies(replies: &[&str]) -> KnowledgeLearningPlugin {
        let plugin = KnowledgeLearningPlugin::new(KnowledgePluginConfig {
            enable_vector_search: false,
            session_id: "sess".to_string(),
            user_id: "u1".to_string(),
            ..Default::default()
        });
        plugin
            .initialize(Some(ScriptedCompleter::new(replies)), None)
            .await
            .unwrap();
        plugin
    }

    #[tokio::test]
    async fn test_statement_auto_stored() {
        let plugin = plugin_with_replies(&[STATEMENT_32K]).await;
        let result = plugin
            .process_message("GPT-4 has a context window of 32k", MessageRole::User)
            .await
            .unwrap();

        assert_eq!(result.action, ProcessAction::Stored);
        assert_eq!(result.triples_stored.len(), 1);
        assert_eq!(result.triples_stored[0].version, 1);

        let stored = plugin
            .store()
            .get_by_subject_predicate("GPT-4", "context_window")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.object, "32k");
    }

    #[tokio::test]
    async fn test_correction_flows_through_confirmation() {
        let plugin = plugin_with_replies(&[STATEMENT_32K, CORRECTION_128K]).await;
        plugin
            .process_message("GPT-4 has a context window of 32k", MessageRole::User)
            .await
            .unwrap();

        let result = plugin
            .process_message(
                "Actually, GPT-4 now supports 128k context, not 32k",
                MessageRole::User,
            )
            .await
            .unwrap();
        assert_eq!(result.action, ProcessAction::Conflict);
        assert!(result.has_pending_confirmation());
        assert!(result.confirmation_prompts[0].contains("32k"));
        assert!(result.confirmation_prompts[0].contains("128k"));

        // Not yet applied
        let current = plugin
            .store()
            .get_by_subject_predicate("GPT-4", "context_window")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(current.object, "32k");

        // Natural-language confirmation applies the update
        let (handled, _) = plugin.process_confirmation_response("yes, update it").await.unwrap();
        assert!(handled);

        let updated = plugin
            .store()
            .get_by_subject_predicate("GPT-4", "context_window")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.object, "128k");
        assert_eq!(updated.version, 2);
        assert_eq!(updated.previous_values, vec!["32k"]);

        let history = plugin.store().get_history(&updated.id, 10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].old_value, "32k");
        assert_eq!(history[0].new_value, "128k");
    }

    #[tokio::test]
    async fn test_unrecognized_response_leaves_pending() {
        let plugin = plugin_with_replies(&[STATEMENT_32K, CORRECTION_128K]).await;
        plugin
            .process_message("GPT-4 has a context window of 32k", MessageRole::User)
            .await
            .unwrap();
        plugin
            .process_message("Actually, GPT-4 now supports 128k context", MessageRole::User)
            .await
            .unwrap();

        let (handled, _) = plugin
            .process_confirmation_response("interesting, why is that?")
            .await
            .unwrap();
        assert!(!handled);
        assert!(plugin.confirmation().has_pending());
    }

    #[tokio::test]
    async fn test_rejection_keeps_old_value() {
        let plugin = plugin_with_replies(&[STATEMENT_32K, CORRECTION_128K]).await;
        plugin
            .process_message("GPT-4 has a context window of 32k", MessageRole::User)
            .await
            .unwrap();
        plugin
            .process_message("Actually, GPT-4 now supports 128k context", MessageRole::User)
            .await
            .unwrap();

        let (handled, _) = plugin.process_confirmation_response("no, keep it").await.unwrap();
        assert!(handled);

        let current = plugin
            .store()
            .get_by_subject_predicate("GPT-4", "context_window")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(current.object, "32k");
        assert_eq!(current.version, 1);
    }

    #[tokio::test]
    async fn test_agent_higher_confidence_auto_updates() {
        const AGENT_SEARCH: &str = r#"{"is_factual": true, "intent": "statement", "triples": [{"subject": "GPT-4", "predicate": "context_window", "object": "128k"}], "confidence": 0.95}"#;

        let plugin = KnowledgeLearningPlugin::new(KnowledgePluginConfig {
            enable_vector_search: false,
            extract_from_agent: true,
            session_id: "sess".to_string(),
            ..Default::default()
        });
        plugin
            .initialize(
                Some(ScriptedCompleter::new(&[STATEMENT_32K, AGENT_SEARCH])),
                None,
            )
            .await
            .unwrap();

        plugin
            .process_message("GPT-4 has a context window of 32k", MessageRole::User)
            .await
            .unwrap();

        let result = plugin
            .process_message(
                "According to the search result, GPT-4 supports 128k context",
                MessageRole::Assistant,
            )
            .await
            .unwrap();
        assert_eq!(result.action, ProcessAction::Stored);
        assert!(!result.has_pending_confirmation());

        let updated = plugin
            .store()
            .get_by_subject_predicate("GPT-4", "context_window")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.object, "128k");
        assert_eq!(updated.version, 2);
    }

    #[tokio::test]
    async fn test_context_block_formatting() {
        let plugin = plugin_with_replies(&[STATEMENT_32K]).await;
        plugin
            .process_message("GPT-4 has a context window of 32k", MessageRole::User)
            .await
            .unwrap();

        let context = plugin.get_context_for_query("GPT-4", None).await.unwrap();
        assert!(context.starts_with("## Learned Knowledge"));
        assert!(context.contains("(GPT-4, context_window, 32k)"));
        assert!(context.contains("[user_stated]"));
    }

    #[tokio::test]
    async fn test_stats() {
        let plugin = plugin_with_replies(&[STATEMENT_32K, CORRECTION_128K]).await;
        plugin
            .process_message("GPT-4 has a context window of 32k", MessageRole::User)
            .await
            .unwrap();
        plugin
            .process_message("Actually, GPT-4 now supports 128k context", MessageRole::User)
            .await
            .unwrap();

        let stats = plugin.get_stats().await.unwrap();
        assert_eq!(stats.store.total_triples, 1);
        assert_eq!(stats.pending_confirmations, 1);
        assert!(stats.vector.is_none());
    }
}
