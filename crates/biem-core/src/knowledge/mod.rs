//! Knowledge Module
//!
//! The global knowledge pipeline: LLM-driven triple extraction, a versioned
//! store with global `(subject, predicate)` uniqueness, a separate vector
//! namespace for semantic retrieval, conflict detection with user
//! confirmation, and the plugin tying it into a conversation flow.

pub mod conflict;
pub mod extractor;
pub mod models;
pub mod plugin;
pub mod store;
pub mod vector_store;

pub use conflict::{
    ConfirmationManager, KnowledgeConflictConfig, KnowledgeConflictDetector, ResponseClass,
};
pub use extractor::{ExtractorConfig, KnowledgeExtractor, MessageRole, normalize_predicate};
pub use models::{
    ConflictResult, ExtractionResult, KnowledgeIntent, KnowledgeSource, KnowledgeTriple,
    KnowledgeUpdateEvent, PendingUpdate,
};
pub use plugin::{
    KnowledgeLearningPlugin, KnowledgePluginConfig, KnowledgePluginStats, ProcessAction,
    ProcessResult,
};
pub use store::{KnowledgeStore, KnowledgeStoreConfig, KnowledgeStoreStats};
pub use vector_store::{KnowledgeVectorConfig, KnowledgeVectorStats, KnowledgeVectorStore};
