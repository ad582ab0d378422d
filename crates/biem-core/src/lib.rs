//! # BIEM Core
//!
//! Bio-inspired evolving memory engine for conversational agents:
//!
//! - **Three-tier storage**: L1 working canvas, L2 association web
//!   (vector + graph), L3 crystal for consolidated facts
//! - **Energy decay**: exponential `E = E_last * e^(-lambda * dt)` with
//!   activation boosts driving promotion and demotion
//! - **Associative graph**: temporal/semantic/causal edges with spreading
//!   activation (BFS wavefront, per-hop decay)
//! - **Two-stage recall**: vector similarity fused with graph activation
//! - **Knowledge pipeline**: LLM triple extraction, globally unique
//!   `(subject, predicate)` facts with version history, conflict-gated
//!   updates with user confirmation
//! - **Per-user memory, global knowledge**: memory nodes, links, and facts
//!   are partitioned by user; knowledge triples are shared, attributed only
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use biem_core::prelude::*;
//!
//! let manager = Arc::new(MemoryManager::new(MemoryConfig::default()));
//! manager.set_embedder(my_embedder);
//! manager.initialize().await?;
//!
//! let (node, conflicts) = manager
//!     .ingest("User prefers dark mode", IngestOptions::default())
//!     .await?;
//!
//! let hits = manager.recall("ui preferences", Some(5), true, &[]).await?;
//! ```
//!
//! External capabilities (text embedding and chat completion) are traits in
//! [`llm`]; the engine degrades gracefully when they are absent.

// ============================================================================
// MODULES
// ============================================================================

pub mod config;
pub mod embedding;
pub mod knowledge;
pub mod llm;
pub mod memory;
pub mod storage;

// ============================================================================
// PUBLIC API RE-EXPORTS
// ============================================================================

// Memory types
pub use memory::{
    AssociationRouter, ConflictChecker, ConflictConfig, ConflictKind, ConflictNode, CrystalFact,
    DissonanceAction, DissonanceSignal, Encoder, EncoderConfig, EnergyConfig, EnergyController,
    IngestOptions, Link, LinkType, MemoryConfig, MemoryManager, MemoryMetadata, MemoryNode,
    MemoryStats, RecallConfig, ResolveAction, RouterConfig, Tier, TierConfig, TierManager,
    TierStats,
};

// Storage layer
pub use storage::{
    Direction, FilterOp, FilterValue, GraphConfig, L1Config, L1WorkingStore, L2GraphStore,
    L2VectorStore, L3Config, L3CrystalStore, Result, ScalarFilter, StorageError,
    VectorStoreConfig,
};

// Knowledge pipeline
pub use knowledge::{
    ConfirmationManager, ExtractionResult, ExtractorConfig, KnowledgeConflictDetector,
    KnowledgeExtractor, KnowledgeIntent, KnowledgeLearningPlugin, KnowledgePluginConfig,
    KnowledgeSource, KnowledgeStore, KnowledgeStoreConfig, KnowledgeTriple, KnowledgeUpdateEvent,
    KnowledgeVectorStore, MessageRole, ProcessAction, ProcessResult,
};

// LLM capability seam
pub use llm::{
    ChatCompleter, ChatMessage, ChatRole, ConflictVerdict, ConflictVerifier, Embedder, LlmError,
};

// Environment configuration
pub use config::BiemConfig;

// Vector math
pub use embedding::{cosine_similarity, euclidean_distance};

// ============================================================================
// VERSION INFO
// ============================================================================

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// ============================================================================
// PRELUDE
// ============================================================================

/// Convenient imports for common usage
pub mod prelude {
    pub use crate::{
        BiemConfig, ChatCompleter, ChatMessage, DissonanceSignal, Embedder, IngestOptions,
        KnowledgeLearningPlugin, KnowledgePluginConfig, KnowledgeTriple, Link, LinkType,
        MemoryConfig, MemoryManager, MemoryNode, MessageRole, ResolveAction, Result, ScalarFilter,
        StorageError, Tier,
    };
}
