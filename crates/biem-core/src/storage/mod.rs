//! Storage Module
//!
//! The three-tier storage hierarchy:
//! - L1 working store: in-process map of hot, high-energy nodes
//! - L2 vector store: authoritative node rows + in-process cosine index
//! - L2 graph store: typed weighted association web with spreading activation
//! - L3 crystal store: durable relational store for facts and persisted links

mod l1_working;
mod l2_graph;
mod l2_vector;
mod l3_crystal;

pub use l1_working::{L1Config, L1Stats, L1WorkingStore};
pub use l2_graph::{Direction, GraphConfig, GraphStats, L2GraphStore};
pub use l2_vector::{
    FilterOp, FilterValue, L2VectorStore, ScalarFilter, VectorStoreConfig, VectorStoreStats,
};
pub use l3_crystal::{CrystalStats, L3CrystalStore, L3Config};
pub(crate) use l3_crystal::sanitize_fts_query;

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Storage error type shared across tiers
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Operation attempted before `connect` completed
    #[error("Storage not ready: {0}")]
    NotReady(String),
    /// Backend cannot be reached; callers degrade rather than crash
    #[error("Backend unavailable: {0}")]
    Unavailable(String),
    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
    /// Node or record not found
    #[error("Not found: {0}")]
    NotFound(String),
    /// Input violates a contract
    #[error("Validation error: {0}")]
    Validation(String),
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// External call exceeded its budget
    #[error("Operation timed out: {0}")]
    Timeout(String),
}

/// Storage result type
pub type Result<T> = std::result::Result<T, StorageError>;
