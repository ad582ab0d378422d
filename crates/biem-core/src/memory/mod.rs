//! Memory Module
//!
//! The episodic memory side of the engine:
//! - Data model (nodes, links, conflicts, crystal facts)
//! - Energy decay and activation
//! - Encoding (embeddings, entities, sentiment)
//! - Association routing and conflict checking
//! - Tier orchestration and the public facade

pub mod conflict;
pub mod encoder;
pub mod energy;
pub mod manager;
pub mod node;
pub mod router;
pub mod tier;

pub use conflict::{ConflictChecker, ConflictConfig};
pub use encoder::{Encoder, EncoderConfig};
pub use energy::{DecayInfo, DecaySource, EnergyConfig, EnergyController};
pub use manager::{
    IngestOptions, MemoryConfig, MemoryManager, MemoryStats, RecallConfig, ResolveAction,
};
pub use node::{
    ConflictKind, ConflictNode, CrystalFact, DissonanceAction, DissonanceSignal, Link, LinkType,
    MemoryMetadata, MemoryNode, Tier, MAX_LINK_WEIGHT, MIN_LINK_WEIGHT,
};
pub use router::{AssociationRouter, LinkStrategy, RouterConfig};
pub use tier::{TierConfig, TierManager, TierStats};
