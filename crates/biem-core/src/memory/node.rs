//! Memory Node - The unit of episodic memory
//!
//! Each node carries:
//! - Content and its embedding vector
//! - Extracted metadata (entities, sentiment, source, tags)
//! - Energy state driving tier residency
//! - A cache of outbound links (the graph store is authoritative)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// TIERS
// ============================================================================

/// Storage tier a node currently lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Tier {
    /// Working canvas - hot, high-energy nodes
    #[default]
    L1,
    /// Association web - every ingested node, vector indexed
    L2,
    /// Crystal - consolidated durable facts
    L3,
}

impl Tier {
    /// Convert to string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::L1 => "L1",
            Tier::L2 => "L2",
            Tier::L3 => "L3",
        }
    }

    /// Parse from string name, defaulting to L2 for unknown values
    pub fn parse_name(s: &str) -> Self {
        match s {
            "L1" => Tier::L1,
            "L3" => Tier::L3,
            _ => Tier::L2,
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// LINKS
// ============================================================================

/// Type of relationship between memory nodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkType {
    /// Sequential/time-based relationship
    Temporal,
    /// Meaning-based similarity
    Semantic,
    /// Cause-effect relationship
    Causal,
}

impl LinkType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkType::Temporal => "temporal",
            LinkType::Semantic => "semantic",
            LinkType::Causal => "causal",
        }
    }

    /// Parse from string name
    pub fn parse_name(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "temporal" => Some(LinkType::Temporal),
            "semantic" => Some(LinkType::Semantic),
            "causal" => Some(LinkType::Causal),
            _ => None,
        }
    }
}

impl std::fmt::Display for LinkType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Minimum weight an edge can carry
pub const MIN_LINK_WEIGHT: f64 = 0.1;

/// Maximum weight an edge can carry
pub const MAX_LINK_WEIGHT: f64 = 2.0;

/// Association edge between memory nodes
///
/// A directed relationship from source to target. At most one edge exists
/// per `(source_id, target_id, link_type)` key; re-inserting updates weight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Link {
    pub source_id: String,
    pub target_id: String,
    pub link_type: LinkType,
    pub weight: f64,
    pub created_at: DateTime<Utc>,
}

impl Link {
    /// Create a new link with the weight clamped into the valid range
    pub fn new(
        source_id: impl Into<String>,
        target_id: impl Into<String>,
        link_type: LinkType,
        weight: f64,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            target_id: target_id.into(),
            link_type,
            weight: weight.clamp(MIN_LINK_WEIGHT, MAX_LINK_WEIGHT),
            created_at: Utc::now(),
        }
    }

    /// Whether two links refer to the same `(source, target, type)` key
    pub fn same_key(&self, other: &Link) -> bool {
        self.source_id == other.source_id
            && self.target_id == other.target_id
            && self.link_type == other.link_type
    }

    /// Serialize to a JSON value
    pub fn to_dict(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    /// Deserialize from a JSON value
    pub fn from_dict(value: &serde_json::Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value.clone())
    }
}

// ============================================================================
// METADATA
// ============================================================================

/// Metadata associated with a memory node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryMetadata {
    /// When the underlying observation happened
    pub timestamp: DateTime<Utc>,
    /// Environment context
    pub location: String,
    /// Extracted entity anchors (first-occurrence order, deduplicated)
    pub entities: Vec<String>,
    /// Emotional polarity (-1 to 1)
    pub sentiment: f64,
    /// Origin of the memory (user, tool, agent, etc.)
    pub source: String,
    pub tags: Vec<String>,
}

impl Default for MemoryMetadata {
    fn default() -> Self {
        Self {
            timestamp: Utc::now(),
            location: String::new(),
            entities: vec![],
            sentiment: 0.0,
            source: String::new(),
            tags: vec![],
        }
    }
}

// ============================================================================
// MEMORY NODE
// ============================================================================

/// A single memory unit
///
/// Energy decays over time following `E = E_last * e^(-lambda * dt)` and is
/// boosted on access. Tier residency follows energy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryNode {
    /// Unique identifier (UUID v4)
    pub id: String,
    /// The remembered content, unbounded
    pub content: String,
    /// Semantic embedding (fixed dimension, discovered at init)
    pub vector: Vec<f32>,
    pub metadata: MemoryMetadata,
    /// Current energy level
    pub energy: f64,
    /// Energy at creation, kept for reference
    pub initial_energy: f64,
    pub last_accessed: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    /// Current storage tier
    pub tier: Tier,
    /// Partition key for memory isolation
    pub user_id: String,
    /// Cached outbound edges; the graph store holds the authoritative copy
    #[serde(default)]
    pub links: Vec<Link>,
}

impl Default for MemoryNode {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            content: String::new(),
            vector: vec![],
            metadata: MemoryMetadata::default(),
            energy: 1.0,
            initial_energy: 1.0,
            last_accessed: now,
            created_at: now,
            tier: Tier::L1,
            user_id: String::new(),
            links: vec![],
        }
    }
}

impl MemoryNode {
    /// Create a new node with the given content
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Default::default()
        }
    }

    /// Update `last_accessed` to now (activates the memory)
    pub fn touch(&mut self) {
        self.last_accessed = Utc::now();
    }

    /// Cache a link on the node if an equal-keyed one is not already present
    pub fn add_link(&mut self, link: Link) {
        if !self.links.iter().any(|l| l.same_key(&link)) {
            self.links.push(link);
        }
    }

    /// Cached links of a specific type
    pub fn links_by_type(&self, link_type: LinkType) -> Vec<&Link> {
        self.links
            .iter()
            .filter(|l| l.link_type == link_type)
            .collect()
    }

    /// Short display form with an energy badge
    pub fn summarize(&self, max_length: usize) -> String {
        let mut preview: String = self.content.chars().take(max_length).collect();
        if self.content.chars().count() > max_length {
            preview.push_str("...");
        }
        format!("[E={:.2}] {}", self.energy, preview)
    }

    /// Serialize to bytes (JSON)
    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }

    /// Deserialize from bytes produced by [`MemoryNode::to_bytes`]
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

// ============================================================================
// CONFLICTS
// ============================================================================

/// Classification of a detected conflict between two memories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConflictKind {
    /// Opposing facts
    Contradiction,
    /// One statement supersedes the other
    Update,
    /// One statement adds detail to the other
    Refinement,
    /// Compatible information
    #[default]
    None,
}

impl ConflictKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictKind::Contradiction => "contradiction",
            ConflictKind::Update => "update",
            ConflictKind::Refinement => "refinement",
            ConflictKind::None => "none",
        }
    }

    pub fn parse_name(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "contradiction" => ConflictKind::Contradiction,
            "update" => ConflictKind::Update,
            "refinement" => ConflictKind::Refinement,
            _ => ConflictKind::None,
        }
    }
}

/// Record of a detected contradiction between two nodes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictNode {
    pub id: String,
    /// Existing memory
    pub node_a_id: String,
    /// New conflicting memory
    pub node_b_id: String,
    /// Semantic similarity between the two contents
    pub similarity: f64,
    pub conflict_type: ConflictKind,
    /// Human-readable conflict description
    pub description: String,
    pub resolved: bool,
    /// How the conflict was resolved
    pub resolution: String,
    pub created_at: DateTime<Utc>,
}

impl ConflictNode {
    pub fn new(
        node_a_id: impl Into<String>,
        node_b_id: impl Into<String>,
        similarity: f64,
        conflict_type: ConflictKind,
        description: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            node_a_id: node_a_id.into(),
            node_b_id: node_b_id.into(),
            similarity,
            conflict_type,
            description: description.into(),
            resolved: false,
            resolution: String::new(),
            created_at: Utc::now(),
        }
    }
}

/// Action a dissonance signal asks the caller to take
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DissonanceAction {
    /// Ask for explicit confirmation before acting
    Confirm,
    /// Old memory is weak enough to restructure automatically
    Restructure,
    /// Keep both memories
    Ignore,
}

/// Signal emitted when cognitive dissonance is detected
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DissonanceSignal {
    pub conflict: ConflictNode,
    pub action_required: DissonanceAction,
    /// 0-1, higher = more urgent
    pub priority: f64,
    /// Additional context for resolution
    pub context: String,
}

// ============================================================================
// CRYSTAL FACTS
// ============================================================================

/// A consolidated semantic fact stored in L3
///
/// Created by merging frequently activated, highly related memory nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrystalFact {
    pub id: String,
    pub content: String,
    pub source_node_ids: Vec<String>,
    pub confidence: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub metadata: serde_json::Value,
    pub user_id: String,
}

impl Default for CrystalFact {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            content: String::new(),
            source_node_ids: vec![],
            confidence: 1.0,
            created_at: now,
            updated_at: now,
            metadata: serde_json::json!({}),
            user_id: String::new(),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
