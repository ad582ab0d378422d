//! Memory Manager - Public facade for the memory system
//!
//! Wires Encoder, Energy Controller, Tier Manager, Association Router, and
//! Conflict Checker behind one API: `ingest`, `recall`, `record_event`,
//! `get_context`, plus conflict management and passthroughs. Per-user
//! scoping is enforced here through an explicit current-user value; nothing
//! mutable is global.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use serde::{Deserialize, Serialize};

use crate::embedding::is_zero_vector;
use crate::llm::{
    CausalInferencer, ChatCompleter, ConflictVerifier, Consolidator, Embedder, ImportanceScorer,
    LlmConflictVerifier,
};
use crate::memory::conflict::{ConflictChecker, ConflictConfig};
use crate::memory::encoder::{Encoder, EncoderConfig};
use crate::memory::energy::{EnergyConfig, EnergyController};
use crate::memory::node::{CrystalFact, DissonanceSignal, MemoryNode};
use crate::memory::router::{AssociationRouter, RouterConfig};
use crate::memory::tier::{TierConfig, TierManager, TierStats};
use crate::storage::{
    GraphConfig, L1Config, L1WorkingStore, L2GraphStore, L2VectorStore, L3Config, L3CrystalStore,
    Result, ScalarFilter, StorageError, VectorStoreConfig,
};

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Master configuration for the memory system
#[derive(Debug, Clone)]
pub struct MemoryConfig {
    pub l1: L1Config,
    pub vector: VectorStoreConfig,
    pub graph: GraphConfig,
    pub l3: L3Config,
    pub energy: EnergyConfig,
    pub encoder: EncoderConfig,
    pub router: RouterConfig,
    pub conflict: ConflictConfig,
    pub tier: TierConfig,

    pub recall: RecallConfig,
    /// Start cleanup/consolidation loops on initialize
    pub auto_start_tasks: bool,
    /// Initial user identity
    pub user_id: String,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            l1: L1Config::default(),
            vector: VectorStoreConfig::default(),
            graph: GraphConfig::default(),
            l3: L3Config::default(),
            energy: EnergyConfig::default(),
            encoder: EncoderConfig::default(),
            router: RouterConfig::default(),
            conflict: ConflictConfig::default(),
            tier: TierConfig::default(),
            recall: RecallConfig::default(),
            auto_start_tasks: true,
            user_id: String::new(),
        }
    }
}

/// Recall tuning
#[derive(Debug, Clone)]
pub struct RecallConfig {
    pub default_limit: usize,
    pub spreading_hops: usize,
    pub spreading_decay: f64,
    /// Seeds taken from the top vector hits for spreading activation
    pub spreading_seeds: usize,
}

impl Default for RecallConfig {
    fn default() -> Self {
        Self {
            default_limit: 10,
            spreading_hops: 2,
            spreading_decay: 0.5,
            spreading_seeds: 5,
        }
    }
}

/// Options for a single ingest call
#[derive(Debug, Clone)]
pub struct IngestOptions {
    /// Origin of the memory (user, tool, agent, ...)
    pub source: String,
    /// Explicit importance in `[0, 1]`; None lets the heuristic decide
    pub importance: Option<f64>,
    pub location: String,
    pub tags: Vec<String>,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            source: "user".to_string(),
            importance: None,
            location: String::new(),
            tags: vec![],
        }
    }
}

/// How a pending conflict should be resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolveAction {
    KeepNew,
    KeepOld,
    Merge,
    Ignore,
}

/// Aggregated system statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryStats {
    pub tiers: TierStats,
    pub pending_conflicts: usize,
    pub initialized: bool,
}

// ============================================================================
// MANAGER
// ============================================================================

/// Main entry point for the memory system
pub struct MemoryManager {
    config: MemoryConfig,

    l1: Arc<L1WorkingStore>,
    l2_vector: Arc<L2VectorStore>,
    l3: Arc<L3CrystalStore>,
    graph: Arc<L2GraphStore>,

    energy: Arc<EnergyController>,
    encoder: Arc<Encoder>,
    router: Arc<AssociationRouter>,
    conflict: Arc<ConflictChecker>,
    tier: Arc<TierManager>,

    initialized: AtomicBool,
    pending_conflicts: Mutex<Vec<DissonanceSignal>>,
    current_user_id: RwLock<String>,
}

impl MemoryManager {
    pub fn new(config: MemoryConfig) -> Self {
        let l1 = Arc::new(L1WorkingStore::new(config.l1.clone()));
        let l2_vector = Arc::new(L2VectorStore::new(config.vector.clone()));
        let graph = Arc::new(L2GraphStore::new(config.graph.clone()));
        let l3 = Arc::new(L3CrystalStore::new(config.l3.clone()));

        let energy = Arc::new(EnergyController::new(config.energy.clone()));
        let encoder = Arc::new(Encoder::new(config.encoder.clone()));
        let router = Arc::new(AssociationRouter::new(graph.clone(), config.router.clone()));
        let conflict = Arc::new(ConflictChecker::new(config.conflict.clone()));

        let tier = Arc::new(TierManager::new(
            l1.clone(),
            l2_vector.clone(),
            graph.clone(),
            l3.clone(),
            energy.clone(),
            config.tier.clone(),
        ));

        let user_id = config.user_id.clone();
        Self {
            config,
            l1,
            l2_vector,
            l3,
            graph,
            energy,
            encoder,
            router,
            conflict,
            tier,
            initialized: AtomicBool::new(false),
            pending_conflicts: Mutex::new(vec![]),
            current_user_id: RwLock::new(user_id),
        }
    }

    // ========================================================================
    // LIFECYCLE
    // ========================================================================

    /// Connect all backends and start background tasks when configured
    pub async fn initialize(self: &Arc<Self>) -> Result<()> {
        if self.initialized.load(Ordering::Acquire) {
            return Ok(());
        }

        self.tier.connect_all().await?;
        self.router.set_l3(self.l3.clone(), self.tier.l3_available());
        self.encoder.initialize().await;

        if self.config.auto_start_tasks {
            self.tier.start_background_tasks();
        }

        self.initialized.store(true, Ordering::Release);
        Ok(())
    }

    /// Gracefully shut down the memory system
    pub async fn shutdown(&self) -> Result<()> {
        self.tier.disconnect_all().await?;
        self.energy.stop_decay_loop().await;
        self.initialized.store(false, Ordering::Release);
        Ok(())
    }

    fn ensure_initialized(&self) -> Result<()> {
        if self.initialized.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(StorageError::NotReady("memory manager".to_string()))
        }
    }

    /// Switch the current user identity for subsequent operations
    pub fn set_user_id(&self, user_id: impl Into<String>) {
        if let Ok(mut guard) = self.current_user_id.write() {
            *guard = user_id.into();
        }
    }

    pub fn current_user_id(&self) -> String {
        self.current_user_id.read().map(|g| g.clone()).unwrap_or_default()
    }

    // ========================================================================
    // CAPABILITY WIRING
    // ========================================================================

    pub fn set_embedder(&self, embedder: Arc<dyn Embedder>) {
        self.encoder.set_embedder(embedder);
    }

    pub fn set_importance_scorer(&self, scorer: Arc<dyn ImportanceScorer>) {
        self.energy.set_importance_scorer(scorer);
    }

    pub fn set_conflict_verifier(&self, verifier: Arc<dyn ConflictVerifier>) {
        self.conflict.set_verifier(verifier);
    }

    /// Wire conflict verification through a chat completion capability
    pub fn set_completer_for_conflicts(&self, completer: Arc<dyn ChatCompleter>) {
        self.conflict.set_verifier(Arc::new(LlmConflictVerifier::new(completer)));
    }

    pub fn set_consolidator(&self, consolidator: Arc<dyn Consolidator>) {
        self.tier.set_consolidator(consolidator);
    }

    pub fn set_causal_inferencer(&self, inferencer: Arc<dyn CausalInferencer>) {
        self.router.set_causal_inferencer(inferencer);
    }

    // ========================================================================
    // CORE API
    // ========================================================================

    /// Ingest new content into the memory system.
    ///
    /// Encodes the content, estimates initial energy, checks for conflicts
    /// against the most similar existing memories, stores the node, and
    /// establishes association links. Returned conflict signals are also
    /// queued on the manager.
    pub async fn ingest(
        &self,
        content: &str,
        options: IngestOptions,
    ) -> Result<(MemoryNode, Vec<DissonanceSignal>)> {
        self.ensure_initialized()?;
        let user_id = self.current_user_id();

        let mut node = self
            .encoder
            .encode(content, &options.source, &options.location, options.tags)
            .await;
        node.user_id = user_id.clone();

        node.energy = self
            .energy
            .estimate_initial_energy(content, "", options.importance)
            .await;
        node.initial_energy = node.energy;

        // Similar existing memories feed both conflict detection and linking
        let similar = self
            .l2_vector
            .search_by_vector(&node.vector, 10, &[], &user_id)
            .await?;
        let similar_nodes: Vec<MemoryNode> = similar.into_iter().map(|(n, _)| n).collect();

        let signals = self.conflict.check_conflicts(&node, &similar_nodes).await;
        if !signals.is_empty() {
            if let Ok(mut pending) = self.pending_conflicts.lock() {
                pending.extend(signals.clone());
            }
        }

        self.tier.store(&mut node).await?;

        let links = self.router.route_new_node(&node, &similar_nodes).await?;
        for link in links {
            node.add_link(link);
        }

        Ok((node, signals))
    }

    /// Recall relevant memories using two-stage retrieval.
    ///
    /// Stage 1 is a vector search over `2k` candidates. Stage 2 seeds
    /// spreading activation with the best hits and fuses the scores:
    /// `0.7 * similarity + 0.3 * activation` for vector hits, `0.5 *
    /// activation` for nodes only reached through the graph.
    pub async fn recall(
        &self,
        query: &str,
        top_k: Option<usize>,
        use_spreading: bool,
        filters: &[ScalarFilter],
    ) -> Result<Vec<MemoryNode>> {
        self.ensure_initialized()?;
        let user_id = self.current_user_id();
        let k = top_k.unwrap_or(self.config.recall.default_limit);
        if k == 0 {
            return Ok(vec![]);
        }

        let query_vector = self.encoder.generate_embedding(query).await;
        if is_zero_vector(&query_vector) {
            // Encoding failed; fall back to working memory
            return self.l1.top_k(k, &user_id).await;
        }

        let initial = self
            .l2_vector
            .search_by_vector(&query_vector, k * 2, filters, &user_id)
            .await?;
        if initial.is_empty() {
            return self.l1.top_k(k, &user_id).await;
        }

        if !use_spreading {
            return Ok(initial.into_iter().take(k).map(|(n, _)| n).collect());
        }

        let seeds: Vec<String> = initial
            .iter()
            .take(self.config.recall.spreading_seeds)
            .map(|(n, _)| n.id.clone())
            .collect();
        let activation = self
            .graph
            .spread_activation(
                &seeds,
                self.config.recall.spreading_hops,
                self.config.recall.spreading_decay,
                &user_id,
            )
            .await?;

        let mut combined: std::collections::HashMap<String, f64> = std::collections::HashMap::new();
        for (node, vec_score) in &initial {
            let act = activation.get(&node.id).copied().unwrap_or(0.0);
            combined.insert(node.id.clone(), 0.7 * (*vec_score as f64) + 0.3 * act);
        }
        for (node_id, act) in &activation {
            if !combined.contains_key(node_id) && *act > 0.1 {
                combined.insert(node_id.clone(), act * 0.5);
            }
        }

        let mut ranked: Vec<(String, f64)> = combined.into_iter().collect();
        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        ranked.truncate(k);

        let mut results = vec![];
        for (node_id, _) in ranked {
            if let Some(node) = self.tier.get(&node_id).await? {
                results.push(node);
            }
        }
        Ok(results)
    }

    /// Formatted context block for prompt injection
    pub async fn get_context(&self, current_input: &str, limit: usize) -> Result<String> {
        let memories = self.recall(current_input, Some(limit), true, &[]).await?;
        if memories.is_empty() {
            return Ok(String::new());
        }

        let mut lines = vec!["## Relevant Memories".to_string()];
        for (i, node) in memories.iter().enumerate() {
            let badge = if node.energy > 0.7 {
                "●"
            } else if node.energy > 0.3 {
                "○"
            } else {
                "◌"
            };
            let mut preview: String = node.content.chars().take(200).collect();
            if node.content.chars().count() > 200 {
                preview.push_str("...");
            }
            lines.push(format!("{}. [{} E={:.2}] {}", i + 1, badge, node.energy, preview));

            if !node.metadata.entities.is_empty() {
                let entities: Vec<String> =
                    node.metadata.entities.iter().take(5).cloned().collect();
                lines.push(format!("   Entities: {}", entities.join(", ")));
            }
        }
        Ok(lines.join("\n"))
    }

    /// Record an agent decision/event with optional feedback.
    ///
    /// Feedback scales to an energy boost of `feedback * 0.1` on each
    /// related node; positive feedback additionally creates causal links
    /// from the related nodes to the event.
    pub async fn record_event(
        &self,
        event_type: &str,
        content: &str,
        feedback: f64,
        related_node_ids: &[String],
    ) -> Result<MemoryNode> {
        self.ensure_initialized()?;

        let importance = 0.5 + feedback.abs() * 0.5;
        let (event_node, _) = self
            .ingest(
                content,
                IngestOptions {
                    source: "agent".to_string(),
                    importance: Some(importance),
                    tags: vec![event_type.to_string()],
                    ..Default::default()
                },
            )
            .await?;

        if feedback != 0.0 {
            let boost = feedback * 0.1;
            for node_id in related_node_ids {
                let Some(related) = self.tier.peek(node_id).await? else {
                    continue;
                };
                let new_energy = (related.energy + boost).clamp(0.0, 1.0);
                self.tier.update_energy(node_id, new_energy).await?;

                if feedback > 0.0 {
                    self.router
                        .create_causal_link(
                            node_id,
                            &event_node.id,
                            feedback.abs(),
                            &related.user_id,
                        )
                        .await?;
                }
            }
        }

        Ok(event_node)
    }

    // ========================================================================
    // CONFLICT MANAGEMENT
    // ========================================================================

    /// Pending conflict signals awaiting resolution
    pub fn get_pending_conflicts(&self) -> Vec<DissonanceSignal> {
        self.pending_conflicts.lock().map(|p| p.clone()).unwrap_or_default()
    }

    /// Resolve a pending conflict.
    ///
    /// `keep_new` deletes the existing node, `keep_old` the new one.
    /// `merge` keeps the new node, deletes the old one, and carries the
    /// higher of the two energies forward. `ignore` keeps both.
    pub async fn resolve_conflict(
        &self,
        conflict_id: &str,
        action: ResolveAction,
        _keep_node_id: Option<&str>,
    ) -> Result<bool> {
        self.ensure_initialized()?;

        let signal = {
            let Ok(mut pending) = self.pending_conflicts.lock() else {
                return Ok(false);
            };
            let Some(pos) = pending.iter().position(|s| s.conflict.id == conflict_id) else {
                return Ok(false);
            };
            pending.remove(pos)
        };

        let existing_id = &signal.conflict.node_a_id;
        let new_id = &signal.conflict.node_b_id;

        match action {
            ResolveAction::KeepNew => {
                self.delete_node(existing_id).await?;
            }
            ResolveAction::KeepOld => {
                self.delete_node(new_id).await?;
            }
            ResolveAction::Merge => {
                let old_energy =
                    self.tier.peek(existing_id).await?.map(|n| n.energy).unwrap_or(0.0);
                self.delete_node(existing_id).await?;
                if let Some(new_node) = self.tier.peek(new_id).await? {
                    if old_energy > new_node.energy {
                        self.tier.update_energy(new_id, old_energy).await?;
                    }
                }
            }
            ResolveAction::Ignore => {}
        }

        Ok(true)
    }

    // ========================================================================
    // DIRECT ACCESS
    // ========================================================================

    /// Get a specific node by ID (touch-on-read applies)
    pub async fn get_node(&self, node_id: &str) -> Result<Option<MemoryNode>> {
        self.ensure_initialized()?;
        self.tier.get(node_id).await
    }

    /// Delete a node and all its links
    pub async fn delete_node(&self, node_id: &str) -> Result<bool> {
        self.ensure_initialized()?;
        self.router.remove_node_links(node_id).await?;
        self.tier.delete(node_id).await
    }

    /// Nodes currently in working memory (L1), best first
    pub async fn get_working_memory(&self, limit: usize) -> Result<Vec<MemoryNode>> {
        self.ensure_initialized()?;
        self.l1.top_k(limit, &self.current_user_id()).await
    }

    /// Full-text search over consolidated facts in L3
    pub async fn search_facts(&self, query: &str, limit: usize) -> Result<Vec<CrystalFact>> {
        self.ensure_initialized()?;
        if !self.tier.l3_available() {
            return Ok(vec![]);
        }
        self.l3
            .search_facts(query, limit, 0.0, &self.current_user_id())
            .await
    }

    /// Comprehensive statistics
    pub async fn get_stats(&self) -> Result<MemoryStats> {
        self.ensure_initialized()?;
        Ok(MemoryStats {
            tiers: self.tier.get_stats().await,
            pending_conflicts: self.get_pending_conflicts().len(),
            initialized: true,
        })
    }

    /// The tier manager, exposed for maintenance passes and tests
    pub fn tier_manager(&self) -> &Arc<TierManager> {
        &self.tier
    }

    /// The encoder, exposed so the knowledge pipeline can share embeddings
    pub fn encoder(&self) -> &Arc<Encoder> {
        &self.encoder
    }

    /// The association graph, exposed for read-side inspection
    pub fn graph(&self) -> &Arc<L2GraphStore> {
        &self.graph
    }
}

// ============================================================================
// TESTS
// ============================================================================
