//! Tier Manager - Placement, promotion, demotion, and consolidation
//!
//! Orchestrates data flow between storage tiers:
//! - L1 working canvas for hot, high-energy nodes
//! - L2 vector + graph stores as the authoritative association web
//! - L3 crystal for consolidated facts and persisted links
//!
//! Within a store the write order is L2 vector, then L2 graph, then L1, so a
//! node is always recoverable from L2 after a partial failure. L3 is
//! optional: if it cannot be reached at startup the manager runs degraded
//! for the rest of the process lifetime.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::embedding::cosine_similarity;
use crate::llm::Consolidator;
use crate::memory::energy::EnergyController;
use crate::memory::node::{CrystalFact, MemoryNode, Tier};
use crate::storage::{
    CrystalStats, GraphStats, L1Stats, L1WorkingStore, L2GraphStore, L2VectorStore,
    L3CrystalStore, Result, ScalarFilter, StorageError, VectorStoreStats,
};

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Configuration for tier management
#[derive(Debug, Clone)]
pub struct TierConfig {
    /// Min energy to be placed in L1 at store time
    pub l1_energy_threshold: f64,
    /// Energy needed to promote from L2 to L1
    pub l2_to_l1_threshold: f64,
    /// Energy below which an L1 node is demoted to L2
    pub l1_to_l2_threshold: f64,

    /// Min cluster size for consolidation
    pub consolidation_threshold: usize,
    /// Min pairwise similarity for a consolidation cluster
    pub consolidation_similarity: f64,
    /// Only nodes at or above this energy are scanned for consolidation
    pub consolidation_energy_floor: f64,
    /// Max nodes scanned per consolidation pass
    pub consolidation_scan_limit: usize,

    /// Interval between cleanup passes
    pub cleanup_interval: Duration,
    /// Interval between consolidation passes
    pub consolidation_interval: Duration,

    /// Max links re-hydrated into the graph from L3 at startup
    pub graph_hydration_limit: usize,
}

impl Default for TierConfig {
    fn default() -> Self {
        Self {
            l1_energy_threshold: 0.5,
            l2_to_l1_threshold: 0.7,
            l1_to_l2_threshold: 0.3,
            consolidation_threshold: 5,
            consolidation_similarity: 0.85,
            consolidation_energy_floor: 0.6,
            consolidation_scan_limit: 200,
            cleanup_interval: Duration::from_secs(300),
            consolidation_interval: Duration::from_secs(3600),
            graph_hydration_limit: 10_000,
        }
    }
}

/// Aggregated statistics for all tiers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TierStats {
    pub l1: L1Stats,
    pub l2_vector: VectorStoreStats,
    pub l2_graph: GraphStats,
    pub l3: Option<CrystalStats>,
    pub l3_available: bool,
}

// ============================================================================
// TIER MANAGER
// ============================================================================

/// Manages memory storage across multiple tiers
pub struct TierManager {
    l1: Arc<L1WorkingStore>,
    l2_vector: Arc<L2VectorStore>,
    l2_graph: Arc<L2GraphStore>,
    l3: Arc<L3CrystalStore>,
    energy: Arc<EnergyController>,
    config: TierConfig,

    l3_available: AtomicBool,
    consolidator: RwLock<Option<Arc<dyn Consolidator>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
}

impl TierManager {
    pub fn new(
        l1: Arc<L1WorkingStore>,
        l2_vector: Arc<L2VectorStore>,
        l2_graph: Arc<L2GraphStore>,
        l3: Arc<L3CrystalStore>,
        energy: Arc<EnergyController>,
        config: TierConfig,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            l1,
            l2_vector,
            l2_graph,
            l3,
            energy,
            config,
            l3_available: AtomicBool::new(false),
            consolidator: RwLock::new(None),
            tasks: Mutex::new(vec![]),
            shutdown,
        }
    }

    pub fn config(&self) -> &TierConfig {
        &self.config
    }

    /// Install the LLM consolidation capability
    pub fn set_consolidator(&self, consolidator: Arc<dyn Consolidator>) {
        if let Ok(mut guard) = self.consolidator.write() {
            *guard = Some(consolidator);
        }
    }

    pub fn l3_available(&self) -> bool {
        self.l3_available.load(Ordering::Acquire)
    }

    // ========================================================================
    // LIFECYCLE
    // ========================================================================

    /// Connect all storage backends.
    ///
    /// L3 is optional: when its connection fails the manager continues in
    /// degraded mode (no link/fact persistence, no consolidation output).
    pub async fn connect_all(&self) -> Result<()> {
        self.l1.connect().await?;
        self.l2_vector.connect().await?;
        self.l2_graph.connect().await?;

        match self.l3.connect().await {
            Ok(()) => {
                self.l3_available.store(true, Ordering::Release);
                self.restore_graph_from_l3().await;
            }
            Err(e) => {
                tracing::warn!("L3 not available, continuing degraded: {}", e);
                self.l3_available.store(false, Ordering::Release);
            }
        }
        Ok(())
    }

    async fn restore_graph_from_l3(&self) {
        let links = match self.l3.get_all_links(self.config.graph_hydration_limit).await {
            Ok(links) => links,
            Err(e) => {
                tracing::warn!("Failed to read persisted links: {}", e);
                return;
            }
        };

        let mut restored = 0usize;
        for link in &links {
            match self.l2_graph.add_link(link, "").await {
                Ok(()) => restored += 1,
                Err(e) => tracing::warn!("Failed to restore link: {}", e),
            }
        }
        if restored > 0 {
            tracing::info!("Restored {} links from L3 into the graph", restored);
        }
    }

    pub async fn disconnect_all(&self) -> Result<()> {
        self.stop_background_tasks().await;
        self.l1.disconnect().await?;
        self.l2_vector.disconnect().await?;
        self.l2_graph.disconnect().await?;
        if self.l3_available() {
            self.l3.disconnect().await?;
        }
        Ok(())
    }

    // ========================================================================
    // NODE OPERATIONS
    // ========================================================================

    /// Store a new node in the appropriate tier.
    ///
    /// High-energy nodes also land in L1; every node is indexed in the L2
    /// vector store and registered in the graph.
    pub async fn store(&self, node: &mut MemoryNode) -> Result<String> {
        if node.vector.is_empty() {
            return Err(StorageError::Validation(
                "node must have a vector embedding".to_string(),
            ));
        }

        node.tier = if node.energy >= self.config.l1_energy_threshold {
            Tier::L1
        } else {
            Tier::L2
        };

        // L2 vector first: the node must be recoverable even if later writes fail
        self.l2_vector.put(node).await?;
        self.l2_graph.add_node(&node.id, &node.user_id).await?;

        if node.tier == Tier::L1 {
            let evicted = self.l1.put(node.clone()).await?;
            for mut loser in evicted {
                loser.tier = Tier::L2;
                if let Err(e) = self.l2_vector.put(&loser).await {
                    tracing::warn!("Failed to write back evicted node {}: {}", loser.id, e);
                }
            }
        }

        Ok(node.id.clone())
    }

    /// Retrieve a node from any tier, boosting its energy on read.
    ///
    /// An L2 hit whose boosted energy reaches the promotion threshold is
    /// written into L1.
    pub async fn get(&self, node_id: &str) -> Result<Option<MemoryNode>> {
        if self.l1.exists(node_id).await? {
            self.l1
                .boost_energy(node_id, self.energy.config().activation_boost)
                .await?;
            return self.l1.get(node_id).await;
        }

        let Some(mut node) = self.l2_vector.get(node_id).await? else {
            return Ok(None);
        };

        self.energy.boost(&mut node, None);
        self.l2_vector.update_energy(node_id, node.energy).await?;
        self.l2_vector
            .update_last_accessed(node_id, node.last_accessed)
            .await?;

        if node.energy >= self.config.l2_to_l1_threshold {
            self.promote_to_l1(&mut node).await?;
        }
        Ok(Some(node))
    }

    /// Retrieve a node without the touch-on-read boost
    pub async fn peek(&self, node_id: &str) -> Result<Option<MemoryNode>> {
        if let Some(node) = self.l1.peek(node_id).await? {
            return Ok(Some(node));
        }
        self.l2_vector.get(node_id).await
    }

    /// Delete a node from all tiers
    pub async fn delete(&self, node_id: &str) -> Result<bool> {
        self.l1.delete(node_id).await?;
        let existed = self.l2_vector.delete(node_id).await?;
        self.l2_graph.remove_node(node_id).await?;
        Ok(existed)
    }

    /// Coherent energy update across L1 and L2, handling tier transitions
    pub async fn update_energy(&self, node_id: &str, energy: f64) -> Result<bool> {
        let l1_updated = self.l1.update_energy(node_id, energy).await?;
        let l2_updated = self.l2_vector.update_energy(node_id, energy).await?;

        if !l1_updated && !l2_updated {
            return Ok(false);
        }

        if l1_updated && energy < self.config.l1_to_l2_threshold {
            self.demote_from_l1(node_id).await?;
        } else if !l1_updated && energy >= self.config.l2_to_l1_threshold {
            if let Some(mut node) = self.l2_vector.get(node_id).await? {
                self.promote_to_l1(&mut node).await?;
            }
        }
        Ok(true)
    }

    // ========================================================================
    // TIER TRANSITIONS
    // ========================================================================

    async fn promote_to_l1(&self, node: &mut MemoryNode) -> Result<()> {
        if node.tier == Tier::L1 && self.l1.exists(&node.id).await? {
            return Ok(());
        }
        node.tier = Tier::L1;

        let evicted = self.l1.put(node.clone()).await?;
        for mut loser in evicted {
            loser.tier = Tier::L2;
            if let Err(e) = self.l2_vector.put(&loser).await {
                tracing::warn!("Failed to write back evicted node {}: {}", loser.id, e);
            }
        }
        self.l2_vector.put(node).await?;
        Ok(())
    }

    async fn demote_from_l1(&self, node_id: &str) -> Result<()> {
        let Some(mut node) = self.l1.get(node_id).await? else {
            return Ok(());
        };
        node.tier = Tier::L2;
        self.l1.delete(node_id).await?;
        self.l2_vector.put(&node).await?;
        Ok(())
    }

    // ========================================================================
    // SEARCH
    // ========================================================================

    /// Vector search across tiers with an L1 presence bonus.
    ///
    /// Queries L2 for `top_k * 2` candidates, adds +0.1 similarity to nodes
    /// currently resident in L1, and returns the best `top_k`.
    pub async fn search(
        &self,
        query_vector: &[f32],
        top_k: usize,
        filters: &[ScalarFilter],
        user_id: &str,
    ) -> Result<Vec<(MemoryNode, f32)>> {
        let mut results = self
            .l2_vector
            .search_by_vector(query_vector, top_k * 2, filters, user_id)
            .await?;

        let l1_ids: std::collections::HashSet<String> =
            self.l1.member_ids().await?.into_iter().collect();

        for (node, score) in &mut results {
            if l1_ids.contains(&node.id) {
                *score = (*score + 0.1).min(1.0);
            }
        }

        results.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        results.truncate(top_k);
        Ok(results)
    }

    /// The most relevant nodes currently in working memory
    pub async fn get_working_context(&self, limit: usize, user_id: &str) -> Result<Vec<MemoryNode>> {
        self.l1.top_k(limit, user_id).await
    }

    // ========================================================================
    // BACKGROUND TASKS
    // ========================================================================

    /// Start the cleanup and consolidation loops
    pub fn start_background_tasks(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();
        let cleanup = tokio::spawn(async move {
            loop {
                if let Err(e) = manager.run_cleanup_pass().await {
                    tracing::warn!("Cleanup pass failed: {}", e);
                }
                tokio::select! {
                    _ = tokio::time::sleep(manager.config.cleanup_interval) => {}
                    _ = shutdown.changed() => break,
                }
            }
        });

        let manager = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();
        let consolidation = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(manager.config.consolidation_interval) => {}
                    _ = shutdown.changed() => break,
                }
                if let Err(e) = manager.run_consolidation_pass().await {
                    tracing::warn!("Consolidation pass failed: {}", e);
                }
            }
        });

        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.push(cleanup);
            tasks.push(consolidation);
        }
    }

    /// Stop background tasks, letting in-flight passes finish
    pub async fn stop_background_tasks(&self) {
        let _ = self.shutdown.send(true);
        let handles: Vec<JoinHandle<()>> = match self.tasks.lock() {
            Ok(mut tasks) => tasks.drain(..).collect(),
            Err(_) => vec![],
        };
        for handle in handles {
            let _ = handle.await;
        }
    }

    /// One cleanup cycle: expire stale and low-energy L1 entries back to L2,
    /// then decay the remaining L1 members and demote the ones that fell
    /// under the threshold.
    pub async fn run_cleanup_pass(&self) -> Result<()> {
        for mut node in self.l1.cleanup_stale().await? {
            node.tier = Tier::L2;
            self.l2_vector.put(&node).await?;
        }
        for mut node in self.l1.cleanup_low_energy().await? {
            node.tier = Tier::L2;
            self.l2_vector.put(&node).await?;
        }

        let mut members = self.l1.list_all("").await?;
        if members.is_empty() {
            return Ok(());
        }
        let updates: HashMap<String, f64> = self.energy.apply_decay_batch(&mut members);

        for (node_id, new_energy) in updates {
            self.l1.update_energy(&node_id, new_energy).await?;
            self.l2_vector.update_energy(&node_id, new_energy).await?;
            if new_energy < self.config.l1_to_l2_threshold {
                self.demote_from_l1(&node_id).await?;
            }
        }
        Ok(())
    }

    /// One consolidation cycle: cluster co-activated high-energy nodes and
    /// compress qualifying clusters into crystal facts.
    ///
    /// Returns the facts created this pass.
    pub async fn run_consolidation_pass(&self) -> Result<Vec<CrystalFact>> {
        let candidates = self
            .l2_vector
            .search_by_energy_range(
                self.config.consolidation_energy_floor,
                1.0,
                self.config.consolidation_scan_limit,
                "",
            )
            .await?;

        // Clusters never cross the user partition
        let mut by_user: HashMap<String, Vec<MemoryNode>> = HashMap::new();
        for node in candidates {
            by_user.entry(node.user_id.clone()).or_default().push(node);
        }

        let mut facts = vec![];
        for nodes in by_user.into_values() {
            for cluster in self.cluster_by_similarity(&nodes) {
                if cluster.len() < self.config.consolidation_threshold {
                    continue;
                }
                if let Some(fact) = self.consolidate_cluster(&cluster).await? {
                    facts.push(fact);
                }
            }
        }
        Ok(facts)
    }

    /// Greedy agglomerative grouping: a node joins a cluster only if it is
    /// similar to every current member, keeping pairwise similarity above
    /// the configured floor.
    fn cluster_by_similarity<'a>(&self, nodes: &'a [MemoryNode]) -> Vec<Vec<&'a MemoryNode>> {
        let threshold = self.config.consolidation_similarity as f32;
        let mut assigned = vec![false; nodes.len()];
        let mut clusters = vec![];

        for i in 0..nodes.len() {
            if assigned[i] || nodes[i].vector.is_empty() {
                continue;
            }
            assigned[i] = true;
            let mut cluster = vec![&nodes[i]];

            for j in (i + 1)..nodes.len() {
                if assigned[j] || nodes[j].vector.is_empty() {
                    continue;
                }
                let fits = cluster
                    .iter()
                    .all(|member| cosine_similarity(&member.vector, &nodes[j].vector) >= threshold);
                if fits {
                    assigned[j] = true;
                    cluster.push(&nodes[j]);
                }
            }
            clusters.push(cluster);
        }
        clusters
    }

    async fn consolidate_cluster(&self, cluster: &[&MemoryNode]) -> Result<Option<CrystalFact>> {
        let contents: Vec<String> = cluster.iter().map(|n| n.content.clone()).collect();

        let consolidator = self.consolidator.read().ok().and_then(|g| g.clone());
        let content = match consolidator {
            Some(consolidator) => match consolidator.consolidate(&contents).await {
                Ok(summary) => summary,
                Err(e) => {
                    tracing::warn!("Consolidation summary failed, using fallback: {}", e);
                    simple_consolidate(&contents)
                }
            },
            None => simple_consolidate(&contents),
        };

        let fact = CrystalFact {
            content,
            source_node_ids: cluster.iter().map(|n| n.id.clone()).collect(),
            confidence: cluster.iter().map(|n| n.energy).sum::<f64>() / cluster.len() as f64,
            metadata: serde_json::json!({ "nodeCount": cluster.len() }),
            user_id: cluster[0].user_id.clone(),
            ..Default::default()
        };

        if self.l3_available() {
            if let Err(e) = self.l3.store_fact(&fact).await {
                tracing::warn!("Failed to store crystal fact: {}", e);
            }
        }
        Ok(Some(fact))
    }

    // ========================================================================
    // STATISTICS
    // ========================================================================

    pub async fn get_stats(&self) -> TierStats {
        let l3 = if self.l3_available() {
            self.l3.get_stats().await.ok()
        } else {
            None
        };
        TierStats {
            l1: self.l1.stats(""),
            l2_vector: self.l2_vector.stats(),
            l2_graph: self.l2_graph.stats(),
            l3,
            l3_available: self.l3_available(),
        }
    }
}

fn simple_consolidate(contents: &[String]) -> String {
    match contents {
        [] => String::new(),
        [only] => only.clone(),
        [first, ..] => format!("[Consolidated from {} memories]\n{}", contents.len(), first),
    }
}

// ============================================================================
// TESTS
// ============================================================================
