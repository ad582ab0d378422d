//! Association Router - Link creation and strengthening
//!
//! Establishes relationships between memory nodes on ingest and
//! co-activation: temporal links to recently created nodes, semantic links to
//! similar nodes, and causal links created explicitly or inferred through an
//! optional LLM capability. New links go to the in-process graph first and
//! are persisted to L3 best-effort; the graph stays authoritative.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Duration, Utc};

use crate::embedding::cosine_similarity;
use crate::llm::CausalInferencer;
use crate::memory::node::{Link, LinkType, MemoryNode};
use crate::storage::{L2GraphStore, L3CrystalStore, Result};

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Strategy for automatic link creation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStrategy {
    /// Create automatically based on rules
    Auto,
    /// Only create when explicitly requested
    Deferred,
    /// Never create automatically
    Disabled,
}

/// Configuration for the association router
#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub temporal_strategy: LinkStrategy,
    pub semantic_strategy: LinkStrategy,
    pub causal_strategy: LinkStrategy,

    /// Link nodes created within this many seconds
    pub temporal_window_secs: f64,
    /// Max temporal links per node
    pub max_temporal_links: usize,

    /// Min cosine similarity for a semantic link
    pub semantic_threshold: f64,
    /// Max semantic links per node
    pub max_semantic_links: usize,

    /// Min confidence for a causal link
    pub causal_confidence_threshold: f64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            temporal_strategy: LinkStrategy::Auto,
            semantic_strategy: LinkStrategy::Auto,
            causal_strategy: LinkStrategy::Deferred,
            temporal_window_secs: 300.0,
            max_temporal_links: 5,
            semantic_threshold: 0.7,
            max_semantic_links: 10,
            causal_confidence_threshold: 0.8,
        }
    }
}

/// Bound on the recent-node ring feeding temporal linking
const MAX_RECENT_NODES: usize = 50;

#[derive(Debug, Clone)]
struct RecentNode {
    id: String,
    created_at: DateTime<Utc>,
    user_id: String,
}

// ============================================================================
// ROUTER
// ============================================================================

/// Routes and establishes links between memory nodes
pub struct AssociationRouter {
    graph: Arc<L2GraphStore>,
    config: RouterConfig,
    l3: RwLock<Option<Arc<L3CrystalStore>>>,
    l3_available: AtomicBool,
    recent_nodes: Mutex<Vec<RecentNode>>,
    causal: RwLock<Option<Arc<dyn CausalInferencer>>>,
}

impl AssociationRouter {
    pub fn new(graph: Arc<L2GraphStore>, config: RouterConfig) -> Self {
        Self {
            graph,
            config,
            l3: RwLock::new(None),
            l3_available: AtomicBool::new(false),
            recent_nodes: Mutex::new(vec![]),
            causal: RwLock::new(None),
        }
    }

    /// Attach L3 storage for link persistence
    pub fn set_l3(&self, l3: Arc<L3CrystalStore>, available: bool) {
        if let Ok(mut guard) = self.l3.write() {
            *guard = Some(l3);
        }
        self.l3_available.store(available, Ordering::Release);
    }

    /// Mark L3 unavailable for the rest of this process lifetime
    pub fn mark_l3_unavailable(&self) {
        self.l3_available.store(false, Ordering::Release);
    }

    /// Install the LLM causal-inference capability
    pub fn set_causal_inferencer(&self, inferencer: Arc<dyn CausalInferencer>) {
        if let Ok(mut guard) = self.causal.write() {
            *guard = Some(inferencer);
        }
    }

    // ========================================================================
    // ROUTING
    // ========================================================================

    /// Establish links for a newly created node.
    ///
    /// Returns the created links; callers may cache them on the node.
    pub async fn route_new_node(
        &self,
        node: &MemoryNode,
        context_nodes: &[MemoryNode],
    ) -> Result<Vec<Link>> {
        let mut created = vec![];

        if self.config.temporal_strategy == LinkStrategy::Auto {
            created.extend(self.create_temporal_links(node).await?);
        }

        if self.config.semantic_strategy == LinkStrategy::Auto && !context_nodes.is_empty() {
            created.extend(self.create_semantic_links(node, context_nodes).await?);
        }

        self.remember_recent(node);
        Ok(created)
    }

    async fn create_temporal_links(&self, node: &MemoryNode) -> Result<Vec<Link>> {
        let cutoff =
            node.created_at - Duration::milliseconds((self.config.temporal_window_secs * 1000.0) as i64);

        let mut in_window: Vec<RecentNode> = {
            let recent = self
                .recent_nodes
                .lock()
                .map_err(|_| crate::storage::StorageError::Unavailable("router lock poisoned".to_string()))?;
            recent
                .iter()
                .filter(|r| r.created_at >= cutoff && r.id != node.id && r.user_id == node.user_id)
                .cloned()
                .collect()
        };

        // Most recent first, capped
        in_window.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        in_window.truncate(self.config.max_temporal_links);

        let mut links = vec![];
        for target in in_window {
            // Link from the newer node back to the older one
            let link = Link::new(
                node.id.clone(),
                target.id,
                LinkType::Temporal,
                self.temporal_weight(node.created_at, target.created_at),
            );
            self.persist_link(&link, &node.user_id).await?;
            links.push(link);
        }
        Ok(links)
    }

    /// Temporal weight: closer in time = higher, `1 - dt/window`, floored at 0.1
    fn temporal_weight(&self, time_a: DateTime<Utc>, time_b: DateTime<Utc>) -> f64 {
        let delta = (time_a - time_b).num_milliseconds().abs() as f64 / 1000.0;
        let weight = 1.0 - delta / self.config.temporal_window_secs;
        weight.max(0.1)
    }

    async fn create_semantic_links(
        &self,
        node: &MemoryNode,
        candidates: &[MemoryNode],
    ) -> Result<Vec<Link>> {
        if node.vector.is_empty() {
            return Ok(vec![]);
        }

        let mut similarities: Vec<(String, f64)> = candidates
            .iter()
            .filter(|c| c.id != node.id && !c.vector.is_empty() && c.user_id == node.user_id)
            .map(|c| (c.id.clone(), cosine_similarity(&node.vector, &c.vector) as f64))
            .filter(|(_, sim)| *sim >= self.config.semantic_threshold)
            .collect();

        similarities.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        similarities.truncate(self.config.max_semantic_links);

        let mut links = vec![];
        for (target_id, similarity) in similarities {
            let link = Link::new(node.id.clone(), target_id, LinkType::Semantic, similarity);
            self.persist_link(&link, &node.user_id).await?;
            links.push(link);
        }
        Ok(links)
    }

    /// Add to the graph, then persist to L3 when available.
    ///
    /// L3 failure is logged and swallowed; the graph already holds the link.
    async fn persist_link(&self, link: &Link, user_id: &str) -> Result<()> {
        self.graph.add_link(link, user_id).await?;

        if self.l3_available.load(Ordering::Acquire) {
            let l3 = self.l3.read().ok().and_then(|g| g.clone());
            if let Some(l3) = l3 {
                if let Err(e) = l3.store_link(link, user_id).await {
                    tracing::warn!("Failed to persist link to L3: {}", e);
                }
            }
        }
        Ok(())
    }

    // ========================================================================
    // CAUSAL LINKS
    // ========================================================================

    /// Explicitly create a causal link; returns None below the threshold
    pub async fn create_causal_link(
        &self,
        cause_id: &str,
        effect_id: &str,
        confidence: f64,
        user_id: &str,
    ) -> Result<Option<Link>> {
        if confidence < self.config.causal_confidence_threshold {
            return Ok(None);
        }

        let link = Link::new(cause_id, effect_id, LinkType::Causal, confidence);
        self.persist_link(&link, user_id).await?;
        Ok(Some(link))
    }

    /// Infer causal relationships from the node to each candidate via LLM.
    ///
    /// Inference errors skip the pair.
    pub async fn infer_causal_links(
        &self,
        node: &MemoryNode,
        candidates: &[MemoryNode],
    ) -> Result<Vec<Link>> {
        if self.config.causal_strategy == LinkStrategy::Disabled {
            return Ok(vec![]);
        }
        let inferencer = self.causal.read().ok().and_then(|g| g.clone());
        let Some(inferencer) = inferencer else {
            return Ok(vec![]);
        };

        let mut links = vec![];
        for candidate in candidates {
            if candidate.id == node.id {
                continue;
            }
            match inferencer.infer(&node.content, &candidate.content).await {
                Ok(confidence) => {
                    if let Some(link) = self
                        .create_causal_link(&node.id, &candidate.id, confidence, &node.user_id)
                        .await?
                    {
                        links.push(link);
                    }
                }
                Err(e) => {
                    tracing::debug!("Causal inference skipped a pair: {}", e);
                }
            }
        }
        Ok(links)
    }

    // ========================================================================
    // CO-ACTIVATION
    // ========================================================================

    /// Strengthen links along a path of co-activated nodes
    pub async fn strengthen_path(&self, node_ids: &[String], boost: f64) -> Result<()> {
        for pair in node_ids.windows(2) {
            self.graph.strengthen_link(&pair[0], &pair[1], boost).await?;
        }
        Ok(())
    }

    /// Nodes associated with the given node, as `{node_id: score}`
    pub async fn get_associated(
        &self,
        node_id: &str,
        link_types: Option<&[LinkType]>,
        max_hops: usize,
        user_id: &str,
    ) -> Result<std::collections::HashMap<String, f64>> {
        if max_hops <= 1 {
            let neighbors = self
                .graph
                .get_neighbors(node_id, None, crate::storage::Direction::Both)
                .await?;
            let mut out = std::collections::HashMap::new();
            for (neighbor_id, link) in neighbors {
                if let Some(types) = link_types {
                    if !types.contains(&link.link_type) {
                        continue;
                    }
                }
                let entry = out.entry(neighbor_id).or_insert(0.0);
                if link.weight > *entry {
                    *entry = link.weight;
                }
            }
            Ok(out)
        } else {
            self.graph
                .spread_activation(&[node_id.to_string()], max_hops, 0.5, user_id)
                .await
        }
    }

    // ========================================================================
    // MAINTENANCE
    // ========================================================================

    fn remember_recent(&self, node: &MemoryNode) {
        let Ok(mut recent) = self.recent_nodes.lock() else {
            return;
        };
        recent.push(RecentNode {
            id: node.id.clone(),
            created_at: node.created_at,
            user_id: node.user_id.clone(),
        });
        if recent.len() > MAX_RECENT_NODES {
            recent.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            recent.truncate(MAX_RECENT_NODES);
        }
    }

    /// Remove every link incident to a node being deleted.
    ///
    /// Returns the number of graph links removed.
    pub async fn remove_node_links(&self, node_id: &str) -> Result<usize> {
        let incident = self.graph.get_incident_links(node_id).await?;
        let mut removed = 0;
        for link in &incident {
            if self
                .graph
                .remove_link(&link.source_id, &link.target_id, link.link_type)
                .await?
            {
                removed += 1;
            }
        }

        if self.l3_available.load(Ordering::Acquire) {
            let l3 = self.l3.read().ok().and_then(|g| g.clone());
            if let Some(l3) = l3 {
                if let Err(e) = l3.delete_links_for_node(node_id).await {
                    tracing::warn!("Failed to remove L3 links for {}: {}", node_id, e);
                }
            }
        }

        if let Ok(mut recent) = self.recent_nodes.lock() {
            recent.retain(|r| r.id != node_id);
        }
        Ok(removed)
    }
}

// ============================================================================
// TESTS
// ============================================================================
