//! L2 Graph Store - The association web
//!
//! Directed multi-edge graph over node IDs with typed, weighted edges and a
//! `user_id` node attribute for partition-scoped traversal. Supports
//! spreading activation for associative recall and survives restart through
//! JSON snapshot persistence (links are additionally persisted to L3 by the
//! association router).

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Result, StorageError};
use crate::memory::node::{Link, LinkType, MAX_LINK_WEIGHT, MIN_LINK_WEIGHT};

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Configuration for the graph store
#[derive(Debug, Clone)]
pub struct GraphConfig {
    /// Path for JSON snapshot persistence (None = in-memory only)
    pub persist_path: Option<PathBuf>,
    /// Save a snapshot after every mutation
    pub auto_save: bool,
    /// Limit outgoing edges per node to prevent explosion
    pub max_edges_per_node: usize,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            persist_path: None,
            auto_save: true,
            max_edges_per_node: 50,
        }
    }
}

impl GraphConfig {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Traversal direction for neighbor queries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Out,
    In,
    Both,
}

/// Graph statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphStats {
    pub node_count: usize,
    pub edge_count: usize,
    pub density: f64,
}

// ============================================================================
// INTERNAL REPRESENTATION
// ============================================================================

#[derive(Debug, Clone)]
struct NodeAttr {
    user_id: String,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct EdgeAttr {
    weight: f64,
    created_at: DateTime<Utc>,
}

/// Edge key inside a source's adjacency: (target, type)
type EdgeKey = (String, LinkType);

#[derive(Default)]
struct GraphInner {
    nodes: HashMap<String, NodeAttr>,
    /// source -> (target, link_type) -> attributes
    out: HashMap<String, HashMap<EdgeKey, EdgeAttr>>,
    /// target -> sources with at least one edge into it
    incoming: HashMap<String, HashSet<String>>,
}

impl GraphInner {
    fn edge_count(&self) -> usize {
        self.out.values().map(|edges| edges.len()).sum()
    }

    fn out_links(&self, node_id: &str) -> Vec<Link> {
        let Some(edges) = self.out.get(node_id) else {
            return vec![];
        };
        edges
            .iter()
            .map(|((target, link_type), attr)| Link {
                source_id: node_id.to_string(),
                target_id: target.clone(),
                link_type: *link_type,
                weight: attr.weight,
                created_at: attr.created_at,
            })
            .collect()
    }

    fn in_links(&self, node_id: &str) -> Vec<Link> {
        let Some(sources) = self.incoming.get(node_id) else {
            return vec![];
        };
        let mut links = vec![];
        for source in sources {
            if let Some(edges) = self.out.get(source) {
                for ((target, link_type), attr) in edges {
                    if target == node_id {
                        links.push(Link {
                            source_id: source.clone(),
                            target_id: target.clone(),
                            link_type: *link_type,
                            weight: attr.weight,
                            created_at: attr.created_at,
                        });
                    }
                }
            }
        }
        links
    }
}

// ============================================================================
// SNAPSHOT FORMAT
// ============================================================================

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SnapshotNode {
    id: String,
    user_id: String,
    created_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphSnapshot {
    nodes: Vec<SnapshotNode>,
    edges: Vec<Link>,
}

// ============================================================================
// STORE
// ============================================================================

/// In-process graph storage for memory relationships
///
/// Mutations serialize on the inner write lock; spreading activation holds
/// the read lock for its whole traversal so it sees a consistent snapshot.
pub struct L2GraphStore {
    config: GraphConfig,
    inner: RwLock<GraphInner>,
    connected: AtomicBool,
}

impl L2GraphStore {
    pub fn new(config: GraphConfig) -> Self {
        Self {
            config,
            inner: RwLock::new(GraphInner::default()),
            connected: AtomicBool::new(false),
        }
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.connected.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(StorageError::NotReady("L2 graph store".to_string()))
        }
    }

    fn read_inner(&self) -> Result<std::sync::RwLockReadGuard<'_, GraphInner>> {
        self.inner
            .read()
            .map_err(|_| StorageError::Unavailable("graph lock poisoned".to_string()))
    }

    fn write_inner(&self) -> Result<std::sync::RwLockWriteGuard<'_, GraphInner>> {
        self.inner
            .write()
            .map_err(|_| StorageError::Unavailable("graph lock poisoned".to_string()))
    }

    /// Initialize the graph, restoring a snapshot when one exists
    pub async fn connect(&self) -> Result<()> {
        if let Some(path) = self.config.persist_path.clone() {
            if path.exists() {
                self.load_from_file(&path)?;
            }
        }
        self.connected.store(true, Ordering::Release);
        Ok(())
    }

    /// Snapshot to disk if configured, then release
    pub async fn disconnect(&self) -> Result<()> {
        if self.config.auto_save {
            self.save()?;
        }
        self.connected.store(false, Ordering::Release);
        Ok(())
    }

    /// Add a node without edges; updates `user_id` when previously unset
    pub async fn add_node(&self, node_id: &str, user_id: &str) -> Result<()> {
        self.ensure_connected()?;
        {
            let mut inner = self.write_inner()?;
            match inner.nodes.get_mut(node_id) {
                Some(attr) => {
                    if attr.user_id.is_empty() && !user_id.is_empty() {
                        attr.user_id = user_id.to_string();
                    }
                }
                None => {
                    inner.nodes.insert(
                        node_id.to_string(),
                        NodeAttr {
                            user_id: user_id.to_string(),
                            created_at: Utc::now(),
                        },
                    );
                }
            }
        }
        Ok(())
    }

    /// Remove a node and every incident edge
    pub async fn remove_node(&self, node_id: &str) -> Result<bool> {
        self.ensure_connected()?;
        let removed = {
            let mut inner = self.write_inner()?;
            if inner.nodes.remove(node_id).is_none() {
                false
            } else {
                // Outgoing edges
                if let Some(edges) = inner.out.remove(node_id) {
                    for (target, _) in edges.keys() {
                        if let Some(sources) = inner.incoming.get_mut(target) {
                            sources.remove(node_id);
                        }
                    }
                }
                // Incoming edges
                if let Some(sources) = inner.incoming.remove(node_id) {
                    for source in sources {
                        if let Some(edges) = inner.out.get_mut(&source) {
                            edges.retain(|(target, _), _| target != node_id);
                        }
                    }
                }
                true
            }
        };
        if removed {
            self.auto_save()?;
        }
        Ok(removed)
    }

    /// Upsert a directed link keyed by `(source, target, link_type)`.
    ///
    /// When the source is at its outgoing-edge cap and the key is new, the
    /// weakest outgoing edge is pruned before insertion.
    pub async fn add_link(&self, link: &Link, user_id: &str) -> Result<()> {
        self.ensure_connected()?;
        self.add_node(&link.source_id, user_id).await?;
        self.add_node(&link.target_id, user_id).await?;

        {
            let mut inner = self.write_inner()?;
            let key: EdgeKey = (link.target_id.clone(), link.link_type);
            let degree = inner.out.get(&link.source_id).map_or(0, |e| e.len());
            let is_new = inner
                .out
                .get(&link.source_id)
                .is_none_or(|e| !e.contains_key(&key));

            if is_new && degree >= self.config.max_edges_per_node {
                Self::prune_weakest_edge(&mut inner, &link.source_id);
            }

            inner.out.entry(link.source_id.clone()).or_default().insert(
                key,
                EdgeAttr {
                    weight: link.weight.clamp(MIN_LINK_WEIGHT, MAX_LINK_WEIGHT),
                    created_at: link.created_at,
                },
            );
            inner
                .incoming
                .entry(link.target_id.clone())
                .or_default()
                .insert(link.source_id.clone());
        }

        self.auto_save()
    }

    fn prune_weakest_edge(inner: &mut GraphInner, source_id: &str) {
        let Some(edges) = inner.out.get_mut(source_id) else {
            return;
        };
        let weakest = edges
            .iter()
            .min_by(|a, b| a.1.weight.partial_cmp(&b.1.weight).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(key, _)| key.clone());

        if let Some(key) = weakest {
            edges.remove(&key);
            let still_linked = edges.keys().any(|(target, _)| *target == key.0);
            if !still_linked {
                if let Some(sources) = inner.incoming.get_mut(&key.0) {
                    sources.remove(source_id);
                }
            }
        }
    }

    /// Remove a specific link
    pub async fn remove_link(
        &self,
        source_id: &str,
        target_id: &str,
        link_type: LinkType,
    ) -> Result<bool> {
        self.ensure_connected()?;
        let removed = {
            let mut inner = self.write_inner()?;
            let removed = inner
                .out
                .get_mut(source_id)
                .map(|edges| edges.remove(&(target_id.to_string(), link_type)).is_some())
                .unwrap_or(false);
            if removed {
                let still_linked = inner
                    .out
                    .get(source_id)
                    .is_some_and(|edges| edges.keys().any(|(t, _)| t == target_id));
                if !still_linked {
                    if let Some(sources) = inner.incoming.get_mut(target_id) {
                        sources.remove(source_id);
                    }
                }
            }
            removed
        };
        if removed {
            self.auto_save()?;
        }
        Ok(removed)
    }

    /// Set the weight of every edge between source and target
    pub async fn update_link_weight(
        &self,
        source_id: &str,
        target_id: &str,
        new_weight: f64,
    ) -> Result<bool> {
        self.ensure_connected()?;
        let updated = {
            let mut inner = self.write_inner()?;
            let mut updated = false;
            if let Some(edges) = inner.out.get_mut(source_id) {
                for ((target, _), attr) in edges.iter_mut() {
                    if target == target_id {
                        attr.weight = new_weight.clamp(MIN_LINK_WEIGHT, MAX_LINK_WEIGHT);
                        updated = true;
                    }
                }
            }
            updated
        };
        if updated {
            self.auto_save()?;
        }
        Ok(updated)
    }

    /// Strengthen an edge on co-activation: `weight = min(2.0, weight + boost)`
    pub async fn strengthen_link(
        &self,
        source_id: &str,
        target_id: &str,
        boost: f64,
    ) -> Result<bool> {
        self.ensure_connected()?;
        let updated = {
            let mut inner = self.write_inner()?;
            let mut updated = false;
            if let Some(edges) = inner.out.get_mut(source_id) {
                for ((target, _), attr) in edges.iter_mut() {
                    if target == target_id {
                        attr.weight = (attr.weight + boost).min(MAX_LINK_WEIGHT);
                        updated = true;
                    }
                }
            }
            updated
        };
        if updated {
            self.auto_save()?;
        }
        Ok(updated)
    }

    /// Neighboring nodes and the links connecting them
    pub async fn get_neighbors(
        &self,
        node_id: &str,
        link_type: Option<LinkType>,
        direction: Direction,
    ) -> Result<Vec<(String, Link)>> {
        self.ensure_connected()?;
        let inner = self.read_inner()?;
        if !inner.nodes.contains_key(node_id) {
            return Ok(vec![]);
        }

        let mut neighbors = vec![];
        if matches!(direction, Direction::Out | Direction::Both) {
            for link in inner.out_links(node_id) {
                if link_type.is_none_or(|lt| lt == link.link_type) {
                    neighbors.push((link.target_id.clone(), link));
                }
            }
        }
        if matches!(direction, Direction::In | Direction::Both) {
            for link in inner.in_links(node_id) {
                if link_type.is_none_or(|lt| lt == link.link_type) {
                    neighbors.push((link.source_id.clone(), link));
                }
            }
        }
        Ok(neighbors)
    }

    /// All outgoing links for a node
    pub async fn get_links(&self, node_id: &str) -> Result<Vec<Link>> {
        self.ensure_connected()?;
        let inner = self.read_inner()?;
        Ok(inner.out_links(node_id))
    }

    /// All links where the node is source or target
    pub async fn get_incident_links(&self, node_id: &str) -> Result<Vec<Link>> {
        self.ensure_connected()?;
        let inner = self.read_inner()?;
        let mut links = inner.out_links(node_id);
        links.extend(inner.in_links(node_id));
        Ok(links)
    }

    /// Perform spreading activation from starting nodes.
    ///
    /// Each hop, a neighbor candidate is `score * decay_factor * edge.weight`;
    /// the maximum over incoming paths wins per wavefront and candidates below
    /// 0.01 are dropped. Activation only spreads within the user's partition.
    pub async fn spread_activation(
        &self,
        start_ids: &[String],
        max_hops: usize,
        decay_factor: f64,
        user_id: &str,
    ) -> Result<HashMap<String, f64>> {
        self.ensure_connected()?;
        let inner = self.read_inner()?;

        let in_partition = |id: &str| -> bool {
            inner
                .nodes
                .get(id)
                .is_some_and(|attr| user_id.is_empty() || attr.user_id == user_id)
        };

        let mut activation: HashMap<String, f64> = HashMap::new();
        let mut current_wave: HashMap<String, f64> = start_ids
            .iter()
            .filter(|id| in_partition(id))
            .map(|id| (id.clone(), 1.0))
            .collect();

        for (node_id, score) in &current_wave {
            activation.insert(node_id.clone(), *score);
        }

        for _hop in 0..max_hops {
            let mut next_wave: HashMap<String, f64> = HashMap::new();

            for (node_id, score) in &current_wave {
                let Some(edges) = inner.out.get(node_id) else {
                    continue;
                };
                for ((target, _), attr) in edges {
                    if !in_partition(target) {
                        continue;
                    }
                    let candidate = score * decay_factor * attr.weight;
                    if candidate < 0.01 {
                        continue;
                    }
                    let entry = next_wave.entry(target.clone()).or_insert(0.0);
                    if candidate > *entry {
                        *entry = candidate;
                    }
                }
            }

            for (node_id, score) in &next_wave {
                let entry = activation.entry(node_id.clone()).or_insert(0.0);
                if *score > *entry {
                    *entry = *score;
                }
            }

            current_wave = next_wave;
            if current_wave.is_empty() {
                break;
            }
        }

        Ok(activation)
    }

    /// Shortest path between two nodes if one exists within `max_length` nodes
    pub async fn find_path(
        &self,
        source_id: &str,
        target_id: &str,
        max_length: usize,
    ) -> Result<Option<Vec<String>>> {
        self.ensure_connected()?;
        let inner = self.read_inner()?;
        if !inner.nodes.contains_key(source_id) || !inner.nodes.contains_key(target_id) {
            return Ok(None);
        }

        let mut predecessors: HashMap<String, String> = HashMap::new();
        let mut visited: HashSet<String> = HashSet::new();
        let mut queue = VecDeque::new();
        visited.insert(source_id.to_string());
        queue.push_back(source_id.to_string());

        while let Some(current) = queue.pop_front() {
            if current == target_id {
                let mut path = vec![current.clone()];
                let mut cursor = current;
                while let Some(prev) = predecessors.get(&cursor) {
                    path.push(prev.clone());
                    cursor = prev.clone();
                }
                path.reverse();
                if path.len() <= max_length {
                    return Ok(Some(path));
                }
                return Ok(None);
            }

            if let Some(edges) = inner.out.get(&current) {
                for (target, _) in edges.keys() {
                    if visited.insert(target.clone()) {
                        predecessors.insert(target.clone(), current.clone());
                        queue.push_back(target.clone());
                    }
                }
            }
        }

        Ok(None)
    }

    /// Every node in the same weakly connected component
    pub async fn connected_component(&self, node_id: &str) -> Result<HashSet<String>> {
        self.ensure_connected()?;
        let inner = self.read_inner()?;
        if !inner.nodes.contains_key(node_id) {
            return Ok(HashSet::new());
        }

        let mut component = HashSet::new();
        let mut queue = VecDeque::new();
        component.insert(node_id.to_string());
        queue.push_back(node_id.to_string());

        while let Some(current) = queue.pop_front() {
            if let Some(edges) = inner.out.get(&current) {
                for (target, _) in edges.keys() {
                    if component.insert(target.clone()) {
                        queue.push_back(target.clone());
                    }
                }
            }
            if let Some(sources) = inner.incoming.get(&current) {
                for source in sources {
                    if component.insert(source.clone()) {
                        queue.push_back(source.clone());
                    }
                }
            }
        }

        Ok(component)
    }

    pub async fn has_node(&self, node_id: &str) -> Result<bool> {
        self.ensure_connected()?;
        Ok(self.read_inner()?.nodes.contains_key(node_id))
    }

    pub async fn clear(&self) -> Result<()> {
        self.ensure_connected()?;
        {
            let mut inner = self.write_inner()?;
            *inner = GraphInner::default();
        }
        self.auto_save()
    }

    pub fn stats(&self) -> GraphStats {
        let Ok(inner) = self.inner.read() else {
            return GraphStats {
                node_count: 0,
                edge_count: 0,
                density: 0.0,
            };
        };
        let n = inner.nodes.len();
        let e = inner.edge_count();
        GraphStats {
            node_count: n,
            edge_count: e,
            density: if n > 1 {
                e as f64 / (n as f64 * (n as f64 - 1.0))
            } else {
                0.0
            },
        }
    }

    // ========================================================================
    // PERSISTENCE
    // ========================================================================

    fn auto_save(&self) -> Result<()> {
        if self.config.auto_save && self.config.persist_path.is_some() {
            self.save()?;
        }
        Ok(())
    }

    /// Snapshot the graph to the configured path
    pub fn save(&self) -> Result<()> {
        let Some(path) = self.config.persist_path.clone() else {
            return Ok(());
        };

        let snapshot = {
            let inner = self.read_inner()?;
            GraphSnapshot {
                nodes: inner
                    .nodes
                    .iter()
                    .map(|(id, attr)| SnapshotNode {
                        id: id.clone(),
                        user_id: attr.user_id.clone(),
                        created_at: attr.created_at,
                    })
                    .collect(),
                edges: inner
                    .nodes
                    .keys()
                    .flat_map(|id| inner.out_links(id))
                    .collect(),
            }
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, serde_json::to_vec(&snapshot)?)?;
        Ok(())
    }

    fn load_from_file(&self, path: &Path) -> Result<()> {
        let data = std::fs::read(path)?;
        let snapshot: GraphSnapshot = serde_json::from_slice(&data)?;

        let mut inner = self.write_inner()?;
        *inner = GraphInner::default();
        for node in snapshot.nodes {
            inner.nodes.insert(
                node.id,
                NodeAttr {
                    user_id: node.user_id,
                    created_at: node.created_at,
                },
            );
        }
        for link in snapshot.edges {
            inner.out.entry(link.source_id.clone()).or_default().insert(
                (link.target_id.clone(), link.link_type),
                EdgeAttr {
                    weight: link.weight,
                    created_at: link.created_at,
                },
            );
            inner
                .incoming
                .entry(link.target_id)
                .or_default()
                .insert(link.source_id);
        }
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    async fn connected_graph(config: GraphConfig) -> L2GraphStore {
        let graph = L2GraphStore::new(config);
        graph.connect().await.unwrap();
        graph
    }

    fn link(source: &str, target: &str, link_type: LinkType, weight: f64) -> Link {
        Link::new(source, target, link_type, weight)
    }

    #[tokio::test]
    async fn test_add_link_upserts_by_key() {
        let graph = connected_graph(GraphConfig::new()).await;
        graph
            .add_link(&link("a", "b", LinkType::Semantic, 0.5), "")
            .await
            .unwrap();
        graph
            .add_link(&link("a", "b", LinkType::Semantic, 0.9), "")
            .await
            .unwrap();

        let links = graph.get_links("a").await.unwrap();
        assert_eq!(links.len(), 1);
        assert!((links[0].weight - 0.9).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_distinct_types_coexist() {
        let graph = connected_graph(GraphConfig::new()).await;
        graph
            .add_link(&link("a", "b", LinkType::Temporal, 0.5), "")
            .await
            .unwrap();
        graph
            .add_link(&link("a", "b", LinkType::Semantic, 0.8), "")
            .await
            .unwrap();

        assert_eq!(graph.get_links("a").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_edge_cap_prunes_weakest() {
        let graph = connected_graph(GraphConfig {
            max_edges_per_node: 3,
            ..GraphConfig::new()
        })
        .await;

        graph.add_link(&link("s", "t1", LinkType::Semantic, 0.3), "").await.unwrap();
        graph.add_link(&link("s", "t2", LinkType::Semantic, 0.7), "").await.unwrap();
        graph.add_link(&link("s", "t3", LinkType::Semantic, 0.9), "").await.unwrap();
        graph.add_link(&link("s", "t4", LinkType::Semantic, 0.5), "").await.unwrap();

        let links = graph.get_links("s").await.unwrap();
        assert_eq!(links.len(), 3);
        assert!(!links.iter().any(|l| l.target_id == "t1"));
    }

    #[tokio::test]
    async fn test_remove_node_cascades_edges() {
        let graph = connected_graph(GraphConfig::new()).await;
        graph.add_link(&link("a", "b", LinkType::Semantic, 1.0), "").await.unwrap();
        graph.add_link(&link("b", "c", LinkType::Causal, 1.0), "").await.unwrap();

        assert!(graph.remove_node("b").await.unwrap());
        assert!(graph.get_links("a").await.unwrap().is_empty());
        assert!(graph.get_links("b").await.unwrap().is_empty());
        assert!(!graph.has_node("b").await.unwrap());
    }

    #[tokio::test]
    async fn test_neighbors_directions() {
        let graph = connected_graph(GraphConfig::new()).await;
        graph.add_link(&link("a", "b", LinkType::Semantic, 1.0), "").await.unwrap();
        graph.add_link(&link("c", "b", LinkType::Temporal, 1.0), "").await.unwrap();

        let out = graph.get_neighbors("b", None, Direction::Out).await.unwrap();
        assert!(out.is_empty());

        let incoming = graph.get_neighbors("b", None, Direction::In).await.unwrap();
        assert_eq!(incoming.len(), 2);

        let temporal_in = graph
            .get_neighbors("b", Some(LinkType::Temporal), Direction::Both)
            .await
            .unwrap();
        assert_eq!(temporal_in.len(), 1);
        assert_eq!(temporal_in[0].0, "c");
    }

    #[tokio::test]
    async fn test_strengthen_link_caps_at_two() {
        let graph = connected_graph(GraphConfig::new()).await;
        graph.add_link(&link("a", "b", LinkType::Causal, 1.9), "").await.unwrap();

        graph.strengthen_link("a", "b", 0.5).await.unwrap();
        let links = graph.get_links("a").await.unwrap();
        assert!((links[0].weight - MAX_LINK_WEIGHT).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_spread_activation_chain() {
        let graph = connected_graph(GraphConfig::new()).await;
        graph.add_link(&link("A", "B", LinkType::Semantic, 1.0), "").await.unwrap();
        graph.add_link(&link("B", "C", LinkType::Semantic, 1.0), "").await.unwrap();

        let activation = graph
            .spread_activation(&["A".to_string()], 2, 0.5, "")
            .await
            .unwrap();

        assert!((activation["A"] - 1.0).abs() < 1e-9);
        assert!((activation["B"] - 0.5).abs() < 1e-9);
        assert!((activation["C"] - 0.25).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_spread_activation_empty_seeds() {
        let graph = connected_graph(GraphConfig::new()).await;
        graph.add_link(&link("A", "B", LinkType::Semantic, 1.0), "").await.unwrap();

        let activation = graph.spread_activation(&[], 3, 0.5, "").await.unwrap();
        assert!(activation.is_empty());
    }

    #[tokio::test]
    async fn test_spread_activation_monotone_in_hops() {
        let graph = connected_graph(GraphConfig::new()).await;
        for (s, t) in [("A", "B"), ("B", "C"), ("C", "D")] {
            graph.add_link(&link(s, t, LinkType::Semantic, 1.0), "").await.unwrap();
        }

        let one = graph.spread_activation(&["A".to_string()], 1, 0.6, "").await.unwrap();
        let three = graph.spread_activation(&["A".to_string()], 3, 0.6, "").await.unwrap();

        for (id, score) in &one {
            assert!(three.get(id).copied().unwrap_or(0.0) >= *score);
        }
        assert!(three.len() >= one.len());
    }

    #[tokio::test]
    async fn test_spread_activation_user_partition() {
        let graph = connected_graph(GraphConfig::new()).await;
        graph.add_node("A", "u1").await.unwrap();
        graph.add_node("B", "u1").await.unwrap();
        graph.add_node("X", "u2").await.unwrap();
        graph.add_link(&link("A", "B", LinkType::Semantic, 1.0), "u1").await.unwrap();
        graph.add_link(&link("A", "X", LinkType::Semantic, 1.0), "").await.unwrap();

        let activation = graph
            .spread_activation(&["A".to_string()], 2, 0.5, "u1")
            .await
            .unwrap();
        assert!(activation.contains_key("B"));
        assert!(!activation.contains_key("X"));
    }

    #[tokio::test]
    async fn test_find_path() {
        let graph = connected_graph(GraphConfig::new()).await;
        for (s, t) in [("a", "b"), ("b", "c"), ("a", "d")] {
            graph.add_link(&link(s, t, LinkType::Semantic, 1.0), "").await.unwrap();
        }

        let path = graph.find_path("a", "c", 5).await.unwrap().unwrap();
        assert_eq!(path, vec!["a", "b", "c"]);

        // Too short a budget
        assert!(graph.find_path("a", "c", 2).await.unwrap().is_none());
        // No path in that direction
        assert!(graph.find_path("c", "a", 5).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_connected_component_is_weak() {
        let graph = connected_graph(GraphConfig::new()).await;
        graph.add_link(&link("a", "b", LinkType::Semantic, 1.0), "").await.unwrap();
        graph.add_link(&link("c", "b", LinkType::Semantic, 1.0), "").await.unwrap();
        graph.add_node("lonely", "").await.unwrap();

        let component = graph.connected_component("a").await.unwrap();
        assert_eq!(component.len(), 3);
        assert!(!component.contains("lonely"));
    }

    #[tokio::test]
    async fn test_snapshot_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("graph.json");

        let config = GraphConfig {
            persist_path: Some(path.clone()),
            auto_save: true,
            max_edges_per_node: 50,
        };
        {
            let graph = connected_graph(config.clone()).await;
            graph.add_node("a", "u1").await.unwrap();
            graph.add_link(&link("a", "b", LinkType::Causal, 1.5), "u1").await.unwrap();
            graph.disconnect().await.unwrap();
        }

        let restored = connected_graph(config).await;
        let links = restored.get_links("a").await.unwrap();
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].link_type, LinkType::Causal);
        assert!((links[0].weight - 1.5).abs() < f64::EPSILON);

        let activation = restored
            .spread_activation(&["a".to_string()], 1, 0.5, "u1")
            .await
            .unwrap();
        assert!(activation.contains_key("b"));
    }
}
