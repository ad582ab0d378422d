//! L1 Working Store - High-speed in-memory storage
//!
//! The working canvas: the most relevant, high-energy nodes for the current
//! task, capacity-bounded with TTL-based expiry. Reads are per-user scoped.

use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};

use super::{Result, StorageError};
use crate::memory::node::{MemoryNode, Tier};

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Configuration for the L1 working store
#[derive(Debug, Clone)]
pub struct L1Config {
    /// Maximum nodes to keep in working memory
    pub max_nodes: usize,
    /// Time-to-live for inactive nodes, in seconds
    pub ttl_seconds: i64,
    /// Minimum energy to stay in L1
    pub min_energy: f64,
}

impl Default for L1Config {
    fn default() -> Self {
        Self {
            max_nodes: 100,
            ttl_seconds: 3600,
            min_energy: 0.1,
        }
    }
}

/// Snapshot of working memory state
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct L1Stats {
    pub count: usize,
    pub capacity: usize,
    pub usage_percent: f64,
    pub avg_energy: f64,
    pub min_energy: f64,
    pub max_energy: f64,
}

// ============================================================================
// STORE
// ============================================================================

/// In-memory working canvas for high-speed access
///
/// Maintains the top-K high-energy nodes. Automatically evicts low-energy or
/// stale nodes; evicted nodes are returned to the caller so the tier manager
/// can demote them to L2. Reads may run concurrently; writes serialize on the
/// inner lock.
pub struct L1WorkingStore {
    config: L1Config,
    nodes: RwLock<HashMap<String, MemoryNode>>,
    connected: AtomicBool,
}

impl L1WorkingStore {
    pub fn new(config: L1Config) -> Self {
        Self {
            config,
            nodes: RwLock::new(HashMap::new()),
            connected: AtomicBool::new(false),
        }
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.connected.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(StorageError::NotReady("L1 working store".to_string()))
        }
    }

    fn filter_by_user(nodes: Vec<MemoryNode>, user_id: &str) -> Vec<MemoryNode> {
        if user_id.is_empty() {
            return nodes;
        }
        nodes.into_iter().filter(|n| n.user_id == user_id).collect()
    }

    /// Initialize the working memory
    pub async fn connect(&self) -> Result<()> {
        self.connected.store(true, Ordering::Release);
        Ok(())
    }

    /// Clear contents and release
    pub async fn disconnect(&self) -> Result<()> {
        if let Ok(mut nodes) = self.nodes.write() {
            nodes.clear();
        }
        self.connected.store(false, Ordering::Release);
        Ok(())
    }

    /// Store a node, evicting lowest-energy entries if over capacity.
    ///
    /// Returns the evicted nodes so they can be written back to L2.
    pub async fn put(&self, mut node: MemoryNode) -> Result<Vec<MemoryNode>> {
        self.ensure_connected()?;
        node.tier = Tier::L1;

        let mut nodes = self
            .nodes
            .write()
            .map_err(|_| StorageError::Unavailable("L1 lock poisoned".to_string()))?;
        nodes.insert(node.id.clone(), node);

        if nodes.len() <= self.config.max_nodes {
            return Ok(vec![]);
        }

        // Evict exactly enough lowest-energy entries to return to capacity
        let evict_count = nodes.len() - self.config.max_nodes;
        let mut by_energy: Vec<(String, f64)> =
            nodes.iter().map(|(id, n)| (id.clone(), n.energy)).collect();
        by_energy.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));

        let mut evicted = Vec::with_capacity(evict_count);
        for (id, _) in by_energy.into_iter().take(evict_count) {
            if let Some(node) = nodes.remove(&id) {
                evicted.push(node);
            }
        }
        Ok(evicted)
    }

    /// Retrieve a node and update its access time
    pub async fn get(&self, node_id: &str) -> Result<Option<MemoryNode>> {
        self.ensure_connected()?;
        let mut nodes = self
            .nodes
            .write()
            .map_err(|_| StorageError::Unavailable("L1 lock poisoned".to_string()))?;
        Ok(nodes.get_mut(node_id).map(|node| {
            node.touch();
            node.clone()
        }))
    }

    /// Retrieve a node without updating its access time
    pub async fn peek(&self, node_id: &str) -> Result<Option<MemoryNode>> {
        self.ensure_connected()?;
        let nodes = self
            .nodes
            .read()
            .map_err(|_| StorageError::Unavailable("L1 lock poisoned".to_string()))?;
        Ok(nodes.get(node_id).cloned())
    }

    /// Remove a node from working memory
    pub async fn delete(&self, node_id: &str) -> Result<bool> {
        self.ensure_connected()?;
        let mut nodes = self
            .nodes
            .write()
            .map_err(|_| StorageError::Unavailable("L1 lock poisoned".to_string()))?;
        Ok(nodes.remove(node_id).is_some())
    }

    pub async fn exists(&self, node_id: &str) -> Result<bool> {
        self.ensure_connected()?;
        let nodes = self
            .nodes
            .read()
            .map_err(|_| StorageError::Unavailable("L1 lock poisoned".to_string()))?;
        Ok(nodes.contains_key(node_id))
    }

    /// All nodes sorted by energy descending, optionally scoped to a user
    pub async fn list_all(&self, user_id: &str) -> Result<Vec<MemoryNode>> {
        self.ensure_connected()?;
        let nodes = self
            .nodes
            .read()
            .map_err(|_| StorageError::Unavailable("L1 lock poisoned".to_string()))?;
        let mut out = Self::filter_by_user(nodes.values().cloned().collect(), user_id);
        out.sort_by(|a, b| b.energy.partial_cmp(&a.energy).unwrap_or(std::cmp::Ordering::Equal));
        Ok(out)
    }

    /// IDs of every node currently resident in L1
    pub async fn member_ids(&self) -> Result<Vec<String>> {
        self.ensure_connected()?;
        let nodes = self
            .nodes
            .read()
            .map_err(|_| StorageError::Unavailable("L1 lock poisoned".to_string()))?;
        Ok(nodes.keys().cloned().collect())
    }

    pub async fn count(&self, user_id: &str) -> Result<usize> {
        self.ensure_connected()?;
        let nodes = self
            .nodes
            .read()
            .map_err(|_| StorageError::Unavailable("L1 lock poisoned".to_string()))?;
        if user_id.is_empty() {
            Ok(nodes.len())
        } else {
            Ok(nodes.values().filter(|n| n.user_id == user_id).count())
        }
    }

    pub async fn clear(&self) -> Result<()> {
        self.ensure_connected()?;
        let mut nodes = self
            .nodes
            .write()
            .map_err(|_| StorageError::Unavailable("L1 lock poisoned".to_string()))?;
        nodes.clear();
        Ok(())
    }

    /// Top K highest-energy nodes
    pub async fn top_k(&self, k: usize, user_id: &str) -> Result<Vec<MemoryNode>> {
        let mut all = self.list_all(user_id).await?;
        all.truncate(k);
        Ok(all)
    }

    /// Nodes at or above the energy threshold
    pub async fn by_energy_threshold(
        &self,
        min_energy: f64,
        user_id: &str,
    ) -> Result<Vec<MemoryNode>> {
        self.ensure_connected()?;
        let nodes = self
            .nodes
            .read()
            .map_err(|_| StorageError::Unavailable("L1 lock poisoned".to_string()))?;
        Ok(
            Self::filter_by_user(nodes.values().cloned().collect(), user_id)
                .into_iter()
                .filter(|n| n.energy >= min_energy)
                .collect(),
        )
    }

    /// Most recently accessed nodes
    pub async fn get_recent(&self, limit: usize, user_id: &str) -> Result<Vec<MemoryNode>> {
        self.ensure_connected()?;
        let nodes = self
            .nodes
            .read()
            .map_err(|_| StorageError::Unavailable("L1 lock poisoned".to_string()))?;
        let mut out = Self::filter_by_user(nodes.values().cloned().collect(), user_id);
        out.sort_by(|a, b| b.last_accessed.cmp(&a.last_accessed));
        out.truncate(limit);
        Ok(out)
    }

    /// Set energy for a node, clamped to `[0, 1]`
    pub async fn update_energy(&self, node_id: &str, new_energy: f64) -> Result<bool> {
        self.ensure_connected()?;
        let mut nodes = self
            .nodes
            .write()
            .map_err(|_| StorageError::Unavailable("L1 lock poisoned".to_string()))?;
        match nodes.get_mut(node_id) {
            Some(node) => {
                node.energy = new_energy.clamp(0.0, 1.0);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Boost energy for a node and touch it
    pub async fn boost_energy(&self, node_id: &str, boost: f64) -> Result<bool> {
        self.ensure_connected()?;
        let mut nodes = self
            .nodes
            .write()
            .map_err(|_| StorageError::Unavailable("L1 lock poisoned".to_string()))?;
        match nodes.get_mut(node_id) {
            Some(node) => {
                node.energy = (node.energy + boost).min(1.0);
                node.touch();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Remove nodes not accessed within the TTL; returns removed nodes
    pub async fn cleanup_stale(&self) -> Result<Vec<MemoryNode>> {
        self.ensure_connected()?;
        let cutoff = Utc::now() - Duration::seconds(self.config.ttl_seconds);

        let mut nodes = self
            .nodes
            .write()
            .map_err(|_| StorageError::Unavailable("L1 lock poisoned".to_string()))?;
        let stale_ids: Vec<String> = nodes
            .iter()
            .filter(|(_, n)| n.last_accessed < cutoff)
            .map(|(id, _)| id.clone())
            .collect();

        Ok(stale_ids.into_iter().filter_map(|id| nodes.remove(&id)).collect())
    }

    /// Remove nodes below the minimum energy floor; returns removed nodes
    pub async fn cleanup_low_energy(&self) -> Result<Vec<MemoryNode>> {
        self.ensure_connected()?;
        let floor = self.config.min_energy;

        let mut nodes = self
            .nodes
            .write()
            .map_err(|_| StorageError::Unavailable("L1 lock poisoned".to_string()))?;
        let low_ids: Vec<String> = nodes
            .iter()
            .filter(|(_, n)| n.energy < floor)
            .map(|(id, _)| id.clone())
            .collect();

        Ok(low_ids.into_iter().filter_map(|id| nodes.remove(&id)).collect())
    }

    /// Statistics about working memory state, optionally per user
    pub fn stats(&self, user_id: &str) -> L1Stats {
        let nodes = match self.nodes.read() {
            Ok(nodes) => nodes,
            Err(_) => {
                return L1Stats {
                    count: 0,
                    capacity: self.config.max_nodes,
                    usage_percent: 0.0,
                    avg_energy: 0.0,
                    min_energy: 0.0,
                    max_energy: 0.0,
                };
            }
        };

        let energies: Vec<f64> = nodes
            .values()
            .filter(|n| user_id.is_empty() || n.user_id == user_id)
            .map(|n| n.energy)
            .collect();

        if energies.is_empty() {
            return L1Stats {
                count: 0,
                capacity: self.config.max_nodes,
                usage_percent: 0.0,
                avg_energy: 0.0,
                min_energy: 0.0,
                max_energy: 0.0,
            };
        }

        L1Stats {
            count: energies.len(),
            capacity: self.config.max_nodes,
            usage_percent: energies.len() as f64 / self.config.max_nodes as f64 * 100.0,
            avg_energy: energies.iter().sum::<f64>() / energies.len() as f64,
            min_energy: energies.iter().cloned().fold(f64::INFINITY, f64::min),
            max_energy: energies.iter().cloned().fold(f64::NEG_INFINITY, f64::max),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn node_with_energy(content: &str, energy: f64) -> MemoryNode {
        let mut node = MemoryNode::new(content);
        node.energy = energy;
        node
    }

    async fn connected_store(config: L1Config) -> L1WorkingStore {
        let store = L1WorkingStore::new(config);
        store.connect().await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_not_ready_before_connect() {
        let store = L1WorkingStore::new(L1Config::default());
        let result = store.put(MemoryNode::new("x")).await;
        assert!(matches!(result, Err(StorageError::NotReady(_))));
    }

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let store = connected_store(L1Config::default()).await;
        let node = node_with_energy("remember this", 0.8);
        let id = node.id.clone();

        store.put(node).await.unwrap();
        let fetched = store.get(&id).await.unwrap().unwrap();
        assert_eq!(fetched.content, "remember this");
        assert_eq!(fetched.tier, Tier::L1);
    }

    #[tokio::test]
    async fn test_capacity_evicts_lowest_energy() {
        let store = connected_store(L1Config {
            max_nodes: 3,
            ..Default::default()
        })
        .await;

        for energy in [0.9, 0.5, 0.7] {
            store
                .put(node_with_energy(&format!("n{energy}"), energy))
                .await
                .unwrap();
        }
        // Fourth insert pushes over capacity; the 0.5 node must go
        let evicted = store.put(node_with_energy("n0.8", 0.8)).await.unwrap();
        assert_eq!(evicted.len(), 1);
        assert!((evicted[0].energy - 0.5).abs() < f64::EPSILON);
        assert_eq!(store.count("").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_bulk_overflow_evicts_exact_count() {
        let store = connected_store(L1Config {
            max_nodes: 5,
            ..Default::default()
        })
        .await;

        let mut total_evicted = 0;
        for i in 0..9 {
            let evicted = store
                .put(node_with_energy(&format!("n{i}"), i as f64 / 10.0))
                .await
                .unwrap();
            total_evicted += evicted.len();
        }
        assert_eq!(total_evicted, 4);
        assert_eq!(store.count("").await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_top_k_orders_by_energy() {
        let store = connected_store(L1Config::default()).await;
        for energy in [0.2, 0.9, 0.6] {
            store
                .put(node_with_energy(&format!("n{energy}"), energy))
                .await
                .unwrap();
        }
        let top = store.top_k(2, "").await.unwrap();
        assert_eq!(top.len(), 2);
        assert!((top[0].energy - 0.9).abs() < f64::EPSILON);
        assert!((top[1].energy - 0.6).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_user_scoped_reads() {
        let store = connected_store(L1Config::default()).await;

        let mut a = node_with_energy("alpha", 0.9);
        a.user_id = "u1".to_string();
        let mut b = node_with_energy("beta", 0.8);
        b.user_id = "u2".to_string();
        store.put(a).await.unwrap();
        store.put(b).await.unwrap();

        let u1 = store.list_all("u1").await.unwrap();
        assert_eq!(u1.len(), 1);
        assert_eq!(u1[0].content, "alpha");
        assert_eq!(store.count("u2").await.unwrap(), 1);
        assert_eq!(store.count("").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_cleanup_low_energy() {
        let store = connected_store(L1Config {
            min_energy: 0.3,
            ..Default::default()
        })
        .await;

        store.put(node_with_energy("weak", 0.1)).await.unwrap();
        store.put(node_with_energy("strong", 0.9)).await.unwrap();

        let removed = store.cleanup_low_energy().await.unwrap();
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].content, "weak");
        assert_eq!(store.count("").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_cleanup_stale() {
        let store = connected_store(L1Config {
            ttl_seconds: 60,
            ..Default::default()
        })
        .await;

        let mut old = node_with_energy("old", 0.9);
        old.last_accessed = Utc::now() - Duration::seconds(120);
        let old_id = old.id.clone();
        store.put(old).await.unwrap();
        store.put(node_with_energy("fresh", 0.9)).await.unwrap();

        let removed = store.cleanup_stale().await.unwrap();
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].id, old_id);
    }

    #[tokio::test]
    async fn test_get_touches_access_time() {
        let store = connected_store(L1Config::default()).await;
        let mut node = node_with_energy("touched", 0.5);
        node.last_accessed = Utc::now() - Duration::seconds(500);
        let id = node.id.clone();
        store.put(node).await.unwrap();

        let fetched = store.get(&id).await.unwrap().unwrap();
        assert!(Utc::now() - fetched.last_accessed < Duration::seconds(5));
    }

    #[tokio::test]
    async fn test_stats() {
        let store = connected_store(L1Config::default()).await;
        store.put(node_with_energy("a", 0.4)).await.unwrap();
        store.put(node_with_energy("b", 0.8)).await.unwrap();

        let stats = store.stats("");
        assert_eq!(stats.count, 2);
        assert!((stats.avg_energy - 0.6).abs() < 1e-9);
        assert!((stats.min_energy - 0.4).abs() < f64::EPSILON);
        assert!((stats.max_energy - 0.8).abs() < f64::EPSILON);
    }
}
