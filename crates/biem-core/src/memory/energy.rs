//! Energy Controller - Decay and activation dynamics
//!
//! Implements the exponential decay model `E = E_last * e^(-lambda * dt)`
//! where lambda is the decay coefficient and dt the seconds since last
//! access. Energy is boosted on access and estimated at ingest time from
//! heuristics, optionally refined by an LLM importance scorer.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::llm::ImportanceScorer;
use crate::memory::node::MemoryNode;
use crate::storage::Result as StorageResult;

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Configuration for energy decay behavior
#[derive(Debug, Clone)]
pub struct EnergyConfig {
    /// Decay coefficient per second (higher = faster decay)
    pub decay_lambda: f64,
    /// Minimum energy before a node is considered dead
    pub min_energy: f64,
    /// Energy boost when a node is accessed
    pub activation_boost: f64,
    /// Maximum energy cap
    pub max_energy: f64,
    /// Interval between background decay cycles
    pub decay_interval: Duration,
    /// Budget for LLM importance calls
    pub llm_timeout: Duration,

    /// Trigger LLM evaluation above this heuristic score
    pub high_importance_threshold: f64,
    /// Consider for demotion below this energy
    pub low_importance_threshold: f64,
}

impl Default for EnergyConfig {
    fn default() -> Self {
        Self {
            decay_lambda: 0.001,
            min_energy: 0.01,
            activation_boost: 0.1,
            max_energy: 1.0,
            decay_interval: Duration::from_secs(60),
            llm_timeout: Duration::from_secs(30),
            high_importance_threshold: 0.7,
            low_importance_threshold: 0.3,
        }
    }
}

/// Detailed decay diagnostics for a node
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecayInfo {
    pub current_energy: f64,
    pub projected_energy: f64,
    pub seconds_since_access: f64,
    /// Seconds until the node reaches minimum energy at the current rate
    pub seconds_to_minimum: f64,
    pub is_alive: bool,
    pub needs_demotion: bool,
}

// ============================================================================
// DECAY SOURCE
// ============================================================================

/// Supplies nodes to the free-running decay loop and persists its updates
#[async_trait]
pub trait DecaySource: Send + Sync {
    /// Nodes the loop should decay this cycle
    async fn nodes_for_decay(&self) -> StorageResult<Vec<MemoryNode>>;

    /// Persist a batch of `{node_id: new_energy}` updates
    async fn apply_energy_updates(&self, updates: HashMap<String, f64>) -> StorageResult<()>;
}

// ============================================================================
// CONTROLLER
// ============================================================================

/// Controls energy dynamics for memory nodes
pub struct EnergyController {
    config: EnergyConfig,
    importance: RwLock<Option<Arc<dyn ImportanceScorer>>>,
    decay_task: Mutex<Option<JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
}

impl EnergyController {
    pub fn new(config: EnergyConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            config,
            importance: RwLock::new(None),
            decay_task: Mutex::new(None),
            shutdown,
        }
    }

    pub fn config(&self) -> &EnergyConfig {
        &self.config
    }

    /// Install an LLM importance scorer used for high-value content
    pub fn set_importance_scorer(&self, scorer: Arc<dyn ImportanceScorer>) {
        if let Ok(mut guard) = self.importance.write() {
            *guard = Some(scorer);
        }
    }

    // ========================================================================
    // DECAY
    // ========================================================================

    /// Energy after decay at `current_time`, floored at the minimum
    pub fn calculate_decay(&self, node: &MemoryNode, current_time: DateTime<Utc>) -> f64 {
        let delta_t = (current_time - node.last_accessed).num_milliseconds() as f64 / 1000.0;
        if delta_t <= 0.0 {
            return node.energy;
        }
        let decayed = node.energy * (-self.config.decay_lambda * delta_t).exp();
        decayed.max(self.config.min_energy)
    }

    /// Apply decay to a node in place; returns the new energy
    pub fn apply_decay(&self, node: &mut MemoryNode) -> f64 {
        let new_energy = self.calculate_decay(node, Utc::now());
        node.energy = new_energy;
        new_energy
    }

    /// Apply decay to multiple nodes using a single `now` for the batch
    pub fn apply_decay_batch(&self, nodes: &mut [MemoryNode]) -> HashMap<String, f64> {
        let now = Utc::now();
        let mut results = HashMap::with_capacity(nodes.len());
        for node in nodes {
            let new_energy = self.calculate_decay(node, now);
            node.energy = new_energy;
            results.insert(node.id.clone(), new_energy);
        }
        results
    }

    /// Boost node energy (access or reinforcement) and touch it
    pub fn boost(&self, node: &mut MemoryNode, boost: Option<f64>) -> f64 {
        let amount = boost.unwrap_or(self.config.activation_boost);
        node.energy = (node.energy + amount).min(self.config.max_energy);
        node.touch();
        node.energy
    }

    /// Whether the node has enough energy to be considered active
    pub fn is_alive(&self, node: &MemoryNode) -> bool {
        node.energy >= self.config.min_energy
    }

    /// Whether the node should be demoted to a lower tier
    pub fn needs_demotion(&self, node: &MemoryNode) -> bool {
        node.energy < self.config.low_importance_threshold
    }

    /// Detailed decay diagnostics
    pub fn decay_info(&self, node: &MemoryNode) -> DecayInfo {
        let now = Utc::now();
        let seconds_since_access =
            (now - node.last_accessed).num_milliseconds() as f64 / 1000.0;
        let projected_energy = self.calculate_decay(node, now);

        let seconds_to_minimum = if node.energy > self.config.min_energy {
            -(self.config.min_energy / node.energy).ln() / self.config.decay_lambda
        } else {
            0.0
        };

        DecayInfo {
            current_energy: node.energy,
            projected_energy,
            seconds_since_access,
            seconds_to_minimum,
            is_alive: self.is_alive(node),
            needs_demotion: self.needs_demotion(node),
        }
    }

    // ========================================================================
    // INITIAL ENERGY ESTIMATION
    // ========================================================================

    /// Estimate initial energy for new content.
    ///
    /// Explicit importance wins when provided (clamped). Otherwise a content
    /// heuristic is used; high-scoring content is refined by the importance
    /// scorer when one is installed, blended 0.4 heuristic / 0.6 model.
    pub async fn estimate_initial_energy(
        &self,
        content: &str,
        _context: &str,
        explicit_importance: Option<f64>,
    ) -> f64 {
        if let Some(explicit) = explicit_importance {
            return explicit.clamp(0.1, 1.0);
        }

        let heuristic_score = self.heuristic_importance(content);

        if heuristic_score > self.config.high_importance_threshold {
            let scorer = self.importance.read().ok().and_then(|g| g.clone());
            if let Some(scorer) = scorer {
                let call = scorer.score(content);
                match tokio::time::timeout(self.config.llm_timeout, call).await {
                    Ok(Ok(llm_score)) => {
                        return 0.4 * heuristic_score + 0.6 * llm_score.clamp(0.0, 1.0);
                    }
                    Ok(Err(e)) => {
                        tracing::warn!("Importance scorer failed, using heuristic: {}", e);
                    }
                    Err(_) => {
                        tracing::warn!("Importance scorer timed out, using heuristic");
                    }
                }
            }
        }

        heuristic_score
    }

    /// Importance from simple content heuristics.
    ///
    /// Factors: a moderate-length band, entity density (capitalized words as
    /// proxy), digits, and explicit importance markers.
    pub fn heuristic_importance(&self, content: &str) -> f64 {
        let mut score = 0.5;

        let length = content.len();
        if (50..=500).contains(&length) {
            score += 0.1;
        } else if length < 20 {
            score -= 0.2;
        } else if length > 2000 {
            score -= 0.1;
        }

        let words: Vec<&str> = content.split_whitespace().collect();
        if !words.is_empty() {
            let capitalized = words
                .iter()
                .filter(|w| w.chars().next().is_some_and(|c| c.is_uppercase()))
                .count();
            let entity_ratio = capitalized as f64 / words.len() as f64;
            if entity_ratio > 0.1 {
                score += entity_ratio.min(0.2);
            }
        }

        if content.chars().any(|c| c.is_ascii_digit()) {
            score += 0.1;
        }

        const IMPORTANCE_MARKERS: [&str; 7] =
            ["important", "remember", "key", "critical", "must", "always", "never"];
        let lower = content.to_lowercase();
        if IMPORTANCE_MARKERS.iter().any(|m| lower.contains(m)) {
            score += 0.15;
        }

        score.clamp(0.1, 1.0)
    }

    // ========================================================================
    // BACKGROUND DECAY LOOP
    // ========================================================================

    /// Start the free-running decay loop over the given source.
    ///
    /// Errors from the source are logged and the loop continues.
    pub fn start_decay_loop(self: &Arc<Self>, source: Arc<dyn DecaySource>) {
        let controller = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();
        let interval = self.config.decay_interval;

        let handle = tokio::spawn(async move {
            loop {
                match source.nodes_for_decay().await {
                    Ok(mut nodes) => {
                        if !nodes.is_empty() {
                            let updates = controller.apply_decay_batch(&mut nodes);
                            if let Err(e) = source.apply_energy_updates(updates).await {
                                tracing::warn!("Decay loop failed to persist updates: {}", e);
                            }
                        }
                    }
                    Err(e) => tracing::warn!("Decay loop failed to fetch nodes: {}", e),
                }

                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = shutdown.changed() => break,
                }
            }
        });

        if let Ok(mut task) = self.decay_task.lock() {
            *task = Some(handle);
        }
    }

    /// Stop the decay loop, letting any in-flight write complete
    pub async fn stop_decay_loop(&self) {
        let _ = self.shutdown.send(true);
        let handle = self.decay_task.lock().ok().and_then(|mut t| t.take());
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn controller(lambda: f64) -> EnergyController {
        EnergyController::new(EnergyConfig {
            decay_lambda: lambda,
            ..Default::default()
        })
    }

    fn node_accessed_seconds_ago(energy: f64, seconds: i64) -> MemoryNode {
        let mut node = MemoryNode::new("test");
        node.energy = energy;
        node.last_accessed = Utc::now() - ChronoDuration::seconds(seconds);
        node
    }

    #[test]
    fn test_exponential_decay_formula() {
        let ctrl = controller(1.0);
        let node = node_accessed_seconds_ago(0.5, 2);
        let decayed = ctrl.calculate_decay(&node, Utc::now());
        // 0.5 * e^-2 ~= 0.0677
        assert!((decayed - 0.5 * (-2.0f64).exp()).abs() < 0.005);
    }

    #[test]
    fn test_decay_floors_at_minimum() {
        let ctrl = controller(1.0);
        let node = node_accessed_seconds_ago(0.5, 100_000);
        let decayed = ctrl.calculate_decay(&node, Utc::now());
        assert!((decayed - ctrl.config.min_energy).abs() < f64::EPSILON);
    }

    #[test]
    fn test_no_decay_for_future_access_time() {
        let ctrl = controller(1.0);
        let mut node = MemoryNode::new("x");
        node.energy = 0.8;
        node.last_accessed = Utc::now() + ChronoDuration::seconds(10);
        assert!((ctrl.calculate_decay(&node, Utc::now()) - 0.8).abs() < f64::EPSILON);
    }

    #[test]
    fn test_decay_is_monotone_in_time() {
        let ctrl = controller(0.01);
        let node = node_accessed_seconds_ago(0.9, 0);
        let now = Utc::now();
        let e1 = ctrl.calculate_decay(&node, now + ChronoDuration::seconds(10));
        let e2 = ctrl.calculate_decay(&node, now + ChronoDuration::seconds(100));
        assert!(e2 <= e1);
        assert!(e1 <= node.energy);
    }

    #[test]
    fn test_boost_clamps_and_touches() {
        let ctrl = controller(0.001);
        let mut node = node_accessed_seconds_ago(0.95, 500);

        let new_energy = ctrl.boost(&mut node, None);
        assert!((new_energy - 1.0).abs() < f64::EPSILON);
        assert!(Utc::now() - node.last_accessed < ChronoDuration::seconds(5));

        let mut other = node_accessed_seconds_ago(0.5, 0);
        ctrl.boost(&mut other, Some(0.2));
        assert!((other.energy - 0.7).abs() < 1e-9);
    }

    #[test]
    fn test_batch_decay_uses_single_now() {
        let ctrl = controller(0.5);
        let mut nodes = vec![
            node_accessed_seconds_ago(1.0, 10),
            node_accessed_seconds_ago(1.0, 10),
        ];
        let updates = ctrl.apply_decay_batch(&mut nodes);
        assert_eq!(updates.len(), 2);
        let values: Vec<f64> = updates.values().cloned().collect();
        assert!((values[0] - values[1]).abs() < 1e-9);
    }

    #[test]
    fn test_alive_and_demotion_classification() {
        let ctrl = controller(0.001);
        let mut node = MemoryNode::new("x");

        node.energy = 0.005;
        assert!(!ctrl.is_alive(&node));

        node.energy = 0.2;
        assert!(ctrl.is_alive(&node));
        assert!(ctrl.needs_demotion(&node));

        node.energy = 0.5;
        assert!(!ctrl.needs_demotion(&node));
    }

    #[tokio::test]
    async fn test_explicit_importance_clamped() {
        let ctrl = controller(0.001);
        assert!((ctrl.estimate_initial_energy("x", "", Some(5.0)).await - 1.0).abs() < f64::EPSILON);
        assert!((ctrl.estimate_initial_energy("x", "", Some(0.0)).await - 0.1).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_heuristic_bands() {
        let ctrl = controller(0.001);

        let short = ctrl.heuristic_importance("hi");
        let digits = ctrl
            .heuristic_importance("The deploy window opens at 14:30 on weekdays and must never slip")
            ;
        assert!(short < digits);
        assert!(digits <= 1.0);

        // Explicit marker raises the score
        let plain = ctrl.heuristic_importance("the sky was grey over the parking lot today");
        let marked = ctrl.heuristic_importance("remember the sky was grey over the parking lot today");
        assert!(marked > plain);
    }

    #[tokio::test]
    async fn test_llm_blend_applies_above_threshold() {
        struct FixedScorer;
        #[async_trait]
        impl ImportanceScorer for FixedScorer {
            async fn score(&self, _content: &str) -> Result<f64, crate::llm::LlmError> {
                Ok(1.0)
            }
        }

        let ctrl = controller(0.001);
        ctrl.set_importance_scorer(Arc::new(FixedScorer));

        // Content engineered above the 0.7 heuristic threshold
        let content = "Remember: Production Deploys Require Approval From Two Senior Engineers \
                       before 17:00 UTC, always";
        let heuristic = ctrl.heuristic_importance(content);
        assert!(heuristic > 0.7);

        let blended = ctrl.estimate_initial_energy(content, "", None).await;
        let expected = 0.4 * heuristic + 0.6;
        assert!((blended - expected).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_scorer_failure_falls_back_to_heuristic() {
        struct FailingScorer;
        #[async_trait]
        impl ImportanceScorer for FailingScorer {
            async fn score(&self, _content: &str) -> Result<f64, crate::llm::LlmError> {
                Err(crate::llm::LlmError::Backend("down".to_string()))
            }
        }

        let ctrl = controller(0.001);
        ctrl.set_importance_scorer(Arc::new(FailingScorer));

        let content = "Remember: Production Deploys Require Approval From Two Senior Engineers \
                       before 17:00 UTC, always";
        let heuristic = ctrl.heuristic_importance(content);
        let estimated = ctrl.estimate_initial_energy(content, "", None).await;
        assert!((estimated - heuristic).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_decay_loop_runs_and_survives_errors() {
        struct FlakySource {
            calls: AtomicUsize,
            updates: AtomicUsize,
        }

        #[async_trait]
        impl DecaySource for FlakySource {
            async fn nodes_for_decay(&self) -> StorageResult<Vec<MemoryNode>> {
                let call = self.calls.fetch_add(1, Ordering::SeqCst);
                if call == 0 {
                    Err(crate::storage::StorageError::Unavailable("flaky".to_string()))
                } else {
                    Ok(vec![node_accessed_seconds_ago(0.9, 60)])
                }
            }

            async fn apply_energy_updates(
                &self,
                updates: HashMap<String, f64>,
            ) -> StorageResult<()> {
                self.updates.fetch_add(updates.len(), Ordering::SeqCst);
                Ok(())
            }
        }

        let ctrl = Arc::new(EnergyController::new(EnergyConfig {
            decay_interval: Duration::from_millis(10),
            ..Default::default()
        }));
        let source = Arc::new(FlakySource {
            calls: AtomicUsize::new(0),
            updates: AtomicUsize::new(0),
        });

        ctrl.start_decay_loop(source.clone());
        tokio::time::sleep(Duration::from_millis(80)).await;
        ctrl.stop_decay_loop().await;

        // First call errored; later cycles still delivered updates
        assert!(source.calls.load(Ordering::SeqCst) >= 2);
        assert!(source.updates.load(Ordering::SeqCst) >= 1);
    }
}
