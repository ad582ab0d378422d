//! Conflict Checker - Cognitive dissonance detection
//!
//! Detects when new information contradicts existing memory. Pairs are gated
//! by semantic similarity, then verified through the LLM conflict capability.
//! A lexical heuristic exists as a fallback but only runs when explicitly
//! enabled and the verifier is unavailable.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::embedding::cosine_similarity;
use crate::llm::ConflictVerifier;
use crate::memory::node::{
    ConflictKind, ConflictNode, DissonanceAction, DissonanceSignal, MemoryNode,
};

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Configuration for conflict detection
#[derive(Debug, Clone)]
pub struct ConflictConfig {
    /// Min similarity for a pair to be checked at all
    pub similarity_threshold: f64,
    /// Min verifier confidence to report a conflict
    pub confidence_threshold: f64,

    /// Run the lexical heuristic when no verifier is reachable
    pub use_heuristic_fallback: bool,
    /// Min polarity difference for the sentiment heuristic
    pub polarity_threshold: f64,

    /// Emit `restructure` when the existing node is weak
    pub auto_resolve_low_energy: bool,
    /// Energy below which the existing node counts as weak
    pub low_energy_threshold: f64,

    /// Budget for a single verification call
    pub llm_timeout: Duration,
}

impl Default for ConflictConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.8,
            confidence_threshold: 0.7,
            use_heuristic_fallback: false,
            polarity_threshold: 0.5,
            auto_resolve_low_energy: true,
            low_energy_threshold: 0.3,
            llm_timeout: Duration::from_secs(30),
        }
    }
}

const NEGATION_PATTERNS: [&str; 10] = [
    "not ", "don't ", "doesn't ", "isn't ", "aren't ", "won't ", "can't ", "shouldn't ",
    "never ", "no longer ",
];

const CONTRADICTION_PAIRS: [(&str, &str); 9] = [
    ("true", "false"),
    ("yes", "no"),
    ("always", "never"),
    ("all", "none"),
    ("increase", "decrease"),
    ("start", "stop"),
    ("enable", "disable"),
    ("allow", "deny"),
    ("success", "failure"),
];

// ============================================================================
// CHECKER
// ============================================================================

/// Detects and describes conflicts between memory nodes
pub struct ConflictChecker {
    config: ConflictConfig,
    verifier: RwLock<Option<Arc<dyn ConflictVerifier>>>,
}

impl ConflictChecker {
    pub fn new(config: ConflictConfig) -> Self {
        Self {
            config,
            verifier: RwLock::new(None),
        }
    }

    /// Install the LLM conflict verification capability
    pub fn set_verifier(&self, verifier: Arc<dyn ConflictVerifier>) {
        if let Ok(mut guard) = self.verifier.write() {
            *guard = Some(verifier);
        }
    }

    /// Check a new node against a set of existing candidates
    pub async fn check_conflicts(
        &self,
        new_node: &MemoryNode,
        existing_nodes: &[MemoryNode],
    ) -> Vec<DissonanceSignal> {
        let mut signals = vec![];

        for existing in existing_nodes {
            if existing.id == new_node.id {
                continue;
            }

            let similarity = cosine_similarity(&new_node.vector, &existing.vector) as f64;
            if similarity < self.config.similarity_threshold {
                continue;
            }

            if let Some(conflict) = self.detect_conflict(new_node, existing, similarity).await {
                signals.push(self.create_signal(conflict, existing));
            }
        }

        signals
    }

    async fn detect_conflict(
        &self,
        new_node: &MemoryNode,
        existing_node: &MemoryNode,
        similarity: f64,
    ) -> Option<ConflictNode> {
        let verifier = self.verifier.read().ok().and_then(|g| g.clone());

        if let Some(verifier) = verifier {
            let call = verifier.verify(&new_node.content, &existing_node.content);
            match tokio::time::timeout(self.config.llm_timeout, call).await {
                Ok(Ok(verdict)) => {
                    if !verdict.is_conflict
                        || verdict.confidence < self.config.confidence_threshold
                    {
                        return None;
                    }
                    return Some(ConflictNode::new(
                        existing_node.id.clone(),
                        new_node.id.clone(),
                        similarity,
                        verdict.conflict_type,
                        verdict.description,
                    ));
                }
                Ok(Err(e)) => {
                    tracing::warn!("Conflict verification failed: {}", e);
                }
                Err(_) => {
                    tracing::warn!("Conflict verification timed out");
                }
            }
            // Fall through to the heuristic only when enabled
        }

        if !self.config.use_heuristic_fallback {
            return None;
        }

        if !self.heuristic_conflict_check(new_node, existing_node) {
            return None;
        }

        Some(ConflictNode::new(
            existing_node.id.clone(),
            new_node.id.clone(),
            similarity,
            ConflictKind::Contradiction,
            "Heuristic: polarity or negation mismatch between similar memories",
        ))
    }

    /// Lexical heuristic: sentiment reversal, mismatched negation, or
    /// contradiction-pair vocabulary
    fn heuristic_conflict_check(&self, node_a: &MemoryNode, node_b: &MemoryNode) -> bool {
        let sentiment_a = node_a.metadata.sentiment;
        let sentiment_b = node_b.metadata.sentiment;

        let polarity_diff = (sentiment_a - sentiment_b).abs();
        if polarity_diff >= self.config.polarity_threshold
            && ((sentiment_a > 0.0 && sentiment_b < 0.0)
                || (sentiment_a < 0.0 && sentiment_b > 0.0))
        {
            return true;
        }

        let content_a = node_a.content.to_lowercase();
        let content_b = node_b.content.to_lowercase();

        let has_negation_a = NEGATION_PATTERNS.iter().any(|p| content_a.contains(p));
        let has_negation_b = NEGATION_PATTERNS.iter().any(|p| content_b.contains(p));
        if has_negation_a != has_negation_b {
            return true;
        }

        CONTRADICTION_PAIRS.iter().any(|(pos, neg)| {
            (content_a.contains(pos) && content_b.contains(neg))
                || (content_a.contains(neg) && content_b.contains(pos))
        })
    }

    fn create_signal(&self, conflict: ConflictNode, existing_node: &MemoryNode) -> DissonanceSignal {
        let (action, priority) = if self.config.auto_resolve_low_energy
            && existing_node.energy < self.config.low_energy_threshold
        {
            (DissonanceAction::Restructure, 0.3)
        } else if conflict.conflict_type == ConflictKind::Update {
            (DissonanceAction::Confirm, 0.5)
        } else {
            (DissonanceAction::Confirm, 0.7)
        };

        DissonanceSignal {
            conflict,
            action_required: action,
            priority,
            context: format!("Existing memory energy: {:.2}", existing_node.energy),
        }
    }

    /// Mark a conflict as resolved
    pub fn resolve(&self, conflict: &mut ConflictNode, resolution: &str) {
        conflict.resolved = true;
        conflict.resolution = resolution.to_string();
    }

    /// Human-readable summary of a set of conflicts
    pub fn conflict_summary(&self, conflicts: &[ConflictNode]) -> String {
        if conflicts.is_empty() {
            return "No conflicts detected.".to_string();
        }

        let mut lines = vec![format!("Detected {} potential conflict(s):", conflicts.len())];
        for (i, c) in conflicts.iter().enumerate() {
            let status = if c.resolved { "resolved" } else { "pending" };
            let description: String = c.description.chars().take(100).collect();
            lines.push(format!(
                "{}. [{}] {}: {}",
                i + 1,
                status,
                c.conflict_type.as_str(),
                description
            ));
        }
        lines.join("\n")
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{ConflictVerdict, LlmError};
    use async_trait::async_trait;

    struct FixedVerifier {
        verdict: ConflictVerdict,
    }

    #[async_trait]
    impl ConflictVerifier for FixedVerifier {
        async fn verify(&self, _a: &str, _b: &str) -> Result<ConflictVerdict, LlmError> {
            Ok(self.verdict.clone())
        }
    }

    fn node(content: &str, vector: Vec<f32>, energy: f64) -> MemoryNode {
        let mut n = MemoryNode::new(content);
        n.vector = vector;
        n.energy = energy;
        n
    }

    fn conflicting_verdict(kind: ConflictKind, confidence: f64) -> ConflictVerdict {
        ConflictVerdict {
            is_conflict: true,
            conflict_type: kind,
            description: "they disagree".to_string(),
            confidence,
        }
    }

    #[tokio::test]
    async fn test_similarity_gate_skips_dissimilar_pairs() {
        let checker = ConflictChecker::new(ConflictConfig::default());
        checker.set_verifier(Arc::new(FixedVerifier {
            verdict: conflicting_verdict(ConflictKind::Contradiction, 1.0),
        }));

        let new = node("a", vec![1.0, 0.0], 0.9);
        let existing = node("b", vec![0.0, 1.0], 0.9);
        let signals = checker.check_conflicts(&new, &[existing]).await;
        assert!(signals.is_empty());
    }

    #[tokio::test]
    async fn test_verdict_confidence_gate() {
        let low = ConflictChecker::new(ConflictConfig::default());
        low.set_verifier(Arc::new(FixedVerifier {
            verdict: conflicting_verdict(ConflictKind::Contradiction, 0.5),
        }));

        let new = node("dark mode on", vec![1.0, 0.0], 0.9);
        let existing = node("dark mode off", vec![1.0, 0.0], 0.9);
        assert!(low.check_conflicts(&new, &[existing.clone()]).await.is_empty());

        let high = ConflictChecker::new(ConflictConfig::default());
        high.set_verifier(Arc::new(FixedVerifier {
            verdict: conflicting_verdict(ConflictKind::Contradiction, 0.9),
        }));
        let signals = high.check_conflicts(&new, &[existing]).await;
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].conflict.conflict_type, ConflictKind::Contradiction);
    }

    #[tokio::test]
    async fn test_no_verifier_and_fallback_disabled_means_no_conflict() {
        let checker = ConflictChecker::new(ConflictConfig::default());
        let new = node("the service is up", vec![1.0], 0.9);
        let existing = node("the service is not up", vec![1.0], 0.9);
        assert!(checker.check_conflicts(&new, &[existing]).await.is_empty());
    }

    #[tokio::test]
    async fn test_heuristic_negation_mismatch() {
        let checker = ConflictChecker::new(ConflictConfig {
            use_heuristic_fallback: true,
            ..Default::default()
        });

        let new = node("the flag is enabled for tenants", vec![1.0], 0.9);
        let existing = node("the flag is not enabled for tenants", vec![1.0], 0.9);
        let signals = checker.check_conflicts(&new, &[existing]).await;
        assert_eq!(signals.len(), 1);
    }

    #[tokio::test]
    async fn test_heuristic_sentiment_reversal() {
        let checker = ConflictChecker::new(ConflictConfig {
            use_heuristic_fallback: true,
            ..Default::default()
        });

        let mut new = node("rollout went well overall", vec![1.0], 0.9);
        new.metadata.sentiment = 0.8;
        let mut existing = node("rollout went poorly overall", vec![1.0], 0.9);
        existing.metadata.sentiment = -0.8;

        let signals = checker.check_conflicts(&new, &[existing]).await;
        assert_eq!(signals.len(), 1);
    }

    #[tokio::test]
    async fn test_priorities() {
        let checker = ConflictChecker::new(ConflictConfig::default());
        checker.set_verifier(Arc::new(FixedVerifier {
            verdict: conflicting_verdict(ConflictKind::Contradiction, 0.9),
        }));

        // Weak existing node: restructure at 0.3
        let new = node("x", vec![1.0], 0.9);
        let weak = node("y", vec![1.0], 0.1);
        let signals = checker.check_conflicts(&new, &[weak]).await;
        assert_eq!(signals[0].action_required, DissonanceAction::Restructure);
        assert!((signals[0].priority - 0.3).abs() < f64::EPSILON);

        // Strong existing node with a contradiction: confirm at 0.7
        let strong = node("y", vec![1.0], 0.9);
        let signals = checker.check_conflicts(&new, &[strong.clone()]).await;
        assert_eq!(signals[0].action_required, DissonanceAction::Confirm);
        assert!((signals[0].priority - 0.7).abs() < f64::EPSILON);

        // Update verdicts confirm at 0.5
        let update_checker = ConflictChecker::new(ConflictConfig::default());
        update_checker.set_verifier(Arc::new(FixedVerifier {
            verdict: conflicting_verdict(ConflictKind::Update, 0.9),
        }));
        let signals = update_checker.check_conflicts(&new, &[strong]).await;
        assert!((signals[0].priority - 0.5).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_conflict_summary() {
        let checker = ConflictChecker::new(ConflictConfig::default());
        assert_eq!(checker.conflict_summary(&[]), "No conflicts detected.");

        let mut conflict = ConflictNode::new("a", "b", 0.9, ConflictKind::Update, "changed value");
        checker.resolve(&mut conflict, "kept_new");
        let summary = checker.conflict_summary(&[conflict]);
        assert!(summary.contains("resolved"));
        assert!(summary.contains("update"));
    }
}
