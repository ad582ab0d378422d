//! Encoder - Turns raw text into memory nodes
//!
//! Extracts entities and sentiment, and generates embeddings through the
//! external [`Embedder`] capability. Embedding failure never fails an
//! ingest: the encoder degrades to an all-zero vector of the configured
//! dimension. The dimension itself is discovered with a probe embedding at
//! initialization.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock};
use std::time::Duration;

use lru::LruCache;
use regex::Regex;

use crate::embedding::zero_vector;
use crate::llm::Embedder;
use crate::memory::node::{MemoryMetadata, MemoryNode, Tier};

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Configuration for the encoder
#[derive(Debug, Clone)]
pub struct EncoderConfig {
    /// Expected embedding dimension; corrected by the init probe
    pub embedding_dim: usize,
    /// Content is truncated to this many characters before embedding
    pub max_content_length: usize,
    /// Budget for a single embedding backend call
    pub embed_timeout: Duration,
    /// Capacity of the query-embedding LRU cache
    pub query_cache_size: usize,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            embedding_dim: 1024,
            max_content_length: 8000,
            embed_timeout: Duration::from_secs(60),
            query_cache_size: 100,
        }
    }
}

// ============================================================================
// LEXICONS AND PATTERNS
// ============================================================================

const POSITIVE_WORDS: [&str; 19] = [
    "good", "great", "excellent", "amazing", "wonderful", "fantastic", "happy", "love", "best",
    "perfect", "success", "win", "positive", "helpful", "useful", "effective", "efficient",
    "improve", "solved",
];

const NEGATIVE_WORDS: [&str; 20] = [
    "bad", "terrible", "awful", "horrible", "worst", "fail", "error", "problem", "issue", "bug",
    "crash", "broken", "wrong", "negative", "difficult", "hard", "confusing", "slow",
    "frustrated", "angry",
];

fn capitalized_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b[A-Z][a-z]+(?:\s+[A-Z][a-z]+)*\b").expect("valid regex"))
}

fn email_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b[\w.-]+@[\w.-]+\.\w+\b").expect("valid regex"))
}

fn url_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"https?://\S+").expect("valid regex"))
}

fn date_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)\b\d{1,2}[/-]\d{1,2}[/-]\d{2,4}\b|\b(?:Jan|Feb|Mar|Apr|May|Jun|Jul|Aug|Sep|Oct|Nov|Dec)[a-z]*\s+\d{1,2},?\s*\d{4}\b",
        )
        .expect("valid regex")
    })
}

// ============================================================================
// ENCODER
// ============================================================================

/// Encodes content into memory nodes with metadata and embeddings
pub struct Encoder {
    config: EncoderConfig,
    dim: AtomicUsize,
    embedder: RwLock<Option<Arc<dyn Embedder>>>,
    initialized: AtomicBool,
    query_cache: Mutex<LruCache<String, Vec<f32>>>,
}

impl Encoder {
    pub fn new(config: EncoderConfig) -> Self {
        let cache_size = NonZeroUsize::new(config.query_cache_size.max(1)).expect("non-zero");
        let dim = config.embedding_dim;
        Self {
            config,
            dim: AtomicUsize::new(dim),
            embedder: RwLock::new(None),
            initialized: AtomicBool::new(false),
            query_cache: Mutex::new(LruCache::new(cache_size)),
        }
    }

    /// Install the external embedding capability
    pub fn set_embedder(&self, embedder: Arc<dyn Embedder>) {
        if let Ok(mut guard) = self.embedder.write() {
            *guard = Some(embedder);
        }
        self.initialized.store(false, Ordering::Release);
    }

    /// The embedding dimension currently in effect
    pub fn dimension(&self) -> usize {
        self.dim.load(Ordering::Acquire)
    }

    /// Probe the embedding backend once and adopt its dimension
    pub async fn initialize(&self) {
        if self.initialized.swap(true, Ordering::AcqRel) {
            return;
        }
        let embedder = self.embedder.read().ok().and_then(|g| g.clone());
        let Some(embedder) = embedder else {
            tracing::warn!("No embedder installed; memories will carry zero vectors");
            return;
        };

        match tokio::time::timeout(self.config.embed_timeout, embedder.embed("test")).await {
            Ok(Ok(probe)) if !probe.is_empty() => {
                let actual = probe.len();
                let configured = self.dim.load(Ordering::Acquire);
                if actual != configured {
                    tracing::info!("Updating embedding_dim: {} -> {}", configured, actual);
                    self.dim.store(actual, Ordering::Release);
                }
            }
            Ok(Ok(_)) | Ok(Err(_)) | Err(_) => {
                tracing::warn!("Could not verify embedding backend; keeping configured dimension");
            }
        }
    }

    // ========================================================================
    // ENCODING
    // ========================================================================

    /// Encode content into a fresh node with embedding and metadata
    pub async fn encode(
        &self,
        content: &str,
        source: &str,
        location: &str,
        tags: Vec<String>,
    ) -> MemoryNode {
        self.initialize().await;

        let entities = self.extract_entities(content);
        let sentiment = self.analyze_sentiment(content);
        let vector = self.generate_embedding(content).await;

        MemoryNode {
            content: content.to_string(),
            vector,
            metadata: MemoryMetadata {
                location: location.to_string(),
                entities,
                sentiment,
                source: source.to_string(),
                tags,
                ..Default::default()
            },
            energy: 1.0,
            tier: Tier::L1,
            ..Default::default()
        }
    }

    /// Encode multiple contents using one batched embedding call
    pub async fn batch_encode(&self, contents: &[String], source: &str) -> Vec<MemoryNode> {
        self.initialize().await;
        if contents.is_empty() {
            return vec![];
        }

        let embeddings = self.generate_embeddings_batch(contents).await;
        let dim = self.dimension();

        contents
            .iter()
            .enumerate()
            .map(|(i, content)| MemoryNode {
                content: content.clone(),
                vector: embeddings.get(i).cloned().unwrap_or_else(|| zero_vector(dim)),
                metadata: MemoryMetadata {
                    entities: self.extract_entities(content),
                    sentiment: self.analyze_sentiment(content),
                    source: source.to_string(),
                    ..Default::default()
                },
                energy: 1.0,
                tier: Tier::L1,
                ..Default::default()
            })
            .collect()
    }

    /// Generate an embedding, degrading to a zero vector on any failure
    pub async fn generate_embedding(&self, content: &str) -> Vec<f32> {
        let truncated = self.truncate(content);
        if truncated.trim().is_empty() {
            return zero_vector(self.dimension());
        }

        if let Ok(mut cache) = self.query_cache.lock() {
            if let Some(hit) = cache.get(truncated.as_str()) {
                return hit.clone();
            }
        }

        let embedder = self.embedder.read().ok().and_then(|g| g.clone());
        let Some(embedder) = embedder else {
            return zero_vector(self.dimension());
        };

        match tokio::time::timeout(self.config.embed_timeout, embedder.embed(&truncated)).await {
            Ok(Ok(vector)) if !vector.is_empty() => {
                if let Ok(mut cache) = self.query_cache.lock() {
                    cache.put(truncated, vector.clone());
                }
                vector
            }
            Ok(Ok(_)) => zero_vector(self.dimension()),
            Ok(Err(e)) => {
                tracing::warn!("Embedding failed: {}", e);
                zero_vector(self.dimension())
            }
            Err(_) => {
                tracing::warn!("Embedding call timed out");
                zero_vector(self.dimension())
            }
        }
    }

    /// Generate embeddings for multiple contents in one backend call
    pub async fn generate_embeddings_batch(&self, contents: &[String]) -> Vec<Vec<f32>> {
        if contents.is_empty() {
            return vec![];
        }
        let truncated: Vec<String> = contents.iter().map(|c| self.truncate(c)).collect();

        let embedder = self.embedder.read().ok().and_then(|g| g.clone());
        let Some(embedder) = embedder else {
            let dim = self.dimension();
            return truncated.iter().map(|_| zero_vector(dim)).collect();
        };

        match tokio::time::timeout(self.config.embed_timeout, embedder.embed_batch(&truncated))
            .await
        {
            Ok(Ok(vectors)) if vectors.len() == truncated.len() => vectors,
            Ok(Ok(_)) | Ok(Err(_)) | Err(_) => {
                tracing::warn!("Batch embedding failed; falling back to zero vectors");
                let dim = self.dimension();
                truncated.iter().map(|_| zero_vector(dim)).collect()
            }
        }
    }

    fn truncate(&self, content: &str) -> String {
        content.chars().take(self.config.max_content_length).collect()
    }

    // ========================================================================
    // ENTITY EXTRACTION
    // ========================================================================

    /// Extract up to 20 deduplicated entity anchors, first occurrence first
    pub fn extract_entities(&self, content: &str) -> Vec<String> {
        let window = self.truncate(content);
        let mut candidates: Vec<String> = vec![];

        candidates.extend(
            capitalized_re()
                .find_iter(&window)
                .take(10)
                .map(|m| m.as_str().to_string()),
        );
        candidates.extend(email_re().find_iter(&window).take(3).map(|m| m.as_str().to_string()));
        candidates.extend(url_re().find_iter(&window).take(3).map(|m| m.as_str().to_string()));
        candidates.extend(date_re().find_iter(&window).take(5).map(|m| m.as_str().to_string()));

        let mut seen = std::collections::HashSet::new();
        candidates
            .into_iter()
            .filter(|e| seen.insert(e.to_lowercase()))
            .take(20)
            .collect()
    }

    // ========================================================================
    // SENTIMENT
    // ========================================================================

    /// Lexicon-based polarity in `[-1, 1]`
    pub fn analyze_sentiment(&self, content: &str) -> f64 {
        let lower = content.to_lowercase();
        let words: Vec<&str> = lower.split_whitespace().collect();
        if words.is_empty() {
            return 0.0;
        }

        let pos = words.iter().filter(|w| POSITIVE_WORDS.contains(w)).count() as f64;
        let neg = words.iter().filter(|w| NEGATIVE_WORDS.contains(w)).count() as f64;

        let total = pos + neg;
        if total == 0.0 {
            0.0
        } else {
            ((pos - neg) / total).clamp(-1.0, 1.0)
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    struct FixedEmbedder {
        dim: usize,
        calls: AtomicUsize,
        batch_calls: AtomicUsize,
    }

    impl FixedEmbedder {
        fn new(dim: usize) -> Self {
            Self {
                dim,
                calls: AtomicUsize::new(0),
                batch_calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Embedder for FixedEmbedder {
        async fn embed(&self, text: &str) -> Result<Vec<f32>, crate::llm::LlmError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let seed = text.len() as f32;
            Ok((0..self.dim).map(|i| (i as f32 + seed).sin()).collect())
        }

        async fn embed_batch(
            &self,
            texts: &[String],
        ) -> Result<Vec<Vec<f32>>, crate::llm::LlmError> {
            self.batch_calls.fetch_add(1, Ordering::SeqCst);
            let mut out = vec![];
            for text in texts {
                let seed = text.len() as f32;
                out.push((0..self.dim).map(|i| (i as f32 + seed).sin()).collect());
            }
            Ok(out)
        }
    }

    #[tokio::test]
    async fn test_dimension_discovered_by_probe() {
        let encoder = Encoder::new(EncoderConfig {
            embedding_dim: 1024,
            ..Default::default()
        });
        encoder.set_embedder(Arc::new(FixedEmbedder::new(256)));

        encoder.initialize().await;
        assert_eq!(encoder.dimension(), 256);
    }

    #[tokio::test]
    async fn test_encode_without_embedder_yields_zero_vector() {
        let encoder = Encoder::new(EncoderConfig {
            embedding_dim: 8,
            ..Default::default()
        });
        let node = encoder.encode("some content here", "user", "", vec![]).await;
        assert_eq!(node.vector.len(), 8);
        assert!(node.vector.iter().all(|v| *v == 0.0));
        assert_eq!(node.tier, Tier::L1);
        assert!((node.energy - 1.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_encode_empty_string() {
        let encoder = Encoder::new(EncoderConfig {
            embedding_dim: 4,
            ..Default::default()
        });
        encoder.set_embedder(Arc::new(FixedEmbedder::new(4)));

        let node = encoder.encode("", "user", "", vec![]).await;
        assert!(node.vector.iter().all(|v| *v == 0.0));
        assert!(node.metadata.entities.is_empty());
    }

    #[tokio::test]
    async fn test_query_cache_avoids_repeat_calls() {
        let embedder = Arc::new(FixedEmbedder::new(4));
        let encoder = Encoder::new(EncoderConfig::default());
        encoder.set_embedder(embedder.clone());
        encoder.initialize().await;
        let after_probe = embedder.calls.load(Ordering::SeqCst);

        encoder.generate_embedding("repeated query").await;
        encoder.generate_embedding("repeated query").await;
        assert_eq!(embedder.calls.load(Ordering::SeqCst), after_probe + 1);
    }

    #[tokio::test]
    async fn test_batch_encode_single_backend_call() {
        let embedder = Arc::new(FixedEmbedder::new(4));
        let encoder = Encoder::new(EncoderConfig::default());
        encoder.set_embedder(embedder.clone());

        let contents = vec!["one".to_string(), "two".to_string(), "three".to_string()];
        let nodes = encoder.batch_encode(&contents, "tool").await;
        assert_eq!(nodes.len(), 3);
        assert_eq!(embedder.batch_calls.load(Ordering::SeqCst), 1);
        assert!(nodes.iter().all(|n| n.metadata.source == "tool"));
    }

    #[test]
    fn test_entity_extraction_dedupes_case_insensitively() {
        let encoder = Encoder::new(EncoderConfig::default());
        let entities = encoder.extract_entities(
            "Alice met Bob in Paris. alice emailed bob@example.com about https://example.com \
             on 12/05/2024.",
        );

        assert!(entities.contains(&"Alice".to_string()));
        assert!(entities.contains(&"Bob".to_string()));
        assert!(entities.contains(&"Paris".to_string()));
        assert!(entities.contains(&"bob@example.com".to_string()));
        assert!(entities.iter().any(|e| e.starts_with("https://")));
        assert!(entities.contains(&"12/05/2024".to_string()));

        let lowered: Vec<String> = entities.iter().map(|e| e.to_lowercase()).collect();
        let mut deduped = lowered.clone();
        deduped.dedup();
        assert_eq!(
            lowered.len(),
            lowered.iter().collect::<std::collections::HashSet<_>>().len()
        );
    }

    #[test]
    fn test_entity_extraction_caps_at_twenty() {
        let encoder = Encoder::new(EncoderConfig::default());
        let mut content = String::new();
        for i in 0..30 {
            content.push_str(&format!("Entity{i:02} visited. "));
        }
        // Capitalized matches are capped at 10 before the global cap
        let entities = encoder.extract_entities(&content);
        assert!(entities.len() <= 20);
    }

    #[test]
    fn test_sentiment_polarity() {
        let encoder = Encoder::new(EncoderConfig::default());
        assert!(encoder.analyze_sentiment("this is great and helpful, love it") > 0.5);
        assert!(encoder.analyze_sentiment("terrible bug, everything broken and slow") < -0.5);
        assert_eq!(encoder.analyze_sentiment("the meeting is at noon"), 0.0);
        assert_eq!(encoder.analyze_sentiment(""), 0.0);
    }

    #[tokio::test]
    async fn test_truncation_is_char_safe() {
        let encoder = Encoder::new(EncoderConfig {
            max_content_length: 5,
            embedding_dim: 4,
            ..Default::default()
        });
        // Multi-byte characters at the cut point must not panic
        let node = encoder.encode("日本語のテキストです", "user", "", vec![]).await;
        assert_eq!(node.content, "日本語のテキストです");
    }
}
