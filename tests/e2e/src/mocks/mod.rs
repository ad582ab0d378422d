//! Deterministic test doubles for the external capabilities

use std::collections::VecDeque;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use biem_core::llm::{ChatCompleter, ChatMessage, Embedder, LlmError};

/// Bag-of-words embedder: texts sharing vocabulary land close together.
///
/// Each word hashes into one of `dim` buckets; the bucket counts are
/// L2-normalized. Deterministic within a build, no model needed.
pub struct VocabEmbedder {
    dim: usize,
}

impl VocabEmbedder {
    pub fn new() -> Self {
        Self { dim: 64 }
    }

    fn bucket(&self, word: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        word.hash(&mut hasher);
        (hasher.finish() as usize) % self.dim
    }
}

impl Default for VocabEmbedder {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Embedder for VocabEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, LlmError> {
        let mut v = vec![0.0f32; self.dim];
        for word in text
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
        {
            v[self.bucket(word)] += 1.0;
        }
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut v {
                *x /= norm;
            }
        }
        Ok(v)
    }
}

/// Completer that replays scripted replies in order, then errors
pub struct ScriptedCompleter {
    replies: Mutex<VecDeque<String>>,
}

impl ScriptedCompleter {
    pub fn new(replies: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.iter().map(|r| r.to_string()).collect()),
        })
    }
}

#[async_trait]
impl ChatCompleter for ScriptedCompleter {
    async fn complete(&self, _messages: &[ChatMessage]) -> Result<String, LlmError> {
        self.replies
            .lock()
            .map_err(|_| LlmError::Backend("lock poisoned".to_string()))?
            .pop_front()
            .ok_or_else(|| LlmError::Backend("script exhausted".to_string()))
    }
}
