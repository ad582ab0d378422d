//! Knowledge Vector Store - Semantic search over triples
//!
//! A separate vector namespace from memory nodes, keyed by `triple_id`.
//! Works alongside the relational knowledge store: this side answers "which
//! triples are semantically close", the relational side holds the facts.
//! Retrieval is global; the stored `user_id` is contributor attribution.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};

use rusqlite::{Connection, params};
use serde::{Deserialize, Serialize};

use crate::embedding::{self, cosine_similarity, is_zero_vector};
use crate::knowledge::models::KnowledgeTriple;
use crate::memory::encoder::Encoder;
use crate::storage::{Result, StorageError};

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Configuration for the knowledge vector store
#[derive(Debug, Clone)]
pub struct KnowledgeVectorConfig {
    /// Database file path (None = in-memory, for tests)
    pub db_path: Option<PathBuf>,
    /// Collection name; doubles as the backing table name
    pub collection: String,
}

impl Default for KnowledgeVectorConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            collection: "biem_knowledge".to_string(),
        }
    }
}

/// Collection statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KnowledgeVectorStats {
    pub row_count: usize,
    pub collection: String,
}

// ============================================================================
// STORE
// ============================================================================

/// Vector store for knowledge triples
pub struct KnowledgeVectorStore {
    config: KnowledgeVectorConfig,
    table: String,
    conn: Mutex<Option<Connection>>,
    index: RwLock<HashMap<String, Vec<f32>>>,
    encoder: RwLock<Option<Arc<Encoder>>>,
}

impl KnowledgeVectorStore {
    pub fn new(config: KnowledgeVectorConfig) -> Self {
        let table: String = config
            .collection
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || *c == '_')
            .collect();
        Self {
            config,
            table,
            conn: Mutex::new(None),
            index: RwLock::new(HashMap::new()),
            encoder: RwLock::new(None),
        }
    }

    /// Share the memory encoder for embedding generation
    pub fn set_encoder(&self, encoder: Arc<Encoder>) {
        if let Ok(mut guard) = self.encoder.write() {
            *guard = Some(encoder);
        }
    }

    /// Open the database, ensure the schema, and rebuild the index
    pub async fn connect(&self) -> Result<()> {
        let conn = match &self.config.db_path {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                Connection::open(path)?
            }
            None => Connection::open_in_memory()?,
        };
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA busy_timeout = 5000;",
        )?;
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                triple_id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL DEFAULT '',
                vector BLOB NOT NULL,
                subject TEXT NOT NULL,
                predicate TEXT NOT NULL
            );",
            table = self.table
        ))?;

        {
            let mut stmt = conn.prepare(&format!("SELECT triple_id, vector FROM {}", self.table))?;
            let rows: Vec<(String, Vec<u8>)> = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                .filter_map(|r| r.ok())
                .collect();
            drop(stmt);

            let mut index = self
                .index
                .write()
                .map_err(|_| StorageError::Unavailable("knowledge index lock poisoned".to_string()))?;
            index.clear();
            for (id, bytes) in rows {
                if let Some(vector) = embedding::from_bytes(&bytes) {
                    index.insert(id, vector);
                }
            }
        }

        let mut guard = self
            .conn
            .lock()
            .map_err(|_| StorageError::Unavailable("knowledge vector lock poisoned".to_string()))?;
        *guard = Some(conn);
        Ok(())
    }

    pub async fn disconnect(&self) -> Result<()> {
        let mut guard = self
            .conn
            .lock()
            .map_err(|_| StorageError::Unavailable("knowledge vector lock poisoned".to_string()))?;
        *guard = None;
        if let Ok(mut index) = self.index.write() {
            index.clear();
        }
        Ok(())
    }

    pub fn is_available(&self) -> bool {
        self.conn.lock().map(|g| g.is_some()).unwrap_or(false)
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let guard = self
            .conn
            .lock()
            .map_err(|_| StorageError::Unavailable("knowledge vector lock poisoned".to_string()))?;
        match guard.as_ref() {
            Some(conn) => f(conn),
            None => Err(StorageError::NotReady("knowledge vector store".to_string())),
        }
    }

    async fn embed(&self, text: &str) -> Option<Vec<f32>> {
        let encoder = self.encoder.read().ok().and_then(|g| g.clone())?;
        let vector = encoder.generate_embedding(text).await;
        if is_zero_vector(&vector) { None } else { Some(vector) }
    }

    // ========================================================================
    // WRITES
    // ========================================================================

    /// Store a triple's embedding; generates one from its text when missing.
    ///
    /// Returns false when no vector could be produced.
    pub async fn store(&self, triple: &KnowledgeTriple) -> Result<bool> {
        if !self.is_available() {
            return Ok(false);
        }

        let vector = if triple.vector.is_empty() {
            match self.embed(&triple.to_text()).await {
                Some(vector) => vector,
                None => return Ok(false),
            }
        } else {
            triple.vector.clone()
        };

        self.with_conn(|conn| {
            conn.execute(
                &format!(
                    "INSERT INTO {table} (triple_id, user_id, vector, subject, predicate)
                     VALUES (?1, ?2, ?3, ?4, ?5)
                     ON CONFLICT(triple_id) DO UPDATE SET
                        user_id = excluded.user_id,
                        vector = excluded.vector,
                        subject = excluded.subject,
                        predicate = excluded.predicate",
                    table = self.table
                ),
                params![
                    triple.id,
                    triple.user_id,
                    embedding::to_bytes(&vector),
                    triple.subject,
                    triple.predicate,
                ],
            )?;
            Ok(())
        })?;

        if let Ok(mut index) = self.index.write() {
            index.insert(triple.id.clone(), vector);
        }
        Ok(true)
    }

    /// Delete a triple's vector
    pub async fn delete(&self, triple_id: &str) -> Result<bool> {
        let deleted = self.with_conn(|conn| {
            let n = conn.execute(
                &format!("DELETE FROM {} WHERE triple_id = ?1", self.table),
                params![triple_id],
            )?;
            Ok(n > 0)
        })?;
        if deleted {
            if let Ok(mut index) = self.index.write() {
                index.remove(triple_id);
            }
        }
        Ok(deleted)
    }

    // ========================================================================
    // SEARCH
    // ========================================================================

    /// Similarity search, returning `(triple_id, score)` above `min_score`
    pub async fn search(
        &self,
        query: &str,
        top_k: usize,
        min_score: f32,
    ) -> Result<Vec<(String, f32)>> {
        if top_k == 0 {
            return Ok(vec![]);
        }
        let Some(query_vector) = self.embed(query).await else {
            return Ok(vec![]);
        };
        Ok(self.search_by_vector(&query_vector, top_k, min_score, None))
    }

    fn search_by_vector(
        &self,
        query: &[f32],
        top_k: usize,
        min_score: f32,
        exclude: Option<&str>,
    ) -> Vec<(String, f32)> {
        let Ok(index) = self.index.read() else {
            return vec![];
        };
        let mut scored: Vec<(String, f32)> = index
            .iter()
            .filter(|(id, _)| exclude.is_none_or(|ex| ex != id.as_str()))
            .map(|(id, vector)| (id.clone(), cosine_similarity(query, vector)))
            .filter(|(_, score)| *score >= min_score)
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(top_k);
        scored
    }

    /// Search with cluster expansion: activating a triple also activates its
    /// neighbours.
    ///
    /// 1. Retrieve `top_k` initial hits.
    /// 2. For each hit, pull up to `expansion_k` related triples (at a
    ///    slightly relaxed threshold) and score them
    ///    `initial * related * 0.7`, kept above `min_score / 2`.
    /// 3. Deduplicate keeping the best score per triple.
    pub async fn search_with_cluster_expansion(
        &self,
        query: &str,
        top_k: usize,
        expansion_k: usize,
        min_score: f32,
    ) -> Result<Vec<(String, f32)>> {
        let initial = self.search(query, top_k, min_score).await?;
        if initial.is_empty() {
            return Ok(vec![]);
        }

        let mut all: HashMap<String, f32> = initial.iter().cloned().collect();

        for (triple_id, initial_score) in &initial {
            let related = self.find_related(triple_id, expansion_k, min_score * 0.8)?;
            for (related_id, related_score) in related {
                let expanded = initial_score * related_score * 0.7;
                match all.get_mut(&related_id) {
                    Some(existing) => {
                        if related_score > *existing {
                            *existing = related_score;
                        }
                    }
                    None => {
                        if expanded >= min_score * 0.5 {
                            all.insert(related_id, expanded);
                        }
                    }
                }
            }
        }

        let mut results: Vec<(String, f32)> = all.into_iter().collect();
        results.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        Ok(results)
    }

    /// Triples related to a seed triple by vector similarity (excluding it)
    fn find_related(
        &self,
        triple_id: &str,
        k: usize,
        min_score: f32,
    ) -> Result<Vec<(String, f32)>> {
        let seed = {
            let index = self
                .index
                .read()
                .map_err(|_| StorageError::Unavailable("knowledge index lock poisoned".to_string()))?;
            index.get(triple_id).cloned()
        };
        let Some(seed) = seed else {
            return Ok(vec![]);
        };
        Ok(self.search_by_vector(&seed, k, min_score, Some(triple_id)))
    }

    /// All triples semantically clustered around a subject
    pub async fn get_subject_cluster(
        &self,
        subject: &str,
        limit: usize,
    ) -> Result<Vec<(String, f32)>> {
        self.search(subject, limit, 0.3).await
    }

    pub fn stats(&self) -> KnowledgeVectorStats {
        KnowledgeVectorStats {
            row_count: self.index.read().map(|i| i.len()).unwrap_or(0),
            collection: self.config.collection.clone(),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
