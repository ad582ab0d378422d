//! L2 Vector Store - Semantic search over every ingested node
//!
//! Holds the authoritative copy of all nodes (L1 is a hot cache). Node rows
//! live in SQLite; vectors are additionally kept in an in-process cosine
//! index rebuilt on connect, so similarity search never touches disk until
//! candidate rows are fetched. Scalar predicates and the `user_id` partition
//! are applied as post-filters on candidates.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Mutex, RwLock};

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};

use super::{Result, StorageError};
use crate::embedding;
use crate::memory::node::{MemoryMetadata, MemoryNode, Tier};

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Configuration for the vector store
#[derive(Debug, Clone)]
pub struct VectorStoreConfig {
    /// Database file path (None = in-memory, for tests)
    pub db_path: Option<PathBuf>,
    /// Collection name; doubles as the backing table name
    pub collection: String,
    /// Expected embedding dimension; 0 = accept the first vector's length
    pub dim: usize,
}

impl Default for VectorStoreConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            collection: "biem_memories".to_string(),
            dim: 0,
        }
    }
}

/// Collection statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VectorStoreStats {
    pub row_count: usize,
    pub collection: String,
    pub dim: usize,
}

// ============================================================================
// SCALAR FILTERS
// ============================================================================

/// Recognized filter operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Gte,
    Lte,
    Gt,
    Lt,
    Eq,
    Ne,
}

impl FilterOp {
    /// Parse the operator names of the filter grammar (`$gte`, `$lte`, ...)
    pub fn parse_name(s: &str) -> Option<Self> {
        match s {
            "$gte" => Some(FilterOp::Gte),
            "$lte" => Some(FilterOp::Lte),
            "$gt" => Some(FilterOp::Gt),
            "$lt" => Some(FilterOp::Lt),
            "$eq" => Some(FilterOp::Eq),
            "$ne" => Some(FilterOp::Ne),
            _ => None,
        }
    }
}

/// A filterable value
#[derive(Debug, Clone, PartialEq)]
pub enum FilterValue {
    Number(f64),
    Text(String),
}

/// A scalar predicate over an indexed field
#[derive(Debug, Clone)]
pub struct ScalarFilter {
    pub field: String,
    pub op: FilterOp,
    pub value: FilterValue,
}

impl ScalarFilter {
    pub fn new(field: impl Into<String>, op: FilterOp, value: FilterValue) -> Self {
        Self {
            field: field.into(),
            op,
            value,
        }
    }

    /// Convenience constructor for numeric predicates
    pub fn number(field: impl Into<String>, op: FilterOp, value: f64) -> Self {
        Self::new(field, op, FilterValue::Number(value))
    }

    fn matches(&self, node: &MemoryNode) -> bool {
        let Some(actual) = field_value(node, &self.field) else {
            return false;
        };
        match (&actual, &self.value) {
            (FilterValue::Number(a), FilterValue::Number(b)) => match self.op {
                FilterOp::Gte => a >= b,
                FilterOp::Lte => a <= b,
                FilterOp::Gt => a > b,
                FilterOp::Lt => a < b,
                FilterOp::Eq => (a - b).abs() < f64::EPSILON,
                FilterOp::Ne => (a - b).abs() >= f64::EPSILON,
            },
            (FilterValue::Text(a), FilterValue::Text(b)) => match self.op {
                FilterOp::Eq => a == b,
                FilterOp::Ne => a != b,
                FilterOp::Gte => a >= b,
                FilterOp::Lte => a <= b,
                FilterOp::Gt => a > b,
                FilterOp::Lt => a < b,
            },
            _ => false,
        }
    }
}

fn field_value(node: &MemoryNode, field: &str) -> Option<FilterValue> {
    match field {
        "energy" => Some(FilterValue::Number(node.energy)),
        "initial_energy" => Some(FilterValue::Number(node.initial_energy)),
        "sentiment" => Some(FilterValue::Number(node.metadata.sentiment)),
        "timestamp" => Some(FilterValue::Number(node.metadata.timestamp.timestamp() as f64)),
        "last_accessed" => Some(FilterValue::Number(node.last_accessed.timestamp() as f64)),
        "created_at" => Some(FilterValue::Number(node.created_at.timestamp() as f64)),
        "tier" => Some(FilterValue::Text(node.tier.as_str().to_string())),
        "source" => Some(FilterValue::Text(node.metadata.source.clone())),
        "user_id" => Some(FilterValue::Text(node.user_id.clone())),
        "location" => Some(FilterValue::Text(node.metadata.location.clone())),
        _ => None,
    }
}

// ============================================================================
// STORE
// ============================================================================

/// SQLite-backed vector store with an in-process cosine index
pub struct L2VectorStore {
    config: VectorStoreConfig,
    table: String,
    conn: Mutex<Option<Connection>>,
    index: RwLock<HashMap<String, Vec<f32>>>,
    dim: RwLock<usize>,
}

impl L2VectorStore {
    pub fn new(config: VectorStoreConfig) -> Self {
        let table: String = config
            .collection
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || *c == '_')
            .collect();
        let dim = config.dim;
        Self {
            config,
            table,
            conn: Mutex::new(None),
            index: RwLock::new(HashMap::new()),
            dim: RwLock::new(dim),
        }
    }

    fn configure_connection(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA temp_store = MEMORY;
             PRAGMA busy_timeout = 5000;",
        )?;
        Ok(())
    }

    /// Open the database, ensure the schema, and rebuild the cosine index
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
        Self::configure_connection(&conn)?;

        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                id TEXT PRIMARY KEY,
                content TEXT NOT NULL,
                vector BLOB NOT NULL,
                energy REAL NOT NULL,
                timestamp INTEGER NOT NULL,
                last_accessed INTEGER NOT NULL,
                tier TEXT NOT NULL,
                sentiment REAL NOT NULL DEFAULT 0,
                user_id TEXT NOT NULL DEFAULT '',
                entities TEXT NOT NULL DEFAULT '[]',
                source TEXT NOT NULL DEFAULT '',
                tags TEXT NOT NULL DEFAULT '[]',
                location TEXT NOT NULL DEFAULT '',
                initial_energy REAL NOT NULL DEFAULT 1.0,
                created_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_{table}_energy ON {table}(energy);
            CREATE INDEX IF NOT EXISTS idx_{table}_user ON {table}(user_id);
            CREATE INDEX IF NOT EXISTS idx_{table}_created ON {table}(created_at);",
            table = self.table
        ))?;

        // Rebuild the in-process index from persisted vectors
        {
            let mut stmt =
                conn.prepare(&format!("SELECT id, vector FROM {}", self.table))?;
            let rows: Vec<(String, Vec<u8>)> = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                .filter_map(|r| r.ok())
                .collect();
            drop(stmt);

            let mut index = self
                .index
                .write()
                .map_err(|_| StorageError::Unavailable("vector index lock poisoned".to_string()))?;
            index.clear();
            for (id, bytes) in rows {
                match embedding::from_bytes(&bytes) {
                    Some(vector) => {
                        index.insert(id, vector);
                    }
                    None => tracing::warn!("Discarding malformed vector for node {}", id),
                }
            }
        }

        let mut guard = self
            .conn
            .lock()
            .map_err(|_| StorageError::Unavailable("vector store lock poisoned".to_string()))?;
        *guard = Some(conn);
        Ok(())
    }

    pub async fn disconnect(&self) -> Result<()> {
        let mut guard = self
            .conn
            .lock()
            .map_err(|_| StorageError::Unavailable("vector store lock poisoned".to_string()))?;
        *guard = None;
        if let Ok(mut index) = self.index.write() {
            index.clear();
        }
        Ok(())
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let guard = self
            .conn
            .lock()
            .map_err(|_| StorageError::Unavailable("vector store lock poisoned".to_string()))?;
        match guard.as_ref() {
            Some(conn) => f(conn),
            None => Err(StorageError::NotReady("L2 vector store".to_string())),
        }
    }

    /// The embedding dimension in effect (0 until the first vector is stored)
    pub fn dimension(&self) -> usize {
        self.dim.read().map(|d| *d).unwrap_or(0)
    }

    /// Upsert a node by id. The node must carry a vector of the configured
    /// dimension; the first stored vector fixes the dimension when unset.
    pub async fn put(&self, node: &MemoryNode) -> Result<()> {
        if node.vector.is_empty() {
            return Err(StorageError::Validation(
                "node must have a vector embedding".to_string(),
            ));
        }

        {
            let mut dim = self
                .dim
                .write()
                .map_err(|_| StorageError::Unavailable("vector store lock poisoned".to_string()))?;
            if *dim == 0 {
                *dim = node.vector.len();
            } else if node.vector.len() != *dim {
                return Err(StorageError::Validation(format!(
                    "vector dimension mismatch: expected {}, got {}",
                    *dim,
                    node.vector.len()
                )));
            }
        }

        self.with_conn(|conn| {
            conn.execute(
                &format!(
                    "INSERT INTO {table} (
                        id, content, vector, energy, timestamp, last_accessed, tier,
                        sentiment, user_id, entities, source, tags, location,
                        initial_energy, created_at
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
                    ON CONFLICT(id) DO UPDATE SET
                        content = excluded.content,
                        vector = excluded.vector,
                        energy = excluded.energy,
                        timestamp = excluded.timestamp,
                        last_accessed = excluded.last_accessed,
                        tier = excluded.tier,
                        sentiment = excluded.sentiment,
                        user_id = excluded.user_id,
                        entities = excluded.entities,
                        source = excluded.source,
                        tags = excluded.tags,
                        location = excluded.location,
                        initial_energy = excluded.initial_energy,
                        created_at = excluded.created_at",
                    table = self.table
                ),
                params![
                    node.id,
                    node.content,
                    embedding::to_bytes(&node.vector),
                    node.energy,
                    node.metadata.timestamp.timestamp(),
                    node.last_accessed.timestamp(),
                    node.tier.as_str(),
                    node.metadata.sentiment,
                    node.user_id,
                    serde_json::to_string(&node.metadata.entities)?,
                    node.metadata.source,
                    serde_json::to_string(&node.metadata.tags)?,
                    node.metadata.location,
                    node.initial_energy,
                    node.created_at.timestamp(),
                ],
            )?;
            Ok(())
        })?;

        let mut index = self
            .index
            .write()
            .map_err(|_| StorageError::Unavailable("vector index lock poisoned".to_string()))?;
        index.insert(node.id.clone(), node.vector.clone());
        Ok(())
    }

    /// Retrieve a node by ID
    pub async fn get(&self, node_id: &str) -> Result<Option<MemoryNode>> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT * FROM {} WHERE id = ?1", self.table),
                params![node_id],
                row_to_node,
            )
            .optional()
            .map_err(StorageError::from)
        })
    }

    /// Delete a node by ID
    pub async fn delete(&self, node_id: &str) -> Result<bool> {
        let deleted = self.with_conn(|conn| {
            let n = conn.execute(
                &format!("DELETE FROM {} WHERE id = ?1", self.table),
                params![node_id],
            )?;
            Ok(n > 0)
        })?;
        if deleted {
            if let Ok(mut index) = self.index.write() {
                index.remove(node_id);
            }
        }
        Ok(deleted)
    }

    pub async fn exists(&self, node_id: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let n: i64 = conn.query_row(
                &format!("SELECT COUNT(*) FROM {} WHERE id = ?1", self.table),
                params![node_id],
                |row| row.get(0),
            )?;
            Ok(n > 0)
        })
    }

    /// Search by vector similarity with optional scalar filters.
    ///
    /// Returns `(node, cosine_similarity)` pairs, best first. Candidates
    /// failing a filter or outside the user partition are skipped; at most
    /// `top_k` survivors are returned.
    pub async fn search_by_vector(
        &self,
        query: &[f32],
        top_k: usize,
        filters: &[ScalarFilter],
        user_id: &str,
    ) -> Result<Vec<(MemoryNode, f32)>> {
        if top_k == 0 || query.is_empty() {
            return Ok(vec![]);
        }

        let mut scored: Vec<(String, f32)> = {
            let index = self
                .index
                .read()
                .map_err(|_| StorageError::Unavailable("vector index lock poisoned".to_string()))?;
            index
                .iter()
                .map(|(id, vector)| (id.clone(), embedding::cosine_similarity(query, vector)))
                .collect()
        };
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        let mut results = Vec::with_capacity(top_k);
        for (id, score) in scored {
            if results.len() >= top_k {
                break;
            }
            let Some(node) = self.get(&id).await? else {
                continue;
            };
            if !user_id.is_empty() && node.user_id != user_id {
                continue;
            }
            if !filters.iter().all(|f| f.matches(&node)) {
                continue;
            }
            results.push((node, score.max(0.0)));
        }
        Ok(results)
    }

    /// Query nodes within an energy range
    pub async fn search_by_energy_range(
        &self,
        min_energy: f64,
        max_energy: f64,
        limit: usize,
        user_id: &str,
    ) -> Result<Vec<MemoryNode>> {
        self.with_conn(|conn| {
            let mut out = vec![];
            if user_id.is_empty() {
                let mut stmt = conn.prepare(&format!(
                    "SELECT * FROM {} WHERE energy >= ?1 AND energy <= ?2 LIMIT ?3",
                    self.table
                ))?;
                let rows = stmt.query_map(params![min_energy, max_energy, limit as i64], row_to_node)?;
                for row in rows {
                    out.push(row?);
                }
            } else {
                let mut stmt = conn.prepare(&format!(
                    "SELECT * FROM {} WHERE energy >= ?1 AND energy <= ?2 AND user_id = ?3 LIMIT ?4",
                    self.table
                ))?;
                let rows = stmt.query_map(
                    params![min_energy, max_energy, user_id, limit as i64],
                    row_to_node,
                )?;
                for row in rows {
                    out.push(row?);
                }
            }
            Ok(out)
        })
    }

    /// Update a node's energy in place, preserving every other field
    pub async fn update_energy(&self, node_id: &str, energy: f64) -> Result<bool> {
        self.with_conn(|conn| {
            let n = conn.execute(
                &format!("UPDATE {} SET energy = ?2 WHERE id = ?1", self.table),
                params![node_id, energy],
            )?;
            Ok(n > 0)
        })
    }

    /// Batch energy update in a single transaction; returns how many rows hit
    pub async fn batch_update_energy(&self, updates: &HashMap<String, f64>) -> Result<usize> {
        self.with_conn(|conn| {
            let mut updated = 0;
            conn.execute_batch("BEGIN")?;
            let sql = format!("UPDATE {} SET energy = ?2 WHERE id = ?1", self.table);
            for (node_id, energy) in updates {
                match conn.execute(&sql, params![node_id, energy]) {
                    Ok(n) => updated += n,
                    Err(e) => {
                        let _ = conn.execute_batch("ROLLBACK");
                        return Err(e.into());
                    }
                }
            }
            conn.execute_batch("COMMIT")?;
            Ok(updated)
        })
    }

    /// Update the stored access time, used by touch-on-read flows
    pub async fn update_last_accessed(
        &self,
        node_id: &str,
        last_accessed: DateTime<Utc>,
    ) -> Result<bool> {
        self.with_conn(|conn| {
            let n = conn.execute(
                &format!("UPDATE {} SET last_accessed = ?2 WHERE id = ?1", self.table),
                params![node_id, last_accessed.timestamp()],
            )?;
            Ok(n > 0)
        })
    }

    /// List all nodes (bounded), optionally user scoped
    pub async fn list_all(&self, user_id: &str, limit: usize) -> Result<Vec<MemoryNode>> {
        self.with_conn(|conn| {
            let mut out = vec![];
            if user_id.is_empty() {
                let mut stmt =
                    conn.prepare(&format!("SELECT * FROM {} LIMIT ?1", self.table))?;
                let rows = stmt.query_map(params![limit as i64], row_to_node)?;
                for row in rows {
                    out.push(row?);
                }
            } else {
                let mut stmt = conn.prepare(&format!(
                    "SELECT * FROM {} WHERE user_id = ?1 LIMIT ?2",
                    self.table
                ))?;
                let rows = stmt.query_map(params![user_id, limit as i64], row_to_node)?;
                for row in rows {
                    out.push(row?);
                }
            }
            Ok(out)
        })
    }

    /// Most recently created nodes
    pub async fn list_recent(&self, limit: usize, user_id: &str) -> Result<Vec<MemoryNode>> {
        self.with_conn(|conn| {
            let mut out = vec![];
            if user_id.is_empty() {
                let mut stmt = conn.prepare(&format!(
                    "SELECT * FROM {} ORDER BY created_at DESC LIMIT ?1",
                    self.table
                ))?;
                let rows = stmt.query_map(params![limit as i64], row_to_node)?;
                for row in rows {
                    out.push(row?);
                }
            } else {
                let mut stmt = conn.prepare(&format!(
                    "SELECT * FROM {} WHERE user_id = ?1 ORDER BY created_at DESC LIMIT ?2",
                    self.table
                ))?;
                let rows = stmt.query_map(params![user_id, limit as i64], row_to_node)?;
                for row in rows {
                    out.push(row?);
                }
            }
            Ok(out)
        })
    }

    pub async fn count(&self) -> Result<usize> {
        self.with_conn(|conn| {
            let n: i64 = conn.query_row(
                &format!("SELECT COUNT(*) FROM {}", self.table),
                [],
                |row| row.get(0),
            )?;
            Ok(n as usize)
        })
    }

    pub async fn clear(&self) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(&format!("DELETE FROM {}", self.table), [])?;
            Ok(())
        })?;
        if let Ok(mut index) = self.index.write() {
            index.clear();
        }
        Ok(())
    }

    pub fn stats(&self) -> VectorStoreStats {
        let row_count = self.index.read().map(|i| i.len()).unwrap_or(0);
        VectorStoreStats {
            row_count,
            collection: self.config.collection.clone(),
            dim: self.dimension(),
        }
    }
}

// ============================================================================
// ROW MAPPING
// ============================================================================

fn row_to_node(row: &rusqlite::Row<'_>) -> rusqlite::Result<MemoryNode> {
    let vector_bytes: Vec<u8> = row.get("vector")?;
    let entities_json: String = row.get("entities")?;
    let tags_json: String = row.get("tags")?;
    let tier: String = row.get("tier")?;

    let timestamp: i64 = row.get("timestamp")?;
    let last_accessed: i64 = row.get("last_accessed")?;
    let created_at: i64 = row.get("created_at")?;

    Ok(MemoryNode {
        id: row.get("id")?,
        content: row.get("content")?,
        vector: embedding::from_bytes(&vector_bytes).unwrap_or_default(),
        metadata: MemoryMetadata {
            timestamp: DateTime::from_timestamp(timestamp, 0).unwrap_or_else(Utc::now),
            location: row.get("location")?,
            entities: serde_json::from_str(&entities_json).unwrap_or_default(),
            sentiment: row.get("sentiment")?,
            source: row.get("source")?,
            tags: serde_json::from_str(&tags_json).unwrap_or_default(),
        },
        energy: row.get("energy")?,
        initial_energy: row.get("initial_energy")?,
        last_accessed: DateTime::from_timestamp(last_accessed, 0).unwrap_or_else(Utc::now),
        created_at: DateTime::from_timestamp(created_at, 0).unwrap_or_else(Utc::now),
        tier: Tier::parse_name(&tier),
        user_id: row.get("user_id")?,
        links: vec![],
    })
}

// ============================================================================
// TESTS
// ============================================================================
