//! L3 Crystal Store - Durable relational storage
//!
//! The crystal: long-term structured storage for consolidated facts and
//! persisted association links. Backed by SQLite with WAL and FTS5 full-text
//! search on fact content. L3 is optional at runtime; when it cannot be
//! reached the tier manager runs in degraded mode without it.

use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};

use super::{Result, StorageError};
use crate::memory::node::{CrystalFact, Link, LinkType};

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Configuration for the crystal store
#[derive(Debug, Clone, Default)]
pub struct L3Config {
    /// Database file path (None = in-memory, for tests)
    pub db_path: Option<PathBuf>,
}

/// Crystal store statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrystalStats {
    pub facts_count: usize,
    pub links_count: usize,
    pub avg_confidence: f64,
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS crystal_facts (
    id TEXT PRIMARY KEY,
    content TEXT NOT NULL,
    source_node_ids TEXT NOT NULL DEFAULT '[]',
    confidence REAL NOT NULL DEFAULT 1.0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    metadata TEXT NOT NULL DEFAULT '{}',
    user_id TEXT NOT NULL DEFAULT ''
);
CREATE INDEX IF NOT EXISTS idx_facts_created ON crystal_facts(created_at);
CREATE INDEX IF NOT EXISTS idx_facts_confidence ON crystal_facts(confidence);
CREATE INDEX IF NOT EXISTS idx_facts_user ON crystal_facts(user_id);

CREATE VIRTUAL TABLE IF NOT EXISTS crystal_fts USING fts5(fact_id UNINDEXED, content);

CREATE TABLE IF NOT EXISTS crystal_links (
    id TEXT PRIMARY KEY,
    source_id TEXT NOT NULL,
    target_id TEXT NOT NULL,
    link_type TEXT NOT NULL,
    weight REAL NOT NULL DEFAULT 1.0,
    created_at TEXT NOT NULL,
    user_id TEXT NOT NULL DEFAULT '',
    UNIQUE(source_id, target_id, link_type)
);
CREATE INDEX IF NOT EXISTS idx_links_source ON crystal_links(source_id);
CREATE INDEX IF NOT EXISTS idx_links_target ON crystal_links(target_id);
CREATE INDEX IF NOT EXISTS idx_links_type ON crystal_links(link_type);
CREATE INDEX IF NOT EXISTS idx_links_user ON crystal_links(user_id);
";

/// Quote query tokens so user input cannot break FTS5 syntax.
///
/// Splits on non-alphanumeric characters the same way the default FTS5
/// tokenizer does, so "GPT-4" matches the indexed terms "gpt" and "4".
pub(crate) fn sanitize_fts_query(query: &str) -> String {
    query
        .split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|t| !t.is_empty())
        .map(|t| format!("\"{t}\""))
        .collect::<Vec<_>>()
        .join(" ")
}

// ============================================================================
// STORE
// ============================================================================

/// SQLite-backed long-term knowledge storage
pub struct L3CrystalStore {
    config: L3Config,
    conn: Mutex<Option<Connection>>,
}

impl L3CrystalStore {
    pub fn new(config: L3Config) -> Self {
        Self {
            config,
            conn: Mutex::new(None),
        }
    }

    /// Open the database and ensure the schema exists
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
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )?;
        conn.execute_batch(SCHEMA)?;

        let mut guard = self
            .conn
            .lock()
            .map_err(|_| StorageError::Unavailable("crystal store lock poisoned".to_string()))?;
        *guard = Some(conn);
        Ok(())
    }

    pub async fn disconnect(&self) -> Result<()> {
        let mut guard = self
            .conn
            .lock()
            .map_err(|_| StorageError::Unavailable("crystal store lock poisoned".to_string()))?;
        *guard = None;
        Ok(())
    }

    pub fn is_available(&self) -> bool {
        self.conn.lock().map(|g| g.is_some()).unwrap_or(false)
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let guard = self
            .conn
            .lock()
            .map_err(|_| StorageError::Unavailable("crystal store lock poisoned".to_string()))?;
        match guard.as_ref() {
            Some(conn) => f(conn),
            None => Err(StorageError::NotReady("L3 crystal store".to_string())),
        }
    }

    // ========================================================================
    // CRYSTAL FACTS
    // ========================================================================

    /// Store a new crystal fact, returning its id
    pub async fn store_fact(&self, fact: &CrystalFact) -> Result<String> {
        let source_ids = serde_json::to_string(&fact.source_node_ids)?;
        let metadata = serde_json::to_string(&fact.metadata)?;

        self.with_conn(|conn| {
            conn.execute_batch("BEGIN")?;
            let outcome = conn
                .execute(
                    "INSERT INTO crystal_facts
                     (id, content, source_node_ids, confidence, created_at, updated_at, metadata, user_id)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    params![
                        fact.id,
                        fact.content,
                        source_ids,
                        fact.confidence,
                        fact.created_at,
                        fact.updated_at,
                        metadata,
                        fact.user_id,
                    ],
                )
                .and_then(|_| {
                    conn.execute(
                        "INSERT INTO crystal_fts (fact_id, content) VALUES (?1, ?2)",
                        params![fact.id, fact.content],
                    )
                });
            match outcome {
                Ok(_) => {
                    conn.execute_batch("COMMIT")?;
                    Ok(fact.id.clone())
                }
                Err(e) => {
                    let _ = conn.execute_batch("ROLLBACK");
                    Err(e.into())
                }
            }
        })
    }

    /// Retrieve a fact by id
    pub async fn get_fact(&self, fact_id: &str) -> Result<Option<CrystalFact>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT * FROM crystal_facts WHERE id = ?1",
                params![fact_id],
                row_to_fact,
            )
            .optional()
            .map_err(StorageError::from)
        })
    }

    /// Update a fact's content and optionally its confidence
    pub async fn update_fact(
        &self,
        fact_id: &str,
        content: &str,
        confidence: Option<f64>,
    ) -> Result<bool> {
        self.with_conn(|conn| {
            let now = Utc::now();
            let n = match confidence {
                Some(c) => conn.execute(
                    "UPDATE crystal_facts SET content = ?2, confidence = ?3, updated_at = ?4
                     WHERE id = ?1",
                    params![fact_id, content, c, now],
                )?,
                None => conn.execute(
                    "UPDATE crystal_facts SET content = ?2, updated_at = ?3 WHERE id = ?1",
                    params![fact_id, content, now],
                )?,
            };
            if n > 0 {
                conn.execute(
                    "UPDATE crystal_fts SET content = ?2 WHERE fact_id = ?1",
                    params![fact_id, content],
                )?;
            }
            Ok(n > 0)
        })
    }

    /// Delete a fact
    pub async fn delete_fact(&self, fact_id: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let n = conn.execute("DELETE FROM crystal_facts WHERE id = ?1", params![fact_id])?;
            conn.execute("DELETE FROM crystal_fts WHERE fact_id = ?1", params![fact_id])?;
            Ok(n > 0)
        })
    }

    /// Full-text search on fact content
    pub async fn search_facts(
        &self,
        query: &str,
        limit: usize,
        min_confidence: f64,
        user_id: &str,
    ) -> Result<Vec<CrystalFact>> {
        let fts_query = sanitize_fts_query(query);
        if fts_query.is_empty() {
            return Ok(vec![]);
        }
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT f.* FROM crystal_facts f
                 JOIN crystal_fts ft ON ft.fact_id = f.id
                 WHERE crystal_fts MATCH ?1
                   AND f.confidence >= ?2
                   AND (?3 = '' OR f.user_id = ?3)
                 ORDER BY rank
                 LIMIT ?4",
            )?;
            let rows = stmt.query_map(
                params![fts_query, min_confidence, user_id, limit as i64],
                row_to_fact,
            )?;
            let mut out = vec![];
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
    }

    /// Facts derived from a given source node
    pub async fn get_facts_by_source(&self, source_node_id: &str) -> Result<Vec<CrystalFact>> {
        self.with_conn(|conn| {
            let needle = format!("%\"{source_node_id}\"%");
            let mut stmt = conn.prepare(
                "SELECT * FROM crystal_facts WHERE source_node_ids LIKE ?1
                 ORDER BY created_at DESC",
            )?;
            let rows = stmt.query_map(params![needle], row_to_fact)?;
            let mut out = vec![];
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
    }

    /// Most recently created facts
    pub async fn get_recent_facts(&self, limit: usize, user_id: &str) -> Result<Vec<CrystalFact>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM crystal_facts
                 WHERE (?1 = '' OR user_id = ?1)
                 ORDER BY created_at DESC LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![user_id, limit as i64], row_to_fact)?;
            let mut out = vec![];
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
    }

    /// Facts with high confidence scores
    pub async fn get_high_confidence_facts(
        &self,
        min_confidence: f64,
        limit: usize,
    ) -> Result<Vec<CrystalFact>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM crystal_facts WHERE confidence >= ?1
                 ORDER BY confidence DESC, created_at DESC LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![min_confidence, limit as i64], row_to_fact)?;
            let mut out = vec![];
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
    }

    // ========================================================================
    // CRYSTAL LINKS
    // ========================================================================

    /// Persist a link; upsert on `(source_id, target_id, link_type)`
    pub async fn store_link(&self, link: &Link, user_id: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO crystal_links (id, source_id, target_id, link_type, weight, created_at, user_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT (source_id, target_id, link_type)
                 DO UPDATE SET weight = excluded.weight",
                params![
                    uuid::Uuid::new_v4().to_string(),
                    link.source_id,
                    link.target_id,
                    link.link_type.as_str(),
                    link.weight,
                    link.created_at,
                    user_id,
                ],
            )?;
            Ok(())
        })
    }

    /// All links where the node is source or target
    pub async fn get_links_for_node(&self, node_id: &str) -> Result<Vec<Link>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM crystal_links WHERE source_id = ?1 OR target_id = ?1",
            )?;
            let rows = stmt.query_map(params![node_id], row_to_link)?;
            let mut out = vec![];
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
    }

    /// Outgoing links from a node, optionally restricted to one type
    pub async fn get_outgoing_links(
        &self,
        source_id: &str,
        link_type: Option<LinkType>,
    ) -> Result<Vec<Link>> {
        self.with_conn(|conn| {
            let mut out = vec![];
            match link_type {
                Some(lt) => {
                    let mut stmt = conn.prepare(
                        "SELECT * FROM crystal_links WHERE source_id = ?1 AND link_type = ?2",
                    )?;
                    let rows = stmt.query_map(params![source_id, lt.as_str()], row_to_link)?;
                    for row in rows {
                        out.push(row?);
                    }
                }
                None => {
                    let mut stmt =
                        conn.prepare("SELECT * FROM crystal_links WHERE source_id = ?1")?;
                    let rows = stmt.query_map(params![source_id], row_to_link)?;
                    for row in rows {
                        out.push(row?);
                    }
                }
            }
            Ok(out)
        })
    }

    /// All persisted links, bounded, used for graph re-hydration at startup
    pub async fn get_all_links(&self, limit: usize) -> Result<Vec<Link>> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT * FROM crystal_links ORDER BY created_at LIMIT ?1")?;
            let rows = stmt.query_map(params![limit as i64], row_to_link)?;
            let mut out = vec![];
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
    }

    /// Delete a specific link
    pub async fn delete_link(
        &self,
        source_id: &str,
        target_id: &str,
        link_type: LinkType,
    ) -> Result<bool> {
        self.with_conn(|conn| {
            let n = conn.execute(
                "DELETE FROM crystal_links
                 WHERE source_id = ?1 AND target_id = ?2 AND link_type = ?3",
                params![source_id, target_id, link_type.as_str()],
            )?;
            Ok(n > 0)
        })
    }

    /// Delete every link incident to a node; returns the number removed
    pub async fn delete_links_for_node(&self, node_id: &str) -> Result<usize> {
        self.with_conn(|conn| {
            let n = conn.execute(
                "DELETE FROM crystal_links WHERE source_id = ?1 OR target_id = ?1",
                params![node_id],
            )?;
            Ok(n)
        })
    }

    /// Update a persisted link's weight
    pub async fn update_link_weight(
        &self,
        source_id: &str,
        target_id: &str,
        link_type: LinkType,
        weight: f64,
    ) -> Result<bool> {
        self.with_conn(|conn| {
            let n = conn.execute(
                "UPDATE crystal_links SET weight = ?4
                 WHERE source_id = ?1 AND target_id = ?2 AND link_type = ?3",
                params![source_id, target_id, link_type.as_str(), weight],
            )?;
            Ok(n > 0)
        })
    }

    // ========================================================================
    // UTILITY
    // ========================================================================

    /// Clear all data (for testing)
    pub async fn clear_all(&self) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute_batch(
                "DELETE FROM crystal_links;
                 DELETE FROM crystal_facts;
                 DELETE FROM crystal_fts;",
            )?;
            Ok(())
        })
    }

    pub async fn get_stats(&self) -> Result<CrystalStats> {
        self.with_conn(|conn| {
            let facts_count: i64 =
                conn.query_row("SELECT COUNT(*) FROM crystal_facts", [], |r| r.get(0))?;
            let links_count: i64 =
                conn.query_row("SELECT COUNT(*) FROM crystal_links", [], |r| r.get(0))?;
            let avg_confidence: Option<f64> =
                conn.query_row("SELECT AVG(confidence) FROM crystal_facts", [], |r| r.get(0))?;
            Ok(CrystalStats {
                facts_count: facts_count as usize,
                links_count: links_count as usize,
                avg_confidence: avg_confidence.unwrap_or(0.0),
            })
        })
    }
}

// ============================================================================
// ROW MAPPING
// ============================================================================

fn row_to_fact(row: &rusqlite::Row<'_>) -> rusqlite::Result<CrystalFact> {
    let source_ids_json: String = row.get("source_node_ids")?;
    let metadata_json: String = row.get("metadata")?;
    Ok(CrystalFact {
        id: row.get("id")?,
        content: row.get("content")?,
        source_node_ids: serde_json::from_str(&source_ids_json).unwrap_or_default(),
        confidence: row.get("confidence")?,
        created_at: row.get::<_, DateTime<Utc>>("created_at")?,
        updated_at: row.get::<_, DateTime<Utc>>("updated_at")?,
        metadata: serde_json::from_str(&metadata_json).unwrap_or(serde_json::Value::Null),
        user_id: row.get("user_id")?,
    })
}

fn row_to_link(row: &rusqlite::Row<'_>) -> rusqlite::Result<Link> {
    let link_type: String = row.get("link_type")?;
    Ok(Link {
        source_id: row.get("source_id")?,
        target_id: row.get("target_id")?,
        link_type: LinkType::parse_name(&link_type).unwrap_or(LinkType::Semantic),
        weight: row.get("weight")?,
        created_at: row.get::<_, DateTime<Utc>>("created_at")?,
    })
}

// ============================================================================
// TESTS
// ============================================================================
