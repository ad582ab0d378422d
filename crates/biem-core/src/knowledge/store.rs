//! Knowledge Store - Versioned triple storage
//!
//! SQLite-backed storage for knowledge triples with a global
//! case-insensitive uniqueness constraint on `(subject, predicate)` and an
//! append-only history table. A value-changing write updates the row and
//! inserts its history record in one transaction; writing an identical
//! object is idempotent (no version bump, no history row).
//!
//! Legacy databases carrying the old per-user uniqueness constraint are
//! migrated to the global constraint at connect time.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::knowledge::models::{KnowledgeSource, KnowledgeTriple, KnowledgeUpdateEvent};
use crate::storage::{Result, StorageError, sanitize_fts_query};

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Configuration for the knowledge store
#[derive(Debug, Clone, Default)]
pub struct KnowledgeStoreConfig {
    /// Database file path (None = in-memory, for tests). Usually shared
    /// with the L3 crystal store.
    pub db_path: Option<PathBuf>,
}

/// Knowledge store statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KnowledgeStoreStats {
    pub total_triples: usize,
    pub unique_subjects: usize,
    pub unique_predicates: usize,
    pub total_updates: usize,
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS knowledge_triples (
    id TEXT PRIMARY KEY,
    subject TEXT NOT NULL COLLATE NOCASE,
    predicate TEXT NOT NULL COLLATE NOCASE,
    object TEXT NOT NULL,
    confidence REAL NOT NULL DEFAULT 0.8,
    source TEXT NOT NULL DEFAULT 'conversation',
    version INTEGER NOT NULL DEFAULT 1,
    previous_values TEXT NOT NULL DEFAULT '[]',
    session_id TEXT NOT NULL DEFAULT '',
    user_id TEXT NOT NULL DEFAULT '',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE(subject, predicate)
);
CREATE INDEX IF NOT EXISTS idx_triples_subject ON knowledge_triples(subject);
CREATE INDEX IF NOT EXISTS idx_triples_predicate ON knowledge_triples(predicate);
CREATE INDEX IF NOT EXISTS idx_triples_updated ON knowledge_triples(updated_at);

CREATE VIRTUAL TABLE IF NOT EXISTS knowledge_fts USING fts5(triple_id UNINDEXED, subject, object);

CREATE TABLE IF NOT EXISTS knowledge_history (
    id TEXT PRIMARY KEY,
    triple_id TEXT NOT NULL REFERENCES knowledge_triples(id) ON DELETE CASCADE,
    old_value TEXT NOT NULL DEFAULT '',
    new_value TEXT NOT NULL DEFAULT '',
    reason TEXT NOT NULL DEFAULT '',
    confirmed INTEGER NOT NULL DEFAULT 0,
    session_id TEXT NOT NULL DEFAULT '',
    contributor_id TEXT NOT NULL DEFAULT '',
    timestamp TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_history_triple ON knowledge_history(triple_id);
CREATE INDEX IF NOT EXISTS idx_history_timestamp ON knowledge_history(timestamp);
";

// ============================================================================
// STORE
// ============================================================================

/// SQLite-backed knowledge triple storage
pub struct KnowledgeStore {
    config: KnowledgeStoreConfig,
    conn: Mutex<Option<Connection>>,
}

impl KnowledgeStore {
    pub fn new(config: KnowledgeStoreConfig) -> Self {
        Self {
            config,
            conn: Mutex::new(None),
        }
    }

    /// Open the database, migrate legacy schemas, and ensure tables exist
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

        migrate_legacy_schema(&conn)?;
        conn.execute_batch(SCHEMA)?;

        let mut guard = self
            .conn
            .lock()
            .map_err(|_| StorageError::Unavailable("knowledge store lock poisoned".to_string()))?;
        *guard = Some(conn);
        Ok(())
    }

    pub async fn disconnect(&self) -> Result<()> {
        let mut guard = self
            .conn
            .lock()
            .map_err(|_| StorageError::Unavailable("knowledge store lock poisoned".to_string()))?;
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
            .map_err(|_| StorageError::Unavailable("knowledge store lock poisoned".to_string()))?;
        match guard.as_ref() {
            Some(conn) => f(conn),
            None => Err(StorageError::NotReady("knowledge store".to_string())),
        }
    }

    // ========================================================================
    // WRITES
    // ========================================================================

    /// Store a triple with upsert-on-conflict semantics.
    ///
    /// On a `(subject, predicate)` collision with a different object, the
    /// row's object is replaced, `version` bumped, the old object pushed
    /// onto `previous_values`, `confidence` kept at the max of both, and a
    /// history row written in the same transaction. An identical object is
    /// a no-op apart from the confidence max.
    pub async fn store(&self, triple: &KnowledgeTriple) -> Result<KnowledgeTriple> {
        self.with_conn(|conn| {
            conn.execute_batch("BEGIN")?;
            let outcome = store_in_tx(conn, triple);
            match outcome {
                Ok(stored) => {
                    conn.execute_batch("COMMIT")?;
                    Ok(stored)
                }
                Err(e) => {
                    let _ = conn.execute_batch("ROLLBACK");
                    Err(e)
                }
            }
        })
    }

    /// Update a triple's object with history tracking, atomically.
    ///
    /// Used by the confirmation flow; the history row is marked confirmed.
    pub async fn update(
        &self,
        triple_id: &str,
        new_object: &str,
        source: KnowledgeSource,
        confidence: f64,
        session_id: &str,
    ) -> Result<bool> {
        self.with_conn(|conn| {
            conn.execute_batch("BEGIN")?;
            let outcome = (|| -> Result<bool> {
                let current: Option<(String, String)> = conn
                    .query_row(
                        "SELECT object, user_id FROM knowledge_triples WHERE id = ?1",
                        params![triple_id],
                        |row| Ok((row.get(0)?, row.get(1)?)),
                    )
                    .optional()?;
                let Some((old_value, contributor)) = current else {
                    return Ok(false);
                };

                let now = Utc::now();
                conn.execute(
                    "UPDATE knowledge_triples
                     SET object = ?2,
                         confidence = ?3,
                         source = ?4,
                         version = version + 1,
                         previous_values = json_insert(previous_values, '$[#]', ?5),
                         updated_at = ?6
                     WHERE id = ?1",
                    params![triple_id, new_object, confidence, source.as_str(), old_value, now],
                )?;
                conn.execute(
                    "UPDATE knowledge_fts SET object = ?2 WHERE triple_id = ?1",
                    params![triple_id, new_object],
                )?;
                insert_history(
                    conn,
                    triple_id,
                    &old_value,
                    new_object,
                    source.as_str(),
                    true,
                    session_id,
                    &contributor,
                )?;
                Ok(true)
            })();

            match outcome {
                Ok(updated) => {
                    conn.execute_batch("COMMIT")?;
                    Ok(updated)
                }
                Err(e) => {
                    let _ = conn.execute_batch("ROLLBACK");
                    Err(e)
                }
            }
        })
    }

    /// Delete a triple (history rows cascade)
    pub async fn delete(&self, triple_id: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let n = conn.execute(
                "DELETE FROM knowledge_triples WHERE id = ?1",
                params![triple_id],
            )?;
            conn.execute(
                "DELETE FROM knowledge_fts WHERE triple_id = ?1",
                params![triple_id],
            )?;
            Ok(n > 0)
        })
    }

    // ========================================================================
    // READS
    // ========================================================================

    pub async fn get(&self, triple_id: &str) -> Result<Option<KnowledgeTriple>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT * FROM knowledge_triples WHERE id = ?1",
                params![triple_id],
                row_to_triple,
            )
            .optional()
            .map_err(StorageError::from)
        })
    }

    /// Exact match on the case-insensitive `(subject, predicate)` key
    pub async fn get_by_subject_predicate(
        &self,
        subject: &str,
        predicate: &str,
    ) -> Result<Option<KnowledgeTriple>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT * FROM knowledge_triples WHERE subject = ?1 AND predicate = ?2",
                params![subject, predicate],
                row_to_triple,
            )
            .optional()
            .map_err(StorageError::from)
        })
    }

    pub async fn query_by_subject(&self, subject: &str, limit: usize) -> Result<Vec<KnowledgeTriple>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM knowledge_triples WHERE subject = ?1
                 ORDER BY updated_at DESC LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![subject, limit as i64], row_to_triple)?;
            collect_rows(rows)
        })
    }

    pub async fn query_by_predicate(
        &self,
        predicate: &str,
        limit: usize,
    ) -> Result<Vec<KnowledgeTriple>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM knowledge_triples WHERE predicate = ?1
                 ORDER BY updated_at DESC LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![predicate, limit as i64], row_to_triple)?;
            collect_rows(rows)
        })
    }

    /// Full-text search over subject and object
    pub async fn search(&self, query: &str, limit: usize) -> Result<Vec<KnowledgeTriple>> {
        let fts_query = sanitize_fts_query(query);
        if fts_query.is_empty() {
            return Ok(vec![]);
        }
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT t.* FROM knowledge_triples t
                 JOIN knowledge_fts f ON f.triple_id = t.id
                 WHERE knowledge_fts MATCH ?1
                 ORDER BY rank
                 LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![fts_query, limit as i64], row_to_triple)?;
            collect_rows(rows)
        })
    }

    pub async fn get_recent(&self, limit: usize) -> Result<Vec<KnowledgeTriple>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM knowledge_triples ORDER BY updated_at DESC LIMIT ?1",
            )?;
            let rows = stmt.query_map(params![limit as i64], row_to_triple)?;
            collect_rows(rows)
        })
    }

    pub async fn get_all(&self, limit: usize) -> Result<Vec<KnowledgeTriple>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM knowledge_triples ORDER BY subject, predicate LIMIT ?1",
            )?;
            let rows = stmt.query_map(params![limit as i64], row_to_triple)?;
            collect_rows(rows)
        })
    }

    /// Existing triples sharing the key but carrying a different object
    pub async fn find_potential_conflicts(
        &self,
        triple: &KnowledgeTriple,
    ) -> Result<Vec<KnowledgeTriple>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM knowledge_triples
                 WHERE subject = ?1 AND predicate = ?2 AND LOWER(object) != LOWER(?3)",
            )?;
            let rows = stmt.query_map(
                params![triple.subject, triple.predicate, triple.object],
                row_to_triple,
            )?;
            collect_rows(rows)
        })
    }

    /// Update history for a triple, newest first
    pub async fn get_history(
        &self,
        triple_id: &str,
        limit: usize,
    ) -> Result<Vec<KnowledgeUpdateEvent>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM knowledge_history WHERE triple_id = ?1
                 ORDER BY timestamp DESC LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![triple_id, limit as i64], |row| {
                Ok(KnowledgeUpdateEvent {
                    id: row.get("id")?,
                    triple_id: row.get("triple_id")?,
                    old_value: row.get("old_value")?,
                    new_value: row.get("new_value")?,
                    reason: row.get("reason")?,
                    confirmed: row.get::<_, i64>("confirmed")? != 0,
                    session_id: row.get("session_id")?,
                    contributor_id: row.get("contributor_id")?,
                    timestamp: row.get::<_, DateTime<Utc>>("timestamp")?,
                })
            })?;
            let mut out = vec![];
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
    }

    pub async fn get_stats(&self) -> Result<KnowledgeStoreStats> {
        self.with_conn(|conn| {
            let total: i64 =
                conn.query_row("SELECT COUNT(*) FROM knowledge_triples", [], |r| r.get(0))?;
            let subjects: i64 = conn.query_row(
                "SELECT COUNT(DISTINCT LOWER(subject)) FROM knowledge_triples",
                [],
                |r| r.get(0),
            )?;
            let predicates: i64 = conn.query_row(
                "SELECT COUNT(DISTINCT LOWER(predicate)) FROM knowledge_triples",
                [],
                |r| r.get(0),
            )?;
            let updates: i64 =
                conn.query_row("SELECT COUNT(*) FROM knowledge_history", [], |r| r.get(0))?;
            Ok(KnowledgeStoreStats {
                total_triples: total as usize,
                unique_subjects: subjects as usize,
                unique_predicates: predicates as usize,
                total_updates: updates as usize,
            })
        })
    }

    /// Clear all knowledge (for testing)
    pub async fn clear_all(&self) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute_batch(
                "DELETE FROM knowledge_history;
                 DELETE FROM knowledge_triples;
                 DELETE FROM knowledge_fts;",
            )?;
            Ok(())
        })
    }
}

// ============================================================================
// TRANSACTION HELPERS
// ============================================================================

fn store_in_tx(conn: &Connection, triple: &KnowledgeTriple) -> Result<KnowledgeTriple> {
    let existing = conn
        .query_row(
            "SELECT * FROM knowledge_triples WHERE subject = ?1 AND predicate = ?2",
            params![triple.subject, triple.predicate],
            row_to_triple,
        )
        .optional()?;

    let now = Utc::now();
    match existing {
        None => {
            conn.execute(
                "INSERT INTO knowledge_triples (
                    id, subject, predicate, object, confidence, source, version,
                    previous_values, session_id, user_id, created_at, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1, '[]', ?7, ?8, ?9, ?9)",
                params![
                    triple.id,
                    triple.subject,
                    triple.predicate,
                    triple.object,
                    triple.confidence,
                    triple.source.as_str(),
                    triple.session_id,
                    triple.user_id,
                    now,
                ],
            )?;
            conn.execute(
                "INSERT INTO knowledge_fts (triple_id, subject, object) VALUES (?1, ?2, ?3)",
                params![triple.id, triple.subject, triple.object],
            )?;

            let mut stored = triple.clone();
            stored.version = 1;
            stored.previous_values = vec![];
            stored.created_at = now;
            stored.updated_at = now;
            Ok(stored)
        }
        Some(existing) => {
            if existing.object.to_lowercase() == triple.object.to_lowercase() {
                // Idempotent on identical object; only the confidence can rise
                if triple.confidence > existing.confidence {
                    conn.execute(
                        "UPDATE knowledge_triples SET confidence = ?2 WHERE id = ?1",
                        params![existing.id, triple.confidence],
                    )?;
                }
                let mut unchanged = existing.clone();
                unchanged.confidence = existing.confidence.max(triple.confidence);
                return Ok(unchanged);
            }

            let confidence = existing.confidence.max(triple.confidence);
            conn.execute(
                "UPDATE knowledge_triples
                 SET object = ?2,
                     confidence = ?3,
                     source = ?4,
                     version = version + 1,
                     previous_values = json_insert(previous_values, '$[#]', ?5),
                     updated_at = ?6
                 WHERE id = ?1",
                params![
                    existing.id,
                    triple.object,
                    confidence,
                    triple.source.as_str(),
                    existing.object,
                    now,
                ],
            )?;
            conn.execute(
                "UPDATE knowledge_fts SET object = ?2 WHERE triple_id = ?1",
                params![existing.id, triple.object],
            )?;
            insert_history(
                conn,
                &existing.id,
                &existing.object,
                &triple.object,
                triple.source.as_str(),
                false,
                &triple.session_id,
                &triple.user_id,
            )?;

            let mut stored = existing.clone();
            stored.object = triple.object.clone();
            stored.confidence = confidence;
            stored.source = triple.source;
            stored.version = existing.version + 1;
            stored.previous_values.push(existing.object.clone());
            stored.updated_at = now;
            Ok(stored)
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn insert_history(
    conn: &Connection,
    triple_id: &str,
    old_value: &str,
    new_value: &str,
    reason: &str,
    confirmed: bool,
    session_id: &str,
    contributor_id: &str,
) -> Result<()> {
    conn.execute(
        "INSERT INTO knowledge_history
         (id, triple_id, old_value, new_value, reason, confirmed, session_id, contributor_id, timestamp)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            Uuid::new_v4().to_string(),
            triple_id,
            old_value,
            new_value,
            reason,
            confirmed as i64,
            session_id,
            contributor_id,
            Utc::now(),
        ],
    )?;
    Ok(())
}

// ============================================================================
// LEGACY MIGRATION
// ============================================================================

/// Rebuild a legacy `knowledge_triples` table that carried per-user
/// uniqueness into the global `(subject, predicate)` constraint.
///
/// For each key the most recently updated row wins; older rows' objects are
/// folded into `previous_values` in update order.
fn migrate_legacy_schema(conn: &Connection) -> Result<()> {
    let table_sql: Option<String> = conn
        .query_row(
            "SELECT sql FROM sqlite_master WHERE type = 'table' AND name = 'knowledge_triples'",
            [],
            |row| row.get(0),
        )
        .optional()?;

    let Some(table_sql) = table_sql else {
        return Ok(());
    };
    let normalized: String = table_sql.to_lowercase().split_whitespace().collect();
    if !normalized.contains("unique(user_id,subject,predicate)") {
        return Ok(());
    }
    tracing::info!("Migrating knowledge_triples to the global uniqueness constraint");

    // FK enforcement must be off while the parent table is rebuilt, or the
    // implicit DELETE of DROP TABLE would cascade into knowledge_history
    conn.execute_batch("PRAGMA foreign_keys = OFF")?;

    let mut stmt = conn.prepare("SELECT * FROM knowledge_triples ORDER BY updated_at ASC")?;
    let rows: Vec<KnowledgeTriple> = stmt
        .query_map([], row_to_triple)?
        .filter_map(|r| r.ok())
        .collect();
    drop(stmt);

    let mut by_key: HashMap<(String, String), Vec<KnowledgeTriple>> = HashMap::new();
    for row in rows {
        let key = (row.subject.to_lowercase(), row.predicate.to_lowercase());
        by_key.entry(key).or_default().push(row);
    }

    conn.execute_batch("BEGIN")?;
    let outcome = (|| -> Result<()> {
        conn.execute_batch(
            "DROP TABLE knowledge_triples;
             CREATE TABLE knowledge_triples (
                id TEXT PRIMARY KEY,
                subject TEXT NOT NULL COLLATE NOCASE,
                predicate TEXT NOT NULL COLLATE NOCASE,
                object TEXT NOT NULL,
                confidence REAL NOT NULL DEFAULT 0.8,
                source TEXT NOT NULL DEFAULT 'conversation',
                version INTEGER NOT NULL DEFAULT 1,
                previous_values TEXT NOT NULL DEFAULT '[]',
                session_id TEXT NOT NULL DEFAULT '',
                user_id TEXT NOT NULL DEFAULT '',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE(subject, predicate)
             );",
        )?;

        for versions in by_key.into_values() {
            // Rows arrive oldest-first; the last one is canonical
            let Some(canonical) = versions.last().cloned() else {
                continue;
            };
            let mut previous: Vec<String> = vec![];
            for older in &versions[..versions.len() - 1] {
                previous.extend(older.previous_values.iter().cloned());
                previous.push(older.object.clone());
            }
            previous.extend(canonical.previous_values.iter().cloned());
            let version = 1 + previous.len() as u32;

            conn.execute(
                "INSERT INTO knowledge_triples (
                    id, subject, predicate, object, confidence, source, version,
                    previous_values, session_id, user_id, created_at, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    canonical.id,
                    canonical.subject,
                    canonical.predicate,
                    canonical.object,
                    canonical.confidence,
                    canonical.source.as_str(),
                    version,
                    serde_json::to_string(&previous)?,
                    canonical.session_id,
                    canonical.user_id,
                    canonical.created_at,
                    canonical.updated_at,
                ],
            )?;
        }

        // Rebuild the search index from the surviving rows
        conn.execute_batch(
            "CREATE VIRTUAL TABLE IF NOT EXISTS knowledge_fts
                 USING fts5(triple_id UNINDEXED, subject, object);
             DELETE FROM knowledge_fts;
             INSERT INTO knowledge_fts (triple_id, subject, object)
                 SELECT id, subject, object FROM knowledge_triples;",
        )?;
        Ok(())
    })();

    let result = match outcome {
        Ok(()) => {
            conn.execute_batch("COMMIT")?;
            Ok(())
        }
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            Err(e)
        }
    };
    conn.execute_batch("PRAGMA foreign_keys = ON")?;
    result
}

// ============================================================================
// ROW MAPPING
// ============================================================================

fn row_to_triple(row: &rusqlite::Row<'_>) -> rusqlite::Result<KnowledgeTriple> {
    let previous_json: String = row.get("previous_values")?;
    let source: String = row.get("source")?;
    Ok(KnowledgeTriple {
        id: row.get("id")?,
        subject: row.get("subject")?,
        predicate: row.get("predicate")?,
        object: row.get("object")?,
        confidence: row.get("confidence")?,
        source: KnowledgeSource::parse_name(&source),
        version: row.get::<_, i64>("version")? as u32,
        previous_values: serde_json::from_str(&previous_json).unwrap_or_default(),
        session_id: row.get("session_id")?,
        user_id: row.get("user_id")?,
        created_at: row.get::<_, DateTime<Utc>>("created_at")?,
        updated_at: row.get::<_, DateTime<Utc>>("updated_at")?,
        vector: vec![],
    })
}

fn collect_rows(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<KnowledgeTriple>>,
) -> Result<Vec<KnowledgeTriple>> {
    let mut out = vec![];
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    async fn connected_store() -> KnowledgeStore {
        let store = KnowledgeStore::new(KnowledgeStoreConfig::default());
        store.connect().await.unwrap();
        store
    }

    fn triple(subject: &str, predicate: &str, object: &str) -> KnowledgeTriple {
        KnowledgeTriple::new(subject, predicate, object)
    }

    #[tokio::test]
    async fn test_store_and_get() {
        let store = connected_store().await;
        let stored = store
            .store(&triple("GPT-4", "context_window", "32k"))
            .await
            .unwrap();
        assert_eq!(stored.version, 1);

        let fetched = store.get(&stored.id).await.unwrap().unwrap();
        assert_eq!(fetched.object, "32k");
        assert_eq!(fetched.version, 1);
        assert!(fetched.previous_values.is_empty());
    }

    #[tokio::test]
    async fn test_version_law() {
        let store = connected_store().await;
        store.store(&triple("GPT-4", "context_window", "8k")).await.unwrap();
        store.store(&triple("GPT-4", "context_window", "32k")).await.unwrap();
        let third = store.store(&triple("GPT-4", "context_window", "128k")).await.unwrap();

        assert_eq!(third.version, 3);
        assert_eq!(third.previous_values, vec!["8k", "32k"]);
        assert_eq!(third.version as usize, 1 + third.previous_values.len());

        // History carries one row per value change
        let history = store.get_history(&third.id, 10).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].old_value, "32k");
        assert_eq!(history[0].new_value, "128k");
    }

    #[tokio::test]
    async fn test_identical_object_is_idempotent() {
        let store = connected_store().await;
        let first = store.store(&triple("Python", "created_by", "Guido")).await.unwrap();

        let mut again = triple("Python", "created_by", "guido");
        again.confidence = 0.95;
        let second = store.store(&again).await.unwrap();

        assert_eq!(second.id, first.id);
        assert_eq!(second.version, 1);
        assert!(second.previous_values.is_empty());
        assert!((second.confidence - 0.95).abs() < f64::EPSILON);
        assert!(store.get_history(&first.id, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_uniqueness_is_global_across_users() {
        let store = connected_store().await;

        let mut from_u1 = triple("Python", "created_by", "Guido");
        from_u1.user_id = "u1".to_string();
        store.store(&from_u1).await.unwrap();

        let mut from_u2 = triple("python", "Created_By", "Guido van Rossum");
        from_u2.user_id = "u2".to_string();
        let merged = store.store(&from_u2).await.unwrap();

        assert_eq!(merged.version, 2);
        assert_eq!(merged.previous_values, vec!["Guido"]);

        let stats = store.get_stats().await.unwrap();
        assert_eq!(stats.total_triples, 1);
    }

    #[tokio::test]
    async fn test_confidence_keeps_max() {
        let store = connected_store().await;
        let mut high = triple("Service", "timeout", "30s");
        high.confidence = 0.9;
        store.store(&high).await.unwrap();

        let mut low = triple("Service", "timeout", "60s");
        low.confidence = 0.5;
        let updated = store.store(&low).await.unwrap();
        assert!((updated.confidence - 0.9).abs() < f64::EPSILON);
        assert_eq!(updated.object, "60s");
    }

    #[tokio::test]
    async fn test_update_writes_confirmed_history() {
        let store = connected_store().await;
        let stored = store.store(&triple("GPT-4", "context_window", "32k")).await.unwrap();

        let updated = store
            .update(&stored.id, "128k", KnowledgeSource::UserVerified, 1.0, "session-1")
            .await
            .unwrap();
        assert!(updated);

        let fetched = store.get(&stored.id).await.unwrap().unwrap();
        assert_eq!(fetched.object, "128k");
        assert_eq!(fetched.version, 2);
        assert_eq!(fetched.previous_values, vec!["32k"]);
        assert_eq!(fetched.source, KnowledgeSource::UserVerified);

        let history = store.get_history(&stored.id, 10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert!(history[0].confirmed);
        assert_eq!(history[0].session_id, "session-1");
    }

    #[tokio::test]
    async fn test_find_potential_conflicts() {
        let store = connected_store().await;
        store.store(&triple("GPT-4", "context_window", "32k")).await.unwrap();

        let incoming = triple("gpt-4", "Context_Window", "128k");
        let conflicts = store.find_potential_conflicts(&incoming).await.unwrap();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].object, "32k");

        // Same value (case-insensitive) is not a conflict
        let same = triple("GPT-4", "context_window", "32K");
        assert!(store.find_potential_conflicts(&same).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_query_and_search() {
        let store = connected_store().await;
        store.store(&triple("Python", "created_by", "Guido van Rossum")).await.unwrap();
        store.store(&triple("Python", "release_year", "1991")).await.unwrap();
        store.store(&triple("Rust", "created_by", "Graydon Hoare")).await.unwrap();

        assert_eq!(store.query_by_subject("python", 10).await.unwrap().len(), 2);
        assert_eq!(store.query_by_predicate("created_by", 10).await.unwrap().len(), 2);

        let hits = store.search("Guido", 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].subject, "Python");
    }

    #[tokio::test]
    async fn test_delete_cascades_history() {
        let store = connected_store().await;
        store.store(&triple("X", "p", "one")).await.unwrap();
        let updated = store.store(&triple("X", "p", "two")).await.unwrap();
        assert_eq!(store.get_history(&updated.id, 10).await.unwrap().len(), 1);

        assert!(store.delete(&updated.id).await.unwrap());
        assert!(store.get(&updated.id).await.unwrap().is_none());
        assert_eq!(store.get_stats().await.unwrap().total_updates, 0);
    }

    #[tokio::test]
    async fn test_legacy_per_user_schema_migrates_to_global() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("knowledge.db");

        // Seed a legacy database with per-user uniqueness and duplicate keys
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch(
                "CREATE TABLE knowledge_triples (
                    id TEXT PRIMARY KEY,
                    subject TEXT NOT NULL,
                    predicate TEXT NOT NULL,
                    object TEXT NOT NULL,
                    confidence REAL NOT NULL DEFAULT 0.8,
                    source TEXT NOT NULL DEFAULT 'conversation',
                    version INTEGER NOT NULL DEFAULT 1,
                    previous_values TEXT NOT NULL DEFAULT '[]',
                    session_id TEXT NOT NULL DEFAULT '',
                    user_id TEXT NOT NULL DEFAULT '',
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    UNIQUE(user_id, subject, predicate)
                 );",
            )
            .unwrap();
            conn.execute(
                "INSERT INTO knowledge_triples
                 (id, subject, predicate, object, version, previous_values, user_id, created_at, updated_at)
                 VALUES ('t1', 'Python', 'created_by', 'Guido', 1, '[]', 'u1',
                         '2024-01-01T00:00:00Z', '2024-01-01T00:00:00Z')",
                [],
            )
            .unwrap();
            conn.execute(
                "INSERT INTO knowledge_triples
                 (id, subject, predicate, object, version, previous_values, user_id, created_at, updated_at)
                 VALUES ('t2', 'python', 'created_by', 'Guido van Rossum', 1, '[]', 'u2',
                         '2024-02-01T00:00:00Z', '2024-02-01T00:00:00Z')",
                [],
            )
            .unwrap();
        }

        let store = KnowledgeStore::new(KnowledgeStoreConfig {
            db_path: Some(path),
        });
        store.connect().await.unwrap();

        let merged = store
            .get_by_subject_predicate("Python", "created_by")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(merged.object, "Guido van Rossum");
        assert_eq!(merged.version, 2);
        assert_eq!(merged.previous_values, vec!["Guido"]);
        assert_eq!(store.get_stats().await.unwrap().total_triples, 1);

        // The constraint is now global: a third user updates the same row
        let mut from_u3 = KnowledgeTriple::new("PYTHON", "CREATED_BY", "Guido v. Rossum");
        from_u3.user_id = "u3".to_string();
        let updated = store.store(&from_u3).await.unwrap();
        assert_eq!(updated.version, 3);
    }
}
