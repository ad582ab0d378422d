//! Environment Configuration
//!
//! Reads the recognized environment options and maps them onto the embedded
//! backends. The vector and relational services are abstract contracts; in
//! this build `MILVUS_COLLECTION` names the memory vector collection (and
//! its backing file), `POSTGRES_DB` names the relational database file, and
//! the host/port fields are parsed and retained for remote substitutions.

use std::path::PathBuf;

use directories::ProjectDirs;

use crate::knowledge::{KnowledgePluginConfig, KnowledgeStoreConfig, KnowledgeVectorConfig};
use crate::memory::manager::MemoryConfig;
use crate::storage::{L3Config, VectorStoreConfig};

// ============================================================================
// ENV HELPERS
// ============================================================================

fn env_str(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn env_bool(name: &str, default: bool) -> bool {
    match env_str(name) {
        Some(value) => matches!(value.to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        None => default,
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    env_str(name)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

// ============================================================================
// CONFIG
// ============================================================================

/// LLM request defaults consumed by completion capabilities
#[derive(Debug, Clone)]
pub struct LlmSettings {
    /// Default model identifier (`MODEL`)
    pub model: Option<String>,
    /// Sampling temperature (`TEMPERATURE`)
    pub temperature: f64,
    /// Agent loop iteration cap (`MAX_ITERATIONS`)
    pub max_iterations: u32,
}

/// Address of the memory vector backend
#[derive(Debug, Clone)]
pub struct VectorBackendSettings {
    pub host: String,
    pub port: u16,
    pub collection: String,
    /// Embedded mode; this build always stores locally
    pub use_lite: bool,
}

/// Address of the relational backend
#[derive(Debug, Clone)]
pub struct RelationalSettings {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: String,
}

/// Engine configuration assembled from the environment
#[derive(Debug, Clone)]
pub struct BiemConfig {
    pub llm: LlmSettings,
    pub vector: VectorBackendSettings,
    pub relational: RelationalSettings,

    /// Enable the triple vector store (`KNOWLEDGE_VECTOR_SEARCH`)
    pub knowledge_vector_search: bool,
    /// Subsystem toggles
    pub disable_memory: bool,
    pub disable_knowledge: bool,

    /// Default memory/knowledge identity (`USER_ID`)
    pub user_id: String,

    /// Logging verbosity flags
    pub verbose: bool,
    pub debug: bool,

    /// Root directory for embedded backend files
    pub data_dir: PathBuf,
}

impl Default for BiemConfig {
    fn default() -> Self {
        Self {
            llm: LlmSettings {
                model: None,
                temperature: 0.7,
                max_iterations: 10,
            },
            vector: VectorBackendSettings {
                host: "localhost".to_string(),
                port: 19530,
                collection: "biem_memories".to_string(),
                use_lite: true,
            },
            relational: RelationalSettings {
                host: "localhost".to_string(),
                port: 5432,
                database: "biem".to_string(),
                user: String::new(),
                password: String::new(),
            },
            knowledge_vector_search: true,
            disable_memory: false,
            disable_knowledge: false,
            user_id: "default".to_string(),
            verbose: false,
            debug: false,
            data_dir: default_data_dir(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    if let Some(proj_dirs) = ProjectDirs::from("ai", "biem", "core") {
        return proj_dirs.data_dir().to_path_buf();
    }
    PathBuf::from(".biem")
}

impl BiemConfig {
    /// Build configuration from the recognized environment options
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            llm: LlmSettings {
                model: env_str("MODEL"),
                temperature: env_parse("TEMPERATURE", defaults.llm.temperature),
                max_iterations: env_parse("MAX_ITERATIONS", defaults.llm.max_iterations),
            },
            vector: VectorBackendSettings {
                host: env_str("MILVUS_HOST").unwrap_or(defaults.vector.host),
                port: env_parse("MILVUS_PORT", defaults.vector.port),
                collection: env_str("MILVUS_COLLECTION").unwrap_or(defaults.vector.collection),
                use_lite: env_bool("MILVUS_USE_LITE", defaults.vector.use_lite),
            },
            relational: RelationalSettings {
                host: env_str("POSTGRES_HOST").unwrap_or(defaults.relational.host),
                port: env_parse("POSTGRES_PORT", defaults.relational.port),
                database: env_str("POSTGRES_DB").unwrap_or(defaults.relational.database),
                user: env_str("POSTGRES_USER").unwrap_or_default(),
                password: env_str("POSTGRES_PASSWORD").unwrap_or_default(),
            },
            knowledge_vector_search: env_bool("KNOWLEDGE_VECTOR_SEARCH", true),
            disable_memory: env_bool("DISABLE_MEMORY", false),
            disable_knowledge: env_bool("DISABLE_KNOWLEDGE", false),
            user_id: env_str("USER_ID").unwrap_or(defaults.user_id),
            verbose: env_bool("VERBOSE", false),
            debug: env_bool("DEBUG", false),
            data_dir: default_data_dir(),
        }
    }

    /// Path of the embedded memory vector database
    pub fn memory_vector_db_path(&self) -> PathBuf {
        self.data_dir.join(format!("{}.db", self.vector.collection))
    }

    /// Path of the embedded knowledge vector database
    pub fn knowledge_vector_db_path(&self) -> PathBuf {
        self.data_dir.join("biem_knowledge.db")
    }

    /// Path of the embedded relational database
    pub fn relational_db_path(&self) -> PathBuf {
        self.data_dir.join(format!("{}.db", self.relational.database))
    }

    /// Path of the graph snapshot file
    pub fn graph_snapshot_path(&self) -> PathBuf {
        self.data_dir.join("graph.json")
    }

    /// Memory system configuration derived from these settings
    pub fn memory_config(&self) -> MemoryConfig {
        MemoryConfig {
            vector: VectorStoreConfig {
                db_path: Some(self.memory_vector_db_path()),
                collection: self.vector.collection.clone(),
                dim: 0,
            },
            graph: crate::storage::GraphConfig {
                persist_path: Some(self.graph_snapshot_path()),
                ..crate::storage::GraphConfig::default()
            },
            l3: L3Config {
                db_path: Some(self.relational_db_path()),
            },
            user_id: self.user_id.clone(),
            ..MemoryConfig::default()
        }
    }

    /// Knowledge plugin configuration derived from these settings
    pub fn knowledge_config(&self, session_id: &str) -> KnowledgePluginConfig {
        KnowledgePluginConfig {
            store: KnowledgeStoreConfig {
                db_path: Some(self.relational_db_path()),
            },
            vector: KnowledgeVectorConfig {
                db_path: Some(self.knowledge_vector_db_path()),
                collection: "biem_knowledge".to_string(),
            },
            enable_vector_search: self.knowledge_vector_search,
            user_id: self.user_id.clone(),
            session_id: session_id.to_string(),
            ..KnowledgePluginConfig::default()
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BiemConfig::default();
        assert_eq!(config.vector.collection, "biem_memories");
        assert_eq!(config.relational.database, "biem");
        assert_eq!(config.user_id, "default");
        assert!(config.knowledge_vector_search);
        assert!(!config.disable_memory);
    }

    #[test]
    fn test_from_env_overrides() {
        // Env mutation is process-global; this test owns these variables
        unsafe {
            std::env::set_var("MILVUS_COLLECTION", "custom_memories");
            std::env::set_var("POSTGRES_DB", "custom_db");
            std::env::set_var("USER_ID", "alice");
            std::env::set_var("TEMPERATURE", "0.2");
            std::env::set_var("DISABLE_KNOWLEDGE", "true");
            std::env::set_var("KNOWLEDGE_VECTOR_SEARCH", "0");
        }

        let config = BiemConfig::from_env();
        assert_eq!(config.vector.collection, "custom_memories");
        assert_eq!(config.relational.database, "custom_db");
        assert_eq!(config.user_id, "alice");
        assert!((config.llm.temperature - 0.2).abs() < f64::EPSILON);
        assert!(config.disable_knowledge);
        assert!(!config.knowledge_vector_search);

        assert!(config.memory_vector_db_path().ends_with("custom_memories.db"));
        assert!(config.relational_db_path().ends_with("custom_db.db"));

        unsafe {
            std::env::remove_var("MILVUS_COLLECTION");
            std::env::remove_var("POSTGRES_DB");
            std::env::remove_var("USER_ID");
            std::env::remove_var("TEMPERATURE");
            std::env::remove_var("DISABLE_KNOWLEDGE");
            std::env::remove_var("KNOWLEDGE_VECTOR_SEARCH");
        }
    }

    #[test]
    fn test_derived_configs_share_relational_path() {
        let config = BiemConfig::default();
        let memory = config.memory_config();
        let knowledge = config.knowledge_config("session-1");
        assert_eq!(memory.l3.db_path, knowledge.store.db_path);
        assert_eq!(knowledge.session_id, "session-1");
    }
}
