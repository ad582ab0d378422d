//! BIEM Ops CLI
//!
//! Operational helpers for the memory engine: reset and recreate the
//! backing databases, and inspect store statistics.

use std::path::Path;

use anyhow::Context;
use clap::{Parser, Subcommand};
use rusqlite::Connection;

use biem_core::knowledge::{KnowledgeStore, KnowledgeStoreConfig, KnowledgeVectorConfig, KnowledgeVectorStore};
use biem_core::storage::{L2VectorStore, L3Config, L3CrystalStore, VectorStoreConfig};
use biem_core::BiemConfig;

/// BIEM - operational helpers for the memory engine
#[derive(Parser)]
#[command(name = "biem-ops")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Operational helpers for the BIEM memory engine")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Drop and recreate all memory and knowledge databases
    Reset {
        /// Skip the confirmation prompt
        #[arg(long)]
        yes: bool,
    },

    /// Show store statistics
    Stats,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = BiemConfig::from_env();

    match cli.command {
        Commands::Reset { yes } => run_reset(&config, yes).await,
        Commands::Stats => run_stats(&config).await,
    }
}

// ============================================================================
// RESET
// ============================================================================

async fn run_reset(config: &BiemConfig, yes: bool) -> anyhow::Result<()> {
    println!("This will DELETE ALL DATA in the memory and knowledge databases.");
    if !yes {
        println!("Press Ctrl+C within 3 seconds to cancel...");
        tokio::time::sleep(std::time::Duration::from_secs(3)).await;
    }

    let vectors_ok = reset_vector_collections(config).await;
    let relational_ok = reset_relational_tables(config).await;

    println!();
    println!("Summary:");
    println!("  Vector collections: {}", if vectors_ok { "OK" } else { "FAILED" });
    println!("  Relational tables:  {}", if relational_ok { "OK" } else { "FAILED" });

    if vectors_ok && relational_ok {
        println!("All databases reset. Schemas recreated.");
        Ok(())
    } else {
        anyhow::bail!("some reset steps failed");
    }
}

/// Drop the `biem_memories` and `biem_knowledge` collections, then recreate
/// their schemas by reconnecting the stores.
async fn reset_vector_collections(config: &BiemConfig) -> bool {
    let memory_path = config.memory_vector_db_path();
    let knowledge_path = config.knowledge_vector_db_path();

    let result: anyhow::Result<()> = async {
        drop_table(&memory_path, &config.vector.collection)?;
        drop_table(&knowledge_path, "biem_knowledge")?;

        // Reconnect to recreate the current schemas
        let memory_store = L2VectorStore::new(VectorStoreConfig {
            db_path: Some(memory_path.clone()),
            collection: config.vector.collection.clone(),
            dim: 0,
        });
        memory_store
            .connect()
            .await
            .context("recreating memory vector collection")?;

        let knowledge_store = KnowledgeVectorStore::new(KnowledgeVectorConfig {
            db_path: Some(knowledge_path.clone()),
            collection: "biem_knowledge".to_string(),
        });
        knowledge_store
            .connect()
            .await
            .context("recreating knowledge vector collection")?;
        Ok(())
    }
    .await;

    match result {
        Ok(()) => {
            println!("  Dropped and recreated vector collections");
            true
        }
        Err(e) => {
            eprintln!("  Vector reset failed: {e:#}");
            false
        }
    }
}

/// Drop the relational tables in foreign-key order, then recreate the
/// current schema by reconnecting the stores.
async fn reset_relational_tables(config: &BiemConfig) -> bool {
    let path = config.relational_db_path();

    let result: anyhow::Result<()> = async {
        if path.exists() {
            let conn = Connection::open(&path).context("opening relational database")?;
            // Order respects the history -> triples foreign key
            conn.execute_batch(
                "DROP TABLE IF EXISTS knowledge_history;
                 DROP TABLE IF EXISTS knowledge_fts;
                 DROP TABLE IF EXISTS knowledge_triples;
                 DROP TABLE IF EXISTS crystal_links;
                 DROP TABLE IF EXISTS crystal_fts;
                 DROP TABLE IF EXISTS crystal_facts;",
            )
            .context("dropping relational tables")?;
        }

        let crystal = L3CrystalStore::new(L3Config {
            db_path: Some(path.clone()),
        });
        crystal.connect().await.context("recreating crystal tables")?;

        let knowledge = KnowledgeStore::new(KnowledgeStoreConfig {
            db_path: Some(path.clone()),
        });
        knowledge.connect().await.context("recreating knowledge tables")?;
        Ok(())
    }
    .await;

    match result {
        Ok(()) => {
            println!("  Dropped and recreated relational tables");
            true
        }
        Err(e) => {
            eprintln!("  Relational reset failed: {e:#}");
            false
        }
    }
}

fn drop_table(db_path: &Path, collection: &str) -> anyhow::Result<()> {
    if !db_path.exists() {
        return Ok(());
    }
    let table: String = collection
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_')
        .collect();
    let conn = Connection::open(db_path)
        .with_context(|| format!("opening {}", db_path.display()))?;
    conn.execute_batch(&format!("DROP TABLE IF EXISTS {table};"))
        .with_context(|| format!("dropping collection {collection}"))?;
    Ok(())
}

// ============================================================================
// STATS
// ============================================================================

async fn run_stats(config: &BiemConfig) -> anyhow::Result<()> {
    let crystal = L3CrystalStore::new(L3Config {
        db_path: Some(config.relational_db_path()),
    });
    match crystal.connect().await {
        Ok(()) => {
            let stats = crystal.get_stats().await?;
            println!("Crystal facts:      {}", stats.facts_count);
            println!("Persisted links:    {}", stats.links_count);
            println!("Avg confidence:     {:.2}", stats.avg_confidence);
        }
        Err(e) => println!("Crystal store:      unavailable ({e})"),
    }

    let knowledge = KnowledgeStore::new(KnowledgeStoreConfig {
        db_path: Some(config.relational_db_path()),
    });
    match knowledge.connect().await {
        Ok(()) => {
            let stats = knowledge.get_stats().await?;
            println!("Knowledge triples:  {}", stats.total_triples);
            println!("Unique subjects:    {}", stats.unique_subjects);
            println!("Unique predicates:  {}", stats.unique_predicates);
            println!("Recorded updates:   {}", stats.total_updates);
        }
        Err(e) => println!("Knowledge store:    unavailable ({e})"),
    }

    let memory = L2VectorStore::new(VectorStoreConfig {
        db_path: Some(config.memory_vector_db_path()),
        collection: config.vector.collection.clone(),
        dim: 0,
    });
    match memory.connect().await {
        Ok(()) => {
            let stats = memory.stats();
            println!("Memory nodes:       {}", stats.row_count);
        }
        Err(e) => println!("Memory vectors:     unavailable ({e})"),
    }

    Ok(())
}
