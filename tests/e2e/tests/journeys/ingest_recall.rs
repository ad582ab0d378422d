//! Journey: ingest content, recall it, and read it back as context

use std::sync::Arc;

use biem_core::prelude::*;
use biem_e2e_tests::mocks::VocabEmbedder;

async fn manager_for(user: &str) -> Arc<MemoryManager> {
    let manager = Arc::new(MemoryManager::new(MemoryConfig {
        auto_start_tasks: false,
        user_id: user.to_string(),
        ..Default::default()
    }));
    manager.set_embedder(Arc::new(VocabEmbedder::new()));
    manager.initialize().await.unwrap();
    manager
}

#[tokio::test]
async fn ingest_then_recall_returns_the_node() {
    let manager = manager_for("u1").await;

    let (node, signals) = manager
        .ingest(
            "User prefers dark mode",
            IngestOptions {
                importance: Some(0.9),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(signals.is_empty());
    assert!((node.energy - 0.9).abs() < f64::EPSILON);
    assert_eq!(node.tier, Tier::L1);

    let recalled = manager
        .recall("dark mode ui preferences", Some(1), true, &[])
        .await
        .unwrap();
    assert_eq!(recalled.len(), 1);
    assert_eq!(recalled[0].id, node.id);
    assert_eq!(recalled[0].content, "User prefers dark mode");
}

#[tokio::test]
async fn recall_without_spreading_still_finds_vector_hits() {
    let manager = manager_for("u1").await;
    let (node, _) = manager
        .ingest("standup notes are posted in the team channel", IngestOptions::default())
        .await
        .unwrap();

    let recalled = manager
        .recall("where are standup notes posted", Some(3), false, &[])
        .await
        .unwrap();
    assert!(recalled.iter().any(|n| n.id == node.id));
}

#[tokio::test]
async fn memory_is_isolated_per_user() {
    let manager = manager_for("u1").await;
    manager
        .ingest("the staging password rotates weekly", IngestOptions::default())
        .await
        .unwrap();

    manager.set_user_id("u2");
    let recalled = manager
        .recall("staging password rotation", Some(5), true, &[])
        .await
        .unwrap();
    assert!(recalled.is_empty());

    // The original owner still sees it
    manager.set_user_id("u1");
    let recalled = manager
        .recall("staging password rotation", Some(5), true, &[])
        .await
        .unwrap();
    assert_eq!(recalled.len(), 1);
}

#[tokio::test]
async fn context_block_carries_energy_badges() {
    let manager = manager_for("u1").await;
    manager
        .ingest(
            "Deploy freezes start every Friday at 15:00 UTC",
            IngestOptions {
                importance: Some(0.95),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let context = manager
        .get_context("when does the deploy freeze start", 5)
        .await
        .unwrap();
    assert!(context.starts_with("## Relevant Memories"));
    assert!(context.contains("E="));
    assert!(context.contains("Deploy freezes"));
}

#[tokio::test]
async fn touch_on_read_boosts_energy() {
    let manager = manager_for("u1").await;
    let (node, _) = manager
        .ingest(
            "quarterly planning happens in the first week",
            IngestOptions {
                importance: Some(0.4),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let fetched = manager.get_node(&node.id).await.unwrap().unwrap();
    assert!(fetched.energy > 0.4);
}
