//! Journey: associative spreading and causal reinforcement from feedback

use std::sync::Arc;

use biem_core::storage::{GraphConfig, L2GraphStore};
use biem_core::prelude::*;
use biem_e2e_tests::mocks::VocabEmbedder;

#[tokio::test]
async fn spreading_activation_chain_decays_per_hop() {
    let graph = L2GraphStore::new(GraphConfig::new());
    graph.connect().await.unwrap();

    graph
        .add_link(&Link::new("A", "B", LinkType::Semantic, 1.0), "")
        .await
        .unwrap();
    graph
        .add_link(&Link::new("B", "C", LinkType::Semantic, 1.0), "")
        .await
        .unwrap();

    let activation = graph
        .spread_activation(&["A".to_string()], 2, 0.5, "")
        .await
        .unwrap();

    assert!((activation["A"] - 1.0).abs() < 1e-9);
    assert!((activation["B"] - 0.5).abs() < 1e-9);
    assert!((activation["C"] - 0.25).abs() < 1e-9);
}

#[tokio::test]
async fn recall_reaches_graph_neighbours_the_vector_missed() {
    let manager = Arc::new(MemoryManager::new(MemoryConfig {
        auto_start_tasks: false,
        user_id: "u1".to_string(),
        ..Default::default()
    }));
    manager.set_embedder(Arc::new(VocabEmbedder::new()));
    manager.initialize().await.unwrap();

    // Two memories ingested moments apart become temporally linked; the
    // second shares no vocabulary with the query.
    let (anchor, _) = manager
        .ingest("the invoice export job failed on monday", IngestOptions::default())
        .await
        .unwrap();
    let (neighbour, _) = manager
        .ingest("rollback restored the previous build", IngestOptions::default())
        .await
        .unwrap();
    assert!(neighbour.links.iter().any(|l| l.target_id == anchor.id));

    let recalled = manager
        .recall("invoice export job failure", Some(5), true, &[])
        .await
        .unwrap();
    let ids: Vec<&str> = recalled.iter().map(|n| n.id.as_str()).collect();
    assert!(ids.contains(&anchor.id.as_str()));
    assert!(ids.contains(&neighbour.id.as_str()));
}

#[tokio::test]
async fn positive_feedback_boosts_and_creates_causal_links() {
    let manager = Arc::new(MemoryManager::new(MemoryConfig {
        auto_start_tasks: false,
        user_id: "u1".to_string(),
        ..Default::default()
    }));
    manager.set_embedder(Arc::new(VocabEmbedder::new()));
    manager.initialize().await.unwrap();

    let (a, _) = manager
        .ingest("option one uses the queue", IngestOptions::default())
        .await
        .unwrap();
    let (b, _) = manager
        .ingest("option two polls the table", IngestOptions::default())
        .await
        .unwrap();

    let tier = manager.tier_manager();
    let a_before = tier.peek(&a.id).await.unwrap().unwrap().energy;
    let b_before = tier.peek(&b.id).await.unwrap().unwrap().energy;

    let event = manager
        .record_event(
            "decision",
            "picked the queue for ordering guarantees",
            1.0,
            &[a.id.clone(), b.id.clone()],
        )
        .await
        .unwrap();

    // Energy boosted by exactly +0.1 (capped at 1.0)
    let a_after = tier.peek(&a.id).await.unwrap().unwrap().energy;
    let b_after = tier.peek(&b.id).await.unwrap().unwrap().energy;
    assert!((a_after - (a_before + 0.1).min(1.0)).abs() < 1e-9);
    assert!((b_after - (b_before + 0.1).min(1.0)).abs() < 1e-9);

    // Causal links a -> e and b -> e with weight 1.0
    for source in [&a.id, &b.id] {
        let links = manager.graph().get_links(source).await.unwrap();
        let causal: Vec<_> = links
            .iter()
            .filter(|l| l.link_type == LinkType::Causal && l.target_id == event.id)
            .collect();
        assert_eq!(causal.len(), 1);
        assert!((causal[0].weight - 1.0).abs() < f64::EPSILON);
    }

    let node = manager.get_node(&event.id).await.unwrap().unwrap();
    assert_eq!(node.metadata.source, "agent");
}
