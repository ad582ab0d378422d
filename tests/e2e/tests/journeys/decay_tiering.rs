//! Journey: energy decay drives demotion out of the working canvas

use std::sync::Arc;

use chrono::{Duration, Utc};

use biem_core::memory::energy::{EnergyConfig, EnergyController};
use biem_core::memory::node::MemoryNode;
use biem_core::memory::tier::TierConfig;
use biem_core::prelude::*;
use biem_e2e_tests::mocks::VocabEmbedder;

#[tokio::test]
async fn decayed_node_is_demoted_on_energy_update() {
    let manager = Arc::new(MemoryManager::new(MemoryConfig {
        auto_start_tasks: false,
        user_id: "u1".to_string(),
        energy: EnergyConfig {
            decay_lambda: 1.0,
            ..Default::default()
        },
        tier: TierConfig {
            l1_to_l2_threshold: 0.3,
            ..Default::default()
        },
        ..Default::default()
    }));
    manager.set_embedder(Arc::new(VocabEmbedder::new()));
    manager.initialize().await.unwrap();

    // Placed in L1 at exactly the placement threshold
    let (node, _) = manager
        .ingest(
            "a fleeting observation about the weather",
            IngestOptions {
                importance: Some(0.5),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let tier = manager.tier_manager();
    assert_eq!(node.tier, Tier::L1);

    // Two seconds without access at lambda = 1.0
    let energy = EnergyController::new(EnergyConfig {
        decay_lambda: 1.0,
        ..Default::default()
    });
    let mut aged = node.clone();
    aged.last_accessed = Utc::now() - Duration::seconds(2);
    let decayed = energy.calculate_decay(&aged, Utc::now());
    assert!((decayed - 0.5 * (-2.0f64).exp()).abs() < 0.005);

    // The coherent energy update evicts it from L1 but keeps it in L2
    manager.tier_manager().update_energy(&node.id, decayed).await.unwrap();
    let after = tier.peek(&node.id).await.unwrap().unwrap();
    assert_eq!(after.tier, Tier::L2);
    assert!(after.energy < 0.1);

    let working = manager.get_working_memory(10).await.unwrap();
    assert!(working.iter().all(|n| n.id != node.id));
}

#[tokio::test]
async fn cleanup_pass_moves_decayed_members_to_l2() {
    let manager = Arc::new(MemoryManager::new(MemoryConfig {
        auto_start_tasks: false,
        user_id: "u1".to_string(),
        energy: EnergyConfig {
            decay_lambda: 1.0,
            ..Default::default()
        },
        ..Default::default()
    }));
    manager.set_embedder(Arc::new(VocabEmbedder::new()));
    manager.initialize().await.unwrap();

    let (node, _) = manager
        .ingest(
            "short lived context from the morning",
            IngestOptions {
                importance: Some(0.6),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    // Re-store the node with a backdated access time so cleanup decay bites
    let tier = manager.tier_manager();
    let mut aged = tier.peek(&node.id).await.unwrap().unwrap();
    aged.last_accessed = Utc::now() - Duration::seconds(10);
    tier.store(&mut aged).await.unwrap();

    tier.run_cleanup_pass().await.unwrap();

    let after = tier.peek(&node.id).await.unwrap().unwrap();
    assert_eq!(after.tier, Tier::L2);
    assert!(after.energy < 0.3);
}

#[tokio::test]
async fn energy_never_leaves_bounds() {
    let energy = EnergyController::new(EnergyConfig {
        decay_lambda: 2.0,
        ..Default::default()
    });

    let mut node = MemoryNode::new("bounded");
    node.energy = 0.9;
    node.last_accessed = Utc::now() - Duration::days(30);

    let decayed = energy.apply_decay(&mut node);
    assert!(decayed >= 0.01);

    energy.boost(&mut node, Some(5.0));
    assert!(node.energy <= 1.0);
}
