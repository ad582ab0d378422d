//! Journey: knowledge extraction, conflict confirmation, and versioning

use biem_core::knowledge::{MessageRole, ProcessAction};
use biem_core::prelude::*;
use biem_e2e_tests::mocks::ScriptedCompleter;

const STATEMENT_32K: &str = r#"{"is_factual": true, "intent": "statement", "triples": [{"subject": "GPT-4", "predicate": "context_window", "object": "32k"}], "confidence": 0.9, "reasoning": "technical fact"}"#;
const CORRECTION_128K: &str = r#"{"is_factual": true, "intent": "correction", "triples": [{"subject": "GPT-4", "predicate": "context_window", "object": "128k"}], "confidence": 0.9, "reasoning": "correction"}"#;

async fn plugin(user: &str, replies: &[&str]) -> KnowledgeLearningPlugin {
    let plugin = KnowledgeLearningPlugin::new(KnowledgePluginConfig {
        enable_vector_search: false,
        user_id: user.to_string(),
        session_id: "session-1".to_string(),
        ..Default::default()
    });
    plugin
        .initialize(Some(ScriptedCompleter::new(replies)), None)
        .await
        .unwrap();
    plugin
}

#[tokio::test]
async fn correction_is_confirmed_and_versioned() {
    let plugin = plugin("u1", &[STATEMENT_32K, CORRECTION_128K]).await;

    // Statement stores at version 1
    let first = plugin
        .process_message("GPT-4 has a context window of 32k", MessageRole::User)
        .await
        .unwrap();
    assert_eq!(first.action, ProcessAction::Stored);
    assert_eq!(first.triples_stored[0].version, 1);

    // Correction surfaces a pending confirmation instead of writing
    let second = plugin
        .process_message(
            "Actually, GPT-4 now supports 128k context, not 32k",
            MessageRole::User,
        )
        .await
        .unwrap();
    assert_eq!(second.action, ProcessAction::Conflict);
    assert!(second.has_pending_confirmation());
    assert!(second.confirmation_prompts[0].contains("32k"));

    let (handled, _reply) = plugin
        .process_confirmation_response("yes, please update")
        .await
        .unwrap();
    assert!(handled);

    let triple = plugin
        .store()
        .get_by_subject_predicate("GPT-4", "context_window")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(triple.object, "128k");
    assert_eq!(triple.version, 2);
    assert_eq!(triple.previous_values, vec!["32k"]);

    // One history row links both values
    let history = plugin.store().get_history(&triple.id, 10).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].old_value, "32k");
    assert_eq!(history[0].new_value, "128k");
    assert!(history[0].confirmed);
}

#[tokio::test]
async fn knowledge_is_global_across_users() {
    // Two plugins share one database file, as two user sessions would
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("knowledge.db");

    let config_for = |user: &str| KnowledgePluginConfig {
        enable_vector_search: false,
        store: biem_core::KnowledgeStoreConfig {
            db_path: Some(db_path.clone()),
        },
        user_id: user.to_string(),
        session_id: format!("session-{user}"),
        ..Default::default()
    };

    const GUIDO: &str = r#"{"is_factual": true, "intent": "statement", "triples": [{"subject": "Python", "predicate": "created_by", "object": "Guido"}], "confidence": 0.9}"#;
    const GUIDO_FULL: &str = r#"{"is_factual": true, "intent": "statement", "triples": [{"subject": "Python", "predicate": "created_by", "object": "Guido van Rossum"}], "confidence": 0.9}"#;

    let u1 = KnowledgeLearningPlugin::new(config_for("u1"));
    u1.initialize(Some(ScriptedCompleter::new(&[GUIDO])), None)
        .await
        .unwrap();
    u1.process_message("Python was created by Guido", MessageRole::User)
        .await
        .unwrap();

    let u2 = KnowledgeLearningPlugin::new(config_for("u2"));
    u2.initialize(Some(ScriptedCompleter::new(&[GUIDO_FULL])), None)
        .await
        .unwrap();
    let result = u2
        .process_message("Python was created by Guido van Rossum", MessageRole::User)
        .await
        .unwrap();

    // u2 sees the conflict against u1's globally shared triple
    assert_eq!(result.action, ProcessAction::Conflict);
    let (handled, _) = u2.process_confirmation_response("yes").await.unwrap();
    assert!(handled);

    // Both users observe a single triple at version 2
    for plugin in [&u1, &u2] {
        let triple = plugin
            .store()
            .get_by_subject_predicate("Python", "created_by")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(triple.object, "Guido van Rossum");
        assert_eq!(triple.version, 2);
        assert_eq!(triple.previous_values, vec!["Guido"]);
    }

    let stats = u1.get_stats().await.unwrap();
    assert_eq!(stats.store.total_triples, 1);
}

#[tokio::test]
async fn opinions_are_not_stored() {
    const OPINION: &str = r#"{"is_factual": false, "intent": "opinion", "triples": [], "confidence": 0.0, "reasoning": "subjective"}"#;
    let plugin = plugin("u1", &[OPINION]).await;

    let result = plugin
        .process_message("I think Python is the best language", MessageRole::User)
        .await
        .unwrap();
    assert_eq!(result.action, ProcessAction::None);
    assert_eq!(plugin.get_all_knowledge(10).await.unwrap().len(), 0);
}

#[tokio::test]
async fn stored_triples_carry_attribution() {
    let plugin = plugin("u1", &[STATEMENT_32K]).await;
    plugin
        .process_message("GPT-4 has a context window of 32k", MessageRole::User)
        .await
        .unwrap();

    let triples = plugin.get_knowledge_about("GPT-4").await.unwrap();
    assert_eq!(triples.len(), 1);
    assert_eq!(triples[0].source.as_str(), "user_stated");
    assert_eq!(triples[0].user_id, "u1");
    assert_eq!(triples[0].session_id, "session-1");
}
