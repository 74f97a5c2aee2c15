//! Integration tests for the agent registry: registration, heartbeats,
//! candidate ranking, and staleness quarantine.

use sqlx::PgPool;
use uuid::Uuid;

use conductor_core::bus::EventBus;
use conductor_core::config::AgentConfig;
use conductor_core::registry::{AgentRegistry, NewAgent};
use conductor_db::models::AgentStatus;
use conductor_db::queries::agents as agent_db;
use conductor_test_utils::{create_test_db, drop_test_db};

fn registry(pool: &PgPool) -> AgentRegistry {
    AgentRegistry::new(
        pool.clone(),
        EventBus::new(pool.clone(), 256),
        AgentConfig::default(),
    )
}

fn worker(name: &str, capabilities: &[&str], capacity: i32) -> NewAgent {
    NewAgent {
        name: name.into(),
        capabilities: capabilities.iter().map(|s| s.to_string()).collect(),
        capacity,
        tags: vec![],
        attributes: serde_json::json!({}),
    }
}

#[tokio::test]
async fn register_and_duplicate_name_conflict() {
    let (pool, db_name) = create_test_db().await;
    let registry = registry(&pool);

    let agent = registry
        .register(worker("w1", &["code"], 1))
        .await
        .expect("register should succeed");
    assert_eq!(agent.status, AgentStatus::Idle);
    assert_eq!(agent.current_load, 0);

    let err = registry.register(worker("w1", &["code"], 1)).await.unwrap_err();
    assert_eq!(err.kind(), "conflict");

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn register_validates_input() {
    let (pool, db_name) = create_test_db().await;
    let registry = registry(&pool);

    let err = registry.register(worker("", &["code"], 1)).await.unwrap_err();
    assert_eq!(err.kind(), "invalid_input");

    let err = registry.register(worker("w", &["code"], 0)).await.unwrap_err();
    assert_eq!(err.kind(), "invalid_input");

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn candidates_filtered_by_capability_and_ranked() {
    let (pool, db_name) = create_test_db().await;
    let registry = registry(&pool);

    let coder = registry.register(worker("coder", &["code"], 2)).await.unwrap();
    let tester = registry.register(worker("tester", &["test"], 2)).await.unwrap();
    let generalist = registry
        .register(worker("generalist", &["code", "test"], 2))
        .await
        .unwrap();

    let required = vec!["code".to_string()];
    let candidates = registry.find_candidates(&required, None, None).await.unwrap();
    let ids: Vec<Uuid> = candidates.iter().map(|c| c.agent.id).collect();
    assert!(ids.contains(&coder.id));
    assert!(ids.contains(&generalist.id));
    assert!(!ids.contains(&tester.id), "capability filter excludes tester");

    // Load one unit onto the coder; the idle generalist now ranks first.
    agent_db::increment_load(&pool, coder.id).await.unwrap();
    let candidates = registry.find_candidates(&required, None, None).await.unwrap();
    assert_eq!(candidates[0].agent.id, generalist.id);
    assert!(candidates[0].score > candidates[1].score);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn saturated_agents_are_not_candidates() {
    let (pool, db_name) = create_test_db().await;
    let registry = registry(&pool);

    let agent = registry.register(worker("w", &["code"], 1)).await.unwrap();
    assert_eq!(agent_db::increment_load(&pool, agent.id).await.unwrap(), 1);

    // Load equals capacity: further increments refuse, dispatch skips.
    assert_eq!(agent_db::increment_load(&pool, agent.id).await.unwrap(), 0);
    let candidates = registry
        .find_candidates(&["code".to_string()], None, None)
        .await
        .unwrap();
    assert!(candidates.is_empty());

    // Releasing the unit restores dispatchability and idleness.
    agent_db::decrement_load(&pool, agent.id).await.unwrap();
    let agent = registry.get(agent.id).await.unwrap();
    assert_eq!(agent.current_load, 0);
    assert_eq!(agent.status, AgentStatus::Idle);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn heartbeat_is_idempotent_and_revives() {
    let (pool, db_name) = create_test_db().await;
    let registry = registry(&pool);

    let agent = registry.register(worker("w", &["code"], 1)).await.unwrap();

    registry.heartbeat(agent.id, None).await.unwrap();
    registry
        .heartbeat(agent.id, Some(serde_json::json!({ "cpu": 0.2 })))
        .await
        .unwrap();

    registry.mark_unreachable(agent.id).await.unwrap();
    let row = registry.get(agent.id).await.unwrap();
    assert_eq!(row.status, AgentStatus::Unreachable);

    registry.heartbeat(agent.id, None).await.unwrap();
    let row = registry.get(agent.id).await.unwrap();
    assert_eq!(row.status, AgentStatus::Idle, "heartbeat revives the agent");
    assert_eq!(row.attributes["cpu"], serde_json::json!(0.2));

    let err = registry.heartbeat(Uuid::new_v4(), None).await.unwrap_err();
    assert_eq!(err.kind(), "not_found");

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn stale_sweep_quarantines_silent_agents() {
    let (pool, db_name) = create_test_db().await;
    let registry = registry(&pool);

    let fresh = registry.register(worker("fresh", &["code"], 1)).await.unwrap();
    let silent = registry.register(worker("silent", &["code"], 1)).await.unwrap();

    sqlx::query("UPDATE agents SET last_heartbeat = now() - interval '10 minutes' WHERE id = $1")
        .bind(silent.id)
        .execute(&pool)
        .await
        .unwrap();

    let stale = registry.stale_sweep().await.unwrap();
    assert_eq!(stale.len(), 1);
    assert_eq!(stale[0].id, silent.id);

    let row = registry.get(silent.id).await.unwrap();
    assert_eq!(row.status, AgentStatus::Unreachable);
    let row = registry.get(fresh.id).await.unwrap();
    assert_eq!(row.status, AgentStatus::Idle);

    let since = chrono::Utc::now() - chrono::Duration::minutes(1);
    let events =
        conductor_db::queries::events::of_type_since(&pool, "agent.stale.detected", since)
            .await
            .unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].entity_id, silent.id.to_string());

    // Second sweep finds nothing new.
    let stale = registry.stale_sweep().await.unwrap();
    assert!(stale.is_empty());

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn update_and_deregister() {
    let (pool, db_name) = create_test_db().await;
    let registry = registry(&pool);

    let agent = registry.register(worker("w", &["code"], 1)).await.unwrap();

    let updated = registry
        .update(
            agent.id,
            conductor_core::registry::AgentUpdate {
                capacity: Some(4),
                health_score: Some(0.8),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(updated.capacity, 4);
    assert!((updated.health_score - 0.8).abs() < 1e-9);
    assert_eq!(updated.capabilities, vec!["code".to_string()], "untouched fields keep values");

    registry.deregister(agent.id).await.unwrap();
    let err = registry.get(agent.id).await.unwrap_err();
    assert_eq!(err.kind(), "not_found");

    pool.close().await;
    drop_test_db(&db_name).await;
}
