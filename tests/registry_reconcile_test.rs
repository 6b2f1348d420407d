//! External-edit reconciliation through the live store watcher.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::CountingHandler;
use maestro::domain::models::AgentConfig;
use maestro::infrastructure::store::JsonStore;
use maestro::services::{AgentRegistry, EventBus};
use tempfile::tempdir;

fn config(id: &str) -> AgentConfig {
    AgentConfig::new(id, format!("Agent {id}"), "mock", "m")
}

#[tokio::test]
async fn test_external_edit_reconciles_preserving_active_agents() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("agents.json");
    // Short windows so the test observes the debounced reload quickly.
    let store = JsonStore::with_timing(&path, Duration::from_millis(300), Duration::from_millis(50));
    let bus = Arc::new(EventBus::new());

    let registered = CountingHandler::new("registered-counter");
    bus.subscribe("agent:registered", registered.clone()).await;

    let registry = AgentRegistry::new(store.clone(), bus);
    registry.register(config("x")).await.unwrap();
    registry.register(config("y")).await.unwrap();
    registry.record_task_start("y").await.unwrap();
    assert_eq!(registered.count(), 2);

    let _watch = registry.start_watch().expect("watch starts");
    // Let the watcher settle and the self-write window expire.
    tokio::time::sleep(Duration::from_millis(400)).await;

    // External editor replaces the document with a single new agent.
    std::fs::write(
        &path,
        serde_json::to_string_pretty(&[config("z")]).unwrap(),
    )
    .unwrap();

    // Debounce (50 ms) plus slack for the reload.
    let mut reconciled = false;
    for _ in 0..40 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        if registry.get("z").await.is_some() {
            reconciled = true;
            break;
        }
    }
    assert!(reconciled, "external edit must reload the registry");

    assert!(registry.get("x").await.is_none(), "idle removed id is dropped");
    let y = registry.get("y").await.unwrap();
    assert_eq!(y.active_tasks, 1, "active agent survives with runtime state");
    assert_eq!(
        registered.count(),
        2,
        "reload is non-emitting: no agent:registered for reloaded ids"
    );
}

#[tokio::test]
async fn test_self_write_does_not_reload() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("agents.json");
    let store = JsonStore::with_timing(&path, Duration::from_millis(500), Duration::from_millis(50));
    let bus = Arc::new(EventBus::new());
    let registry = AgentRegistry::new(store, bus);

    registry.register(config("a")).await.unwrap();
    let _watch = registry.start_watch().expect("watch starts");
    tokio::time::sleep(Duration::from_millis(100)).await;

    // A registry mutation writes the file; the watcher must not bounce
    // it back into a reload that could race fresh runtime state.
    registry.record_task_start("a").await.unwrap();
    registry.register(config("b")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    let a = registry.get("a").await.unwrap();
    assert_eq!(a.active_tasks, 1, "runtime state untouched by self-write");
    assert_eq!(registry.count().await, 2);
}
