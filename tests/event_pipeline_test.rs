//! Bus → log wiring and delivery guarantees.

mod common;

use std::sync::Arc;

use common::CountingHandler;
use maestro::services::{Event, EventBus, EventLog};
use tempfile::tempdir;

fn task_started(n: usize) -> Event {
    Event::TaskStarted {
        task_id: format!("t{n}"),
        skill_id: "s".to_string(),
        agent_count: 1,
    }
}

#[tokio::test]
async fn test_every_subscriber_runs_before_publish_returns() {
    let bus = EventBus::new();
    let first = CountingHandler::new("first");
    let second = CountingHandler::new("second");
    bus.subscribe("task:started", first.clone()).await;
    bus.subscribe_all(second.clone()).await;

    bus.publish(task_started(1)).await;

    // No waiting: delivery is synchronous within publish.
    assert_eq!(first.count(), 1);
    assert_eq!(second.count(), 1);
}

#[tokio::test]
async fn test_bus_feeds_the_jsonl_tail() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("events.jsonl");
    let bus = EventBus::new();
    let log = EventLog::new(&path).unwrap();
    log.attach(&bus).await;

    bus.publish(task_started(1)).await;
    bus.publish(Event::SkillRegistered {
        skill_id: "echo".to_string(),
        name: "Echo".to_string(),
    })
    .await;

    let recent = log.get_recent_events(10).await;
    assert_eq!(recent.len(), 2);
    assert_eq!(recent[0].event, "task:started");
    assert_eq!(recent[1].event, "skill:registered");

    // The tail is on disk too, one JSON object per line.
    let raw = std::fs::read_to_string(&path).unwrap();
    let lines: Vec<&str> = raw.lines().collect();
    assert_eq!(lines.len(), 2);
    for line in lines {
        let value: serde_json::Value = serde_json::from_str(line).unwrap();
        assert!(value["ts"].is_string());
        assert!(value["event"].is_string());
    }
}

#[tokio::test]
async fn test_corrupt_tail_seeds_then_grows() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("events.jsonl");
    std::fs::write(
        &path,
        "garbage\n{\"ts\":\"2026-02-01T00:00:00.000000000Z\",\"event\":\"task:started\",\"taskId\":\"old\"}\n{broken\n",
    )
    .unwrap();

    let bus = EventBus::new();
    let log = EventLog::new(&path).unwrap();
    log.attach(&bus).await;

    let recent = log.get_recent_events(100).await;
    assert_eq!(recent.len(), 1, "corrupt lines are skipped silently");

    bus.publish(task_started(2)).await;
    let recent = log.get_recent_events(100).await;
    assert_eq!(recent.len(), 2, "the ring keeps growing after a corrupt tail");
    assert_eq!(recent[1].data["taskId"], "t2");
}

#[tokio::test]
async fn test_late_subscriber_misses_earlier_events() {
    let bus = Arc::new(EventBus::new());
    bus.publish(task_started(1)).await;

    let late = CountingHandler::new("late");
    bus.subscribe("task:started", late.clone()).await;
    assert_eq!(late.count(), 0, "no retention for late subscribers");

    bus.publish(task_started(2)).await;
    assert_eq!(late.count(), 1);
}
