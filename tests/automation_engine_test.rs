//! Integration tests for the automation engine.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{Harness, MockBehavior};
use maestro::domain::models::workspace::GitEventKind;
use maestro::domain::models::{
    AutomationRule, ExecutionStatus, RoutingStrategy, RuleCondition, SkillDefinition,
    ThrottleMode, ThrottleSpec,
};
use maestro::infrastructure::store::JsonStore;
use maestro::services::automation::ExecutionQuery;
use maestro::services::event_bus::Event;
use maestro::services::AutomationEngine;

struct AutomationHarness {
    h: Harness,
    engine: Arc<AutomationEngine>,
}

impl AutomationHarness {
    async fn new() -> Self {
        let h = Harness::new().await;
        let engine = AutomationEngine::new(
            JsonStore::new(h.dir.path().join("rules.json")),
            h.router.clone(),
            h.registry.clone(),
        );
        engine.attach(&h.bus).await;
        Self { h, engine }
    }

    fn git_event(path: &str) -> Event {
        Event::WorkspaceGitEvent {
            path: path.to_string(),
            kind: GitEventKind::Commit,
            detail: Some("main".to_string()),
        }
    }

    async fn settle(&self) {
        // Let spawned dispatch tasks drain.
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}

fn review_rule(id: &str) -> AutomationRule {
    AutomationRule::new(id, format!("rule {id}"), "review")
        .on_events(vec!["workspace:git-event".to_string()])
}

#[tokio::test]
async fn test_event_triggers_matching_rule() {
    let ah = AutomationHarness::new().await;
    ah.h.add_agent("a", 1.0, &[]).await;
    ah.h.add_skill("review", RoutingStrategy::Single).await;
    ah.engine.register_rule(review_rule("r1")).await.unwrap();

    ah.h.bus.publish(AutomationHarness::git_event("/repo")).await;
    ah.settle().await;

    let executions = ah.engine.get_executions(ExecutionQuery::default()).await;
    assert_eq!(executions.len(), 1);
    assert_eq!(executions[0].status, ExecutionStatus::Completed);
    assert_eq!(executions[0].trigger_event, "workspace:git-event");
    assert!(executions[0].task_id.is_some());
}

#[tokio::test]
async fn test_filters_must_match_string_cast() {
    let ah = AutomationHarness::new().await;
    ah.h.add_agent("a", 1.0, &[]).await;
    ah.h.add_skill("review", RoutingStrategy::Single).await;
    ah.engine
        .register_rule(review_rule("r1").with_filter("path", "/wanted"))
        .await
        .unwrap();

    ah.h.bus.publish(AutomationHarness::git_event("/other")).await;
    ah.settle().await;
    assert!(ah.engine.get_executions(ExecutionQuery::default()).await.is_empty());

    ah.h.bus.publish(AutomationHarness::git_event("/wanted")).await;
    ah.settle().await;
    assert_eq!(ah.engine.get_executions(ExecutionQuery::default()).await.len(), 1);
}

#[tokio::test]
async fn test_throttle_leading_with_group_by_path() {
    let ah = AutomationHarness::new().await;
    ah.h.add_agent("a", 1.0, &[]).await;
    ah.h.add_skill("review", RoutingStrategy::Single).await;
    ah.engine
        .register_rule(review_rule("r1").with_throttle(ThrottleSpec {
            interval_ms: 30_000,
            mode: ThrottleMode::Leading,
            group_by: Some("path".to_string()),
        }))
        .await
        .unwrap();

    for _ in 0..5 {
        ah.h.bus.publish(AutomationHarness::git_event("/a")).await;
    }
    ah.h.bus.publish(AutomationHarness::git_event("/b")).await;
    ah.settle().await;

    let executions = ah.engine.get_executions(ExecutionQuery::default()).await;
    let throttled = executions
        .iter()
        .filter(|e| e.status == ExecutionStatus::Throttled)
        .count();
    let ran: Vec<_> = executions
        .iter()
        .filter(|e| e.status != ExecutionStatus::Throttled)
        .collect();

    assert_eq!(throttled, 4, "four /a events are throttled");
    assert_eq!(ran.len(), 2, "one run for /a, one for /b");
}

#[tokio::test]
async fn test_throttle_trailing_coalesces() {
    let ah = AutomationHarness::new().await;
    ah.h.add_agent("a", 1.0, &[]).await;
    ah.h.add_skill("review", RoutingStrategy::Single).await;
    ah.engine
        .register_rule(review_rule("r1").with_throttle(ThrottleSpec {
            interval_ms: 100,
            mode: ThrottleMode::Trailing,
            group_by: None,
        }))
        .await
        .unwrap();

    for _ in 0..3 {
        ah.h.bus.publish(AutomationHarness::git_event("/a")).await;
    }
    // Nothing runs before the interval elapses.
    let early = ah.engine.get_executions(ExecutionQuery::default()).await;
    assert!(early.iter().all(|e| e.status == ExecutionStatus::Throttled));

    tokio::time::sleep(Duration::from_millis(400)).await;
    let executions = ah.engine.get_executions(ExecutionQuery::default()).await;
    let ran = executions
        .iter()
        .filter(|e| e.status == ExecutionStatus::Completed)
        .count();
    assert_eq!(ran, 1, "coalesced into a single trailing run");
}

#[tokio::test(start_paused = true)]
async fn test_retry_records_bounded_attempts() {
    let ah = AutomationHarness::new().await;
    ah.h.add_agent("a", 1.0, &[]).await;
    ah.h.mock.script("a", MockBehavior::Fail { error: "flaky".to_string() });
    ah.h.add_skill("review", RoutingStrategy::Single).await;
    ah.engine
        .register_rule(review_rule("r1").with_max_retries(2))
        .await
        .unwrap();

    ah.h.bus.publish(AutomationHarness::git_event("/a")).await;

    // Paused time: sleeps (retry backoff included) auto-advance.
    for _ in 0..200 {
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(500)).await;
    }

    let executions = ah
        .engine
        .get_executions(ExecutionQuery {
            rule_id: Some("r1".to_string()),
            ..ExecutionQuery::default()
        })
        .await;
    assert_eq!(executions.len(), 3, "maxRetries=2 yields at most 3 attempts");
    let attempts: Vec<u32> = executions.iter().map(|e| e.retry_attempt).collect();
    assert_eq!(attempts, vec![0, 1, 2], "strictly increasing retry counter");
    assert!(executions.iter().all(|e| e.status == ExecutionStatus::Failed));
}

#[tokio::test]
async fn test_dry_run_records_without_dispatch() {
    let ah = AutomationHarness::new().await;
    ah.h.add_agent("a", 1.0, &[]).await;
    ah.h.add_skill("review", RoutingStrategy::Single).await;
    ah.engine.register_rule(review_rule("r1")).await.unwrap();
    ah.engine.set_dry_run(true);

    ah.h.bus.publish(AutomationHarness::git_event("/a")).await;
    ah.settle().await;

    let executions = ah.engine.get_executions(ExecutionQuery::default()).await;
    assert_eq!(executions.len(), 1);
    assert_eq!(executions[0].status, ExecutionStatus::Skipped);
    assert!(executions[0]
        .result_summary
        .as_deref()
        .unwrap_or_default()
        .contains("[DRY RUN]"));
    assert!(ah.h.mock.calls().is_empty(), "no provider dispatch happened");
}

#[tokio::test]
async fn test_min_agents_condition_skips() {
    let ah = AutomationHarness::new().await;
    ah.h.add_agent("a", 1.0, &[]).await;
    ah.h.add_skill("review", RoutingStrategy::Single).await;

    let mut rule = review_rule("r1");
    rule.conditions = vec![RuleCondition {
        kind: "min-agents".to_string(),
        value: serde_json::json!(3),
    }];
    ah.engine.register_rule(rule).await.unwrap();

    ah.h.bus.publish(AutomationHarness::git_event("/a")).await;
    ah.settle().await;

    let executions = ah.engine.get_executions(ExecutionQuery::default()).await;
    assert_eq!(executions.len(), 1);
    assert_eq!(executions[0].status, ExecutionStatus::Skipped);
    assert!(executions[0]
        .error
        .as_deref()
        .unwrap_or_default()
        .contains("min-agents"));
}

#[tokio::test]
async fn test_template_params_reach_the_prompt() {
    let ah = AutomationHarness::new().await;
    ah.h.add_agent("a", 1.0, &[]).await;

    let skill = SkillDefinition::new("review", "Review", "changed: {file}", RoutingStrategy::Single);
    ah.h.skills.register(skill).await.unwrap();

    let mut rule = AutomationRule::new("r1", "on change", "review")
        .on_events(vec!["workspace:file-changed".to_string()]);
    rule.template_params
        .insert("file".to_string(), "{event.file}".to_string());
    ah.engine.register_rule(rule).await.unwrap();

    ah.h.bus
        .publish(Event::WorkspaceFileChanged {
            path: "/repo".to_string(),
            file: "src/main.rs".to_string(),
        })
        .await;
    ah.settle().await;

    let executions = ah.engine.get_executions(ExecutionQuery::default()).await;
    assert_eq!(executions.len(), 1);
    assert_eq!(
        executions[0].params.get("file").map(String::as_str),
        Some("src/main.rs")
    );
    // The mock echoes the resolved prompt back.
    assert_eq!(
        executions[0].result_summary.as_deref(),
        Some("changed: src/main.rs")
    );
}

#[tokio::test]
async fn test_priority_orders_rule_evaluation() {
    let ah = AutomationHarness::new().await;
    ah.h.add_agent("a", 1.0, &[]).await;
    ah.h.add_skill("review", RoutingStrategy::Single).await;

    ah.engine
        .register_rule(review_rule("low").with_priority(1))
        .await
        .unwrap();
    ah.engine
        .register_rule(review_rule("high").with_priority(10))
        .await
        .unwrap();

    ah.h.bus.publish(AutomationHarness::git_event("/a")).await;
    ah.settle().await;

    let executions = ah.engine.get_executions(ExecutionQuery::default()).await;
    assert_eq!(executions.len(), 2);
    assert_eq!(executions[0].rule_id, "high", "higher priority evaluates first");
}

#[tokio::test]
async fn test_disabled_engine_ignores_events() {
    let ah = AutomationHarness::new().await;
    ah.h.add_agent("a", 1.0, &[]).await;
    ah.h.add_skill("review", RoutingStrategy::Single).await;
    ah.engine.register_rule(review_rule("r1")).await.unwrap();
    ah.engine.set_enabled(false);

    ah.h.bus.publish(AutomationHarness::git_event("/a")).await;
    ah.settle().await;
    assert!(ah.engine.get_executions(ExecutionQuery::default()).await.is_empty());
}

#[tokio::test]
async fn test_failed_execution_enqueues_review() {
    let ah = AutomationHarness::new().await;
    ah.h.add_agent("a", 1.0, &[]).await;
    ah.h.mock.script("a", MockBehavior::Fail { error: "broken".to_string() });
    ah.h.add_skill("review", RoutingStrategy::Single).await;
    ah.engine.register_rule(review_rule("r1")).await.unwrap();

    ah.h.bus.publish(AutomationHarness::git_event("/a")).await;
    ah.settle().await;

    let reviews = ah.engine.pending_reviews().await;
    assert_eq!(reviews.len(), 1);
    assert_eq!(reviews[0].execution_status, ExecutionStatus::Failed);
}

#[tokio::test]
async fn test_rule_stats_aggregate() {
    let ah = AutomationHarness::new().await;
    ah.h.add_agent("a", 1.0, &[]).await;
    ah.h.add_skill("review", RoutingStrategy::Single).await;
    ah.engine.register_rule(review_rule("r1")).await.unwrap();

    ah.h.bus.publish(AutomationHarness::git_event("/a")).await;
    ah.h.bus.publish(AutomationHarness::git_event("/b")).await;
    ah.settle().await;

    let stats = ah.engine.get_rule_stats("r1").await;
    assert_eq!(stats.total, 2);
    assert_eq!(stats.completed, 2);
    assert!((stats.success_rate - 1.0).abs() < f64::EPSILON);
    assert!(stats.last_triggered.is_some());
}

#[tokio::test]
async fn test_manual_trigger_runs_pipeline() {
    let ah = AutomationHarness::new().await;
    ah.h.add_agent("a", 1.0, &[]).await;
    ah.h.add_skill("review", RoutingStrategy::Single).await;
    ah.engine.register_rule(review_rule("r1")).await.unwrap();

    let execution_id = ah
        .engine
        .trigger_rule("r1", serde_json::json!({"path": "/manual"}), false)
        .await
        .unwrap();
    ah.settle().await;

    let executions = ah.engine.get_executions(ExecutionQuery::default()).await;
    assert_eq!(executions.len(), 1);
    assert_eq!(executions[0].id, execution_id);
    assert_eq!(executions[0].status, ExecutionStatus::Completed);
}
