//! Automation engine: event→rule matching and task creation.
//!
//! Subscribes to the full event set. Each event is matched against the
//! enabled rules (event-name set plus string-cast payload filters); each
//! matching rule runs through throttle buckets, a per-rule concurrency
//! gate, and condition checks, then resolves its parameters and routes a
//! task. Failures retry with exponential backoff. Every evaluation —
//! including throttled and skipped ones — leaves a record in the bounded
//! execution history, and completed/failed executions can enqueue review
//! items. Automation errors never escape to the event bus.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use chrono::Utc;
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::domain::models::{
    AutomationRule, ExecutionRecord, ExecutionStatus, ReviewItem, ReviewStatus, RuleStats,
    TaskRequest, ThrottleMode,
};
use crate::infrastructure::store::JsonStore;
use crate::services::agent_registry::AgentRegistry;
use crate::services::event_bus::{Event, EventBus, EventHandler};
use crate::services::task_router::TaskRouter;

/// Bounded execution history length.
pub const EXECUTION_HISTORY_LIMIT: usize = 500;
/// Bounded review queue length.
pub const REVIEW_QUEUE_LIMIT: usize = 200;
/// Payload snapshot values longer than this are truncated.
const SNAPSHOT_VALUE_LIMIT: usize = 200;
/// Result summaries stored on execution records are truncated to this.
const SUMMARY_LIMIT: usize = 200;

const RETRY_INITIAL: Duration = Duration::from_secs(1);
const RETRY_MAX: Duration = Duration::from_secs(30);
const RETRY_MULTIPLIER: f64 = 2.0;
const RETRY_JITTER: f64 = 0.2;

/// Error types for rule management.
#[derive(Debug, thiserror::Error)]
pub enum AutomationError {
    #[error("rule id already registered: {0}")]
    DuplicateId(String),

    #[error("unknown rule: {0}")]
    UnknownRule(String),

    #[error("invalid rule: {0}")]
    Invalid(String),
}

/// Filters for `get_executions`.
#[derive(Debug, Clone, Default)]
pub struct ExecutionQuery {
    pub rule_id: Option<String>,
    pub status: Option<ExecutionStatus>,
    pub limit: Option<usize>,
}

/// Point-in-time engine status.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStatus {
    pub enabled: bool,
    pub dry_run: bool,
    pub rule_count: usize,
    pub enabled_rule_count: usize,
    pub execution_count: usize,
    pub pending_reviews: usize,
    pub active_executions: u32,
}

struct ThrottleBucket {
    last_run: Option<Instant>,
    /// Latest coalesced payload while a trailing run is pending.
    trailing_pending: Option<Arc<std::sync::Mutex<serde_json::Value>>>,
}

/// Process-wide automation engine backed by `automation/rules.json`.
pub struct AutomationEngine {
    rules: RwLock<HashMap<String, AutomationRule>>,
    store: Arc<JsonStore>,
    router: Arc<TaskRouter>,
    registry: Arc<AgentRegistry>,
    enabled: AtomicBool,
    dry_run: AtomicBool,
    executions: RwLock<VecDeque<ExecutionRecord>>,
    reviews: RwLock<VecDeque<ReviewItem>>,
    ordinals: Mutex<HashMap<String, u64>>,
    throttles: Mutex<HashMap<String, ThrottleBucket>>,
    active: Mutex<HashMap<String, u32>>,
}

impl AutomationEngine {
    pub fn new(
        store: Arc<JsonStore>,
        router: Arc<TaskRouter>,
        registry: Arc<AgentRegistry>,
    ) -> Arc<Self> {
        Arc::new(Self {
            rules: RwLock::new(HashMap::new()),
            store,
            router,
            registry,
            enabled: AtomicBool::new(true),
            dry_run: AtomicBool::new(false),
            executions: RwLock::new(VecDeque::new()),
            reviews: RwLock::new(VecDeque::new()),
            ordinals: Mutex::new(HashMap::new()),
            throttles: Mutex::new(HashMap::new()),
            active: Mutex::new(HashMap::new()),
        })
    }

    /// Seed rules from the persisted document.
    pub async fn load(&self) {
        let persisted: Vec<AutomationRule> = self.store.load_array();
        let mut rules = self.rules.write().await;
        for rule in persisted {
            rules.insert(rule.id.clone(), rule);
        }
        info!(count = rules.len(), "automation rules loaded");
    }

    /// Subscribe this engine to every event name on the bus.
    pub async fn attach(self: &Arc<Self>, bus: &EventBus) {
        bus.subscribe_all(Arc::new(AutomationSubscriber(self.clone()))).await;
    }

    // -- rule management ----------------------------------------------------

    pub async fn register_rule(&self, rule: AutomationRule) -> Result<(), AutomationError> {
        if rule.id.is_empty() {
            return Err(AutomationError::Invalid("rule id must not be empty".to_string()));
        }
        if rule.skill_id.is_empty() {
            return Err(AutomationError::Invalid(format!(
                "rule {}: skillId must not be empty",
                rule.id
            )));
        }
        for event in &rule.matcher.events {
            // Typos in persisted matchers are warnings, not hard errors.
            crate::services::event_bus::is_known_event(event);
        }
        let mut rules = self.rules.write().await;
        if rules.contains_key(&rule.id) {
            return Err(AutomationError::DuplicateId(rule.id));
        }
        rules.insert(rule.id.clone(), rule);
        self.persist_locked(&rules);
        Ok(())
    }

    pub async fn update_rule(&self, rule: AutomationRule) -> Result<(), AutomationError> {
        let mut rules = self.rules.write().await;
        if !rules.contains_key(&rule.id) {
            return Err(AutomationError::UnknownRule(rule.id));
        }
        rules.insert(rule.id.clone(), rule);
        self.persist_locked(&rules);
        Ok(())
    }

    pub async fn remove_rule(&self, id: &str) -> Result<(), AutomationError> {
        let mut rules = self.rules.write().await;
        if rules.remove(id).is_none() {
            return Err(AutomationError::UnknownRule(id.to_string()));
        }
        self.persist_locked(&rules);
        Ok(())
    }

    pub async fn list_rules(&self) -> Vec<AutomationRule> {
        let mut all: Vec<_> = self.rules.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    pub async fn get_rule(&self, id: &str) -> Option<AutomationRule> {
        self.rules.read().await.get(id).cloned()
    }

    /// Manually trigger a rule through the same pipeline, bypassing the
    /// matcher (and the throttle — a manual trigger is an explicit ask).
    pub async fn trigger_rule(
        self: &Arc<Self>,
        id: &str,
        data: serde_json::Value,
        dry_run: bool,
    ) -> Result<String, AutomationError> {
        let rule = self
            .get_rule(id)
            .await
            .ok_or_else(|| AutomationError::UnknownRule(id.to_string()))?;
        let execution_id = self
            .run_gated(rule, "manual", data, dry_run || self.dry_run.load(Ordering::Relaxed))
            .await;
        Ok(execution_id)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
        info!(enabled, "automation engine toggled");
    }

    pub fn set_dry_run(&self, dry_run: bool) {
        self.dry_run.store(dry_run, Ordering::SeqCst);
    }

    pub async fn get_status(&self) -> EngineStatus {
        let rules = self.rules.read().await;
        let active: u32 = self.active.lock().await.values().sum();
        EngineStatus {
            enabled: self.enabled.load(Ordering::SeqCst),
            dry_run: self.dry_run.load(Ordering::SeqCst),
            rule_count: rules.len(),
            enabled_rule_count: rules.values().filter(|r| r.enabled).count(),
            execution_count: self.executions.read().await.len(),
            pending_reviews: self
                .reviews
                .read()
                .await
                .iter()
                .filter(|r| r.status == ReviewStatus::Pending)
                .count(),
            active_executions: active,
        }
    }

    // -- history and reviews ------------------------------------------------

    pub async fn get_executions(&self, query: ExecutionQuery) -> Vec<ExecutionRecord> {
        let executions = self.executions.read().await;
        let mut matched: Vec<ExecutionRecord> = executions
            .iter()
            .rev()
            .filter(|e| query.rule_id.as_deref().is_none_or(|id| e.rule_id == id))
            .filter(|e| query.status.is_none_or(|s| e.status == s))
            .take(query.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect();
        matched.reverse();
        matched
    }

    pub async fn get_rule_stats(&self, rule_id: &str) -> RuleStats {
        let executions = self.executions.read().await;
        let mut stats = RuleStats {
            rule_id: rule_id.to_string(),
            ..RuleStats::default()
        };
        let mut duration_sum = 0u64;
        let mut duration_count = 0u64;

        for execution in executions.iter().filter(|e| e.rule_id == rule_id) {
            stats.total += 1;
            match execution.status {
                ExecutionStatus::Completed => stats.completed += 1,
                ExecutionStatus::Failed => stats.failed += 1,
                ExecutionStatus::Skipped => stats.skipped += 1,
                ExecutionStatus::Throttled => stats.throttled += 1,
                ExecutionStatus::Running | ExecutionStatus::Queued => stats.running += 1,
            }
            if let Some(d) = execution.duration_ms {
                duration_sum += d;
                duration_count += 1;
            }
            stats.last_triggered = Some(match stats.last_triggered {
                Some(prev) if prev > execution.started_at => prev,
                _ => execution.started_at,
            });
        }

        if duration_count > 0 {
            stats.avg_duration_ms = Some(duration_sum / duration_count);
        }
        let attempts = stats.completed + stats.failed;
        if attempts > 0 {
            stats.success_rate = stats.completed as f64 / attempts as f64;
        }
        stats
    }

    pub async fn pending_reviews(&self) -> Vec<ReviewItem> {
        self.reviews
            .read()
            .await
            .iter()
            .filter(|r| r.status == ReviewStatus::Pending)
            .cloned()
            .collect()
    }

    pub async fn resolve_review(
        &self,
        review_id: &str,
        status: ReviewStatus,
        notes: Option<String>,
    ) -> bool {
        let mut reviews = self.reviews.write().await;
        if let Some(item) = reviews.iter_mut().find(|r| r.id == review_id) {
            item.status = status;
            item.notes = notes;
            item.reviewed_at = Some(Utc::now());
            true
        } else {
            false
        }
    }

    // -- event pipeline -----------------------------------------------------

    async fn on_event(self: &Arc<Self>, event: &Event) {
        if !self.enabled.load(Ordering::SeqCst) {
            return;
        }

        let name = event.name();
        let data = event.data();

        let mut matching: Vec<AutomationRule> = {
            let rules = self.rules.read().await;
            rules
                .values()
                .filter(|r| r.enabled)
                .filter(|r| r.matcher.events.iter().any(|e| e == name))
                .filter(|r| filters_match(&r.matcher.filters, &data))
                .cloned()
                .collect()
        };
        if matching.is_empty() {
            return;
        }
        // Higher priority first; id as the stable tie-break.
        matching.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.id.cmp(&b.id)));

        for rule in matching {
            self.process_rule(rule, name, data.clone()).await;
        }
    }

    /// Phase a: throttle. Leading buckets run the first call per interval
    /// and record the rest as throttled; trailing buckets coalesce calls
    /// into one run at interval end.
    async fn process_rule(self: &Arc<Self>, rule: AutomationRule, event_name: &str, data: serde_json::Value) {
        let Some(throttle) = rule.throttle.clone() else {
            self.run_gated(rule, event_name, data, self.dry_run.load(Ordering::Relaxed))
                .await;
            return;
        };

        let bucket_key = bucket_key(&rule, &throttle.group_by, &data);
        let interval = Duration::from_millis(throttle.interval_ms);

        match throttle.mode {
            ThrottleMode::Leading => {
                let run_now = {
                    let mut buckets = self.throttles.lock().await;
                    let bucket = buckets.entry(bucket_key).or_insert(ThrottleBucket {
                        last_run: None,
                        trailing_pending: None,
                    });
                    let due = bucket
                        .last_run
                        .is_none_or(|at| at.elapsed() >= interval);
                    if due {
                        bucket.last_run = Some(Instant::now());
                    }
                    due
                };
                if run_now {
                    self.run_gated(rule, event_name, data, self.dry_run.load(Ordering::Relaxed))
                        .await;
                } else {
                    self.record_terminal(
                        &rule,
                        event_name,
                        &data,
                        ExecutionStatus::Throttled,
                        Some("throttled (leading)".to_string()),
                    )
                    .await;
                }
            }
            ThrottleMode::Trailing => {
                let pending = {
                    let mut buckets = self.throttles.lock().await;
                    let bucket = buckets.entry(bucket_key.clone()).or_insert(ThrottleBucket {
                        last_run: None,
                        trailing_pending: None,
                    });
                    match &bucket.trailing_pending {
                        Some(latest) => {
                            // Coalesce into the pending run.
                            if let Ok(mut guard) = latest.lock() {
                                *guard = data.clone();
                            }
                            None
                        }
                        None => {
                            let latest = Arc::new(std::sync::Mutex::new(data.clone()));
                            bucket.trailing_pending = Some(latest.clone());
                            Some(latest)
                        }
                    }
                };

                match pending {
                    Some(latest) => {
                        let engine = self.clone();
                        let event_name = event_name.to_string();
                        tokio::spawn(async move {
                            tokio::time::sleep(interval).await;
                            let data = {
                                let mut buckets = engine.throttles.lock().await;
                                if let Some(bucket) = buckets.get_mut(&bucket_key) {
                                    bucket.trailing_pending = None;
                                    bucket.last_run = Some(Instant::now());
                                }
                                latest.lock().map(|g| g.clone()).unwrap_or(serde_json::Value::Null)
                            };
                            if engine.enabled.load(Ordering::SeqCst) {
                                engine
                                    .run_gated(
                                        rule,
                                        &event_name,
                                        data,
                                        engine.dry_run.load(Ordering::Relaxed),
                                    )
                                    .await;
                            }
                        });
                    }
                    None => {
                        self.record_terminal(
                            &rule,
                            event_name,
                            &data,
                            ExecutionStatus::Throttled,
                            Some("coalesced into pending trailing run".to_string()),
                        )
                        .await;
                    }
                }
            }
        }
    }

    /// Phases b–e: concurrency gate, conditions, parameter resolution,
    /// dry-run short-circuit, then the dispatch/retry task. Returns the
    /// id of the first execution record written.
    async fn run_gated(
        self: &Arc<Self>,
        rule: AutomationRule,
        event_name: &str,
        data: serde_json::Value,
        dry_run: bool,
    ) -> String {
        // Phase b: per-rule concurrency. The slot is taken here, before
        // the worker task spawns, so a burst cannot slip past the gate.
        {
            let mut active = self.active.lock().await;
            let current = active.entry(rule.id.clone()).or_insert(0);
            if let Some(max) = rule.max_concurrent {
                if *current >= max {
                    drop(active);
                    return self
                        .record_terminal(
                            &rule,
                            event_name,
                            &data,
                            ExecutionStatus::Skipped,
                            Some(format!("max concurrent executions reached ({max})")),
                        )
                        .await;
                }
            }
            *current += 1;
        }

        // Phase c: conditions.
        if let Some(reason) = self.failed_condition(&rule).await {
            self.release_slot(&rule.id).await;
            return self
                .record_terminal(&rule, event_name, &data, ExecutionStatus::Skipped, Some(reason))
                .await;
        }

        // Phase d: parameter resolution.
        let params = resolve_params(&rule, &data);

        // Phase e: dry run records the resolved invocation without dispatching.
        if dry_run {
            self.release_slot(&rule.id).await;
            let execution_id = self.next_execution_id(&rule.id).await;
            let record = ExecutionRecord {
                id: execution_id.clone(),
                rule_id: rule.id.clone(),
                skill_id: rule.skill_id.clone(),
                trigger_event: event_name.to_string(),
                trigger_data: snapshot(&data),
                params,
                status: ExecutionStatus::Skipped,
                retry_attempt: 0,
                duration_ms: Some(0),
                started_at: Utc::now(),
                completed_at: Some(Utc::now()),
                error: None,
                task_id: None,
                result_summary: Some("[DRY RUN] resolved without dispatch".to_string()),
            };
            self.push_execution(record).await;
            return execution_id;
        }

        // Phase f/g run on a worker task so event delivery stays prompt.
        // The first record is pushed here so history order follows rule
        // evaluation order, not task scheduling.
        let first_execution_id = self.next_execution_id(&rule.id).await;
        self.push_execution(ExecutionRecord {
            id: first_execution_id.clone(),
            rule_id: rule.id.clone(),
            skill_id: rule.skill_id.clone(),
            trigger_event: event_name.to_string(),
            trigger_data: snapshot(&data),
            params: params.clone(),
            status: ExecutionStatus::Queued,
            retry_attempt: 0,
            duration_ms: None,
            started_at: Utc::now(),
            completed_at: None,
            error: None,
            task_id: None,
            result_summary: None,
        })
        .await;

        let engine = self.clone();
        let event_name = event_name.to_string();
        let first_id = first_execution_id.clone();
        tokio::spawn(async move {
            engine
                .dispatch_with_retry(rule, &event_name, data, params, first_id)
                .await;
        });
        first_execution_id
    }

    /// Phase f: route the task, retrying failures with exponential
    /// backoff (base 1 s, factor 2, jitter ±20%, cap 30 s). Each attempt
    /// leaves its own execution record with an increasing retry counter.
    async fn dispatch_with_retry(
        self: &Arc<Self>,
        rule: AutomationRule,
        event_name: &str,
        data: serde_json::Value,
        params: HashMap<String, String>,
        first_execution_id: String,
    ) {
        // The slot was taken in run_gated; this task owns its release.
        let mut backoff = ExponentialBackoff {
            initial_interval: RETRY_INITIAL,
            multiplier: RETRY_MULTIPLIER,
            randomization_factor: RETRY_JITTER,
            max_interval: RETRY_MAX,
            max_elapsed_time: None,
            ..ExponentialBackoff::default()
        };

        let mut attempt: u32 = 0;
        loop {
            let execution_id = if attempt == 0 {
                self.mark_running(&first_execution_id).await;
                first_execution_id.clone()
            } else {
                let execution_id = self.next_execution_id(&rule.id).await;
                self.push_execution(ExecutionRecord {
                    id: execution_id.clone(),
                    rule_id: rule.id.clone(),
                    skill_id: rule.skill_id.clone(),
                    trigger_event: event_name.to_string(),
                    trigger_data: snapshot(&data),
                    params: params.clone(),
                    status: ExecutionStatus::Running,
                    retry_attempt: attempt,
                    duration_ms: None,
                    started_at: Utc::now(),
                    completed_at: None,
                    error: None,
                    task_id: None,
                    result_summary: None,
                })
                .await;
                execution_id
            };

            let request = TaskRequest::new(rule.skill_id.clone(), params.clone())
                .with_task_id(format!("task-{execution_id}"))
                .with_context(format!("automation:{}", rule.id));

            let started = Instant::now();
            let result = self
                .router
                .route_with_overrides(request, &rule.target_agents, &rule.target_tags)
                .await;
            let duration_ms = started.elapsed().as_millis() as u64;

            let status = if result.success {
                ExecutionStatus::Completed
            } else {
                ExecutionStatus::Failed
            };
            let summary = if result.final_content.is_empty() {
                None
            } else {
                Some(truncate(&result.final_content, SUMMARY_LIMIT))
            };
            let agent_id = result.responses.first().map(|r| r.agent_id.clone());

            self.finish_execution(
                &execution_id,
                status,
                duration_ms,
                result.error.clone(),
                Some(result.task_id.clone()),
                summary,
            )
            .await;

            let needs_review =
                (status == ExecutionStatus::Completed && rule.require_review)
                    || (status == ExecutionStatus::Failed && rule.review_on_failure);
            if needs_review {
                self.push_review(ReviewItem {
                    id: Uuid::new_v4().to_string(),
                    execution_id: execution_id.clone(),
                    agent_id,
                    execution_status: status,
                    status: ReviewStatus::Pending,
                    duration_ms: Some(duration_ms),
                    notes: None,
                    reviewed_at: None,
                })
                .await;
            }

            if result.success || attempt >= rule.max_retries {
                if !result.success {
                    debug!(rule_id = %rule.id, attempts = attempt + 1, "retries exhausted");
                }
                break;
            }

            attempt += 1;
            let delay = backoff.next_backoff().unwrap_or(RETRY_MAX);
            debug!(rule_id = %rule.id, attempt, delay_ms = delay.as_millis() as u64, "scheduling retry");
            tokio::time::sleep(delay).await;
        }

        self.release_slot(&rule.id).await;
    }

    async fn release_slot(&self, rule_id: &str) {
        let mut active = self.active.lock().await;
        if let Some(count) = active.get_mut(rule_id) {
            *count = count.saturating_sub(1);
        }
    }

    async fn failed_condition(&self, rule: &AutomationRule) -> Option<String> {
        for condition in &rule.conditions {
            match condition.kind.as_str() {
                "min-agents" => {
                    let needed = condition.value.as_u64().unwrap_or(1) as usize;
                    let available = self.registry.find_available(None).await.len();
                    if available < needed {
                        return Some(format!(
                            "condition min-agents not met: {available} available, {needed} required"
                        ));
                    }
                }
                other => {
                    return Some(format!("unknown condition type: {other}"));
                }
            }
        }
        None
    }

    async fn next_execution_id(&self, rule_id: &str) -> String {
        let mut ordinals = self.ordinals.lock().await;
        let ordinal = ordinals.entry(rule_id.to_string()).or_insert(0);
        *ordinal += 1;
        format!("{rule_id}#{ordinal}")
    }

    async fn record_terminal(
        &self,
        rule: &AutomationRule,
        event_name: &str,
        data: &serde_json::Value,
        status: ExecutionStatus,
        message: Option<String>,
    ) -> String {
        let execution_id = self.next_execution_id(&rule.id).await;
        let now = Utc::now();
        self.push_execution(ExecutionRecord {
            id: execution_id.clone(),
            rule_id: rule.id.clone(),
            skill_id: rule.skill_id.clone(),
            trigger_event: event_name.to_string(),
            trigger_data: snapshot(data),
            params: HashMap::new(),
            status,
            retry_attempt: 0,
            duration_ms: Some(0),
            started_at: now,
            completed_at: Some(now),
            error: message,
            task_id: None,
            result_summary: None,
        })
        .await;
        execution_id
    }

    async fn mark_running(&self, execution_id: &str) {
        let mut executions = self.executions.write().await;
        if let Some(record) = executions.iter_mut().rev().find(|e| e.id == execution_id) {
            record.status = ExecutionStatus::Running;
            record.started_at = Utc::now();
        }
    }

    async fn push_execution(&self, record: ExecutionRecord) {
        let mut executions = self.executions.write().await;
        if executions.len() == EXECUTION_HISTORY_LIMIT {
            executions.pop_front();
        }
        executions.push_back(record);
    }

    async fn finish_execution(
        &self,
        execution_id: &str,
        status: ExecutionStatus,
        duration_ms: u64,
        error: Option<String>,
        task_id: Option<String>,
        result_summary: Option<String>,
    ) {
        let mut executions = self.executions.write().await;
        if let Some(record) = executions.iter_mut().rev().find(|e| e.id == execution_id) {
            record.status = status;
            record.duration_ms = Some(duration_ms);
            record.completed_at = Some(Utc::now());
            record.error = error;
            record.task_id = task_id;
            record.result_summary = result_summary;
        }
    }

    async fn push_review(&self, item: ReviewItem) {
        let mut reviews = self.reviews.write().await;
        if reviews.len() == REVIEW_QUEUE_LIMIT {
            reviews.pop_front();
        }
        reviews.push_back(item);
    }

    fn persist_locked(&self, rules: &HashMap<String, AutomationRule>) {
        let mut all: Vec<&AutomationRule> = rules.values().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        if let Err(e) = self.store.save_array(&all) {
            warn!(error = %e, "failed to persist automation rules");
        }
    }
}

/// Bus subscription wrapper; the spawning code paths need the engine
/// behind an `Arc`.
struct AutomationSubscriber(Arc<AutomationEngine>);

#[async_trait]
impl EventHandler for AutomationSubscriber {
    fn name(&self) -> &str {
        "automation-engine"
    }

    async fn handle(&self, event: &Event) {
        self.0.on_event(event).await;
    }
}

fn bucket_key(rule: &AutomationRule, group_by: &Option<String>, data: &serde_json::Value) -> String {
    match group_by {
        Some(field) => {
            let group = lookup_path(data, field)
                .map(value_to_string)
                .unwrap_or_default();
            format!("{}|{}", rule.id, group)
        }
        None => rule.id.clone(),
    }
}

/// All filter keys must equal the string-cast payload values.
fn filters_match(filters: &HashMap<String, String>, data: &serde_json::Value) -> bool {
    filters.iter().all(|(key, expected)| {
        lookup_path(data, key)
            .map(value_to_string)
            .is_some_and(|actual| actual == *expected)
    })
}

/// Resolve static and template parameters against the event payload.
fn resolve_params(rule: &AutomationRule, data: &serde_json::Value) -> HashMap<String, String> {
    let mut params = rule.static_params.clone();
    for (key, template) in &rule.template_params {
        params.insert(key.clone(), expand_event_template(template, data));
    }
    params
}

/// Expand `{event.<path>}` placeholders against the payload; missing
/// paths resolve to the empty string.
fn expand_event_template(template: &str, data: &serde_json::Value) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        match after.find('}') {
            Some(close) => {
                let key = &after[..close];
                if let Some(path) = key.strip_prefix("event.") {
                    if let Some(value) = lookup_path(data, path) {
                        out.push_str(&value_to_string(value));
                    }
                }
                rest = &after[close + 1..];
            }
            None => {
                out.push_str(&rest[open..]);
                return out;
            }
        }
    }

    out.push_str(rest);
    out
}

/// Dotted-path lookup into the payload.
fn lookup_path<'a>(data: &'a serde_json::Value, path: &str) -> Option<&'a serde_json::Value> {
    let mut current = data;
    for segment in path.split('.') {
        current = current.get(segment)?;
    }
    Some(current)
}

/// String-cast for filter comparison and template expansion.
fn value_to_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Payload snapshot for execution records; long string values truncated.
fn snapshot(data: &serde_json::Value) -> serde_json::Value {
    match data {
        serde_json::Value::Object(map) => {
            let truncated: serde_json::Map<String, serde_json::Value> = map
                .iter()
                .map(|(k, v)| {
                    let v = match v {
                        serde_json::Value::String(s) if s.len() > SNAPSHOT_VALUE_LIMIT => {
                            serde_json::Value::String(truncate(s, SNAPSHOT_VALUE_LIMIT))
                        }
                        other => other.clone(),
                    };
                    (k.clone(), v)
                })
                .collect();
            serde_json::Value::Object(truncated)
        }
        other => other.clone(),
    }
}

fn truncate(s: &str, limit: usize) -> String {
    if s.len() <= limit {
        s.to_string()
    } else {
        let mut cut = limit;
        while !s.is_char_boundary(cut) {
            cut -= 1;
        }
        format!("{}…", &s[..cut])
    }
}
