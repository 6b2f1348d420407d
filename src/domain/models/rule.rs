//! Automation rule domain model.
//!
//! Rules turn observed events into tasks. A rule pairs a matcher
//! (event-name set + payload filters) with a skill invocation, under
//! throttle, concurrency, retry, and condition policies. Every evaluation
//! leaves an `ExecutionRecord` in the engine's bounded history.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which events a rule reacts to and which payload fields must match.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleMatcher {
    /// Event names (`workspace:git-event`, `task:completed`, ...).
    #[serde(default)]
    pub events: Vec<String>,
    /// Payload field equality filters; values are compared string-cast.
    #[serde(default)]
    pub filters: HashMap<String, String>,
}

/// Throttle edge behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThrottleMode {
    /// First call in the interval runs; later calls are recorded throttled.
    Leading,
    /// Calls coalesce; one run fires when the interval elapses.
    Trailing,
}

impl Default for ThrottleMode {
    fn default() -> Self {
        Self::Leading
    }
}

/// Per-rule throttle policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThrottleSpec {
    pub interval_ms: u64,
    #[serde(default)]
    pub mode: ThrottleMode,
    /// Optional event-payload field whose value partitions the bucket,
    /// e.g. `path` to throttle per workspace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_by: Option<String>,
}

/// A gate evaluated before dispatch; any failure skips the execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleCondition {
    /// Condition kind, e.g. `min-agents`.
    #[serde(rename = "type")]
    pub kind: String,
    pub value: serde_json::Value,
}

fn default_enabled() -> bool {
    true
}

fn default_review_on_failure() -> bool {
    true
}

/// Persisted automation rule (`automation/rules.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutomationRule {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Higher priority wins tie-breaks when several rules match one event.
    #[serde(default)]
    pub priority: i32,
    pub matcher: RuleMatcher,
    pub skill_id: String,
    /// Parameters used verbatim.
    #[serde(default)]
    pub static_params: HashMap<String, String>,
    /// Parameters with `{event.<path>}` placeholders resolved against the
    /// triggering event's payload (dotted paths allowed).
    #[serde(default)]
    pub template_params: HashMap<String, String>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Agent-selection overrides applied on top of the skill's targets.
    #[serde(default)]
    pub target_agents: Vec<String>,
    #[serde(default)]
    pub target_tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub throttle: Option<ThrottleSpec>,
    /// Per-rule cap on concurrently running executions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrent: Option<u32>,
    /// Retries per execution attempt beyond the first.
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default)]
    pub conditions: Vec<RuleCondition>,
    /// Enqueue a review item on every completion.
    #[serde(default)]
    pub require_review: bool,
    /// Enqueue a review item on failure.
    #[serde(default = "default_review_on_failure")]
    pub review_on_failure: bool,
}

impl AutomationRule {
    pub fn new(id: impl Into<String>, name: impl Into<String>, skill_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            enabled: true,
            priority: 0,
            matcher: RuleMatcher::default(),
            skill_id: skill_id.into(),
            static_params: HashMap::new(),
            template_params: HashMap::new(),
            tags: Vec::new(),
            target_agents: Vec::new(),
            target_tags: Vec::new(),
            throttle: None,
            max_concurrent: None,
            max_retries: 0,
            conditions: Vec::new(),
            require_review: false,
            review_on_failure: true,
        }
    }

    pub fn on_events(mut self, events: Vec<String>) -> Self {
        self.matcher.events = events;
        self
    }

    pub fn with_filter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.matcher.filters.insert(key.into(), value.into());
        self
    }

    pub fn with_throttle(mut self, throttle: ThrottleSpec) -> Self {
        self.throttle = Some(throttle);
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

/// Status of one rule evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Skipped,
    Throttled,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Throttled => "throttled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Queued | Self::Running)
    }
}

/// One evaluation of a rule against an event (bounded history).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRecord {
    /// Derived from the rule id plus an ordinal, e.g. `nightly-review#42`.
    pub id: String,
    pub rule_id: String,
    pub skill_id: String,
    pub trigger_event: String,
    /// Snapshot of the triggering payload; long string values truncated.
    pub trigger_data: serde_json::Value,
    #[serde(default)]
    pub params: HashMap<String, String>,
    pub status: ExecutionStatus,
    #[serde(default)]
    pub retry_attempt: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_summary: Option<String>,
}

/// Review disposition of a completed or failed execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReviewStatus {
    Pending,
    Approved,
    Rejected,
    Flagged,
}

/// Queued item for human review of an automation outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewItem {
    pub id: String,
    pub execution_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    pub execution_status: ExecutionStatus,
    pub status: ReviewStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reviewed_at: Option<DateTime<Utc>>,
}

/// Aggregate statistics over a rule's retained executions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleStats {
    pub rule_id: String,
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub throttled: usize,
    pub running: usize,
    pub avg_duration_ms: Option<u64>,
    pub last_triggered: Option<DateTime<Utc>>,
    pub success_rate: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rule_defaults_from_sparse_json() {
        let rule: AutomationRule = serde_json::from_str(
            r#"{
                "id": "r1",
                "name": "on commit",
                "matcher": { "events": ["workspace:git-event"] },
                "skillId": "review"
            }"#,
        )
        .unwrap();
        assert!(rule.enabled);
        assert_eq!(rule.priority, 0);
        assert_eq!(rule.max_retries, 0);
        assert!(rule.review_on_failure);
        assert!(!rule.require_review);
        assert!(rule.throttle.is_none());
    }

    #[test]
    fn test_throttle_mode_default_is_leading() {
        let spec: ThrottleSpec = serde_json::from_str(r#"{"intervalMs": 1000}"#).unwrap();
        assert_eq!(spec.mode, ThrottleMode::Leading);
        assert!(spec.group_by.is_none());
    }

    #[test]
    fn test_execution_status_terminal() {
        assert!(ExecutionStatus::Completed.is_terminal());
        assert!(ExecutionStatus::Throttled.is_terminal());
        assert!(!ExecutionStatus::Running.is_terminal());
        assert!(!ExecutionStatus::Queued.is_terminal());
    }
}
