//! Task, response, and result types.
//!
//! A task is one invocation of a skill; each selected agent produces an
//! `AgentResponse`, and the router aggregates them into a `TaskResult`
//! according to the skill's strategy.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One invocation of a skill.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRequest {
    pub task_id: String,
    pub skill_id: String,
    #[serde(default)]
    pub params: HashMap<String, String>,
    /// Set by the router after template substitution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_prompt: Option<String>,
    #[serde(default)]
    pub priority: i32,
    pub created_at: DateTime<Utc>,
    /// Free-form caller context (rule id, tool caller, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

impl TaskRequest {
    pub fn new(skill_id: impl Into<String>, params: HashMap<String, String>) -> Self {
        Self {
            task_id: Uuid::new_v4().to_string(),
            skill_id: skill_id.into(),
            params,
            resolved_prompt: None,
            priority: 0,
            created_at: Utc::now(),
            context: None,
        }
    }

    pub fn with_task_id(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = task_id.into();
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }
}

/// Per-agent, per-dispatch outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentResponse {
    pub agent_id: String,
    pub model: String,
    pub content: String,
    pub token_count: u64,
    /// True when `token_count` comes from the length heuristic.
    pub token_count_estimated: bool,
    pub latency_ms: u64,
    /// Provider-defined unit: dollar-like for per-token billing, zero for
    /// premium-request billing.
    pub cost_units: f64,
    #[serde(default)]
    pub premium_requests: u64,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl AgentResponse {
    /// A failed response carrying no usage, e.g. for dispatch-level errors
    /// (timeout, cancellation, unreachable provider).
    pub fn failure(agent_id: impl Into<String>, model: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            model: model.into(),
            content: String::new(),
            token_count: 0,
            token_count_estimated: false,
            latency_ms: 0,
            cost_units: 0.0,
            premium_requests: 0,
            success: false,
            error: Some(error.into()),
            timestamp: Utc::now(),
        }
    }
}

/// Aggregated outcome of one routed task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResult {
    pub task_id: String,
    pub skill_id: String,
    pub responses: Vec<AgentResponse>,
    /// Strategy-dependent selection or merge of the responses.
    pub final_content: String,
    pub total_tokens: u64,
    pub total_cost_units: f64,
    pub total_latency_ms: u64,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub completed_at: DateTime<Utc>,
}

impl TaskResult {
    /// A failed result with no dispatches (unknown skill, no candidates).
    pub fn failed(task_id: impl Into<String>, skill_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            skill_id: skill_id.into(),
            responses: Vec::new(),
            final_content: String::new(),
            total_tokens: 0,
            total_cost_units: 0.0,
            total_latency_ms: 0,
            success: false,
            error: Some(error.into()),
            completed_at: Utc::now(),
        }
    }

    /// Aggregate responses into a result; `final_content` and `success`
    /// are chosen by the strategy and passed in.
    pub fn aggregate(
        task_id: impl Into<String>,
        skill_id: impl Into<String>,
        responses: Vec<AgentResponse>,
        final_content: String,
        success: bool,
    ) -> Self {
        let total_tokens = responses.iter().map(|r| r.token_count).sum();
        let total_cost_units = responses.iter().map(|r| r.cost_units).sum();
        let total_latency_ms = responses.iter().map(|r| r.latency_ms).max().unwrap_or(0);
        Self {
            task_id: task_id.into(),
            skill_id: skill_id.into(),
            responses,
            final_content,
            total_tokens,
            total_cost_units,
            total_latency_ms,
            success,
            error: None,
            completed_at: Utc::now(),
        }
    }
}

/// Length heuristic used when a provider reports no token counts:
/// `ceil((|prompt| + |content|) / 4)`.
pub fn estimate_tokens(prompt: &str, content: &str) -> u64 {
    let chars = (prompt.len() + content.len()) as u64;
    chars.div_ceil(4)
}
