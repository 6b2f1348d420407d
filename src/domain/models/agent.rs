//! Agent domain model.
//!
//! An agent is a registered handle to a language-model provider instance:
//! a persisted configuration plus runtime state (lifecycle, concurrency
//! counters, usage accounting) that is never written to disk.

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How the agent's backend is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Local subprocess speaking over stdin/stdout.
    Stdio,
    /// Raw TCP endpoint.
    Tcp,
    /// HTTPS API endpoint.
    Http,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stdio => "stdio",
            Self::Tcp => "tcp",
            Self::Http => "http",
        }
    }
}

/// Lifecycle state of a registered agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Idle,
    Starting,
    Running,
    Busy,
    Error,
    Stopped,
}

impl Default for AgentState {
    fn default() -> Self {
        Self::Idle
    }
}

impl AgentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Busy => "busy",
            Self::Error => "error",
            Self::Stopped => "stopped",
        }
    }

    pub fn parse_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "idle" => Some(Self::Idle),
            "starting" => Some(Self::Starting),
            "running" => Some(Self::Running),
            "busy" => Some(Self::Busy),
            "error" => Some(Self::Error),
            "stopped" => Some(Self::Stopped),
            _ => None,
        }
    }
}

fn default_max_concurrency() -> u32 {
    1
}

fn default_cost_multiplier() -> f64 {
    1.0
}

fn default_timeout_ms() -> u64 {
    120_000
}

/// Persisted agent configuration.
///
/// Field names follow the on-disk `agents/agents.json` document, which is
/// shared with external editors and peers; the id is immutable after
/// creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfig {
    pub id: String,
    pub name: String,
    /// Provider tag; must match a registered provider (`cli`, `openai`, ...).
    pub provider: String,
    pub model: String,
    #[serde(default = "AgentConfig::default_transport")]
    pub transport: TransportKind,
    /// Interpretation depends on `transport`: binary name for stdio,
    /// host:port for tcp, base URL for http.
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub argv: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: u32,
    #[serde(default = "default_cost_multiplier")]
    pub cost_multiplier: f64,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub can_mutate: bool,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binary_path: Option<String>,
    #[serde(default)]
    pub extra_args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
}

impl AgentConfig {
    fn default_transport() -> TransportKind {
        TransportKind::Stdio
    }

    /// Minimal constructor for programmatic registration; everything else
    /// takes the persisted-document defaults.
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        provider: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            provider: provider.into(),
            model: model.into(),
            transport: TransportKind::Stdio,
            endpoint: String::new(),
            argv: Vec::new(),
            env: HashMap::new(),
            max_concurrency: default_max_concurrency(),
            cost_multiplier: default_cost_multiplier(),
            tags: Vec::new(),
            can_mutate: false,
            timeout_ms: default_timeout_ms(),
            binary_path: None,
            extra_args: Vec::new(),
            working_dir: None,
        }
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn with_max_concurrency(mut self, max: u32) -> Self {
        self.max_concurrency = max.max(1);
        self
    }

    pub fn with_cost_multiplier(mut self, mult: f64) -> Self {
        self.cost_multiplier = mult.max(0.0);
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    /// True if any of the given tags appears in this agent's tag set.
    pub fn matches_any_tag(&self, tags: &[String]) -> bool {
        tags.iter().any(|t| self.tags.contains(t))
    }
}

/// Runtime instance wrapping a configuration. Owned exclusively by the
/// registry; never persisted.
#[derive(Debug, Clone)]
pub struct AgentInstance {
    pub config: AgentConfig,
    pub state: AgentState,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    /// Invariant: `0 <= active_tasks <= config.max_concurrency`.
    pub active_tasks: u32,
    pub total_tokens: u64,
    pub total_cost_units: f64,
    pub premium_requests: u64,
    /// True when token counts come from a length heuristic rather than
    /// the provider.
    pub tokens_estimated: bool,
    pub started_at: DateTime<Utc>,
    pub last_activity: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl AgentInstance {
    pub fn new(config: AgentConfig) -> Self {
        Self {
            config,
            state: AgentState::Idle,
            tasks_completed: 0,
            tasks_failed: 0,
            active_tasks: 0,
            total_tokens: 0,
            total_cost_units: 0.0,
            premium_requests: 0,
            tokens_estimated: false,
            started_at: Utc::now(),
            last_activity: None,
            last_error: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    /// Eligible to take another dispatch: idle or running with a free slot.
    pub fn is_available(&self) -> bool {
        matches!(self.state, AgentState::Idle | AgentState::Running)
            && self.active_tasks < self.config.max_concurrency
    }

    pub fn health(&self) -> AgentHealth {
        AgentHealth {
            id: self.config.id.clone(),
            name: self.config.name.clone(),
            provider: self.config.provider.clone(),
            state: self.state,
            active_tasks: self.active_tasks,
            max_concurrency: self.config.max_concurrency,
            tasks_completed: self.tasks_completed,
            tasks_failed: self.tasks_failed,
            total_tokens: self.total_tokens,
            total_cost_units: self.total_cost_units,
            premium_requests: self.premium_requests,
            tokens_estimated: self.tokens_estimated,
            last_activity: self.last_activity,
            last_error: self.last_error.clone(),
        }
    }
}

/// Point-in-time health report for one agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentHealth {
    pub id: String,
    pub name: String,
    pub provider: String,
    pub state: AgentState,
    pub active_tasks: u32,
    pub max_concurrency: u32,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub total_tokens: u64,
    pub total_cost_units: f64,
    pub premium_requests: u64,
    pub tokens_estimated: bool,
    pub last_activity: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Partial update applied by `update(id, partial)`. The id itself is
/// immutable; absent fields keep their current value.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfigPatch {
    pub name: Option<String>,
    pub model: Option<String>,
    pub endpoint: Option<String>,
    pub argv: Option<Vec<String>>,
    pub env: Option<HashMap<String, String>>,
    pub max_concurrency: Option<u32>,
    pub cost_multiplier: Option<f64>,
    pub tags: Option<Vec<String>>,
    pub can_mutate: Option<bool>,
    pub timeout_ms: Option<u64>,
    pub binary_path: Option<String>,
    pub extra_args: Option<Vec<String>>,
    pub working_dir: Option<PathBuf>,
}

impl AgentConfigPatch {
    pub fn apply(self, config: &mut AgentConfig) {
        if let Some(v) = self.name {
            config.name = v;
        }
        if let Some(v) = self.model {
            config.model = v;
        }
        if let Some(v) = self.endpoint {
            config.endpoint = v;
        }
        if let Some(v) = self.argv {
            config.argv = v;
        }
        if let Some(v) = self.env {
            config.env = v;
        }
        if let Some(v) = self.max_concurrency {
            config.max_concurrency = v.max(1);
        }
        if let Some(v) = self.cost_multiplier {
            config.cost_multiplier = v.max(0.0);
        }
        if let Some(v) = self.tags {
            config.tags = v;
        }
        if let Some(v) = self.can_mutate {
            config.can_mutate = v;
        }
        if let Some(v) = self.timeout_ms {
            config.timeout_ms = v;
        }
        if let Some(v) = self.binary_path {
            config.binary_path = Some(v);
        }
        if let Some(v) = self.extra_args {
            config.extra_args = v;
        }
        if let Some(v) = self.working_dir {
            config.working_dir = Some(v);
        }
    }
}
