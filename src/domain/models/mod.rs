//! Core domain models.

pub mod agent;
pub mod rule;
pub mod skill;
pub mod task;
pub mod workspace;

pub use agent::{AgentConfig, AgentConfigPatch, AgentHealth, AgentInstance, AgentState, TransportKind};
pub use rule::{
    AutomationRule, ExecutionRecord, ExecutionStatus, ReviewItem, ReviewStatus, RuleCondition,
    RuleMatcher, RuleStats, ThrottleMode, ThrottleSpec,
};
pub use skill::{render_template, RoutingStrategy, SkillDefinition};
pub use task::{estimate_tokens, AgentResponse, TaskRequest, TaskResult};
pub use workspace::{
    FileChange, GitActivity, GitEventKind, MonitorStopReason, RemoteRefChange, SessionSummary,
    WorkspaceHistoryEntry,
};
