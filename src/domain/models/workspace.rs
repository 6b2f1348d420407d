//! Workspace monitoring domain types.
//!
//! Records produced by the workspace monitor: git activity, file-change
//! buffers, mined chat-session summaries, and start/stop history.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of local git activity detected by the `.git` watchers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GitEventKind {
    /// `HEAD` changed to point at a different ref.
    BranchSwitch,
    /// A `refs/heads/<branch>` tip moved.
    Commit,
    /// `COMMIT_EDITMSG` was written.
    CommitMessage,
    /// A merge is in progress (`MERGE_HEAD` appeared).
    Merge,
    /// A rebase is in progress (`REBASE_HEAD` appeared).
    Rebase,
    /// `git fetch --all --prune` failed.
    FetchFailed,
}

impl GitEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BranchSwitch => "branch-switch",
            Self::Commit => "commit",
            Self::CommitMessage => "commit-message",
            Self::Merge => "merge",
            Self::Rebase => "rebase",
            Self::FetchFailed => "fetch-failed",
        }
    }
}

/// One observed git event, kept in the monitor's bounded buffer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitActivity {
    pub kind: GitEventKind,
    /// Branch name, commit subject, or error detail depending on `kind`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// How a remote-tracking ref changed across a fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteRefChange {
    Added,
    Changed,
    Deleted,
}

impl RemoteRefChange {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Added => "added",
            Self::Changed => "changed",
            Self::Deleted => "deleted",
        }
    }
}

/// One observed file change, kept in the monitor's bounded buffer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileChange {
    pub path: String,
    pub timestamp: DateTime<Utc>,
}

/// Metadata mined from a chat-session JSONL plus its `state.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default)]
    pub models: Vec<String>,
    #[serde(default)]
    pub request_count: u64,
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub error_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_request: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_request: Option<DateTime<Utc>>,
}

/// Why a workspace monitor stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MonitorStopReason {
    Manual,
    Shutdown,
    Error,
}

impl MonitorStopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Shutdown => "shutdown",
            Self::Error => "error",
        }
    }
}

/// Persisted entry in `config/workspace-history.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceHistoryEntry {
    pub path: String,
    pub started_at: DateTime<Utc>,
    pub stopped_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub reason: MonitorStopReason,
}
