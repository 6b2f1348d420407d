//! Typed in-process event bus.
//!
//! The set of event names is closed: every event the system can emit is a
//! variant of [`Event`], and its wire name (`agent:registered`, ...) is
//! fixed. Delivery is synchronous within the publishing context — every
//! subscriber registered before `publish` was called has run before
//! `publish` returns — and FIFO per publisher. There is no retention;
//! non-subscribers miss the event. Handlers must not block the publisher
//! on long I/O: do the heavy work on a spawned task.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::domain::models::workspace::{GitEventKind, MonitorStopReason, RemoteRefChange};
use crate::domain::models::AgentState;

/// Every event name the bus can carry.
pub const ALL_EVENT_NAMES: &[&str] = &[
    "agent:registered",
    "agent:unregistered",
    "agent:state-changed",
    "task:started",
    "task:completed",
    "skill:registered",
    "skill:removed",
    "workspace:monitoring",
    "workspace:stopped",
    "workspace:file-changed",
    "workspace:session-updated",
    "workspace:git-event",
    "workspace:remote-update",
    "crossrepo:dispatched",
    "crossrepo:completed",
    "message:received",
];

/// Closed union of event payloads, keyed by event name.
///
/// Serialization yields the flat payload object (no tag); the name is
/// carried separately by [`Event::name`]. The event log and the
/// automation engine both consume the serialized shape, so payload
/// fields are part of the wire contract.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
#[serde(rename_all = "camelCase")]
pub enum Event {
    #[serde(rename_all = "camelCase")]
    AgentRegistered {
        agent_id: String,
        name: String,
        provider: String,
    },
    #[serde(rename_all = "camelCase")]
    AgentUnregistered { agent_id: String },
    #[serde(rename_all = "camelCase")]
    AgentStateChanged {
        agent_id: String,
        from: AgentState,
        to: AgentState,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    TaskStarted {
        task_id: String,
        skill_id: String,
        agent_count: usize,
    },
    #[serde(rename_all = "camelCase")]
    TaskCompleted {
        task_id: String,
        skill_id: String,
        success: bool,
        total_tokens: u64,
        total_cost_units: f64,
        duration_ms: u64,
    },
    #[serde(rename_all = "camelCase")]
    SkillRegistered { skill_id: String, name: String },
    #[serde(rename_all = "camelCase")]
    SkillRemoved { skill_id: String },
    #[serde(rename_all = "camelCase")]
    WorkspaceMonitoring { path: String },
    #[serde(rename_all = "camelCase")]
    WorkspaceStopped {
        path: String,
        reason: MonitorStopReason,
    },
    #[serde(rename_all = "camelCase")]
    WorkspaceFileChanged { path: String, file: String },
    #[serde(rename_all = "camelCase")]
    WorkspaceSessionUpdated {
        path: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    WorkspaceGitEvent {
        path: String,
        kind: GitEventKind,
        #[serde(skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    WorkspaceRemoteUpdate {
        path: String,
        #[serde(rename = "ref")]
        ref_name: String,
        change: RemoteRefChange,
    },
    #[serde(rename_all = "camelCase")]
    CrossRepoDispatched {
        source: String,
        target: String,
        task_id: String,
    },
    #[serde(rename_all = "camelCase")]
    CrossRepoCompleted {
        source: String,
        target: String,
        task_id: String,
        success: bool,
    },
    #[serde(rename_all = "camelCase")]
    MessageReceived {
        from: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        subject: Option<String>,
    },
}

impl Event {
    /// The wire name of this event.
    pub fn name(&self) -> &'static str {
        match self {
            Self::AgentRegistered { .. } => "agent:registered",
            Self::AgentUnregistered { .. } => "agent:unregistered",
            Self::AgentStateChanged { .. } => "agent:state-changed",
            Self::TaskStarted { .. } => "task:started",
            Self::TaskCompleted { .. } => "task:completed",
            Self::SkillRegistered { .. } => "skill:registered",
            Self::SkillRemoved { .. } => "skill:removed",
            Self::WorkspaceMonitoring { .. } => "workspace:monitoring",
            Self::WorkspaceStopped { .. } => "workspace:stopped",
            Self::WorkspaceFileChanged { .. } => "workspace:file-changed",
            Self::WorkspaceSessionUpdated { .. } => "workspace:session-updated",
            Self::WorkspaceGitEvent { .. } => "workspace:git-event",
            Self::WorkspaceRemoteUpdate { .. } => "workspace:remote-update",
            Self::CrossRepoDispatched { .. } => "crossrepo:dispatched",
            Self::CrossRepoCompleted { .. } => "crossrepo:completed",
            Self::MessageReceived { .. } => "message:received",
        }
    }

    /// Shape-preserving projection of the payload for filter matching and
    /// `{event.<path>}` template resolution.
    pub fn data(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// Subscriber callback. Implementations needing long I/O must hand the
/// work to a spawned task and return promptly.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Stable handler name, used in logs.
    fn name(&self) -> &str;

    async fn handle(&self, event: &Event);
}

struct Subscription {
    /// `None` subscribes to every event name.
    events: Option<HashSet<&'static str>>,
    handler: Arc<dyn EventHandler>,
}

/// Process-wide pub/sub hub. Owns no entity state.
#[derive(Default)]
pub struct EventBus {
    subscriptions: RwLock<Vec<Subscription>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe a handler to one event name.
    pub async fn subscribe(&self, event_name: &'static str, handler: Arc<dyn EventHandler>) {
        self.subscribe_many(&[event_name], handler).await;
    }

    /// Subscribe a handler to a set of event names.
    pub async fn subscribe_many(&self, event_names: &[&'static str], handler: Arc<dyn EventHandler>) {
        let events: HashSet<&'static str> = event_names.iter().copied().collect();
        debug!(handler = handler.name(), events = event_names.len(), "subscribing handler");
        self.subscriptions.write().await.push(Subscription {
            events: Some(events),
            handler,
        });
    }

    /// Subscribe a handler to every event name.
    pub async fn subscribe_all(&self, handler: Arc<dyn EventHandler>) {
        debug!(handler = handler.name(), "subscribing handler to all events");
        self.subscriptions.write().await.push(Subscription {
            events: None,
            handler,
        });
    }

    /// Deliver `event` to every matching subscriber before returning.
    pub async fn publish(&self, event: Event) {
        let name = event.name();
        match &event {
            Event::AgentStateChanged { agent_id, from, to, .. } => {
                debug!(event = name, agent_id = %agent_id, from = from.as_str(), to = to.as_str(), "publishing");
            }
            Event::TaskCompleted { task_id, success, .. } => {
                info!(event = name, task_id = %task_id, success = success, "publishing");
            }
            _ => debug!(event = name, "publishing"),
        }

        // Snapshot the matching handlers so a handler that subscribes or
        // publishes re-entrantly never contends with this delivery.
        let handlers: Vec<Arc<dyn EventHandler>> = {
            let subscriptions = self.subscriptions.read().await;
            subscriptions
                .iter()
                .filter(|sub| match &sub.events {
                    Some(set) => set.contains(name),
                    None => true,
                })
                .map(|sub| sub.handler.clone())
                .collect()
        };

        for handler in handlers {
            handler.handle(&event).await;
        }
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscriptions.read().await.len()
    }
}

/// Validate an event name against the closed set, warning on typos in
/// persisted rule matchers.
pub fn is_known_event(name: &str) -> bool {
    let known = ALL_EVENT_NAMES.contains(&name);
    if !known {
        warn!(event = name, "unknown event name");
    }
    known
}
