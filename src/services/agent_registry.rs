//! Agent registry: lifecycle, concurrency accounting, persistence.
//!
//! The registry exclusively owns all `AgentInstance`s. Every mutation
//! routes through its methods (the serialisation point), configurations
//! are rewritten in full to `agents/agents.json` on change, and external
//! edits to that file are merged back in without disturbing runtime
//! state. The router borrows agents under the registry's
//! `active_tasks`/`max_concurrency` counters.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, RwLock};
use tracing::{info, warn};

use crate::domain::models::{
    AgentConfig, AgentConfigPatch, AgentHealth, AgentInstance, AgentState,
};
use crate::infrastructure::store::{JsonStore, StoreWatch};
use crate::services::event_bus::{Event, EventBus};

/// Error types for registry operations.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("agent id already registered: {0}")]
    DuplicateId(String),

    #[error("unknown agent: {0}")]
    UnknownAgent(String),

    #[error("agent {0} is at max concurrency")]
    AtCapacity(String),

    #[error("invalid agent config: {0}")]
    InvalidConfig(String),
}

/// Process-wide agent registry.
pub struct AgentRegistry {
    agents: RwLock<HashMap<String, AgentInstance>>,
    store: Arc<JsonStore>,
    bus: Arc<EventBus>,
}

impl AgentRegistry {
    pub fn new(store: Arc<JsonStore>, bus: Arc<EventBus>) -> Arc<Self> {
        Arc::new(Self {
            agents: RwLock::new(HashMap::new()),
            store,
            bus,
        })
    }

    /// Seed the registry from the persisted document (consulting the
    /// `.bak` sibling when the primary is missing or empty). Runtime
    /// state starts fresh; no events are emitted.
    pub async fn load(&self) {
        let configs: Vec<AgentConfig> = self.store.load_array_with_backup();
        let mut agents = self.agents.write().await;
        for config in configs {
            agents
                .entry(config.id.clone())
                .or_insert_with(|| AgentInstance::new(config));
        }
        info!(count = agents.len(), "agent registry loaded");
    }

    /// Register a new agent. Fails on duplicate id; persists and emits
    /// `agent:registered`.
    pub async fn register(&self, config: AgentConfig) -> Result<(), RegistryError> {
        if config.id.is_empty() {
            return Err(RegistryError::InvalidConfig("agent id must not be empty".to_string()));
        }
        if config.max_concurrency == 0 {
            return Err(RegistryError::InvalidConfig(format!(
                "agent {}: maxConcurrency must be positive",
                config.id
            )));
        }

        let event = {
            let mut agents = self.agents.write().await;
            if agents.contains_key(&config.id) {
                return Err(RegistryError::DuplicateId(config.id));
            }
            let event = Event::AgentRegistered {
                agent_id: config.id.clone(),
                name: config.name.clone(),
                provider: config.provider.clone(),
            };
            agents.insert(config.id.clone(), AgentInstance::new(config));
            self.persist_locked(&agents);
            event
        };

        self.bus.publish(event).await;
        Ok(())
    }

    /// Apply a partial config update. The id is immutable.
    pub async fn update(&self, id: &str, patch: AgentConfigPatch) -> Result<(), RegistryError> {
        let mut agents = self.agents.write().await;
        let instance = agents
            .get_mut(id)
            .ok_or_else(|| RegistryError::UnknownAgent(id.to_string()))?;
        patch.apply(&mut instance.config);
        self.persist_locked(&agents);
        Ok(())
    }

    /// Remove an agent; persists and emits `agent:unregistered`.
    pub async fn unregister(&self, id: &str) -> Result<(), RegistryError> {
        {
            let mut agents = self.agents.write().await;
            if agents.remove(id).is_none() {
                return Err(RegistryError::UnknownAgent(id.to_string()));
            }
            self.persist_locked(&agents);
        }
        self.bus
            .publish(Event::AgentUnregistered {
                agent_id: id.to_string(),
            })
            .await;
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Option<AgentInstance> {
        self.agents.read().await.get(id).cloned()
    }

    pub async fn get_all(&self) -> Vec<AgentInstance> {
        let mut all: Vec<_> = self.agents.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.config.id.cmp(&b.config.id));
        all
    }

    /// Agents whose tag set intersects `tags`.
    pub async fn find_by_tags(&self, tags: &[String]) -> Vec<AgentInstance> {
        self.agents
            .read()
            .await
            .values()
            .filter(|a| a.config.matches_any_tag(tags))
            .cloned()
            .collect()
    }

    pub async fn find_by_provider(&self, provider: &str) -> Vec<AgentInstance> {
        self.agents
            .read()
            .await
            .values()
            .filter(|a| a.config.provider == provider)
            .cloned()
            .collect()
    }

    /// Agents in `{idle, running}` with a free concurrency slot, matching
    /// any of the given tags if supplied.
    pub async fn find_available(&self, tags: Option<&[String]>) -> Vec<AgentInstance> {
        self.agents
            .read()
            .await
            .values()
            .filter(|a| a.is_available())
            .filter(|a| match tags {
                Some(tags) if !tags.is_empty() => a.config.matches_any_tag(tags),
                _ => true,
            })
            .cloned()
            .collect()
    }

    /// Force a lifecycle state (error/stopped transitions and recovery).
    pub async fn set_state(&self, id: &str, state: AgentState, error: Option<String>) -> Result<(), RegistryError> {
        let event = {
            let mut agents = self.agents.write().await;
            let instance = agents
                .get_mut(id)
                .ok_or_else(|| RegistryError::UnknownAgent(id.to_string()))?;
            let from = instance.state;
            instance.state = state;
            instance.last_activity = Some(Utc::now());
            if state == AgentState::Error {
                instance.last_error = error.clone();
            }
            (from != state).then(|| Event::AgentStateChanged {
                agent_id: id.to_string(),
                from,
                to: state,
                error,
            })
        };
        if let Some(event) = event {
            self.bus.publish(event).await;
        }
        Ok(())
    }

    /// Acquire a concurrency slot before dispatching. Transitions
    /// idle→running, and running→busy when the last slot is taken.
    pub async fn record_task_start(&self, id: &str) -> Result<(), RegistryError> {
        let event = {
            let mut agents = self.agents.write().await;
            let instance = agents
                .get_mut(id)
                .ok_or_else(|| RegistryError::UnknownAgent(id.to_string()))?;
            if instance.active_tasks >= instance.config.max_concurrency {
                return Err(RegistryError::AtCapacity(id.to_string()));
            }
            let from = instance.state;
            instance.active_tasks += 1;
            instance.last_activity = Some(Utc::now());
            instance.state = if instance.active_tasks >= instance.config.max_concurrency {
                AgentState::Busy
            } else {
                AgentState::Running
            };
            (from != instance.state).then(|| Event::AgentStateChanged {
                agent_id: id.to_string(),
                from,
                to: instance.state,
                error: None,
            })
        };
        if let Some(event) = event {
            self.bus.publish(event).await;
        }
        Ok(())
    }

    /// Release a slot and fold the dispatch's usage into the agent's
    /// accounting. Must be called on every exit path, including
    /// cancellation and timeout.
    pub async fn record_task_complete(
        &self,
        id: &str,
        tokens: u64,
        cost_units: f64,
        success: bool,
        premium_requests: u64,
        tokens_estimated: bool,
    ) -> Result<(), RegistryError> {
        let event = {
            let mut agents = self.agents.write().await;
            let instance = agents
                .get_mut(id)
                .ok_or_else(|| RegistryError::UnknownAgent(id.to_string()))?;
            let from = instance.state;

            instance.active_tasks = instance.active_tasks.saturating_sub(1);
            instance.total_tokens += tokens;
            instance.total_cost_units += cost_units;
            instance.premium_requests += premium_requests;
            if tokens_estimated {
                instance.tokens_estimated = true;
            }
            if success {
                instance.tasks_completed += 1;
            } else {
                instance.tasks_failed += 1;
            }
            instance.last_activity = Some(Utc::now());

            // Error and stopped are sticky until set_state clears them.
            if !matches!(instance.state, AgentState::Error | AgentState::Stopped) {
                instance.state = if instance.active_tasks == 0 {
                    AgentState::Idle
                } else {
                    AgentState::Running
                };
            }

            (from != instance.state).then(|| Event::AgentStateChanged {
                agent_id: id.to_string(),
                from,
                to: instance.state,
                error: None,
            })
        };
        if let Some(event) = event {
            self.bus.publish(event).await;
        }
        Ok(())
    }

    /// Health report for one agent, or all agents sorted by id.
    pub async fn get_health(&self, id: Option<&str>) -> Vec<AgentHealth> {
        let agents = self.agents.read().await;
        match id {
            Some(id) => agents.get(id).map(AgentInstance::health).into_iter().collect(),
            None => {
                let mut all: Vec<_> = agents.values().map(AgentInstance::health).collect();
                all.sort_by(|a, b| a.id.cmp(&b.id));
                all
            }
        }
    }

    pub async fn count(&self) -> usize {
        self.agents.read().await.len()
    }

    /// Number of agents with at least one in-flight dispatch.
    pub async fn active_count(&self) -> usize {
        self.agents
            .read()
            .await
            .values()
            .filter(|a| a.active_tasks > 0)
            .count()
    }

    /// Merge an externally edited document back in:
    /// - ids present in both keep their runtime state but adopt the new config;
    /// - new ids appear with fresh runtime state;
    /// - removed ids are dropped only while `active_tasks == 0`;
    /// - a reload that would wipe a non-empty registry is rejected.
    ///
    /// Reloads are non-emitting: no `agent:registered` events fire here.
    pub async fn reconcile_from_disk(&self) {
        let incoming: Vec<AgentConfig> = self.store.load_array();
        let mut agents = self.agents.write().await;

        if incoming.is_empty() && !agents.is_empty() {
            warn!("external edit would empty a non-empty agent registry, rejecting reload");
            return;
        }

        let incoming_ids: std::collections::HashSet<String> =
            incoming.iter().map(|c| c.id.clone()).collect();

        for config in incoming {
            match agents.get_mut(&config.id) {
                Some(existing) => existing.config = config,
                None => {
                    agents.insert(config.id.clone(), AgentInstance::new(config));
                }
            }
        }

        agents.retain(|id, instance| incoming_ids.contains(id) || instance.active_tasks > 0);
        info!(count = agents.len(), "agent registry reconciled from external edit");
    }

    /// Start watching the persisted document; external edits debounce and
    /// then call [`Self::reconcile_from_disk`]. Keep the returned handle
    /// alive for the watch's lifetime.
    pub fn start_watch(self: &Arc<Self>) -> Option<StoreWatch> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        match self.store.watch(tx) {
            Ok(watch) => {
                let registry = self.clone();
                tokio::spawn(async move {
                    while rx.recv().await.is_some() {
                        registry.reconcile_from_disk().await;
                    }
                });
                Some(watch)
            }
            Err(e) => {
                warn!(error = %e, "failed to watch agents document");
                None
            }
        }
    }

    fn persist_locked(&self, agents: &HashMap<String, AgentInstance>) {
        let mut configs: Vec<&AgentConfig> = agents.values().map(|a| &a.config).collect();
        configs.sort_by(|a, b| a.id.cmp(&b.id));
        if let Err(e) = self.store.save_array(&configs) {
            warn!(error = %e, "failed to persist agents document");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn registry(dir: &std::path::Path) -> Arc<AgentRegistry> {
        let store = JsonStore::new(dir.join("agents.json"));
        AgentRegistry::new(store, Arc::new(EventBus::new()))
    }

    fn config(id: &str) -> AgentConfig {
        AgentConfig::new(id, format!("Agent {id}"), "cli", "sonnet")
    }

    #[tokio::test]
    async fn test_register_duplicate_rejected() {
        let dir = tempdir().unwrap();
        let registry = registry(dir.path()).await;

        registry.register(config("a")).await.unwrap();
        let err = registry.register(config("a")).await.unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateId(_)));
        assert_eq!(registry.count().await, 1);
    }

    #[tokio::test]
    async fn test_state_machine_idle_running_busy() {
        let dir = tempdir().unwrap();
        let registry = registry(dir.path()).await;
        registry
            .register(config("a").with_max_concurrency(2))
            .await
            .unwrap();

        registry.record_task_start("a").await.unwrap();
        assert_eq!(registry.get("a").await.unwrap().state, AgentState::Running);

        registry.record_task_start("a").await.unwrap();
        assert_eq!(registry.get("a").await.unwrap().state, AgentState::Busy);

        let err = registry.record_task_start("a").await.unwrap_err();
        assert!(matches!(err, RegistryError::AtCapacity(_)));

        registry
            .record_task_complete("a", 10, 0.1, true, 0, false)
            .await
            .unwrap();
        assert_eq!(registry.get("a").await.unwrap().state, AgentState::Running);

        registry
            .record_task_complete("a", 5, 0.05, false, 0, true)
            .await
            .unwrap();
        let instance = registry.get("a").await.unwrap();
        assert_eq!(instance.state, AgentState::Idle);
        assert_eq!(instance.active_tasks, 0);
        assert_eq!(instance.tasks_completed, 1);
        assert_eq!(instance.tasks_failed, 1);
        assert_eq!(instance.total_tokens, 15);
        assert!(instance.tokens_estimated);
    }

    #[tokio::test]
    async fn test_complete_never_goes_negative() {
        let dir = tempdir().unwrap();
        let registry = registry(dir.path()).await;
        registry.register(config("a")).await.unwrap();

        registry
            .record_task_complete("a", 0, 0.0, true, 0, false)
            .await
            .unwrap();
        assert_eq!(registry.get("a").await.unwrap().active_tasks, 0);
    }

    #[tokio::test]
    async fn test_find_available_honours_tags_and_capacity() {
        let dir = tempdir().unwrap();
        let registry = registry(dir.path()).await;
        registry
            .register(config("a").with_tags(vec!["rust".to_string()]))
            .await
            .unwrap();
        registry
            .register(config("b").with_tags(vec!["docs".to_string()]))
            .await
            .unwrap();

        let tagged = registry
            .find_available(Some(&["rust".to_string()]))
            .await;
        assert_eq!(tagged.len(), 1);
        assert_eq!(tagged[0].id(), "a");

        registry.record_task_start("a").await.unwrap();
        let tagged = registry.find_available(Some(&["rust".to_string()])).await;
        assert!(tagged.is_empty(), "agent at capacity is not available");
    }

    #[tokio::test]
    async fn test_reconcile_merges_and_protects_active() {
        let dir = tempdir().unwrap();
        let store = JsonStore::new(dir.path().join("agents.json"));
        let registry = AgentRegistry::new(store.clone(), Arc::new(EventBus::new()));

        registry.register(config("x")).await.unwrap();
        registry.register(config("y")).await.unwrap();
        registry.record_task_start("y").await.unwrap();

        // External edit replaces the document with a single new agent.
        store.save_array(&[config("z")]).unwrap();
        registry.reconcile_from_disk().await;

        assert!(registry.get("x").await.is_none(), "inactive removed id is dropped");
        let y = registry.get("y").await.unwrap();
        assert_eq!(y.active_tasks, 1, "active agent keeps runtime state");
        assert!(registry.get("z").await.is_some(), "new id appears");
    }

    #[tokio::test]
    async fn test_reconcile_rejects_empty_wipe() {
        let dir = tempdir().unwrap();
        let store = JsonStore::new(dir.path().join("agents.json"));
        let registry = AgentRegistry::new(store.clone(), Arc::new(EventBus::new()));
        registry.register(config("a")).await.unwrap();

        store.save_array::<AgentConfig>(&[]).unwrap();
        registry.reconcile_from_disk().await;
        assert_eq!(registry.count().await, 1, "empty wipe is rejected");
    }
}
