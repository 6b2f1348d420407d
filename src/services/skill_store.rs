//! Skill store: CRUD over persisted skill definitions.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::domain::models::SkillDefinition;
use crate::infrastructure::store::JsonStore;
use crate::services::event_bus::{Event, EventBus};

/// Error types for skill operations.
#[derive(Debug, thiserror::Error)]
pub enum SkillError {
    #[error("skill id already registered: {0}")]
    DuplicateId(String),

    #[error("unknown skill: {0}")]
    UnknownSkill(String),

    #[error("invalid skill definition: {0}")]
    Invalid(String),
}

/// Process-wide skill store backed by `skills/skills.json`.
pub struct SkillStore {
    skills: RwLock<HashMap<String, SkillDefinition>>,
    store: Arc<JsonStore>,
    bus: Arc<EventBus>,
}

impl SkillStore {
    pub fn new(store: Arc<JsonStore>, bus: Arc<EventBus>) -> Arc<Self> {
        Arc::new(Self {
            skills: RwLock::new(HashMap::new()),
            store,
            bus,
        })
    }

    /// Seed from the persisted document; no events are emitted.
    pub async fn load(&self) {
        let defs: Vec<SkillDefinition> = self.store.load_array();
        let mut skills = self.skills.write().await;
        for def in defs {
            skills.insert(def.id.clone(), def);
        }
        info!(count = skills.len(), "skill store loaded");
    }

    pub async fn register(&self, skill: SkillDefinition) -> Result<(), SkillError> {
        if skill.id.is_empty() {
            return Err(SkillError::Invalid("skill id must not be empty".to_string()));
        }
        if skill.prompt_template.is_empty() {
            return Err(SkillError::Invalid(format!(
                "skill {}: promptTemplate must not be empty",
                skill.id
            )));
        }

        let event = {
            let mut skills = self.skills.write().await;
            if skills.contains_key(&skill.id) {
                return Err(SkillError::DuplicateId(skill.id));
            }
            let event = Event::SkillRegistered {
                skill_id: skill.id.clone(),
                name: skill.name.clone(),
            };
            skills.insert(skill.id.clone(), skill);
            self.persist_locked(&skills);
            event
        };
        self.bus.publish(event).await;
        Ok(())
    }

    /// Replace an existing definition wholesale; the id is immutable.
    pub async fn update(&self, skill: SkillDefinition) -> Result<(), SkillError> {
        let mut skills = self.skills.write().await;
        if !skills.contains_key(&skill.id) {
            return Err(SkillError::UnknownSkill(skill.id));
        }
        skills.insert(skill.id.clone(), skill);
        self.persist_locked(&skills);
        Ok(())
    }

    pub async fn remove(&self, id: &str) -> Result<(), SkillError> {
        {
            let mut skills = self.skills.write().await;
            if skills.remove(id).is_none() {
                return Err(SkillError::UnknownSkill(id.to_string()));
            }
            self.persist_locked(&skills);
        }
        self.bus
            .publish(Event::SkillRemoved {
                skill_id: id.to_string(),
            })
            .await;
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Option<SkillDefinition> {
        self.skills.read().await.get(id).cloned()
    }

    pub async fn get_all(&self) -> Vec<SkillDefinition> {
        let mut all: Vec<_> = self.skills.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    pub async fn count(&self) -> usize {
        self.skills.read().await.len()
    }

    fn persist_locked(&self, skills: &HashMap<String, SkillDefinition>) {
        let mut defs: Vec<&SkillDefinition> = skills.values().collect();
        defs.sort_by(|a, b| a.id.cmp(&b.id));
        if let Err(e) = self.store.save_array(&defs) {
            warn!(error = %e, "failed to persist skills document");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::RoutingStrategy;
    use tempfile::tempdir;

    fn skill(id: &str) -> SkillDefinition {
        SkillDefinition::new(id, format!("Skill {id}"), "{x}", RoutingStrategy::Single)
    }

    #[tokio::test]
    async fn test_crud_round_trip() {
        let dir = tempdir().unwrap();
        let store = JsonStore::new(dir.path().join("skills.json"));
        let skills = SkillStore::new(store.clone(), Arc::new(EventBus::new()));

        skills.register(skill("echo")).await.unwrap();
        assert!(skills.get("echo").await.is_some());

        // Persisted and reloadable.
        let reloaded = SkillStore::new(store, Arc::new(EventBus::new()));
        reloaded.load().await;
        assert_eq!(reloaded.count().await, 1);

        skills.remove("echo").await.unwrap();
        assert!(skills.get("echo").await.is_none());
    }

    #[tokio::test]
    async fn test_register_rejects_empty_template() {
        let dir = tempdir().unwrap();
        let skills = SkillStore::new(
            JsonStore::new(dir.path().join("skills.json")),
            Arc::new(EventBus::new()),
        );
        let mut bad = skill("bad");
        bad.prompt_template = String::new();
        assert!(matches!(
            skills.register(bad).await.unwrap_err(),
            SkillError::Invalid(_)
        ));
    }
}
