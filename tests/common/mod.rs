//! Shared test fixtures: a scriptable mock provider and a wired harness.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use maestro::domain::models::{AgentConfig, RoutingStrategy, SkillDefinition};
use maestro::domain::ports::{
    BillingModel, ProtocolVariant, Provider, ProviderCapabilities, ProviderError, ProviderReply,
    TokenUsage,
};
use maestro::infrastructure::providers::ProviderRegistry;
use maestro::infrastructure::store::JsonStore;
use maestro::services::{AgentRegistry, EventBus, SkillStore, TaskRouter};

/// Per-agent scripted behaviour for the mock provider.
#[derive(Debug, Clone)]
pub enum MockBehavior {
    /// Succeed with the prompt echoed back.
    Echo { tokens: u64, delay: Duration },
    /// Succeed with fixed content.
    Fixed {
        content: String,
        tokens: u64,
        delay: Duration,
    },
    /// Fail with a provider error.
    Fail { error: String },
}

/// Provider that dispatches according to per-agent scripts and records
/// the order agents were called in.
pub struct MockProvider {
    behaviors: Mutex<HashMap<String, MockBehavior>>,
    calls: Mutex<Vec<String>>,
}

impl MockProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            behaviors: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn script(&self, agent_id: &str, behavior: MockBehavior) {
        self.behaviors
            .lock()
            .unwrap()
            .insert(agent_id.to_string(), behavior);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Provider for MockProvider {
    fn id(&self) -> &str {
        "mock"
    }

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities {
            reports_token_counts: true,
            streaming: false,
            billing: BillingModel::PerToken,
            concurrency_safe: true,
            protocol: ProtocolVariant::ChatCompletions,
        }
    }

    async fn send(
        &self,
        agent: &AgentConfig,
        prompt: &str,
        _max_tokens: Option<u32>,
        _timeout: Duration,
    ) -> Result<ProviderReply, ProviderError> {
        self.calls.lock().unwrap().push(agent.id.clone());
        let behavior = self
            .behaviors
            .lock()
            .unwrap()
            .get(&agent.id)
            .cloned()
            .unwrap_or(MockBehavior::Echo {
                tokens: 10,
                delay: Duration::from_millis(1),
            });

        match behavior {
            MockBehavior::Echo { tokens, delay } => {
                tokio::time::sleep(delay).await;
                Ok(ProviderReply {
                    content: prompt.to_string(),
                    usage: Some(TokenUsage {
                        input_tokens: 0,
                        output_tokens: tokens,
                    }),
                    model: Some(agent.model.clone()),
                })
            }
            MockBehavior::Fixed {
                content,
                tokens,
                delay,
            } => {
                tokio::time::sleep(delay).await;
                Ok(ProviderReply {
                    content,
                    usage: Some(TokenUsage {
                        input_tokens: 0,
                        output_tokens: tokens,
                    }),
                    model: Some(agent.model.clone()),
                })
            }
            MockBehavior::Fail { error } => Err(ProviderError::Api(error)),
        }
    }
}

/// A fully wired router stack on a temp data directory.
pub struct Harness {
    pub bus: Arc<EventBus>,
    pub registry: Arc<AgentRegistry>,
    pub skills: Arc<SkillStore>,
    pub router: Arc<TaskRouter>,
    pub mock: Arc<MockProvider>,
    #[allow(dead_code)]
    pub dir: TempDir,
}

impl Harness {
    pub async fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let bus = Arc::new(EventBus::new());
        let registry = AgentRegistry::new(JsonStore::new(dir.path().join("agents.json")), bus.clone());
        let skills = SkillStore::new(JsonStore::new(dir.path().join("skills.json")), bus.clone());
        let providers = ProviderRegistry::new();
        let mock = MockProvider::new();
        providers.register(mock.clone());
        let router = TaskRouter::new(registry.clone(), skills.clone(), providers, bus.clone());
        Self {
            bus,
            registry,
            skills,
            router,
            mock,
            dir,
        }
    }

    /// Register a mock-backed agent.
    pub async fn add_agent(&self, id: &str, cost_multiplier: f64, tags: &[&str]) {
        let config = AgentConfig::new(id, format!("Agent {id}"), "mock", "mock-model")
            .with_cost_multiplier(cost_multiplier)
            .with_tags(tags.iter().map(|t| (*t).to_string()).collect())
            .with_max_concurrency(4);
        self.registry.register(config).await.unwrap();
    }

    /// Register a simple one-parameter skill.
    pub async fn add_skill(&self, id: &str, strategy: RoutingStrategy) -> SkillDefinition {
        let skill = SkillDefinition::new(id, format!("Skill {id}"), "{x}", strategy);
        self.skills.register(skill.clone()).await.unwrap();
        skill
    }
}

/// Handler that counts deliveries, for bus assertions.
pub struct CountingHandler {
    name: String,
    count: std::sync::atomic::AtomicU32,
}

impl CountingHandler {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            count: std::sync::atomic::AtomicU32::new(0),
        })
    }

    pub fn count(&self) -> u32 {
        self.count.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[async_trait]
impl maestro::services::EventHandler for CountingHandler {
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, _event: &maestro::services::Event) {
        self.count.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
    }
}

/// Parameter map shorthand.
pub fn params(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
        .collect()
}
