//! Core services: event bus and log, registries, router, automation.

pub mod agent_registry;
pub mod automation;
pub mod event_bus;
pub mod event_log;
pub mod skill_store;
pub mod task_router;

pub use agent_registry::{AgentRegistry, RegistryError};
pub use automation::{AutomationEngine, AutomationError, EngineStatus, ExecutionQuery};
pub use event_bus::{Event, EventBus, EventHandler, ALL_EVENT_NAMES};
pub use event_log::{EventLog, EventLogEntry};
pub use skill_store::{SkillError, SkillStore};
pub use task_router::{TaskRouter, MERGE_SEPARATOR};
