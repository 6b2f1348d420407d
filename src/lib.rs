//! Maestro — multi-agent orchestration service.
//!
//! Operators register heterogeneous agents (CLI subprocesses,
//! chat-completions APIs, message-style APIs), define skills
//! (parameterised prompt templates with a routing strategy), and route
//! tasks across them. An automation engine turns observed events — git
//! activity, file changes, agent and task lifecycle — into new tasks
//! under throttling, concurrency, and retry policies.
//!
//! Core components:
//! - [`services::EventBus`] and [`services::EventLog`]: the typed event
//!   spine and its JSONL tail
//! - [`services::AgentRegistry`]: lifecycle, concurrency accounting, and
//!   crash-safe persistence with external-edit reconciliation
//! - [`services::TaskRouter`]: the strategy engine (single, race,
//!   fan-out, consensus, fallback, cost-optimized, evaluate)
//! - [`services::AutomationEngine`]: event→rule matching with throttle
//!   buckets, retries, and a bounded execution history
//! - [`monitor::MonitorManager`]: workspace watchers, remote-ref
//!   polling, and chat-session mining

/// Command-line surface.
pub mod cli;
/// Domain models and ports.
pub mod domain;
/// Configuration, persistence, logging, and provider backends.
pub mod infrastructure;
/// Workspace monitoring.
pub mod monitor;
/// Core orchestration services.
pub mod services;
