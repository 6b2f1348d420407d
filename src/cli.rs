//! Command-line surface. Thin adapters over the library: inspection
//! commands read the persisted documents directly, and `serve` runs the
//! orchestration service.

use anyhow::Result;
use clap::{Parser, Subcommand};
use comfy_table::Table;

use crate::domain::models::{AgentConfig, AutomationRule, SkillDefinition};
use crate::infrastructure::config::DataDirs;
use crate::infrastructure::store::JsonStore;
use crate::services::EventLog;

#[derive(Debug, Parser)]
#[command(name = "maestro", about = "Multi-agent orchestration service", version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Emit JSON instead of tables.
    #[arg(long, global = true)]
    pub json: bool,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the orchestration service.
    Serve,
    /// Inspect registered agents.
    Agents {
        #[command(subcommand)]
        command: AgentsCommands,
    },
    /// Inspect registered skills.
    Skills {
        #[command(subcommand)]
        command: SkillsCommands,
    },
    /// Inspect automation rules.
    Rules {
        #[command(subcommand)]
        command: RulesCommands,
    },
    /// Inspect the event log.
    Events {
        #[command(subcommand)]
        command: EventsCommands,
    },
}

#[derive(Debug, Subcommand)]
pub enum AgentsCommands {
    /// List agent configurations.
    List,
}

#[derive(Debug, Subcommand)]
pub enum SkillsCommands {
    /// List skill definitions.
    List,
}

#[derive(Debug, Subcommand)]
pub enum RulesCommands {
    /// List automation rules.
    List,
}

#[derive(Debug, Subcommand)]
pub enum EventsCommands {
    /// Show the newest event log entries.
    Tail {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

pub fn handle_agents_list(dirs: &DataDirs, json: bool) -> Result<()> {
    let agents: Vec<AgentConfig> = JsonStore::new(&dirs.agents_file).load_array_with_backup();
    if json {
        println!("{}", serde_json::to_string_pretty(&agents)?);
        return Ok(());
    }
    let mut table = Table::new();
    table.set_header(vec!["ID", "Name", "Provider", "Model", "Tags", "Max", "Cost×"]);
    for agent in &agents {
        table.add_row(vec![
            agent.id.clone(),
            agent.name.clone(),
            agent.provider.clone(),
            agent.model.clone(),
            agent.tags.join(","),
            agent.max_concurrency.to_string(),
            format!("{:.2}", agent.cost_multiplier),
        ]);
    }
    println!("{table}");
    Ok(())
}

pub fn handle_skills_list(dirs: &DataDirs, json: bool) -> Result<()> {
    let skills: Vec<SkillDefinition> = JsonStore::new(&dirs.skills_file).load_array();
    if json {
        println!("{}", serde_json::to_string_pretty(&skills)?);
        return Ok(());
    }
    let mut table = Table::new();
    table.set_header(vec!["ID", "Name", "Strategy", "Targets", "Tags"]);
    for skill in &skills {
        table.add_row(vec![
            skill.id.clone(),
            skill.name.clone(),
            skill.strategy.as_str().to_string(),
            skill.target_agents.join(","),
            skill.target_tags.join(","),
        ]);
    }
    println!("{table}");
    Ok(())
}

pub fn handle_rules_list(dirs: &DataDirs, json: bool) -> Result<()> {
    let rules: Vec<AutomationRule> = JsonStore::new(&dirs.rules_file).load_array();
    if json {
        println!("{}", serde_json::to_string_pretty(&rules)?);
        return Ok(());
    }
    let mut table = Table::new();
    table.set_header(vec!["ID", "Name", "Enabled", "Priority", "Events", "Skill"]);
    for rule in &rules {
        table.add_row(vec![
            rule.id.clone(),
            rule.name.clone(),
            rule.enabled.to_string(),
            rule.priority.to_string(),
            rule.matcher.events.join(","),
            rule.skill_id.clone(),
        ]);
    }
    println!("{table}");
    Ok(())
}

pub async fn handle_events_tail(dirs: &DataDirs, limit: usize, json: bool) -> Result<()> {
    let log = EventLog::new(&dirs.events_file)?;
    let entries = log.get_recent_events(limit).await;
    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }
    let mut table = Table::new();
    table.set_header(vec!["Timestamp", "Event", "Data"]);
    for entry in &entries {
        table.add_row(vec![
            entry.ts.to_rfc3339(),
            entry.event.clone(),
            serde_json::to_string(&entry.data).unwrap_or_default(),
        ]);
    }
    println!("{table}");
    Ok(())
}
