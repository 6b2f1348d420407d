//! Maestro service entry point.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::AsyncReadExt;
use tracing::{error, info};

use maestro::cli::{
    handle_agents_list, handle_events_tail, handle_rules_list, handle_skills_list, AgentsCommands,
    Cli, Commands, EventsCommands, RulesCommands, SkillsCommands,
};
use maestro::domain::models::MonitorStopReason;
use maestro::infrastructure::config::{keep_alive_from_env, ConfigLoader, DataDirs};
use maestro::infrastructure::logging;
use maestro::infrastructure::providers::ProviderRegistry;
use maestro::infrastructure::store::JsonStore;
use maestro::monitor::{MonitorConfig, MonitorManager};
use maestro::services::{
    AgentRegistry, AutomationEngine, EventBus, EventLog, SkillStore, TaskRouter,
};

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!(error = %e, "fatal error");
        eprintln!("maestro: {e:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    let config = ConfigLoader::load().context("failed to load configuration")?;
    let _logger = logging::init(&config.log).context("failed to initialise logging")?;
    let dirs = DataDirs::resolve();

    match cli.command {
        Commands::Serve => serve(&config, &dirs).await,
        Commands::Agents {
            command: AgentsCommands::List,
        } => handle_agents_list(&dirs, cli.json),
        Commands::Skills {
            command: SkillsCommands::List,
        } => handle_skills_list(&dirs, cli.json),
        Commands::Rules {
            command: RulesCommands::List,
        } => handle_rules_list(&dirs, cli.json),
        Commands::Events {
            command: EventsCommands::Tail { limit },
        } => handle_events_tail(&dirs, limit, cli.json).await,
    }
}

/// Assemble the components in dependency order, run until a shutdown
/// signal, then tear down in reverse.
async fn serve(config: &maestro::infrastructure::config::MaestroConfig, dirs: &DataDirs) -> Result<()> {
    info!(base = %dirs.base.display(), "starting maestro");

    let bus = Arc::new(EventBus::new());

    let event_log = EventLog::with_capacity(&dirs.events_file, config.event_ring_capacity)
        .context("failed to open event log")?;
    event_log.attach(&bus).await;

    let registry = AgentRegistry::new(JsonStore::new(&dirs.agents_file), bus.clone());
    registry.load().await;
    let _agents_watch = registry.start_watch();

    let skills = SkillStore::new(JsonStore::new(&dirs.skills_file), bus.clone());
    skills.load().await;

    let providers = ProviderRegistry::with_defaults();
    let router = TaskRouter::new(registry.clone(), skills.clone(), providers, bus.clone());

    let automation = AutomationEngine::new(
        JsonStore::new(&dirs.rules_file),
        router.clone(),
        registry.clone(),
    );
    automation.load().await;
    automation.attach(&bus).await;

    let monitors = MonitorManager::new(
        JsonStore::new(&dirs.monitors_file),
        JsonStore::new(&dirs.history_file),
        bus.clone(),
        MonitorConfig::from_env(),
    );
    monitors.restore().await;

    info!(
        agents = registry.count().await,
        skills = skills.count().await,
        "maestro ready"
    );

    wait_for_shutdown(keep_alive_from_env()).await;

    // Teardown in reverse order: in-flight work first, then the engines
    // that would create more, then the monitors (keeping monitors.json
    // so they restart next boot).
    info!("shutting down");
    automation.set_enabled(false);
    router.cancel_all();
    monitors.stop_all(MonitorStopReason::Shutdown, true).await;

    info!("shutdown complete");
    Ok(())
}

/// Resolve on SIGINT/SIGTERM; without keep-alive, stdin EOF (the host
/// closing the tool-plane) also shuts the service down.
async fn wait_for_shutdown(keep_alive: bool) {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let stdin_eof = async {
        if keep_alive {
            std::future::pending::<()>().await;
        }
        let mut stdin = tokio::io::stdin();
        let mut buf = [0u8; 1024];
        while let Ok(n) = stdin.read(&mut buf).await {
            if n == 0 {
                break;
            }
        }
    };

    tokio::select! {
        () = ctrl_c => info!("received interrupt"),
        () = terminate => info!("received terminate"),
        () = stdin_eof => info!("stdin closed"),
    }
}
