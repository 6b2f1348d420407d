//! Configuration: layered service settings and data-directory layout.
//!
//! Service tuning merges programmatic defaults, `maestro.yaml`, and
//! `MAESTRO_*` environment overrides. The data-directory layout honours
//! the public environment contract (`MCP_DATA_DIR` plus per-section
//! overrides) over a platform default.

use std::path::PathBuf;

use anyhow::{Context, Result};
use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration error types.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid log level: {0}. Must be one of: trace, debug, info, warn, error")]
    InvalidLogLevel(String),

    #[error("invalid log format: {0}. Must be one of: json, pretty")]
    InvalidLogFormat(String),

    #[error("invalid event ring capacity: {0}. Must be at least 1")]
    InvalidRingCapacity(usize),
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    pub format: LogFormat,
    /// When set, a daily-rotated JSON log file is written here too.
    pub log_dir: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            log_dir: None,
        }
    }
}

/// Service settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MaestroConfig {
    pub log: LogConfig,
    /// In-memory event ring size.
    pub event_ring_capacity: usize,
}

impl Default for MaestroConfig {
    fn default() -> Self {
        Self {
            log: LogConfig::default(),
            event_ring_capacity: 200,
        }
    }
}

/// Configuration loader with hierarchical merging.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Precedence (lowest to highest): programmatic defaults,
    /// `maestro.yaml`, `MAESTRO_*` environment variables.
    pub fn load() -> Result<MaestroConfig> {
        let config: MaestroConfig = Figment::new()
            .merge(Serialized::defaults(MaestroConfig::default()))
            .merge(Yaml::file("maestro.yaml"))
            .merge(Env::prefixed("MAESTRO_").split("__"))
            .extract()
            .context("failed to extract configuration")?;
        Self::validate(&config)?;
        Ok(config)
    }

    pub fn validate(config: &MaestroConfig) -> Result<(), ConfigError> {
        match config.log.level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            other => return Err(ConfigError::InvalidLogLevel(other.to_string())),
        }
        if config.event_ring_capacity == 0 {
            return Err(ConfigError::InvalidRingCapacity(0));
        }
        Ok(())
    }
}

/// Resolved on-disk layout for every persisted document.
#[derive(Debug, Clone)]
pub struct DataDirs {
    pub base: PathBuf,
    pub agents_file: PathBuf,
    pub skills_file: PathBuf,
    pub rules_file: PathBuf,
    pub monitors_file: PathBuf,
    pub history_file: PathBuf,
    pub events_file: PathBuf,
    pub state_dir: PathBuf,
    pub backup_dir: PathBuf,
    pub meta_dir: PathBuf,
}

impl DataDirs {
    /// Resolve the layout from the environment: `MCP_DATA_DIR` (or the
    /// platform data dir) as the base, with per-section directory
    /// overrides (`AGENTS_DIR`, `SKILLS_DIR`, ...).
    pub fn resolve() -> Self {
        let base = std::env::var_os("MCP_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                dirs::data_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join("maestro")
            });

        let section = |env: &str, default: &str| -> PathBuf {
            std::env::var_os(env)
                .map(PathBuf::from)
                .unwrap_or_else(|| base.join(default))
        };

        Self {
            agents_file: section("AGENTS_DIR", "agents").join("agents.json"),
            skills_file: section("SKILLS_DIR", "skills").join("skills.json"),
            rules_file: section("AUTOMATION_RULES_DIR", "automation").join("rules.json"),
            monitors_file: section("CONFIG_DIR", "config").join("monitors.json"),
            history_file: section("CONFIG_DIR", "config").join("workspace-history.json"),
            events_file: section("EVENT_LOG_DIR", "logs").join("events.jsonl"),
            state_dir: section("STATE_DIR", "state"),
            backup_dir: section("BACKUP_DIR", "backups"),
            meta_dir: section("META_DIR", "meta"),
            base,
        }
    }
}

/// `MCP_KEEP_ALIVE` ∈ {`persistent`, `1`, `true`} keeps the service
/// running with no active monitors or tool-plane.
pub fn keep_alive_from_env() -> bool {
    std::env::var("MCP_KEEP_ALIVE")
        .map(|v| matches!(v.as_str(), "persistent" | "1" | "true"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = MaestroConfig::default();
        assert!(ConfigLoader::validate(&config).is_ok());
        assert_eq!(config.event_ring_capacity, 200);
    }

    #[test]
    fn test_invalid_level_rejected() {
        let mut config = MaestroConfig::default();
        config.log.level = "verbose".to_string();
        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::InvalidLogLevel(_))
        ));
    }

    #[test]
    fn test_data_dirs_honour_env() {
        temp_env::with_vars(
            [
                ("MCP_DATA_DIR", Some("/tmp/maestro-data")),
                ("AGENTS_DIR", Some("/tmp/custom-agents")),
                ("SKILLS_DIR", None),
            ],
            || {
                let dirs = DataDirs::resolve();
                assert_eq!(dirs.base, PathBuf::from("/tmp/maestro-data"));
                assert_eq!(dirs.agents_file, PathBuf::from("/tmp/custom-agents/agents.json"));
                assert_eq!(
                    dirs.skills_file,
                    PathBuf::from("/tmp/maestro-data/skills/skills.json")
                );
            },
        );
    }

    #[test]
    fn test_keep_alive_values() {
        temp_env::with_var("MCP_KEEP_ALIVE", Some("persistent"), || {
            assert!(keep_alive_from_env());
        });
        temp_env::with_var("MCP_KEEP_ALIVE", Some("no"), || {
            assert!(!keep_alive_from_env());
        });
        temp_env::with_var("MCP_KEEP_ALIVE", None::<&str>, || {
            assert!(!keep_alive_from_env());
        });
    }
}
