//! CLI subprocess provider.
//!
//! Dispatches a prompt by spawning the agent's configured binary, writing
//! the prompt to stdin, and collecting stdout until the process exits.
//! The dispatch timeout terminates the child: SIGTERM first, then a hard
//! kill after a short grace period. Children are also killed if the
//! dispatch future is dropped (race losers, shutdown).

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::domain::models::AgentConfig;
use crate::domain::ports::{
    BillingModel, ProtocolVariant, Provider, ProviderCapabilities, ProviderError, ProviderReply,
};

const KILL_GRACE: Duration = Duration::from_secs(2);

/// Provider tag agents reference as `"cli"`.
pub struct CliProvider;

impl CliProvider {
    pub fn new() -> Self {
        Self
    }

    fn build_command(agent: &AgentConfig) -> Result<Command, ProviderError> {
        let binary = agent
            .binary_path
            .as_deref()
            .filter(|b| !b.is_empty())
            .or_else(|| Some(agent.endpoint.as_str()).filter(|e| !e.is_empty()))
            .ok_or_else(|| {
                ProviderError::NotConfigured(format!(
                    "agent {} has neither binaryPath nor endpoint",
                    agent.id
                ))
            })?;

        let mut cmd = Command::new(binary);
        cmd.args(&agent.argv);
        cmd.args(&agent.extra_args);
        for (key, value) in &agent.env {
            cmd.env(key, value);
        }
        if let Some(ref dir) = agent.working_dir {
            cmd.current_dir(dir);
        }
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        Ok(cmd)
    }
}

impl Default for CliProvider {
    fn default() -> Self {
        Self::new()
    }
}

/// SIGTERM, short grace, then SIGKILL.
async fn terminate(child: &mut Child) {
    if let Some(pid) = child.id() {
        let _ = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        if timeout(KILL_GRACE, child.wait()).await.is_ok() {
            return;
        }
    }
    let _ = child.kill().await;
}

#[async_trait]
impl Provider for CliProvider {
    fn id(&self) -> &str {
        "cli"
    }

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities {
            reports_token_counts: false,
            streaming: false,
            billing: BillingModel::PremiumRequest,
            concurrency_safe: true,
            protocol: ProtocolVariant::CliStdio,
        }
    }

    async fn send(
        &self,
        agent: &AgentConfig,
        prompt: &str,
        _max_tokens: Option<u32>,
        timeout_dur: Duration,
    ) -> Result<ProviderReply, ProviderError> {
        let mut cmd = Self::build_command(agent)?;

        debug!(agent_id = %agent.id, "spawning CLI subprocess");
        let mut child = cmd
            .spawn()
            .map_err(|e| ProviderError::Unavailable(format!("failed to spawn {}: {e}", agent.id)))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| ProviderError::Execution("failed to open stdin".to_string()))?;
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| ProviderError::Execution("failed to open stdout".to_string()))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| ProviderError::Execution("failed to open stderr".to_string()))?;

        stdin
            .write_all(prompt.as_bytes())
            .await
            .map_err(|e| ProviderError::Execution(format!("failed to write prompt: {e}")))?;
        // Close stdin to signal end of input.
        drop(stdin);

        let child_ref = &mut child;
        let collect = async move {
            let mut output = String::new();
            stdout
                .read_to_string(&mut output)
                .await
                .map_err(|e| ProviderError::Execution(format!("failed to read stdout: {e}")))?;

            let mut errors = String::new();
            stderr
                .read_to_string(&mut errors)
                .await
                .map_err(|e| ProviderError::Execution(format!("failed to read stderr: {e}")))?;

            let status = child_ref
                .wait()
                .await
                .map_err(|e| ProviderError::Execution(format!("failed to wait for child: {e}")))?;

            Ok::<_, ProviderError>((output, errors, status))
        };

        let collected = timeout(timeout_dur, collect).await;
        match collected {
            Ok(Ok((output, errors, status))) => {
                if !errors.is_empty() {
                    warn!(agent_id = %agent.id, stderr = %errors.trim(), "CLI subprocess produced stderr");
                }
                if !status.success() {
                    return Err(ProviderError::Execution(format!(
                        "CLI exited with {:?}: {}",
                        status.code(),
                        errors.trim()
                    )));
                }
                Ok(ProviderReply {
                    content: output,
                    usage: None,
                    model: None,
                })
            }
            Ok(Err(e)) => {
                terminate(&mut child).await;
                Err(e)
            }
            Err(_) => {
                warn!(agent_id = %agent.id, "CLI subprocess timed out, terminating");
                terminate(&mut child).await;
                Err(ProviderError::Timeout(timeout_dur))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli_agent(binary: &str) -> AgentConfig {
        let mut config = AgentConfig::new("cli-1", "CLI One", "cli", "local");
        config.binary_path = Some(binary.to_string());
        config
    }

    #[tokio::test]
    async fn test_echo_round_trip() {
        let agent = cli_agent("cat");
        let reply = CliProvider::new()
            .send(&agent, "hello subprocess", None, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(reply.content, "hello subprocess");
        assert!(reply.usage.is_none());
    }

    #[tokio::test]
    async fn test_missing_binary_is_unavailable() {
        let agent = cli_agent("/definitely/not/a/binary");
        let err = CliProvider::new()
            .send(&agent, "hi", None, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Unavailable(_)));
    }

    #[tokio::test]
    async fn test_unconfigured_agent_rejected() {
        let agent = AgentConfig::new("cli-2", "CLI Two", "cli", "local");
        let err = CliProvider::new()
            .send(&agent, "hi", None, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::NotConfigured(_)));
    }

    #[tokio::test]
    async fn test_timeout_kills_child() {
        let mut agent = cli_agent("sleep");
        agent.argv = vec!["30".to_string()];
        let start = std::time::Instant::now();
        let err = CliProvider::new()
            .send(&agent, "", None, Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Timeout(_)));
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}
