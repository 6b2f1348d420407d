//! Provider dispatch port.
//!
//! A provider is the backend behind one or more agents: a local CLI
//! subprocess, an HTTPS chat-completions API, or a message-style API.
//! Every provider implements the same `send` operation; the router turns
//! its reply (or error) into a usage-annotated `AgentResponse` and never
//! lets provider failures escape past the dispatch boundary.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::models::AgentConfig;

/// How a provider bills usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BillingModel {
    /// Dollar-like cost derived from token counts.
    PerToken,
    /// Subscription billing counted in premium requests per invocation.
    PremiumRequest,
    /// No billing signal (local models, mocks).
    Free,
}

/// Wire protocol variant spoken by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProtocolVariant {
    /// Subprocess stdin/stdout.
    CliStdio,
    /// OpenAI-style `/chat/completions`.
    ChatCompletions,
    /// Anthropic-style `/messages`.
    Messages,
}

/// Capabilities declared at registration. Informational for the router
/// and the dashboard surface; they never change dispatch semantics.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderCapabilities {
    /// Provider reports real token counts in its replies.
    pub reports_token_counts: bool,
    pub streaming: bool,
    pub billing: BillingModel,
    /// Safe to dispatch to the same provider concurrently.
    pub concurrency_safe: bool,
    pub protocol: ProtocolVariant,
}

/// Token usage as reported by the provider, when available.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// Raw provider reply before the dispatch layer annotates usage and cost.
#[derive(Debug, Clone)]
pub struct ProviderReply {
    pub content: String,
    /// Real token counts when the provider reports them; `None` triggers
    /// the length heuristic.
    pub usage: Option<TokenUsage>,
    /// Model that actually served the request, if reported.
    pub model: Option<String>,
}

/// Error types for provider operations.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("provider not configured: {0}")]
    NotConfigured(String),

    #[error("provider unavailable: {0}")]
    Unavailable(String),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("dispatch cancelled")]
    Cancelled,

    #[error("authentication error: {0}")]
    Auth(String),

    #[error("rate limit exceeded: {0}")]
    RateLimited(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("provider returned an error: {0}")]
    Api(String),

    #[error("execution failed: {0}")]
    Execution(String),
}

/// Port trait implemented by every provider backend.
///
/// # Contract
///
/// - `send` must honour `timeout` by cancelling in-flight work (aborting
///   the HTTP request, killing the subprocess) and returning
///   `ProviderError::Timeout` rather than hanging.
/// - Errors are returned, never panicked; the dispatch layer folds them
///   into a failed `AgentResponse`.
/// - Implementations must be `Send + Sync` for concurrent dispatch.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Provider tag agents reference in their configuration
    /// (`cli`, `openai`, `anthropic`, ...).
    fn id(&self) -> &str;

    fn capabilities(&self) -> ProviderCapabilities;

    /// Send one prompt to the backend described by `agent`.
    async fn send(
        &self,
        agent: &AgentConfig,
        prompt: &str,
        max_tokens: Option<u32>,
        timeout: Duration,
    ) -> Result<ProviderReply, ProviderError>;
}
