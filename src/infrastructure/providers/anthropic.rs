//! Anthropic-style messages provider.
//!
//! Speaks the `/v1/messages` protocol over HTTPS with `x-api-key`
//! authentication. Token usage comes from the API's `usage` block.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::domain::models::AgentConfig;
use crate::domain::ports::{
    BillingModel, ProtocolVariant, Provider, ProviderCapabilities, ProviderError, ProviderReply,
    TokenUsage,
};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 4096;

/// Configuration for the messages provider.
#[derive(Debug, Clone)]
pub struct AnthropicConfig {
    pub api_key: Option<String>,
    pub base_url: String,
}

impl Default for AnthropicConfig {
    fn default() -> Self {
        Self {
            api_key: std::env::var("ANTHROPIC_API_KEY").ok(),
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }
}

/// Provider tag agents reference as `"anthropic"`.
pub struct AnthropicProvider {
    client: reqwest::Client,
    config: AnthropicConfig,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
    #[serde(default)]
    usage: Option<MessagesUsage>,
    #[serde(default)]
    model: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessagesUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

impl AnthropicProvider {
    pub fn new(config: AnthropicConfig) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| ProviderError::NotConfigured(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, config })
    }

    pub fn from_env() -> Result<Self, ProviderError> {
        Self::new(AnthropicConfig::default())
    }

    fn base_url<'a>(&'a self, agent: &'a AgentConfig) -> &'a str {
        if !agent.endpoint.is_empty() {
            agent.endpoint.trim_end_matches('/')
        } else {
            self.config.base_url.trim_end_matches('/')
        }
    }
}

#[async_trait]
impl Provider for AnthropicProvider {
    fn id(&self) -> &str {
        "anthropic"
    }

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities {
            reports_token_counts: true,
            streaming: false,
            billing: BillingModel::PerToken,
            concurrency_safe: true,
            protocol: ProtocolVariant::Messages,
        }
    }

    async fn send(
        &self,
        agent: &AgentConfig,
        prompt: &str,
        max_tokens: Option<u32>,
        timeout: Duration,
    ) -> Result<ProviderReply, ProviderError> {
        let api_key = self
            .config
            .api_key
            .as_deref()
            .ok_or_else(|| ProviderError::Auth("ANTHROPIC_API_KEY is not set".to_string()))?;

        let body = json!({
            "model": agent.model,
            "max_tokens": max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            "messages": [{ "role": "user", "content": prompt }],
        });

        let url = format!("{}/v1/messages", self.base_url(agent));
        debug!(agent_id = %agent.id, url = %url, "dispatching message");

        let response = self
            .client
            .post(&url)
            .header("x-api-key", api_key)
            .header("anthropic-version", API_VERSION)
            .timeout(timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProviderError::Timeout(timeout)
                } else {
                    ProviderError::Network(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(match status.as_u16() {
                401 | 403 => ProviderError::Auth(detail),
                429 => ProviderError::RateLimited(detail),
                _ => ProviderError::Api(format!("HTTP {status}: {detail}")),
            });
        }

        let parsed: MessagesResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Api(format!("malformed messages response: {e}")))?;

        let content = parsed
            .content
            .into_iter()
            .filter_map(|block| block.text)
            .collect::<Vec<_>>()
            .join("");

        Ok(ProviderReply {
            content,
            usage: parsed.usage.map(|u| TokenUsage {
                input_tokens: u.input_tokens,
                output_tokens: u.output_tokens,
            }),
            model: parsed.model,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent_with_endpoint(endpoint: &str) -> AgentConfig {
        let mut config = AgentConfig::new("claude-1", "Claude One", "anthropic", "claude-sonnet-4-5");
        config.endpoint = endpoint.to_string();
        config
    }

    fn provider() -> AnthropicProvider {
        AnthropicProvider::new(AnthropicConfig {
            api_key: Some("test-key".to_string()),
            base_url: DEFAULT_BASE_URL.to_string(),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_parses_content_blocks_and_usage() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/messages")
            .match_header("x-api-key", "test-key")
            .match_header("anthropic-version", API_VERSION)
            .with_status(200)
            .with_body(
                r#"{
                    "model": "claude-sonnet-4-5",
                    "content": [{"type": "text", "text": "hello "}, {"type": "text", "text": "world"}],
                    "usage": {"input_tokens": 8, "output_tokens": 2}
                }"#,
            )
            .create_async()
            .await;

        let reply = provider()
            .send(
                &agent_with_endpoint(&server.url()),
                "hi",
                None,
                Duration::from_secs(5),
            )
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(reply.content, "hello world");
        assert_eq!(reply.usage.unwrap().total(), 10);
    }

    #[tokio::test]
    async fn test_rate_limit_is_typed() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v1/messages")
            .with_status(429)
            .with_body("slow down")
            .create_async()
            .await;

        let err = provider()
            .send(
                &agent_with_endpoint(&server.url()),
                "hi",
                None,
                Duration::from_secs(5),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::RateLimited(_)));
    }
}
