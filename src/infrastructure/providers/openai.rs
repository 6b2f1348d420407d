//! OpenAI-style chat-completions provider.
//!
//! Speaks the `/chat/completions` protocol over HTTPS. The base URL comes
//! from the agent's endpoint (http transport) or `OPENAI_API_BASE`; the
//! key from the provider config or `OPENAI_API_KEY`. Token usage is taken
//! from the API's `usage` block, so responses carry real counts.

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

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Configuration for the chat-completions provider.
#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    pub api_key: Option<String>,
    pub base_url: String,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            api_key: std::env::var("OPENAI_API_KEY").ok(),
            base_url: std::env::var("OPENAI_API_BASE")
                .unwrap_or_else(|_| DEFAULT_BASE_URL.to_string()),
        }
    }
}

/// Provider tag agents reference as `"openai"`.
pub struct OpenAiProvider {
    client: reqwest::Client,
    config: OpenAiConfig,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
    #[serde(default)]
    model: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

impl OpenAiProvider {
    pub fn new(config: OpenAiConfig) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| ProviderError::NotConfigured(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, config })
    }

    pub fn from_env() -> Result<Self, ProviderError> {
        Self::new(OpenAiConfig::default())
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
impl Provider for OpenAiProvider {
    fn id(&self) -> &str {
        "openai"
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
        max_tokens: Option<u32>,
        timeout: Duration,
    ) -> Result<ProviderReply, ProviderError> {
        let api_key = self
            .config
            .api_key
            .as_deref()
            .ok_or_else(|| ProviderError::Auth("OPENAI_API_KEY is not set".to_string()))?;

        let mut body = json!({
            "model": agent.model,
            "messages": [{ "role": "user", "content": prompt }],
        });
        if let Some(max) = max_tokens {
            body["max_tokens"] = json!(max);
        }

        let url = format!("{}/chat/completions", self.base_url(agent));
        debug!(agent_id = %agent.id, url = %url, "dispatching chat completion");

        let response = self
            .client
            .post(&url)
            .bearer_auth(api_key)
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

        let parsed: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Api(format!("malformed chat completion: {e}")))?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default();

        Ok(ProviderReply {
            content,
            usage: parsed.usage.map(|u| TokenUsage {
                input_tokens: u.prompt_tokens,
                output_tokens: u.completion_tokens,
            }),
            model: parsed.model,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent_with_endpoint(endpoint: &str) -> AgentConfig {
        let mut config = AgentConfig::new("gpt-1", "GPT One", "openai", "gpt-4o-mini");
        config.endpoint = endpoint.to_string();
        config
    }

    fn provider(base: &str) -> OpenAiProvider {
        OpenAiProvider::new(OpenAiConfig {
            api_key: Some("test-key".to_string()),
            base_url: base.to_string(),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_parses_content_and_usage() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/chat/completions")
            .match_header("authorization", "Bearer test-key")
            .with_status(200)
            .with_body(
                r#"{
                    "model": "gpt-4o-mini",
                    "choices": [{"message": {"role": "assistant", "content": "pong"}}],
                    "usage": {"prompt_tokens": 12, "completion_tokens": 3, "total_tokens": 15}
                }"#,
            )
            .create_async()
            .await;

        let reply = provider(&server.url())
            .send(
                &agent_with_endpoint(&server.url()),
                "ping",
                Some(64),
                Duration::from_secs(5),
            )
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(reply.content, "pong");
        let usage = reply.usage.unwrap();
        assert_eq!(usage.input_tokens, 12);
        assert_eq!(usage.output_tokens, 3);
        assert_eq!(usage.total(), 15);
    }

    #[tokio::test]
    async fn test_auth_errors_are_typed() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/chat/completions")
            .with_status(401)
            .with_body("bad key")
            .create_async()
            .await;

        let err = provider(&server.url())
            .send(
                &agent_with_endpoint(&server.url()),
                "ping",
                None,
                Duration::from_secs(5),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Auth(_)));
    }

    #[tokio::test]
    async fn test_missing_key_is_auth_error() {
        let provider = OpenAiProvider::new(OpenAiConfig {
            api_key: None,
            base_url: DEFAULT_BASE_URL.to_string(),
        })
        .unwrap();
        let err = provider
            .send(
                &agent_with_endpoint(""),
                "ping",
                None,
                Duration::from_secs(1),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Auth(_)));
    }
}
