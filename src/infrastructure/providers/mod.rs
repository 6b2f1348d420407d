//! Provider implementations and the provider registry.
//!
//! Providers register under a tag (`cli`, `openai`, `anthropic`); agents
//! reference the tag in their configuration, and the router resolves it
//! here at dispatch time.

pub mod anthropic;
pub mod cli;
pub mod openai;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::{info, warn};

use crate::domain::ports::{Provider, ProviderCapabilities};

pub use anthropic::{AnthropicConfig, AnthropicProvider};
pub use cli::CliProvider;
pub use openai::{OpenAiConfig, OpenAiProvider};

/// Tag → provider map. Capabilities are logged at registration and
/// queryable for the dashboard surface.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: RwLock<HashMap<String, Arc<dyn Provider>>>,
}

impl ProviderRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registry with every built-in provider registered. Providers whose
    /// credentials are absent still register; their dispatches fail with
    /// a typed auth error that stays isolated to the response.
    pub fn with_defaults() -> Arc<Self> {
        let registry = Self::new();
        registry.register(Arc::new(CliProvider::new()));
        match OpenAiProvider::from_env() {
            Ok(provider) => registry.register(Arc::new(provider)),
            Err(e) => warn!(error = %e, "openai provider not registered"),
        }
        match AnthropicProvider::from_env() {
            Ok(provider) => registry.register(Arc::new(provider)),
            Err(e) => warn!(error = %e, "anthropic provider not registered"),
        }
        registry
    }

    pub fn register(&self, provider: Arc<dyn Provider>) {
        let tag = provider.id().to_string();
        let caps = provider.capabilities();
        info!(
            provider = %tag,
            billing = ?caps.billing,
            protocol = ?caps.protocol,
            reports_tokens = caps.reports_token_counts,
            "provider registered"
        );
        if let Ok(mut providers) = self.providers.write() {
            providers.insert(tag, provider);
        }
    }

    pub fn get(&self, tag: &str) -> Option<Arc<dyn Provider>> {
        self.providers.read().ok()?.get(tag).cloned()
    }

    pub fn available(&self) -> Vec<String> {
        let mut tags: Vec<String> = self
            .providers
            .read()
            .map(|p| p.keys().cloned().collect())
            .unwrap_or_default();
        tags.sort();
        tags
    }

    pub fn capabilities(&self) -> Vec<(String, ProviderCapabilities)> {
        let mut caps: Vec<(String, ProviderCapabilities)> = self
            .providers
            .read()
            .map(|providers| {
                providers
                    .iter()
                    .map(|(tag, p)| (tag.clone(), p.capabilities()))
                    .collect()
            })
            .unwrap_or_default();
        caps.sort_by(|a, b| a.0.cmp(&b.0));
        caps
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_include_cli() {
        let registry = ProviderRegistry::with_defaults();
        assert!(registry.get("cli").is_some());
        assert!(registry.available().contains(&"cli".to_string()));
    }

    #[test]
    fn test_unknown_tag_is_none() {
        let registry = ProviderRegistry::new();
        assert!(registry.get("nope").is_none());
    }
}
