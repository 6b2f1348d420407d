//! Skill domain model.
//!
//! A skill is a parameterised prompt template plus a routing strategy
//! telling the router how to fan the resolved prompt across agents.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// How a task is fanned across candidate agents and aggregated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RoutingStrategy {
    /// One dispatch to the cheapest candidate.
    Single,
    /// Parallel dispatch; first success wins, the rest are cancelled.
    Race,
    /// Parallel dispatch; all responses aggregated.
    FanOut,
    /// Fan-out, then a synthesiser agent merges the labelled responses.
    Consensus,
    /// Sequential attempts in ascending cost order until one succeeds.
    Fallback,
    /// Fallback that also stops once a response meets the quality bar.
    CostOptimized,
    /// Parallel dispatch; responses scored, top score wins.
    Evaluate,
}

impl Default for RoutingStrategy {
    fn default() -> Self {
        Self::Single
    }
}

impl RoutingStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Single => "single",
            Self::Race => "race",
            Self::FanOut => "fan-out",
            Self::Consensus => "consensus",
            Self::Fallback => "fallback",
            Self::CostOptimized => "cost-optimized",
            Self::Evaluate => "evaluate",
        }
    }

    pub fn parse_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "single" => Some(Self::Single),
            "race" => Some(Self::Race),
            "fan-out" | "fanout" => Some(Self::FanOut),
            "consensus" => Some(Self::Consensus),
            "fallback" => Some(Self::Fallback),
            "cost-optimized" | "cost_optimized" => Some(Self::CostOptimized),
            "evaluate" => Some(Self::Evaluate),
            _ => None,
        }
    }
}

/// Persisted skill definition (`skills/skills.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SkillDefinition {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Template with `{param}` placeholders, substituted literally.
    pub prompt_template: String,
    /// Explicit agent ids eligible for this skill.
    #[serde(default)]
    pub target_agents: Vec<String>,
    /// Tag set; an agent matching any tag is eligible.
    #[serde(default)]
    pub target_tags: Vec<String>,
    #[serde(default)]
    pub strategy: RoutingStrategy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_preferences: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Fan-out: concatenate all responses instead of taking the first success.
    #[serde(default)]
    pub merge_results: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default)]
    pub categories: Vec<String>,
    /// Consensus: tags selecting the synthesiser agent.
    #[serde(default)]
    pub synthesizer_tags: Vec<String>,
    /// Cost-optimized: minimum content length that counts as good enough.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality_threshold: Option<u32>,
    /// Fallback: treat empty content as a failure and try the next candidate.
    #[serde(default)]
    pub fallback_on_empty: bool,
}

impl SkillDefinition {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        prompt_template: impl Into<String>,
        strategy: RoutingStrategy,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            prompt_template: prompt_template.into(),
            target_agents: Vec::new(),
            target_tags: Vec::new(),
            strategy,
            model_preferences: None,
            max_tokens: None,
            timeout_ms: None,
            merge_results: false,
            version: None,
            categories: Vec::new(),
            synthesizer_tags: Vec::new(),
            quality_threshold: None,
            fallback_on_empty: false,
        }
    }

    pub fn with_target_tags(mut self, tags: Vec<String>) -> Self {
        self.target_tags = tags;
        self
    }

    pub fn with_target_agents(mut self, ids: Vec<String>) -> Self {
        self.target_agents = ids;
        self
    }

    pub fn with_merge_results(mut self, merge: bool) -> Self {
        self.merge_results = merge;
        self
    }

    pub fn with_categories(mut self, categories: Vec<String>) -> Self {
        self.categories = categories;
        self
    }

    /// Resolve the prompt template against a parameter map.
    pub fn render_prompt(&self, params: &HashMap<String, String>) -> String {
        render_template(&self.prompt_template, params)
    }
}

/// Literal `{key}` substitution. Missing keys resolve to the empty string
/// and are logged; no escape syntax, no printf semantics.
pub fn render_template(template: &str, params: &HashMap<String, String>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        match after.find('}') {
            Some(close) => {
                let key = &after[..close];
                match params.get(key) {
                    Some(value) => out.push_str(value),
                    None => {
                        warn!(param = %key, "template parameter missing, substituting empty string");
                    }
                }
                rest = &after[close + 1..];
            }
            None => {
                // Unterminated brace: keep the rest verbatim.
                out.push_str(&rest[open..]);
                return out;
            }
        }
    }

    out.push_str(rest);
    out
}
