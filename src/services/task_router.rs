//! Task router: strategy engine and per-agent dispatch gating.
//!
//! `route_task` resolves the skill's prompt template, selects candidate
//! agents from the registry, executes the skill's routing strategy, and
//! aggregates the per-agent responses into a `TaskResult`. The router
//! never returns an error: provider failures are isolated to their
//! dispatch's response, and strategy-level failure is `success == false`
//! on the result.
//!
//! Every dispatch acquires a registry slot (`record_task_start`) before
//! the provider call and releases it (`record_task_complete`) on every
//! exit path — success, provider error, timeout, and cancellation.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::domain::models::{
    estimate_tokens, AgentConfig, AgentInstance, AgentResponse, RoutingStrategy, SkillDefinition,
    TaskRequest, TaskResult,
};
use crate::domain::ports::{BillingModel, ProviderError};
use crate::infrastructure::providers::ProviderRegistry;
use crate::services::agent_registry::AgentRegistry;
use crate::services::event_bus::{Event, EventBus};
use crate::services::skill_store::SkillStore;

/// Separator between responses when a fan-out skill merges results.
pub const MERGE_SEPARATOR: &str = "\n\n---\n\n";

/// Score bonus per distinct skill category found in a response.
const CATEGORY_SCORE: i64 = 50;

/// Process-wide task router.
pub struct TaskRouter {
    registry: Arc<AgentRegistry>,
    skills: Arc<SkillStore>,
    providers: Arc<ProviderRegistry>,
    bus: Arc<EventBus>,
    /// Flipped once on graceful shutdown; cancels all in-flight dispatches.
    shutdown_tx: watch::Sender<bool>,
}

impl TaskRouter {
    pub fn new(
        registry: Arc<AgentRegistry>,
        skills: Arc<SkillStore>,
        providers: Arc<ProviderRegistry>,
        bus: Arc<EventBus>,
    ) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            registry,
            skills,
            providers,
            bus,
            shutdown_tx,
        })
    }

    /// Cancel every in-flight dispatch (graceful shutdown).
    pub fn cancel_all(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Route one task through its skill's strategy.
    pub async fn route_task(self: &Arc<Self>, request: TaskRequest) -> TaskResult {
        self.route_with_overrides(request, &[], &[]).await
    }

    /// Route with agent-selection overrides (used by the automation
    /// engine). Non-empty overrides replace the skill's own targets.
    pub async fn route_with_overrides(
        self: &Arc<Self>,
        mut request: TaskRequest,
        target_agents: &[String],
        target_tags: &[String],
    ) -> TaskResult {
        let started = Instant::now();

        let Some(skill) = self.skills.get(&request.skill_id).await else {
            warn!(task_id = %request.task_id, skill_id = %request.skill_id, "unknown skill");
            let result = TaskResult::failed(
                &request.task_id,
                &request.skill_id,
                format!("unknown skill: {}", request.skill_id),
            );
            self.publish_lifecycle(&request, 0, &result, started).await;
            return result;
        };

        let prompt = skill.render_prompt(&request.params);
        request.resolved_prompt = Some(prompt.clone());

        let candidates = self
            .select_candidates(&skill, target_agents, target_tags)
            .await;
        if candidates.is_empty() {
            warn!(task_id = %request.task_id, skill_id = %skill.id, "no eligible agents");
            let result =
                TaskResult::failed(&request.task_id, &request.skill_id, "no eligible agents");
            self.publish_lifecycle(&request, 0, &result, started).await;
            return result;
        }

        self.bus
            .publish(Event::TaskStarted {
                task_id: request.task_id.clone(),
                skill_id: skill.id.clone(),
                agent_count: candidates.len(),
            })
            .await;

        debug!(
            task_id = %request.task_id,
            strategy = skill.strategy.as_str(),
            candidates = candidates.len(),
            "executing strategy"
        );

        let (responses, final_content) = match skill.strategy {
            RoutingStrategy::Single => self.run_single(&skill, &prompt, candidates).await,
            RoutingStrategy::Race => self.run_race(&skill, &prompt, candidates).await,
            RoutingStrategy::FanOut => self.run_fan_out(&skill, &prompt, candidates).await,
            RoutingStrategy::Consensus => self.run_consensus(&skill, &prompt, candidates).await,
            RoutingStrategy::Fallback => self.run_fallback(&skill, &prompt, candidates).await,
            RoutingStrategy::CostOptimized => {
                self.run_cost_optimized(&skill, &prompt, candidates).await
            }
            RoutingStrategy::Evaluate => self.run_evaluate(&skill, &prompt, candidates).await,
        };

        let success = responses.iter().any(|r| r.success);
        let result = TaskResult::aggregate(
            &request.task_id,
            &skill.id,
            responses,
            final_content,
            success,
        );

        self.bus
            .publish(Event::TaskCompleted {
                task_id: request.task_id.clone(),
                skill_id: skill.id.clone(),
                success: result.success,
                total_tokens: result.total_tokens,
                total_cost_units: result.total_cost_units,
                duration_ms: started.elapsed().as_millis() as u64,
            })
            .await;

        info!(
            task_id = %request.task_id,
            success = result.success,
            tokens = result.total_tokens,
            "task routed"
        );
        result
    }

    async fn publish_lifecycle(
        &self,
        request: &TaskRequest,
        agent_count: usize,
        result: &TaskResult,
        started: Instant,
    ) {
        // Early failures keep the started/completed pairing intact.
        self.bus
            .publish(Event::TaskStarted {
                task_id: request.task_id.clone(),
                skill_id: request.skill_id.clone(),
                agent_count,
            })
            .await;
        self.bus
            .publish(Event::TaskCompleted {
                task_id: request.task_id.clone(),
                skill_id: request.skill_id.clone(),
                success: result.success,
                total_tokens: result.total_tokens,
                total_cost_units: result.total_cost_units,
                duration_ms: started.elapsed().as_millis() as u64,
            })
            .await;
    }

    /// Union of explicit ids and tag matches, intersected with available
    /// agents. Empty targeting selects every available agent.
    async fn select_candidates(
        &self,
        skill: &SkillDefinition,
        override_agents: &[String],
        override_tags: &[String],
    ) -> Vec<AgentInstance> {
        let (ids, tags): (&[String], &[String]) =
            if override_agents.is_empty() && override_tags.is_empty() {
                (&skill.target_agents, &skill.target_tags)
            } else {
                (override_agents, override_tags)
            };

        let available = self.registry.find_available(None).await;
        let mut candidates: Vec<AgentInstance> = if ids.is_empty() && tags.is_empty() {
            available
        } else {
            let id_set: HashSet<&String> = ids.iter().collect();
            available
                .into_iter()
                .filter(|a| id_set.contains(&a.config.id) || a.config.matches_any_tag(tags))
                .collect()
        };

        sort_by_cost(&mut candidates);
        candidates
    }

    /// One dispatch with full accounting. Returns a failed response (never
    /// an error) on provider failure, timeout, or cancellation.
    async fn dispatch_one(
        &self,
        config: &AgentConfig,
        skill: &SkillDefinition,
        prompt: &str,
        cancel: watch::Receiver<bool>,
    ) -> AgentResponse {
        let Some(provider) = self.providers.get(&config.provider) else {
            return AgentResponse::failure(
                &config.id,
                &config.model,
                format!("provider not registered: {}", config.provider),
            );
        };

        if let Err(e) = self.registry.record_task_start(&config.id).await {
            return AgentResponse::failure(&config.id, &config.model, e.to_string());
        }

        let timeout_dur = Duration::from_millis(skill.timeout_ms.unwrap_or(config.timeout_ms));
        let started = Instant::now();

        let shutdown = self.shutdown_tx.subscribe();
        let reply = tokio::select! {
            biased;
            () = wait_cancelled(cancel) => Err(ProviderError::Cancelled),
            () = wait_cancelled(shutdown) => Err(ProviderError::Cancelled),
            sent = timeout(timeout_dur, provider.send(config, prompt, skill.max_tokens, timeout_dur)) => {
                match sent {
                    Ok(inner) => inner,
                    Err(_) => Err(ProviderError::Timeout(timeout_dur)),
                }
            }
        };

        let latency_ms = started.elapsed().as_millis() as u64;
        let billing = provider.capabilities().billing;

        let response = match reply {
            Ok(reply) => {
                let (token_count, estimated) = match reply.usage {
                    Some(usage) => (usage.total(), false),
                    None => (estimate_tokens(prompt, &reply.content), true),
                };
                let (cost_units, premium_requests) = match billing {
                    BillingModel::PerToken => {
                        (config.cost_multiplier * token_count as f64 / 1_000_000.0, 0)
                    }
                    BillingModel::PremiumRequest => (0.0, 1),
                    BillingModel::Free => (0.0, 0),
                };
                AgentResponse {
                    agent_id: config.id.clone(),
                    model: reply.model.unwrap_or_else(|| config.model.clone()),
                    content: reply.content,
                    token_count,
                    token_count_estimated: estimated,
                    latency_ms,
                    cost_units,
                    premium_requests,
                    success: true,
                    error: None,
                    timestamp: Utc::now(),
                }
            }
            Err(e) => {
                let mut failure =
                    AgentResponse::failure(&config.id, &config.model, e.to_string());
                failure.latency_ms = latency_ms;
                failure
            }
        };

        if let Err(e) = self
            .registry
            .record_task_complete(
                &config.id,
                response.token_count,
                response.cost_units,
                response.success,
                response.premium_requests,
                response.token_count_estimated,
            )
            .await
        {
            warn!(agent_id = %config.id, error = %e, "failed to release dispatch slot");
        }

        response
    }

    /// Dispatch to every candidate in parallel; responses come back in
    /// candidate order. `cancel_tx`, when given, lets the caller cancel
    /// the stragglers (race).
    async fn dispatch_parallel(
        self: &Arc<Self>,
        skill: &SkillDefinition,
        prompt: &str,
        candidates: &[AgentInstance],
        cancel_on_first_success: bool,
    ) -> Vec<AgentResponse> {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let mut join_set = JoinSet::new();

        for (idx, candidate) in candidates.iter().enumerate() {
            let router = self.clone();
            let config = candidate.config.clone();
            let skill = skill.clone();
            let prompt = prompt.to_string();
            let cancel = cancel_rx.clone();
            join_set.spawn(async move {
                let response = router.dispatch_one(&config, &skill, &prompt, cancel).await;
                (idx, response)
            });
        }

        let mut slots: Vec<Option<AgentResponse>> = vec![None; candidates.len()];
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((idx, response)) => {
                    if cancel_on_first_success && response.success {
                        let _ = cancel_tx.send(true);
                    }
                    slots[idx] = Some(response);
                }
                Err(e) => warn!(error = %e, "dispatch task panicked"),
            }
        }

        slots.into_iter().flatten().collect()
    }

    async fn run_single(
        self: &Arc<Self>,
        skill: &SkillDefinition,
        prompt: &str,
        candidates: Vec<AgentInstance>,
    ) -> (Vec<AgentResponse>, String) {
        // Candidates arrive cost-sorted; the head is the pick.
        let chosen = &candidates[0];
        let (_, cancel_rx) = watch::channel(false);
        let response = self
            .dispatch_one(&chosen.config, skill, prompt, cancel_rx)
            .await;
        let final_content = response.content.clone();
        (vec![response], final_content)
    }

    async fn run_race(
        self: &Arc<Self>,
        skill: &SkillDefinition,
        prompt: &str,
        candidates: Vec<AgentInstance>,
    ) -> (Vec<AgentResponse>, String) {
        let responses = self
            .dispatch_parallel(skill, prompt, &candidates, true)
            .await;
        // Winner is the successful response with the lowest latency; the
        // cancelled losers are retained in the result.
        let final_content = responses
            .iter()
            .filter(|r| r.success)
            .min_by_key(|r| r.latency_ms)
            .map(|r| r.content.clone())
            .unwrap_or_default();
        (responses, final_content)
    }

    async fn run_fan_out(
        self: &Arc<Self>,
        skill: &SkillDefinition,
        prompt: &str,
        candidates: Vec<AgentInstance>,
    ) -> (Vec<AgentResponse>, String) {
        let responses = self
            .dispatch_parallel(skill, prompt, &candidates, false)
            .await;
        let final_content = merge_final_content(skill, &responses);
        (responses, final_content)
    }

    async fn run_consensus(
        self: &Arc<Self>,
        skill: &SkillDefinition,
        prompt: &str,
        candidates: Vec<AgentInstance>,
    ) -> (Vec<AgentResponse>, String) {
        let mut responses = self
            .dispatch_parallel(skill, prompt, &candidates, false)
            .await;

        let synthesizer = self.pick_synthesizer(skill, &candidates).await;
        let Some(synthesizer) = synthesizer else {
            // No synthesiser available: degrade to merged fan-out.
            let final_content = merge_final_content(skill, &responses);
            return (responses, final_content);
        };

        let mut synthesis_prompt = String::from(prompt);
        synthesis_prompt.push_str("\n\nResponses to synthesise:\n");
        for response in responses.iter().filter(|r| r.success) {
            synthesis_prompt.push_str(&format!(
                "\n--- Response from {} ---\n{}\n",
                response.agent_id, response.content
            ));
        }

        let (_, cancel_rx) = watch::channel(false);
        let synthesis = self
            .dispatch_one(&synthesizer.config, skill, &synthesis_prompt, cancel_rx)
            .await;
        let final_content = synthesis.content.clone();
        // The synthesiser's dispatch counts toward the task totals.
        responses.push(synthesis);
        (responses, final_content)
    }

    async fn pick_synthesizer(
        &self,
        skill: &SkillDefinition,
        candidates: &[AgentInstance],
    ) -> Option<AgentInstance> {
        if !skill.synthesizer_tags.is_empty() {
            let mut tagged = self
                .registry
                .find_available(Some(&skill.synthesizer_tags))
                .await;
            sort_by_cost(&mut tagged);
            if let Some(agent) = tagged.into_iter().next() {
                return Some(agent);
            }
        }
        candidates.first().cloned()
    }

    async fn run_fallback(
        self: &Arc<Self>,
        skill: &SkillDefinition,
        prompt: &str,
        candidates: Vec<AgentInstance>,
    ) -> (Vec<AgentResponse>, String) {
        self.run_sequential(skill, prompt, candidates, None).await
    }

    async fn run_cost_optimized(
        self: &Arc<Self>,
        skill: &SkillDefinition,
        prompt: &str,
        candidates: Vec<AgentInstance>,
    ) -> (Vec<AgentResponse>, String) {
        self.run_sequential(skill, prompt, candidates, skill.quality_threshold)
            .await
    }

    /// Try candidates one at a time in ascending cost order, stopping at
    /// the first acceptable response. Every attempt is retained.
    async fn run_sequential(
        self: &Arc<Self>,
        skill: &SkillDefinition,
        prompt: &str,
        candidates: Vec<AgentInstance>,
        quality_threshold: Option<u32>,
    ) -> (Vec<AgentResponse>, String) {
        let mut responses = Vec::with_capacity(candidates.len());
        let mut final_content = String::new();

        for candidate in &candidates {
            let (_, cancel_rx) = watch::channel(false);
            let response = self
                .dispatch_one(&candidate.config, skill, prompt, cancel_rx)
                .await;
            let acceptable = response.success
                && (!skill.fallback_on_empty || !response.content.is_empty())
                && quality_threshold
                    .is_none_or(|min| response.content.len() >= min as usize);
            let content = response.content.clone();
            responses.push(response);
            if acceptable {
                final_content = content;
                break;
            }
        }

        if final_content.is_empty() && quality_threshold.is_some() {
            // Quality never met: fall back to the best successful attempt.
            if let Some(best) = responses
                .iter()
                .filter(|r| r.success && !r.content.is_empty())
                .max_by_key(|r| r.content.len())
            {
                final_content = best.content.clone();
            }
        }

        (responses, final_content)
    }

    async fn run_evaluate(
        self: &Arc<Self>,
        skill: &SkillDefinition,
        prompt: &str,
        candidates: Vec<AgentInstance>,
    ) -> (Vec<AgentResponse>, String) {
        let responses = self
            .dispatch_parallel(skill, prompt, &candidates, false)
            .await;
        let final_content = responses
            .iter()
            .max_by_key(|r| score_response(r, &skill.categories))
            .map(|r| r.content.clone())
            .unwrap_or_default();
        (responses, final_content)
    }
}

/// Resolve once the cancel flag flips. Pends forever when the sender is
/// gone — a dispatch with no cancel source must never see a spurious
/// cancellation.
async fn wait_cancelled(mut rx: watch::Receiver<bool>) {
    if rx.wait_for(|cancelled| *cancelled).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Ascending cost; ties broken by the larger concurrency budget, then id.
fn sort_by_cost(candidates: &mut [AgentInstance]) {
    candidates.sort_by(|a, b| {
        a.config
            .cost_multiplier
            .partial_cmp(&b.config.cost_multiplier)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b.config.max_concurrency.cmp(&a.config.max_concurrency))
            .then_with(|| a.config.id.cmp(&b.config.id))
    });
}

fn merge_final_content(skill: &SkillDefinition, responses: &[AgentResponse]) -> String {
    if skill.merge_results {
        responses
            .iter()
            .filter(|r| r.success)
            .map(|r| r.content.as_str())
            .collect::<Vec<_>>()
            .join(MERGE_SEPARATOR)
    } else {
        responses
            .iter()
            .find(|r| r.success)
            .map(|r| r.content.clone())
            .unwrap_or_default()
    }
}

/// Length- and category-based score; failed responses always lose.
fn score_response(response: &AgentResponse, categories: &[String]) -> i64 {
    if !response.success {
        return -1;
    }
    let lowered = response.content.to_lowercase();
    let tokens: HashSet<&str> = lowered
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .collect();
    let category_hits = categories
        .iter()
        .filter(|c| tokens.contains(c.to_lowercase().as_str()))
        .count() as i64;
    response.content.len() as i64 + CATEGORY_SCORE * category_hits
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(success: bool, content: &str) -> AgentResponse {
        let mut r = AgentResponse::failure("a", "m", "err");
        r.success = success;
        r.content = content.to_string();
        if success {
            r.error = None;
        }
        r
    }

    #[test]
    fn test_sort_by_cost_tie_breaks() {
        let mut candidates = vec![
            AgentInstance::new(
                AgentConfig::new("b", "B", "cli", "m")
                    .with_cost_multiplier(1.0)
                    .with_max_concurrency(1),
            ),
            AgentInstance::new(
                AgentConfig::new("a", "A", "cli", "m")
                    .with_cost_multiplier(1.0)
                    .with_max_concurrency(4),
            ),
            AgentInstance::new(
                AgentConfig::new("c", "C", "cli", "m").with_cost_multiplier(0.5),
            ),
        ];
        sort_by_cost(&mut candidates);
        let ids: Vec<&str> = candidates.iter().map(AgentInstance::id).collect();
        assert_eq!(ids, vec!["c", "a", "b"]);
    }

    #[test]
    fn test_score_prefers_categories_over_raw_length() {
        let with_category = response(true, "the parser handles unicode");
        let longer_plain = response(true, "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa");
        let categories = vec!["parser".to_string(), "unicode".to_string()];
        assert!(
            score_response(&with_category, &categories)
                > score_response(&longer_plain, &categories)
        );
    }

    #[test]
    fn test_score_failure_always_loses() {
        let failed = response(false, "long long long long content");
        let short_ok = response(true, "");
        assert!(score_response(&short_ok, &[]) > score_response(&failed, &[]));
    }

    #[test]
    fn test_merge_joins_successes_only() {
        let skill = SkillDefinition::new("s", "S", "{x}", RoutingStrategy::FanOut)
            .with_merge_results(true);
        let responses = vec![
            response(true, "one"),
            response(false, "ignored"),
            response(true, "two"),
        ];
        assert_eq!(
            merge_final_content(&skill, &responses),
            format!("one{MERGE_SEPARATOR}two")
        );
    }
}
