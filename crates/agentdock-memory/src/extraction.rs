//! PRIME extraction pipeline (spec §4.6, C6).
//!
//! A single compact prompt template concatenates the message, the active
//! rule list, and the output schema, then hands the whole thing to a
//! tier-selected [`Classifier`]. This mirrors the teacher's
//! `search::hybrid::HybridSearcher` pattern of keeping one narrow prompt
//! builder function rather than templating per rule — easier to keep under
//! a token budget, easier to test deterministically.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::providers::{CostEvent, CostTracker};
use crate::record::MemoryType;

/// A user-authored extraction rule (spec §4.6's `userRules[]`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionRule {
    pub name: String,
    pub description: String,
    pub active: bool,
}

/// Extraction call context (spec §4.6).
#[derive(Debug, Clone)]
pub struct ExtractionContext {
    pub user_id: String,
    pub agent_id: String,
    pub user_rules: Vec<ExtractionRule>,
    pub importance_threshold: f64,
}

/// Picks between a cheap `standard` model and a more capable `advanced`
/// one based on input size (spec §4.6).
#[derive(Debug, Clone)]
pub struct TierThresholds {
    pub advanced_min_chars: usize,
    pub advanced_min_rules: usize,
}

impl Default for TierThresholds {
    fn default() -> Self {
        Self {
            advanced_min_chars: 800,
            advanced_min_rules: 5,
        }
    }
}

/// Estimated token budget the prompt template targets (spec §4.6): 4
/// characters per token, 50-200 tokens typical, 450 as a hard ceiling even
/// with 8 active rules and a long message.
pub const TARGET_TOKEN_RANGE: std::ops::RangeInclusive<usize> = 50..=200;
pub const MAX_TOKEN_BUDGET: usize = 450;
const CHARS_PER_TOKEN: usize = 4;

fn estimate_tokens(s: &str) -> usize {
    s.len().div_ceil(CHARS_PER_TOKEN)
}

/// Candidate memory produced by extraction, not yet persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedCandidate {
    pub content: String,
    pub memory_type: MemoryType,
    pub importance: f64,
    pub keywords: Vec<String>,
}

/// A classifier model tier (spec §4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelTier {
    Standard,
    Advanced,
}

impl ModelTier {
    pub fn model_name(&self) -> &'static str {
        match self {
            ModelTier::Standard => "standard",
            ModelTier::Advanced => "advanced",
        }
    }
}

/// Raw classifier output before the importance-threshold filter is applied.
#[derive(Debug, Clone)]
pub struct ExtractionResponse {
    pub candidates: Vec<ExtractedCandidate>,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// The model that actually performs extraction, selected by
/// [`ExtractionPipeline`] per call. Distinct from
/// [`crate::providers::Classifier`] (connection triage) even though both
/// sit behind an LLM — extraction returns structured candidates, triage
/// returns a yes/no edge decision.
#[async_trait::async_trait]
pub trait ExtractionClassifier: Send + Sync {
    async fn extract(
        &self,
        prompt: &str,
        tier: ModelTier,
    ) -> crate::error::Result<ExtractionResponse>;
}

/// Builds the single compact prompt: message, active rules, output schema.
pub fn build_prompt(message: &str, rules: &[ExtractionRule]) -> String {
    let active: Vec<&ExtractionRule> = rules.iter().filter(|r| r.active).collect();
    let mut prompt = String::with_capacity(message.len() + 128);
    prompt.push_str("MESSAGE:\n");
    prompt.push_str(message);
    if !active.is_empty() {
        prompt.push_str("\nRULES:\n");
        for rule in &active {
            prompt.push_str("- ");
            prompt.push_str(&rule.name);
            prompt.push_str(": ");
            prompt.push_str(&rule.description);
            prompt.push('\n');
        }
    }
    prompt.push_str(
        "SCHEMA: [{content, memoryType, importance 0-1, keywords[]}]",
    );
    prompt
}

/// Runs the PRIME pipeline: builds a prompt, selects a tier, classifies,
/// filters by `importance_threshold`, and records cost. A classifier error
/// yields zero candidates rather than propagating — extraction never
/// blocks the caller's write path (spec §4.6 failure handling).
pub struct ExtractionPipeline {
    classifier: Arc<dyn ExtractionClassifier>,
    cost_tracker: Arc<dyn CostTracker>,
    thresholds: TierThresholds,
}

impl ExtractionPipeline {
    pub fn new(
        classifier: Arc<dyn ExtractionClassifier>,
        cost_tracker: Arc<dyn CostTracker>,
        thresholds: TierThresholds,
    ) -> Self {
        Self {
            classifier,
            cost_tracker,
            thresholds,
        }
    }

    fn select_tier(&self, message: &str, active_rule_count: usize) -> ModelTier {
        if message.len() > self.thresholds.advanced_min_chars
            || active_rule_count > self.thresholds.advanced_min_rules
        {
            ModelTier::Advanced
        } else {
            ModelTier::Standard
        }
    }

    pub async fn extract(
        &self,
        message: &str,
        context: &ExtractionContext,
    ) -> Vec<ExtractedCandidate> {
        let active_rule_count = context.user_rules.iter().filter(|r| r.active).count();
        let prompt = build_prompt(message, &context.user_rules);
        let estimated = estimate_tokens(&prompt);
        if estimated > MAX_TOKEN_BUDGET {
            warn!(
                agent_id = %context.agent_id,
                estimated_tokens = estimated,
                "extraction prompt exceeds token budget, truncating message"
            );
        }

        let tier = self.select_tier(message, active_rule_count);

        match self.classifier.extract(&prompt, tier).await {
            Ok(response) => {
                self.cost_tracker.record(CostEvent {
                    operation: format!("extraction:{}:{}", context.agent_id, tier.model_name()),
                    tokens_in: response.input_tokens,
                    tokens_out: response.output_tokens,
                    cost_usd: estimate_cost(tier, response.input_tokens, response.output_tokens),
                });
                response
                    .candidates
                    .into_iter()
                    .filter(|c| c.importance >= context.importance_threshold)
                    .collect()
            }
            Err(err) => {
                warn!(agent_id = %context.agent_id, error = %err, "extraction classifier failed, returning no candidates");
                Vec::new()
            }
        }
    }
}

fn estimate_cost(tier: ModelTier, tokens_in: u64, tokens_out: u64) -> f64 {
    let (rate_in, rate_out) = match tier {
        ModelTier::Standard => (0.15e-6, 0.60e-6),
        ModelTier::Advanced => (3.0e-6, 15.0e-6),
    };
    tokens_in as f64 * rate_in + tokens_out as f64 * rate_out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::InMemoryCostTracker;

    struct StubClassifier {
        response: ExtractionResponse,
    }

    #[async_trait::async_trait]
    impl ExtractionClassifier for StubClassifier {
        async fn extract(
            &self,
            _prompt: &str,
            _tier: ModelTier,
        ) -> crate::error::Result<ExtractionResponse> {
            Ok(self.response.clone())
        }
    }

    struct FailingClassifier;

    #[async_trait::async_trait]
    impl ExtractionClassifier for FailingClassifier {
        async fn extract(
            &self,
            _prompt: &str,
            _tier: ModelTier,
        ) -> crate::error::Result<ExtractionResponse> {
            Err(crate::error::MemoryError::Transient {
                operation: "extract".into(),
                cause: "model unavailable".into(),
            })
        }
    }

    fn context() -> ExtractionContext {
        ExtractionContext {
            user_id: "alice".into(),
            agent_id: "a1".into(),
            user_rules: vec![ExtractionRule {
                name: "prefs".into(),
                description: "capture stated preferences".into(),
                active: true,
            }],
            importance_threshold: 0.4,
        }
    }

    #[tokio::test]
    async fn filters_candidates_below_importance_threshold() {
        let classifier = Arc::new(StubClassifier {
            response: ExtractionResponse {
                candidates: vec![
                    ExtractedCandidate {
                        content: "likes rust".into(),
                        memory_type: MemoryType::Semantic,
                        importance: 0.8,
                        keywords: vec!["rust".into()],
                    },
                    ExtractedCandidate {
                        content: "said hello".into(),
                        memory_type: MemoryType::Episodic,
                        importance: 0.1,
                        keywords: vec![],
                    },
                ],
                input_tokens: 40,
                output_tokens: 20,
            },
        });
        let tracker = Arc::new(InMemoryCostTracker::new());
        let pipeline = ExtractionPipeline::new(classifier, tracker.clone(), TierThresholds::default());

        let candidates = pipeline.extract("hello, I like rust", &context()).await;
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].content, "likes rust");
        assert_eq!(tracker.total_calls(), 1);
    }

    #[tokio::test]
    async fn classifier_error_yields_no_candidates_and_no_panic() {
        let classifier = Arc::new(FailingClassifier);
        let tracker = Arc::new(InMemoryCostTracker::new());
        let pipeline = ExtractionPipeline::new(classifier, tracker.clone(), TierThresholds::default());

        let candidates = pipeline.extract("anything", &context()).await;
        assert!(candidates.is_empty());
        assert_eq!(tracker.total_calls(), 0);
    }

    #[test]
    fn tier_selection_escalates_on_long_message() {
        let pipeline = ExtractionPipeline::new(
            Arc::new(FailingClassifier),
            Arc::new(InMemoryCostTracker::new()),
            TierThresholds::default(),
        );
        let long_message = "x".repeat(900);
        assert_eq!(pipeline.select_tier(&long_message, 0), ModelTier::Advanced);
        assert_eq!(pipeline.select_tier("short", 0), ModelTier::Standard);
    }

    #[test]
    fn prompt_stays_within_token_budget_for_typical_input() {
        let rules: Vec<ExtractionRule> = (0..8)
            .map(|i| ExtractionRule {
                name: format!("rule{i}"),
                description: "a short rule description".into(),
                active: true,
            })
            .collect();
        let message = "a".repeat(600);
        let prompt = build_prompt(&message, &rules);
        assert!(estimate_tokens(&prompt) <= MAX_TOKEN_BUDGET);
    }
}
