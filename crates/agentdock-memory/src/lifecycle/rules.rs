//! Decay/promotion/cleanup rule configuration and evaluation (spec §4.9).
//!
//! Canonical decay representation (SPEC_FULL §12 decision): every rule and
//! every record stores `half_life_days`, the quantity C3 ([`crate::decay`])
//! already consumes. A rule authored with the legacy `decay_rate_per_day`
//! field is converted once at construction via `ln(2) / rate`, so the rest
//! of the engine never branches on which representation a rule was
//! authored in.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::lifecycle::predicate::{parse_or_warn, Predicate};
use crate::record::{MemoryRecord, MemoryStatus, MemoryType};
use crate::storage::{require_memory, StorageProvider};

const LN_2: f64 = std::f64::consts::LN_2;

/// Converts a legacy per-day decay rate into the equivalent half-life.
pub fn decay_rate_to_half_life_days(decay_rate_per_day: f64) -> f64 {
    if decay_rate_per_day <= 0.0 {
        f64::INFINITY
    } else {
        LN_2 / decay_rate_per_day
    }
}

/// One ordered decay rule (spec §4.9). `condition` is parsed once at
/// construction; a malformed condition disables the rule (`enabled` is
/// forced `false` and a warning logged) rather than failing construction.
pub struct DecayRule {
    pub id: String,
    pub half_life_days: f64,
    pub min_importance: f64,
    pub never_decay: bool,
    pub enabled: bool,
    pub description: Option<String>,
    condition: Option<Predicate>,
}

impl DecayRule {
    /// Build a rule from its canonical half-life representation.
    pub fn new(id: impl Into<String>, condition_source: &str, half_life_days: f64) -> Self {
        let id = id.into();
        let condition = parse_or_warn(&id, condition_source);
        let enabled = condition.is_some();
        Self {
            id,
            half_life_days,
            min_importance: 0.0,
            never_decay: false,
            enabled,
            description: None,
            condition,
        }
    }

    /// Build a rule from the legacy `decayRate` (per-day fraction) field,
    /// converting to half-life per the §12 decision.
    pub fn from_decay_rate(id: impl Into<String>, condition_source: &str, decay_rate_per_day: f64) -> Self {
        Self::new(id, condition_source, decay_rate_to_half_life_days(decay_rate_per_day))
    }

    fn matches(&self, record: &MemoryRecord) -> bool {
        self.enabled
            && record.importance >= self.min_importance
            && self
                .condition
                .as_ref()
                .is_some_and(|p| p.evaluate(record))
    }
}

/// Ordered decay-rule set plus the fallback (spec §4.9: "if none match,
/// `defaultDecayRate` is used").
pub struct DecayRules {
    pub rules: Vec<DecayRule>,
    pub default_half_life_days: f64,
}

impl DecayRules {
    /// Resolve the half-life to use for `record`: first matching rule, in
    /// order, else the default.
    pub fn resolve_half_life(&self, record: &MemoryRecord) -> (f64, bool) {
        for rule in &self.rules {
            if rule.matches(record) {
                return (rule.half_life_days, rule.never_decay);
            }
        }
        (self.default_half_life_days, false)
    }
}

/// Promotion config: episodic → semantic (spec §4.9).
pub struct PromotionRule {
    pub episodic_to_semantic_days: i64,
    pub min_importance_for_promotion: f64,
    pub min_access_count_for_promotion: u64,
    pub preserve_original: bool,
    pub custom_condition: Option<Predicate>,
}

impl PromotionRule {
    pub fn new(
        episodic_to_semantic_days: i64,
        min_importance_for_promotion: f64,
        min_access_count_for_promotion: u64,
        preserve_original: bool,
    ) -> Self {
        Self {
            episodic_to_semantic_days,
            min_importance_for_promotion,
            min_access_count_for_promotion,
            preserve_original,
            custom_condition: None,
        }
    }

    pub fn with_custom_condition(mut self, rule_id: &str, source: &str) -> Self {
        self.custom_condition = parse_or_warn(rule_id, source);
        self
    }

    fn is_eligible(&self, record: &MemoryRecord, now: DateTime<Utc>) -> bool {
        if record.memory_type != MemoryType::Episodic {
            return false;
        }
        let age_days = (now - record.created_at).num_days();
        let base_eligible = age_days >= self.episodic_to_semantic_days
            && record.importance >= self.min_importance_for_promotion
            && record.access_count >= self.min_access_count_for_promotion;

        match &self.custom_condition {
            Some(predicate) => base_eligible && predicate.evaluate(record),
            None => base_eligible,
        }
    }
}

/// Cleanup config (spec §4.9).
pub struct CleanupConfig {
    pub delete_threshold: f64,
    pub archive_enabled: bool,
    pub archive_key_pattern: String,
    pub archive_ttl: chrono::Duration,
    pub max_memories_per_agent: Option<u64>,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            delete_threshold: 0.05,
            archive_enabled: true,
            archive_key_pattern: "archive:{agentId}:{memoryId}".to_string(),
            archive_ttl: chrono::Duration::days(90),
            max_memories_per_agent: Some(100_000),
        }
    }
}

impl CleanupConfig {
    pub fn archive_key(&self, agent_id: &str, memory_id: &str) -> String {
        self.archive_key_pattern
            .replace("{agentId}", agent_id)
            .replace("{memoryId}", memory_id)
    }
}

pub struct LifecycleConfig {
    pub decay: DecayRules,
    pub promotion: PromotionRule,
    pub cleanup: CleanupConfig,
}

/// Result of one promotion pass.
#[derive(Debug, Clone, Default)]
pub struct PromotionReport {
    pub promoted_ids: Vec<String>,
}

/// Result of one cleanup pass.
#[derive(Debug, Clone, Default)]
pub struct CleanupReport {
    pub archived_ids: Vec<String>,
    pub deleted_ids: Vec<String>,
    pub evicted_for_quota_ids: Vec<String>,
}

/// Runs promotion and cleanup cycles over a tenant's records. Decay itself
/// is applied inline by [`crate::recall::RecallService`] via
/// [`DecayRules::resolve_half_life`] feeding [`crate::decay::decay`]; this
/// engine owns the two cycles that run independently of a recall call.
pub struct LifecycleEngine {
    provider: Arc<dyn StorageProvider>,
    config: LifecycleConfig,
}

impl LifecycleEngine {
    pub fn new(provider: Arc<dyn StorageProvider>, config: LifecycleConfig) -> Self {
        Self { provider, config }
    }

    pub async fn run_promotion(&self, user_id: &str, agent_id: &str) -> Result<PromotionReport> {
        let memory_store = require_memory(self.provider.as_ref())?;
        let now = Utc::now();
        let candidates = memory_store
            .recall(user_id, agent_id, "", Some(MemoryType::Episodic), usize::MAX)
            .await?;

        let mut report = PromotionReport::default();
        for record in candidates {
            if !self.config.promotion.is_eligible(&record, now) {
                continue;
            }

            let mut promoted = record.clone();
            promoted.id = uuid::Uuid::new_v4().to_string();
            promoted.memory_type = MemoryType::Semantic;
            promoted.created_at = now;
            promoted.updated_at = now;
            memory_store.store(promoted).await?;

            if !self.config.promotion.preserve_original {
                memory_store
                    .update(user_id, &record.id, serde_json::json!({"status": "archived"}))
                    .await?;
            }
            report.promoted_ids.push(record.id);
        }
        Ok(report)
    }

    pub async fn run_cleanup(&self, user_id: &str, agent_id: &str) -> Result<CleanupReport> {
        let memory_store = require_memory(self.provider.as_ref())?;
        let mut report = CleanupReport::default();

        for memory_type in [
            MemoryType::Working,
            MemoryType::Episodic,
            MemoryType::Semantic,
            MemoryType::Procedural,
        ] {
            let records = memory_store
                .recall(user_id, agent_id, "", Some(memory_type), usize::MAX)
                .await?;

            for record in records {
                if record.never_decay || record.resonance >= self.config.cleanup.delete_threshold {
                    continue;
                }
                if self.config.cleanup.archive_enabled {
                    memory_store
                        .update(user_id, &record.id, serde_json::json!({"status": "archived"}))
                        .await?;
                    report.archived_ids.push(record.id);
                } else {
                    memory_store.delete(user_id, &record.id).await?;
                    report.deleted_ids.push(record.id);
                }
            }
        }

        if let Some(max) = self.config.cleanup.max_memories_per_agent {
            let stats = memory_store.get_stats(user_id, Some(agent_id)).await?;
            if stats.active_records > max {
                let overflow = stats.active_records - max;
                let mut active: Vec<MemoryRecord> = Vec::new();
                for memory_type in [
                    MemoryType::Working,
                    MemoryType::Episodic,
                    MemoryType::Semantic,
                    MemoryType::Procedural,
                ] {
                    active.extend(
                        memory_store
                            .recall(user_id, agent_id, "", Some(memory_type), usize::MAX)
                            .await?
                            .into_iter()
                            .filter(|r| r.is_active() && !r.never_decay),
                    );
                }
                active.sort_by(|a, b| a.resonance.partial_cmp(&b.resonance).unwrap_or(std::cmp::Ordering::Equal));
                for record in active.into_iter().take(overflow as usize) {
                    memory_store.delete(user_id, &record.id).await?;
                    report.evicted_for_quota_ids.push(record.id);
                }
            }
        }

        Ok(report)
    }
}

/// Whether `record` should be archived by the next cleanup pass, absent
/// the `neverDecay` pin (spec §4.9, mirrors [`crate::decay::should_archive`]
/// with the cleanup config's threshold instead of the decay config's).
pub fn is_archival_candidate(record: &MemoryRecord, cleanup: &CleanupConfig) -> bool {
    record.is_active() && !record.never_decay && record.resonance < cleanup.delete_threshold
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryProvider;
    use chrono::Duration;

    #[test]
    fn decay_rate_conversion_matches_half_life_identity() {
        let half_life = decay_rate_to_half_life_days(LN_2 / 30.0);
        assert!((half_life - 30.0).abs() < 1e-9);
    }

    #[test]
    fn decay_rules_resolve_first_match_in_order() {
        let rules = DecayRules {
            rules: vec![
                DecayRule::new("pinned", "importance >= 0.9", 9999.0),
                DecayRule::new("default-fast", "importance < 0.9", 5.0),
            ],
            default_half_life_days: 30.0,
        };
        let mut r = MemoryRecord::new("u", "a", MemoryType::Episodic, "x", 0.95);
        r.never_decay = false;
        let (hl, _) = rules.resolve_half_life(&r);
        assert_eq!(hl, 9999.0);

        let mut r2 = r.clone();
        r2.importance = 0.2;
        let (hl2, _) = rules.resolve_half_life(&r2);
        assert_eq!(hl2, 5.0);
    }

    #[test]
    fn decay_rules_fall_back_to_default_when_nothing_matches() {
        let rules = DecayRules {
            rules: vec![DecayRule::new("narrow", "importance > 2.0", 1.0)],
            default_half_life_days: 30.0,
        };
        let r = MemoryRecord::new("u", "a", MemoryType::Episodic, "x", 0.5);
        let (hl, never) = rules.resolve_half_life(&r);
        assert_eq!(hl, 30.0);
        assert!(!never);
    }

    #[test]
    fn promotion_requires_age_importance_and_access_count() {
        let rule = PromotionRule::new(7, 0.5, 3, true);
        let mut r = MemoryRecord::new("u", "a", MemoryType::Episodic, "x", 0.8);
        r.created_at = Utc::now() - Duration::days(10);
        r.access_count = 5;
        assert!(rule.is_eligible(&r, Utc::now()));

        r.access_count = 1;
        assert!(!rule.is_eligible(&r, Utc::now()));
    }

    #[tokio::test]
    async fn cleanup_archives_low_resonance_records_and_respects_never_decay_pin() {
        let provider = Arc::new(InMemoryProvider::new());
        let memory_store: Arc<dyn crate::storage::MemoryStore> = provider.clone();

        let mut low = MemoryRecord::new("alice", "a1", MemoryType::Episodic, "fading", 0.5);
        low.resonance = 0.01;
        let low_id = memory_store.store(low).await.unwrap();

        let mut pinned = MemoryRecord::new("alice", "a1", MemoryType::Episodic, "pinned", 0.5);
        pinned.resonance = 0.01;
        pinned.never_decay = true;
        let pinned_id = memory_store.store(pinned).await.unwrap();

        let engine = LifecycleEngine::new(
            provider.clone(),
            LifecycleConfig {
                decay: DecayRules {
                    rules: vec![],
                    default_half_life_days: 30.0,
                },
                promotion: PromotionRule::new(30, 0.6, 5, true),
                cleanup: CleanupConfig::default(),
            },
        );

        let report = engine.run_cleanup("alice", "a1").await.unwrap();
        assert!(report.archived_ids.contains(&low_id));
        assert!(!report.archived_ids.contains(&pinned_id));
    }
}
