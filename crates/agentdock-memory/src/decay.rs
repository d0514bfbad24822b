//! Lazy decay calculator (spec §4.3, C3).
//!
//! `decay()` is a pure, synchronous transform over an already-fetched
//! record: no suspension points, no I/O. [`crate::batch::BatchUpdateProcessor`]
//! is the only place a decay outcome turns into a write, and only when
//! [`DecayOutcome::should_update`] says the change crossed the
//! significant-change threshold — that elision is the whole point of
//! "lazy" decay (spec §9).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::MemoryError;
use crate::record::MemoryRecord;

const MS_PER_DAY: f64 = 86_400_000.0;

/// Bounded configuration for the decay calculator (spec §4.3).
#[derive(Debug, Clone)]
pub struct DecayConfig {
    pub default_half_life_days: f64,
    pub archival_threshold: f64,
    pub reinforcement_factor: f64,
    pub max_resonance: f64,
    pub min_update_interval: chrono::Duration,
    pub significant_change_threshold: f64,
    pub access_count_threshold: u64,
    pub enable_reinforcement: bool,
}

impl Default for DecayConfig {
    fn default() -> Self {
        Self {
            default_half_life_days: 30.0,
            archival_threshold: 0.1,
            reinforcement_factor: 0.05,
            max_resonance: 2.0,
            min_update_interval: chrono::Duration::hours(6),
            significant_change_threshold: 0.1,
            access_count_threshold: 5,
            enable_reinforcement: true,
        }
    }
}

impl DecayConfig {
    /// Validate the bounds spec §4.3 requires at construction.
    pub fn validate(&self) -> Result<(), MemoryError> {
        if self.default_half_life_days <= 0.0 {
            return Err(MemoryError::invalid_argument(
                "defaultHalfLife must be > 0",
            ));
        }
        if !(0.0..=1.0).contains(&self.archival_threshold) {
            return Err(MemoryError::invalid_argument(
                "archivalThreshold must be in [0,1]",
            ));
        }
        if !(0.0..=1.0).contains(&self.reinforcement_factor) || self.reinforcement_factor <= 0.0 {
            return Err(MemoryError::invalid_argument(
                "reinforcementFactor must be in (0,1]",
            ));
        }
        if self.max_resonance < 1.0 {
            return Err(MemoryError::invalid_argument(
                "maxResonance must be >= 1",
            ));
        }
        if !(0.0..=1.0).contains(&self.significant_change_threshold) {
            return Err(MemoryError::invalid_argument(
                "significantChangeThreshold must be in [0,1]",
            ));
        }
        Ok(())
    }
}

/// Why a decay computation took the branch it took (spec §4.3 step 9).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecayReason {
    Archived,
    TooRecent,
    DecayApplied,
    ReinforcementApplied,
    DecayAndReinforcement,
    NoSignificantChange,
    NeverDecay,
    ReinforcementOnly,
    CalculationError,
}

/// The full decision produced by a single call to [`decay`].
#[derive(Debug, Clone, Copy)]
pub struct DecayOutcome {
    pub old_resonance: f64,
    pub new_resonance: f64,
    pub should_update: bool,
    pub decay_applied: bool,
    pub reinforcement_applied: bool,
    pub reason: DecayReason,
}

fn temporal_pattern_multiplier(metadata: &std::collections::HashMap<String, Value>) -> f64 {
    let Some(insights) = metadata.get("temporalInsights") else {
        return 1.0;
    };
    let Some(patterns) = insights.get("patterns").and_then(Value::as_array) else {
        return 1.0;
    };

    let mut multiplier = 1.0;
    for pattern in patterns {
        let Some(kind) = pattern.get("type").and_then(Value::as_str) else {
            continue;
        };
        let confidence = pattern.get("confidence").and_then(Value::as_f64).unwrap_or(0.0);
        match kind {
            "burst" => multiplier *= 1.0 + 0.3 * confidence,
            "daily" if confidence > 0.7 => multiplier *= 1.2,
            _ => {}
        }
    }
    multiplier
}

fn should_reinforce(record: &MemoryRecord, config: &DecayConfig) -> bool {
    config.enable_reinforcement
        && record.reinforceable
        && record.access_count > config.access_count_threshold
}

/// Compute the decay/reinforcement decision for `record` as of `now`.
///
/// This never mutates `record`; callers that accept the outcome are
/// responsible for applying `new_resonance` to their own copy and for
/// routing the write through [`crate::batch::BatchUpdateProcessor`] when
/// `should_update` is true.
pub fn decay(record: &MemoryRecord, now: DateTime<Utc>, config: &DecayConfig) -> DecayOutcome {
    let old_resonance = record.resonance;

    if !record.is_active() {
        return DecayOutcome {
            old_resonance,
            new_resonance: old_resonance,
            should_update: false,
            decay_applied: false,
            reinforcement_applied: false,
            reason: DecayReason::Archived,
        };
    }

    if record.never_decay {
        let mut new_resonance = old_resonance;
        let mut reinforcement_applied = false;
        if should_reinforce(record, config) {
            new_resonance += new_resonance * config.reinforcement_factor;
            new_resonance = new_resonance.clamp(0.0, record.max_resonance.max(config.max_resonance));
            reinforcement_applied = (new_resonance - old_resonance).abs() > f64::EPSILON;
        }
        return DecayOutcome {
            old_resonance,
            new_resonance,
            should_update: reinforcement_applied,
            decay_applied: false,
            reinforcement_applied,
            reason: DecayReason::NeverDecay,
        };
    }

    let since_update = now - record.updated_at;
    if since_update < config.min_update_interval {
        return DecayOutcome {
            old_resonance,
            new_resonance: old_resonance,
            should_update: false,
            decay_applied: false,
            reinforcement_applied: false,
            reason: DecayReason::TooRecent,
        };
    }

    let base_half_life = record
        .custom_half_life
        .unwrap_or(config.default_half_life_days);
    let half_life = (base_half_life * temporal_pattern_multiplier(&record.metadata)).max(0.001);

    let delta_ms = (now - record.last_accessed_at).num_milliseconds() as f64;
    let delta_days = (delta_ms / MS_PER_DAY).max(0.0);

    let mut new_resonance = old_resonance * 0.5_f64.powf(delta_days / half_life);
    let decay_applied = (new_resonance - old_resonance).abs() > f64::EPSILON;

    let mut reinforcement_applied = false;
    if should_reinforce(record, config) {
        let before = new_resonance;
        new_resonance += new_resonance * config.reinforcement_factor;
        reinforcement_applied = (new_resonance - before).abs() > f64::EPSILON;
    }

    new_resonance = new_resonance.clamp(0.0, record.max_resonance.max(config.max_resonance));

    let should_update = (new_resonance - old_resonance).abs() > config.significant_change_threshold;

    let reason = match (decay_applied, reinforcement_applied) {
        (true, true) => DecayReason::DecayAndReinforcement,
        (true, false) => DecayReason::DecayApplied,
        (false, true) => DecayReason::ReinforcementOnly,
        (false, false) => DecayReason::NoSignificantChange,
    };

    DecayOutcome {
        old_resonance,
        new_resonance,
        should_update,
        decay_applied,
        reinforcement_applied,
        reason,
    }
}

/// `calculateBatchDecay`: a straight, allocation-light map over [`decay`]
/// (spec §4.3). CPU-bound only — no suspension points.
pub fn decay_batch<'a>(
    records: impl IntoIterator<Item = &'a MemoryRecord>,
    now: DateTime<Utc>,
    config: &DecayConfig,
) -> Vec<(&'a MemoryRecord, DecayOutcome)> {
    records
        .into_iter()
        .map(|r| (r, decay(r, now, config)))
        .collect()
}

/// `shouldArchive` predicate (spec §4.3).
pub fn should_archive(record: &MemoryRecord, config: &DecayConfig) -> bool {
    !record.never_decay && record.is_active() && record.resonance < config.archival_threshold
}
