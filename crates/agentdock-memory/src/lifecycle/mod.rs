//! Lifecycle configuration and rules engine (spec §4.9, C9): the sandboxed
//! predicate grammar plus decay/promotion/cleanup rule evaluation.

pub mod predicate;
pub mod rules;

pub use predicate::{Predicate, PredicateParseError};
pub use rules::{
    decay_rate_to_half_life_days, is_archival_candidate, CleanupConfig, CleanupReport, DecayRule,
    DecayRules, LifecycleConfig, LifecycleEngine, PromotionReport, PromotionRule,
};
