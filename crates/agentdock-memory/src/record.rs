//! The shared memory record and connection types (spec §3).
//!
//! A [`MemoryRecord`] is the one entity every tier, the decay calculator,
//! the connection graph, and recall all operate on. Tier-specific defaults
//! live in [`crate::tier`]; this module only carries the fields and
//! invariants common to all four tiers.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::MemoryError;

/// Default ceiling for [`MemoryRecord::resonance`].
pub const DEFAULT_MAX_RESONANCE: f64 = 2.0;

/// Default half-life, in days, used by the decay calculator absent a
/// per-record or per-rule override.
pub const DEFAULT_HALF_LIFE_DAYS: f64 = 30.0;

/// One of the four memory tiers (spec §2/§4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryType {
    Working,
    Episodic,
    Semantic,
    Procedural,
}

impl MemoryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryType::Working => "working",
            MemoryType::Episodic => "episodic",
            MemoryType::Semantic => "semantic",
            MemoryType::Procedural => "procedural",
        }
    }
}

impl std::fmt::Display for MemoryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for MemoryType {
    type Err = MemoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "working" => Ok(MemoryType::Working),
            "episodic" => Ok(MemoryType::Episodic),
            "semantic" => Ok(MemoryType::Semantic),
            "procedural" => Ok(MemoryType::Procedural),
            other => Err(MemoryError::invalid_argument(format!(
                "unknown memory type: {other}"
            ))),
        }
    }
}

/// Lifecycle status of a record (spec §3: "archive monotonicity").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryStatus {
    Active,
    Archived,
}

/// The shared memory record (spec §3).
///
/// `id`, `userId`/`agentId`, and timestamps are assigned on first write and
/// are immutable thereafter except where the spec explicitly allows
/// mutation (resonance via decay/reinforcement, `accessCount` via recall,
/// `status` via archive/unarchive).
#[non_exhaustive]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryRecord {
    pub id: String,
    pub user_id: String,
    pub agent_id: String,
    pub memory_type: MemoryType,
    pub content: String,
    /// Intrinsic weight at creation, in `[0, 1]`.
    pub importance: f64,
    /// Decaying salience, in `[0, max_resonance]`.
    pub resonance: f64,
    pub access_count: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    pub keywords: Vec<String>,
    pub metadata: HashMap<String, Value>,
    pub status: MemoryStatus,
    /// If true, resonance never decays (may still be reinforced).
    pub never_decay: bool,
    /// If false, resonance never increases.
    pub reinforceable: bool,
    /// Overrides the default half-life, in days.
    pub custom_half_life: Option<f64>,
    pub max_resonance: f64,
    pub embedding_id: Option<String>,
}

impl MemoryRecord {
    /// Build a new active record with engine-assigned id and timestamps.
    ///
    /// Callers go through [`crate::manager::MemoryManager::store`] in
    /// practice; this constructor is the single place tier defaults and
    /// bounds get applied so every code path produces the same shape.
    pub fn new(
        user_id: impl Into<String>,
        agent_id: impl Into<String>,
        memory_type: MemoryType,
        content: impl Into<String>,
        importance: f64,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            agent_id: agent_id.into(),
            memory_type,
            content: content.into(),
            importance: importance.clamp(0.0, 1.0),
            resonance: 1.0,
            access_count: 0,
            created_at: now,
            updated_at: now,
            last_accessed_at: now,
            keywords: Vec::new(),
            metadata: HashMap::new(),
            status: MemoryStatus::Active,
            never_decay: false,
            reinforceable: true,
            custom_half_life: None,
            max_resonance: DEFAULT_MAX_RESONANCE,
            embedding_id: None,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self.status, MemoryStatus::Active)
    }

    /// Tenant scope key used by every isolation check in the engine.
    pub fn tenant(&self) -> (&str, &str) {
        (&self.user_id, &self.agent_id)
    }

    pub fn belongs_to(&self, user_id: &str) -> bool {
        self.user_id == user_id
    }

    /// Clamp resonance into `[0, max_resonance]`, the bound spec §3 requires
    /// to hold "at all times".
    pub fn clamp_resonance(&mut self) {
        self.resonance = self.resonance.clamp(0.0, self.max_resonance);
    }
}

/// Directed edge between two records owned by the same user (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionType {
    Similar,
    Related,
    Causes,
    PartOf,
    Opposite,
}

impl std::fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionType::Similar => "similar",
            ConnectionType::Related => "related",
            ConnectionType::Causes => "causes",
            ConnectionType::PartOf => "part_of",
            ConnectionType::Opposite => "opposite",
        };
        write!(f, "{s}")
    }
}

/// How a connection was decided (spec §4.5, carried in `metadata.triageMethod`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TriageMethod {
    AutoSimilar,
    AutoRelated,
    Llm,
    Embedding,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryConnection {
    pub id: String,
    pub user_id: String,
    pub source_memory_id: String,
    pub target_memory_id: String,
    pub connection_type: ConnectionType,
    pub strength: f64,
    pub reason: String,
    pub created_at: DateTime<Utc>,
    pub triage_method: Option<TriageMethod>,
    pub metadata: HashMap<String, Value>,
}

impl MemoryConnection {
    pub fn new(
        user_id: impl Into<String>,
        source_memory_id: impl Into<String>,
        target_memory_id: impl Into<String>,
        connection_type: ConnectionType,
        strength: f64,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            source_memory_id: source_memory_id.into(),
            target_memory_id: target_memory_id.into(),
            connection_type,
            strength: strength.clamp(0.0, 1.0),
            reason: reason.into(),
            created_at: Utc::now(),
            triage_method: None,
            metadata: HashMap::new(),
        }
    }
}

/// Aggregate statistics for a tenant scope (spec §4.1 `getStats`, enriched
/// per SPEC_FULL §11 with a per-tier breakdown).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryStats {
    pub total_records: u64,
    pub active_records: u64,
    pub archived_records: u64,
    pub average_resonance: f64,
    pub average_importance: f64,
    pub by_tier: HashMap<String, u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_record_has_sane_defaults() {
        let r = MemoryRecord::new("u1", "a1", MemoryType::Episodic, "hello", 0.5);
        assert!(!r.id.is_empty());
        assert_eq!(r.resonance, 1.0);
        assert_eq!(r.access_count, 0);
        assert!(r.is_active());
        assert_eq!(r.created_at, r.updated_at);
        assert_eq!(r.created_at, r.last_accessed_at);
    }

    #[test]
    fn importance_is_clamped_on_construction() {
        let r = MemoryRecord::new("u1", "a1", MemoryType::Semantic, "x", 5.0);
        assert_eq!(r.importance, 1.0);
        let r2 = MemoryRecord::new("u1", "a1", MemoryType::Semantic, "x", -1.0);
        assert_eq!(r2.importance, 0.0);
    }

    #[test]
    fn memory_type_roundtrips_through_display_and_parse() {
        for t in [
            MemoryType::Working,
            MemoryType::Episodic,
            MemoryType::Semantic,
            MemoryType::Procedural,
        ] {
            let parsed: MemoryType = t.to_string().parse().unwrap();
            assert_eq!(parsed, t);
        }
    }

    #[test]
    fn resonance_clamps_to_configured_max() {
        let mut r = MemoryRecord::new("u1", "a1", MemoryType::Semantic, "x", 0.5);
        r.resonance = 10.0;
        r.clamp_resonance();
        assert_eq!(r.resonance, r.max_resonance);

        r.resonance = -1.0;
        r.clamp_resonance();
        assert_eq!(r.resonance, 0.0);
    }
}
