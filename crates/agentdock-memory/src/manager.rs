//! Public facade (spec §4.8, C8).
//!
//! `MemoryManager` is the one type a host application holds: it owns the
//! storage provider, the batch processor, the connection graph, and the
//! recall service, and exposes the small surface spec §4.8 names. Every
//! other module in this crate is reachable only through here or through
//! direct construction for advanced/test use.

use std::sync::Arc;

use tracing::info;

use crate::batch::{BatchConfig, BatchUpdateProcessor};
use crate::decay::DecayConfig;
use crate::error::{MemoryError, Result};
use crate::graph::{ConnectionGraph, TriageConfig};
use crate::keywords::extract_keywords;
use crate::providers::Classifier;
use crate::recall::{RecallConfig, RecallHit, RecallOptions, RecallService};
use crate::record::{ConnectionType, MemoryRecord, MemoryType};
use crate::storage::{require_memory, MemoryStore, StorageProvider};
use crate::tier::TierPolicies;

const DEFAULT_MAX_KEYWORDS: usize = 12;

/// One merged group produced by [`MemoryManager::consolidate_memories`].
#[derive(Debug, Clone)]
pub struct ConsolidationResult {
    pub consolidated_id: String,
    pub source_ids: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ConsolidationConfig {
    pub enabled: bool,
    pub similarity_threshold: f64,
}

impl Default for ConsolidationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            similarity_threshold: 0.85,
        }
    }
}

#[derive(Clone)]
pub struct MemoryManagerConfig {
    pub decay: DecayConfig,
    pub triage: TriageConfig,
    pub recall: RecallConfig,
    pub tiers: TierPolicies,
    pub consolidation: ConsolidationConfig,
}

impl Default for MemoryManagerConfig {
    fn default() -> Self {
        Self {
            decay: DecayConfig::default(),
            triage: TriageConfig::default(),
            recall: RecallConfig::default(),
            tiers: TierPolicies::default(),
            consolidation: ConsolidationConfig::default(),
        }
    }
}

fn validate_tenant(user_id: &str, agent_id: &str) -> Result<()> {
    if user_id.trim().is_empty() || agent_id.trim().is_empty() {
        return Err(MemoryError::invalid_argument("userId and agentId must be non-empty"));
    }
    Ok(())
}

pub struct MemoryManager {
    provider: Arc<dyn StorageProvider>,
    batch: Option<BatchUpdateProcessor>,
    recall: RecallService,
    config: MemoryManagerConfig,
    classifier: Option<Arc<dyn Classifier>>,
}

impl MemoryManager {
    /// Construct a manager over a provider that also exposes the `memory`
    /// capability as a concrete type, so it can be held both as
    /// `Arc<dyn StorageProvider>` (general operations) and
    /// `Arc<dyn MemoryStore>` (the batch processor's target). Every
    /// provider shipped with this crate qualifies; a host implementing a
    /// KV/list-only provider without the memory capability should use
    /// [`MemoryManager::without_memory_capability`] instead.
    pub fn new<P>(provider: Arc<P>, config: MemoryManagerConfig) -> Self
    where
        P: StorageProvider + MemoryStore + 'static,
    {
        let storage: Arc<dyn StorageProvider> = provider.clone();
        let memory_store: Arc<dyn MemoryStore> = provider;
        Self::build(storage, Some(memory_store), config)
    }

    /// Construct a manager over a provider lacking the `memory` capability.
    /// `store`/`recall`/`consolidateMemories` all fail with
    /// [`MemoryError::CapabilityMissing`]; only the KV/list surface works.
    pub fn without_memory_capability(provider: Arc<dyn StorageProvider>, config: MemoryManagerConfig) -> Self {
        Self::build(provider, None, config)
    }

    fn build(
        provider: Arc<dyn StorageProvider>,
        memory_store: Option<Arc<dyn MemoryStore>>,
        config: MemoryManagerConfig,
    ) -> Self {
        let batch = memory_store.map(|ms| BatchUpdateProcessor::new(ms, BatchConfig::default()));
        let graph = ConnectionGraph::new(provider.clone(), config.triage.clone());
        let recall = RecallService::new(
            provider.clone(),
            graph,
            batch.clone(),
            config.tiers.clone(),
            config.recall.clone(),
        );

        Self {
            provider,
            batch,
            recall,
            config,
            classifier: None,
        }
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn Classifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    /// `store(userId, agentId, content, type) → id` (spec §4.8): persists,
    /// then fires connection discovery without waiting on it, per the
    /// write-path latency contract (§5).
    pub async fn store(
        &self,
        user_id: &str,
        agent_id: &str,
        content: &str,
        memory_type: MemoryType,
        importance: f64,
    ) -> Result<String> {
        validate_tenant(user_id, agent_id)?;
        let memory_store = require_memory(self.provider.as_ref())?;

        let mut record = MemoryRecord::new(user_id, agent_id, memory_type, content, importance);
        record.keywords = extract_keywords(content, DEFAULT_MAX_KEYWORDS);

        let id = memory_store.store(record.clone()).await?;
        record.id = id.clone();
        self.recall.invalidate_cache(user_id, agent_id);

        self.spawn_discovery(user_id, agent_id, record);

        Ok(id)
    }

    /// Fire-and-forget connection discovery (spec §4.5 step 5 / §4.8):
    /// never awaited by `store`, so a slow or failing discovery pass can't
    /// push `store` past its latency budget.
    fn spawn_discovery(&self, user_id: &str, agent_id: &str, record: MemoryRecord) {
        let provider = self.provider.clone();
        let triage = self.config.triage.clone();
        let classifier = self.classifier.clone();
        let user_id = user_id.to_string();
        let agent_id = agent_id.to_string();

        tokio::spawn(async move {
            let Some(memory_store) = provider.memory() else {
                return;
            };
            let pool = match memory_store.recall(&user_id, &agent_id, "", None, 200).await {
                Ok(pool) => pool,
                Err(err) => {
                    info!(error = %err, "connection discovery pool fetch failed, skipping");
                    return;
                }
            };
            let mut graph = ConnectionGraph::new(provider, triage);
            if let Some(classifier) = classifier {
                graph = graph.with_classifier(classifier);
            }
            if let Err(err) = graph.discover_connections(&user_id, &record, &pool, &[]).await {
                info!(error = %err, "connection discovery failed");
            }
        });
    }

    /// `recall(userId, agentId, query, options?) → record[]` (spec §4.8):
    /// a thin wrapper over C7.
    pub async fn recall(
        &self,
        user_id: &str,
        agent_id: &str,
        query: &str,
        options: RecallOptions,
        query_embedding: Option<&[f32]>,
    ) -> Result<Vec<RecallHit>> {
        validate_tenant(user_id, agent_id)?;
        self.recall.recall(user_id, agent_id, query, options, query_embedding).await
    }

    /// `consolidateMemories(userId, agentId) → ConsolidationResult[]`
    /// (spec §4.8). Groups recent episodic records whose pairwise keyword
    /// similarity exceeds `consolidation.similarityThreshold` and merges
    /// each group into one record.
    pub async fn consolidate_memories(
        &self,
        user_id: &str,
        agent_id: &str,
    ) -> Result<Vec<ConsolidationResult>> {
        validate_tenant(user_id, agent_id)?;
        if !self.config.consolidation.enabled {
            return Err(MemoryError::invalid_argument("ConsolidationDisabled"));
        }

        let memory_store = require_memory(self.provider.as_ref())?;
        let episodic = memory_store
            .recall(user_id, agent_id, "", Some(MemoryType::Episodic), usize::MAX)
            .await?;

        let mut grouped: Vec<bool> = vec![false; episodic.len()];
        let mut results = Vec::new();

        for i in 0..episodic.len() {
            if grouped[i] {
                continue;
            }
            let mut group = vec![i];
            for j in (i + 1)..episodic.len() {
                if grouped[j] {
                    continue;
                }
                let sim = crate::graph::keyword_jaccard(&episodic[i].keywords, &episodic[j].keywords);
                if sim > self.config.consolidation.similarity_threshold {
                    group.push(j);
                }
            }
            if group.len() < 2 {
                continue;
            }
            for &idx in &group {
                grouped[idx] = true;
            }

            let members: Vec<&MemoryRecord> = group.iter().map(|&idx| &episodic[idx]).collect();
            let source_ids: Vec<String> = members.iter().map(|m| m.id.clone()).collect();
            let mut merged = merge_records(&members);
            merged
                .metadata
                .insert("consolidatedFrom".to_string(), serde_json::json!(source_ids));
            let consolidated_id = memory_store.store(merged).await?;

            // Audit linkage (spec.md:200): each original is recorded as
            // `PartOf` the consolidated record so the merge survives in
            // storage, not just in the returned result.
            let edges = members
                .iter()
                .map(|member| {
                    crate::record::MemoryConnection::new(
                        user_id,
                        &member.id,
                        &consolidated_id,
                        ConnectionType::PartOf,
                        1.0,
                        format!("consolidated into {consolidated_id}"),
                    )
                })
                .collect();
            memory_store.create_connections(user_id, edges).await?;

            results.push(ConsolidationResult {
                consolidated_id: consolidated_id.clone(),
                source_ids,
            });

            for member in &members {
                memory_store
                    .update(user_id, &member.id, serde_json::json!({"status": "archived"}))
                    .await?;
            }
        }

        self.recall.invalidate_cache(user_id, agent_id);
        Ok(results)
    }

    /// `close()` (spec §4.8): flushes C4 and stops accepting new updates.
    pub async fn close(&self) -> Result<()> {
        if let Some(batch) = &self.batch {
            batch.destroy().await?;
        }
        Ok(())
    }
}

/// Merge a consolidation group into one record: keywords unioned, content
/// joined with duplicate sentences dropped, importance = min(1, 1.2·mean),
/// `createdAt` = min, `lastAccessedAt` = max (spec §4.8).
fn merge_records(members: &[&MemoryRecord]) -> MemoryRecord {
    let mut merged = MemoryRecord::new(
        members[0].user_id.clone(),
        members[0].agent_id.clone(),
        MemoryType::Episodic,
        merge_content(members),
        (members.iter().map(|m| m.importance).sum::<f64>() / members.len() as f64 * 1.2).min(1.0),
    );

    let mut keywords = std::collections::BTreeSet::new();
    for member in members {
        keywords.extend(member.keywords.iter().cloned());
    }
    merged.keywords = keywords.into_iter().collect();

    merged.created_at = members.iter().map(|m| m.created_at).min().unwrap();
    merged.last_accessed_at = members.iter().map(|m| m.last_accessed_at).max().unwrap();
    merged.resonance = members.iter().map(|m| m.resonance).fold(0.0, f64::max);
    merged
}

fn merge_content(members: &[&MemoryRecord]) -> String {
    let mut seen = std::collections::HashSet::new();
    let mut sentences = Vec::new();
    for member in members {
        for sentence in member.content.split('.') {
            let trimmed = sentence.trim();
            if trimmed.is_empty() {
                continue;
            }
            if seen.insert(trimmed.to_lowercase()) {
                sentences.push(trimmed.to_string());
            }
        }
    }
    sentences.join(". ")
}
