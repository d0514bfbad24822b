//! Hybrid recall service (spec §4.7, C7).
//!
//! Fans a query out across tiers, applies lazy decay in-flight, computes
//! four independent relevance signals, fuses them with a weighted linear
//! combination (the same shape as the teacher's
//! `search::hybrid::HybridSearcher::fuse_linear`, generalized from
//! `{keyword, semantic}` to `{vector, text, temporal, procedural}`), then
//! optionally expands through the connection graph before truncating to
//! `limit`.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use tracing::debug;

use crate::batch::BatchUpdateProcessor;
use crate::decay::{self, DecayConfig};
use crate::error::Result;
use crate::graph::{centrality_boost, ConnectionGraph};
use crate::record::{MemoryRecord, MemoryType};
use crate::storage::{require_memory, MemoryUpdate, StorageProvider};
use crate::tier::TierPolicies;

/// Weights for the four fusion signals (spec §4.7 default `{0.7,0.3,0,0}`).
#[derive(Debug, Clone, Copy)]
pub struct HybridSearchWeights {
    pub vector: f64,
    pub text: f64,
    pub temporal: f64,
    pub procedural: f64,
}

impl Default for HybridSearchWeights {
    fn default() -> Self {
        Self {
            vector: 0.7,
            text: 0.3,
            temporal: 0.0,
            procedural: 0.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RecallOptions {
    pub memory_types: Option<Vec<MemoryType>>,
    pub limit: usize,
    pub use_connections: bool,
    pub connection_hops: usize,
    pub boost_central_memories: bool,
    pub centrality_alpha: f64,
    pub min_relevance_threshold: f64,
    pub hybrid_search_weights: HybridSearchWeights,
    pub overshoot: usize,
}

impl Default for RecallOptions {
    fn default() -> Self {
        Self {
            memory_types: None,
            limit: 10,
            use_connections: false,
            connection_hops: 1,
            boost_central_memories: false,
            centrality_alpha: 0.3,
            min_relevance_threshold: 0.0,
            hybrid_search_weights: HybridSearchWeights::default(),
            overshoot: 3,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RecallHit {
    pub record: MemoryRecord,
    pub score: f64,
    pub connection_source: Option<String>,
}

/// Config driving the query-embedding signal; absent when the provider has
/// no vector capability or the caller supplies no query embedding.
#[derive(Clone)]
pub struct RecallConfig {
    pub decay: DecayConfig,
    pub cache_capacity: Option<usize>,
    pub cache_ttl: chrono::Duration,
}

impl Default for RecallConfig {
    fn default() -> Self {
        Self {
            decay: DecayConfig::default(),
            cache_capacity: Some(256),
            cache_ttl: chrono::Duration::milliseconds(30_000),
        }
    }
}

struct CacheEntry {
    ids: Vec<String>,
    expires_at: DateTime<Utc>,
}

/// Fetches candidates, scores them, and fuses a ranked result list.
///
/// The optional LRU cache stores only ids, per spec §4.7 ("cache entries
/// store only record ids, not bodies"), and is invalidated wholesale for a
/// tenant on any mutating call (the §12 decision: pair-level invalidation
/// rather than tracking per-query dependencies).
pub struct RecallService {
    provider: Arc<dyn StorageProvider>,
    graph: ConnectionGraph,
    batch: Option<BatchUpdateProcessor>,
    tiers: TierPolicies,
    config: RecallConfig,
    cache: Option<Mutex<LruCache<String, CacheEntry>>>,
}

impl RecallService {
    pub fn new(
        provider: Arc<dyn StorageProvider>,
        graph: ConnectionGraph,
        batch: Option<BatchUpdateProcessor>,
        tiers: TierPolicies,
        config: RecallConfig,
    ) -> Self {
        let cache = config.cache_capacity.and_then(NonZeroUsize::new).map(|cap| Mutex::new(LruCache::new(cap)));
        Self {
            provider,
            graph,
            batch,
            tiers,
            config,
            cache,
        }
    }

    fn cache_key(user_id: &str, agent_id: &str, query: &str, options: &RecallOptions) -> String {
        format!(
            "{user_id}:{agent_id}:{}:{}:{:?}:{}",
            query.trim().to_lowercase(),
            options.limit,
            options.memory_types,
            options.use_connections
        )
    }

    /// Drops every cached entry for `(user_id, agent_id)`. Called after any
    /// store/update/delete/archive for that tenant (spec §12 decision:
    /// bucket-level invalidation rather than tracking per-query
    /// dependencies — coarser than per-key, trivially correct, and cheap
    /// since the cache only holds id lists).
    pub fn invalidate_cache(&self, user_id: &str, agent_id: &str) {
        let Some(cache) = &self.cache else { return };
        let prefix = format!("{user_id}:{agent_id}:");
        let mut guard = cache.lock().unwrap_or_else(|e| e.into_inner());
        let stale: Vec<String> = guard
            .iter()
            .filter(|(k, _)| k.starts_with(&prefix))
            .map(|(k, _)| k.clone())
            .collect();
        for key in stale {
            guard.pop(&key);
        }
    }

    pub async fn recall(
        &self,
        user_id: &str,
        agent_id: &str,
        query: &str,
        options: RecallOptions,
        query_embedding: Option<&[f32]>,
    ) -> Result<Vec<RecallHit>> {
        let cache_key = Self::cache_key(user_id, agent_id, query, &options);

        if let Some(cache) = &self.cache {
            let mut guard = cache.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(entry) = guard.get(&cache_key) {
                if entry.expires_at > Utc::now() {
                    let ids = entry.ids.clone();
                    drop(guard);
                    return self.hydrate(user_id, &ids).await;
                }
                guard.pop(&cache_key);
            }
        }

        let hits = self.recall_uncached(user_id, agent_id, query, options, query_embedding).await?;

        if let Some(cache) = &self.cache {
            let ids = hits.iter().map(|h| h.record.id.clone()).collect();
            cache.lock().unwrap_or_else(|e| e.into_inner()).put(
                cache_key,
                CacheEntry {
                    ids,
                    expires_at: Utc::now() + self.config.cache_ttl,
                },
            );
        }

        Ok(hits)
    }

    async fn hydrate(&self, user_id: &str, ids: &[String]) -> Result<Vec<RecallHit>> {
        let memory_store = require_memory(self.provider.as_ref())?;
        let mut hits = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(record) = memory_store.get_by_id(user_id, id).await? {
                hits.push(RecallHit {
                    record,
                    score: 0.0,
                    connection_source: None,
                });
            }
        }
        Ok(hits)
    }

    async fn recall_uncached(
        &self,
        user_id: &str,
        agent_id: &str,
        query: &str,
        options: RecallOptions,
        query_embedding: Option<&[f32]>,
    ) -> Result<Vec<RecallHit>> {
        let memory_store = require_memory(self.provider.as_ref())?;
        let now = Utc::now();

        let tiers_to_search: Vec<MemoryType> = options.memory_types.clone().unwrap_or_else(|| {
            vec![
                MemoryType::Working,
                MemoryType::Episodic,
                MemoryType::Semantic,
                MemoryType::Procedural,
            ]
        });

        let fetch_limit = options.limit.saturating_mul(options.overshoot.max(1));

        let mut candidates = Vec::new();
        for tier in tiers_to_search {
            let mut tier_hits = memory_store
                .recall(user_id, agent_id, query, Some(tier), fetch_limit)
                .await?;
            candidates.append(&mut tier_hits);
        }

        // One vector-store round trip per recall call, not per candidate:
        // a map from record id to query similarity, consulted by `fuse`.
        let vector_scores = self.query_vector_scores(query_embedding, fetch_limit * 4).await;

        let mut scored = Vec::with_capacity(candidates.len());
        for mut record in candidates {
            let outcome = decay::decay(&record, now, &self.config.decay);
            record.resonance = outcome.new_resonance;

            if outcome.should_update {
                if let Some(batch) = &self.batch {
                    batch
                        .add(MemoryUpdate {
                            id: record.id.clone(),
                            user_id: record.user_id.clone(),
                            agent_id: record.agent_id.clone(),
                            resonance: outcome.new_resonance,
                            last_accessed_at: now,
                            access_count: record.access_count + 1,
                        })
                        .await;
                }
            }

            let score = self.fuse(&record, query, now, &vector_scores, &options.hybrid_search_weights);
            scored.push(RecallHit {
                record,
                score,
                connection_source: None,
            });
        }

        if options.use_connections && !scored.is_empty() {
            self.expand_connections(user_id, &mut scored, &options).await?;
        }

        scored.retain(|hit| hit.score >= options.min_relevance_threshold);
        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(options.limit);

        Ok(scored)
    }

    /// Queries the vector capability once per recall call, if present and
    /// the caller supplied a query embedding; absent either, every record
    /// falls back to the text signal alone (spec §4.7 step 3's "if vector
    /// capability is present").
    async fn query_vector_scores(
        &self,
        query_embedding: Option<&[f32]>,
        k: usize,
    ) -> HashMap<String, f64> {
        let (Some(embedding), Some(vector_store)) = (query_embedding, self.provider.vector()) else {
            return HashMap::new();
        };
        match vector_store.query(embedding, k.max(1), None).await {
            Ok(results) => results
                .into_iter()
                .map(|(id, score)| (id, (score as f64).clamp(0.0, 1.0)))
                .collect(),
            Err(err) => {
                debug!(error = %err, "vector query failed, falling back to text-only signal");
                HashMap::new()
            }
        }
    }

    fn fuse(
        &self,
        record: &MemoryRecord,
        query: &str,
        now: DateTime<Utc>,
        vector_scores: &HashMap<String, f64>,
        weights: &HybridSearchWeights,
    ) -> f64 {
        let vector_signal = vector_scores.get(&record.id).copied().unwrap_or(0.0);
        let text_signal = text_overlap_score(&record.content, query);

        let tau_days = tier_tau_days(record.memory_type, &self.tiers);
        let age_days = (now - record.last_accessed_at).num_milliseconds() as f64 / 86_400_000.0;
        let temporal_signal = (-age_days.max(0.0) / tau_days).exp();

        let procedural_signal = if record.memory_type == MemoryType::Procedural {
            record
                .metadata
                .get("successRate")
                .and_then(serde_json::Value::as_f64)
                .unwrap_or(0.0)
        } else {
            0.0
        };

        let fused = weights.vector * vector_signal
            + weights.text * text_signal
            + weights.temporal * temporal_signal
            + weights.procedural * procedural_signal;

        let resonance_factor = (record.resonance / record.max_resonance.max(f64::EPSILON)).clamp(0.0, 1.0);
        fused * resonance_factor * record.importance.clamp(0.0, 1.0)
    }

    /// Centrality boost (spec §4.7 step 4 / §4.5): applied separately from
    /// [`RecallService::fuse`] because it needs the graph degree, which is
    /// only worth computing when the caller actually requested it.
    async fn apply_centrality_boost(
        &self,
        user_id: &str,
        hit: &mut RecallHit,
        alpha: f64,
    ) -> Result<()> {
        let degree = self.graph.degree(user_id, &hit.record.id).await.unwrap_or(0);
        let normalized = (centrality_boost(degree) / centrality_boost(50).max(f64::EPSILON)).min(1.0);
        hit.score *= 1.0 + alpha.clamp(0.0, 0.5) * normalized;
        Ok(())
    }

    async fn expand_connections(
        &self,
        user_id: &str,
        scored: &mut Vec<RecallHit>,
        options: &RecallOptions,
    ) -> Result<()> {
        if options.boost_central_memories {
            for hit in scored.iter_mut() {
                self.apply_centrality_boost(user_id, hit, options.centrality_alpha).await?;
            }
        }

        let mut ranked: Vec<usize> = (0..scored.len()).collect();
        ranked.sort_by(|&a, &b| {
            scored[b].score.partial_cmp(&scored[a].score).unwrap_or(std::cmp::Ordering::Equal)
        });
        let seeds: Vec<(String, f64)> = ranked
            .into_iter()
            .take(5)
            .map(|i| (scored[i].record.id.clone(), scored[i].score))
            .collect();

        let mut seen: std::collections::HashSet<String> =
            scored.iter().map(|h| h.record.id.clone()).collect();
        let mut appended = Vec::new();

        for (seed_id, seed_score) in seeds {
            let neighborhood = self.graph.traverse(user_id, &seed_id, options.connection_hops).await?;
            for neighbor in neighborhood.memories.into_iter() {
                if neighbor.id == seed_id || !seen.insert(neighbor.id.clone()) {
                    continue;
                }
                let hop = neighborhood.depths.get(&neighbor.id).copied().unwrap_or(1).max(1);
                let discount = 0.7_f64.powi(hop as i32 - 1);
                appended.push(RecallHit {
                    score: seed_score * discount,
                    record: neighbor,
                    connection_source: Some(seed_id.clone()),
                });
            }
        }

        scored.extend(appended);
        Ok(())
    }
}

fn tier_tau_days(memory_type: MemoryType, tiers: &TierPolicies) -> f64 {
    match memory_type {
        MemoryType::Working => tiers.working.ttl.as_secs_f64() / 86_400.0,
        MemoryType::Episodic => tiers.episodic.default_half_life_days,
        MemoryType::Semantic => tiers.episodic.default_half_life_days * 4.0,
        MemoryType::Procedural => 1.0 / tiers.procedural.decay_rate_per_day.max(1e-6),
    }
    .max(0.01)
}

/// Simple bounded token-overlap score, the teacher's `linear_combination`
/// keyword path without an inverted index: count shared lowercase tokens
/// over query token count.
fn text_overlap_score(content: &str, query: &str) -> f64 {
    let query_tokens: Vec<String> = query
        .split_whitespace()
        .map(|t| t.to_lowercase())
        .collect();
    if query_tokens.is_empty() {
        return 0.0;
    }
    let content_lower = content.to_lowercase();
    let matched = query_tokens
        .iter()
        .filter(|t| content_lower.contains(t.as_str()))
        .count();
    (matched as f64 / query_tokens.len() as f64).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryProvider;

    fn make_service() -> (Arc<InMemoryProvider>, RecallService) {
        let provider = Arc::new(InMemoryProvider::new());
        let graph = ConnectionGraph::new(provider.clone(), crate::graph::TriageConfig::default());
        let service = RecallService::new(
            provider.clone(),
            graph,
            None,
            TierPolicies::default(),
            RecallConfig::default(),
        );
        (provider, service)
    }

    #[tokio::test]
    async fn recall_respects_tenant_isolation() {
        let (provider, service) = make_service();
        let memory_store: Arc<dyn crate::storage::MemoryStore> = provider.clone();
        memory_store
            .store(MemoryRecord::new("alice", "a1", MemoryType::Episodic, "likes rust programming", 0.8))
            .await
            .unwrap();
        memory_store
            .store(MemoryRecord::new("bob", "a1", MemoryType::Episodic, "likes rust programming", 0.8))
            .await
            .unwrap();

        let hits = service
            .recall("alice", "a1", "rust", RecallOptions::default(), None)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].record.user_id, "alice");
    }

    #[tokio::test]
    async fn min_relevance_threshold_filters_out_low_scores() {
        let (provider, service) = make_service();
        let memory_store: Arc<dyn crate::storage::MemoryStore> = provider.clone();
        memory_store
            .store(MemoryRecord::new("alice", "a1", MemoryType::Episodic, "completely unrelated text", 0.5))
            .await
            .unwrap();

        let mut options = RecallOptions::default();
        options.min_relevance_threshold = 0.99;
        let hits = service.recall("alice", "a1", "rust", options, None).await.unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn limit_truncates_result_set() {
        let (provider, service) = make_service();
        let memory_store: Arc<dyn crate::storage::MemoryStore> = provider.clone();
        for i in 0..10 {
            memory_store
                .store(MemoryRecord::new(
                    "alice",
                    "a1",
                    MemoryType::Episodic,
                    format!("entry about rust number {i}"),
                    0.9,
                ))
                .await
                .unwrap();
        }

        let mut options = RecallOptions::default();
        options.limit = 3;
        let hits = service.recall("alice", "a1", "rust", options, None).await.unwrap();
        assert_eq!(hits.len(), 3);
    }
}
