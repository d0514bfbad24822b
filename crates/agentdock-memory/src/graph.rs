//! Connection discovery and traversal (spec §4.5, C5).
//!
//! Smart triage decides a candidate pair's [`ConnectionType`] from a
//! similarity score without ever calling an LLM for pairs a simple
//! threshold already resolves confidently — cosine similarity on
//! embeddings when both records have one, Jaccard over keywords otherwise,
//! matching the teacher's `calculate_memory_similarity` fallback chain in
//! `advanced::dreams`. Only the genuinely ambiguous middle band is handed
//! to a [`crate::providers::Classifier`], and only up to
//! `max_llm_calls_per_batch` times per discovery call.

use std::sync::Arc;

use tracing::debug;

use crate::error::Result;
use crate::providers::Classifier;
use crate::record::{ConnectionType, MemoryConnection, MemoryRecord, TriageMethod};
use crate::storage::{require_memory, StorageProvider};

fn env_f64(name: &str, default: f64) -> f64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Similarity-band thresholds for triage (spec §4.5), overridable via
/// `CONNECTION_AUTO_SIMILAR` / `CONNECTION_AUTO_RELATED` /
/// `CONNECTION_LLM_REQUIRED`.
#[derive(Debug, Clone)]
pub struct TriageConfig {
    pub auto_similar: f64,
    pub auto_related: f64,
    pub llm_required: f64,
    pub max_candidates: usize,
    pub max_llm_calls_per_batch: usize,
}

impl Default for TriageConfig {
    fn default() -> Self {
        Self {
            auto_similar: env_f64("CONNECTION_AUTO_SIMILAR", 0.8),
            auto_related: env_f64("CONNECTION_AUTO_RELATED", 0.6),
            llm_required: env_f64("CONNECTION_LLM_REQUIRED", 0.3),
            max_candidates: 50,
            max_llm_calls_per_batch: 10,
        }
    }
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        (dot / (norm_a * norm_b)) as f64
    }
}

pub fn keyword_jaccard(a: &[String], b: &[String]) -> f64 {
    use std::collections::HashSet;
    if a.is_empty() && b.is_empty() {
        return 0.0;
    }
    let set_a: HashSet<&str> = a.iter().map(String::as_str).collect();
    let set_b: HashSet<&str> = b.iter().map(String::as_str).collect();
    let intersection = set_a.intersection(&set_b).count();
    let union = set_a.union(&set_b).count();
    if union == 0 {
        0.0
    } else {
        intersection as f64 / union as f64
    }
}

fn similarity(a: &MemoryRecord, b: &MemoryRecord, embeddings: &[(String, Vec<f32>)]) -> (f64, bool) {
    let emb_a = embeddings.iter().find(|(id, _)| *id == a.id).map(|(_, v)| v);
    let emb_b = embeddings.iter().find(|(id, _)| *id == b.id).map(|(_, v)| v);
    if let (Some(va), Some(vb)) = (emb_a, emb_b) {
        (cosine_similarity(va, vb), true)
    } else {
        (keyword_jaccard(&a.keywords, &b.keywords), false)
    }
}

/// Candidate pair waiting on a classifier verdict (the `llm_required` band).
struct PendingPair<'a> {
    target: &'a MemoryRecord,
    similarity: f64,
}

/// Connection discovery and traversal service.
///
/// Owns no state of its own; every call reads the current record set from
/// the storage provider and writes discovered edges back through its
/// `memory()` capability, so multiple `ConnectionGraph`s can safely share
/// one provider.
pub struct ConnectionGraph {
    provider: Arc<dyn StorageProvider>,
    config: TriageConfig,
    classifier: Option<Arc<dyn Classifier>>,
}

impl ConnectionGraph {
    pub fn new(provider: Arc<dyn StorageProvider>, config: TriageConfig) -> Self {
        Self {
            provider,
            config,
            classifier: None,
        }
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn Classifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    /// Discover and persist connections between `candidate` and `pool`,
    /// restricting the search to the first `max_candidates` entries of
    /// `pool` and at most `max_llm_calls_per_batch` classifier calls.
    /// `embeddings` maps record id to vector when the vector capability is
    /// present; an empty slice falls back to keyword Jaccard for every pair.
    pub async fn discover_connections(
        &self,
        user_id: &str,
        candidate: &MemoryRecord,
        pool: &[MemoryRecord],
        embeddings: &[(String, Vec<f32>)],
    ) -> Result<Vec<MemoryConnection>> {
        let mut edges = Vec::new();
        let mut pending: Vec<PendingPair<'_>> = Vec::new();

        for target in pool.iter().take(self.config.max_candidates) {
            if target.id == candidate.id {
                continue;
            }
            let (score, from_embedding) = similarity(candidate, target, embeddings);

            if score >= self.config.auto_similar {
                edges.push(self.build_edge(
                    user_id,
                    candidate,
                    target,
                    ConnectionType::Similar,
                    score,
                    if from_embedding {
                        TriageMethod::Embedding
                    } else {
                        TriageMethod::AutoSimilar
                    },
                ));
            } else if score >= self.config.auto_related {
                edges.push(self.build_edge(
                    user_id,
                    candidate,
                    target,
                    ConnectionType::Related,
                    score,
                    TriageMethod::AutoRelated,
                ));
            } else if score >= self.config.llm_required {
                pending.push(PendingPair { target, similarity: score });
            }
        }

        if let Some(classifier) = &self.classifier {
            for pair in pending.into_iter().take(self.config.max_llm_calls_per_batch) {
                match classifier.classify_connection(candidate, pair.target).await {
                    Ok(Some(kind)) => edges.push(self.build_edge(
                        user_id,
                        candidate,
                        pair.target,
                        kind,
                        pair.similarity,
                        TriageMethod::Llm,
                    )),
                    Ok(None) => {}
                    Err(err) => {
                        // Non-fatal: classifier failures never block the
                        // rest of discovery (spec §4.5/§6).
                        debug!(error = %err, "connection classifier call failed, skipping pair");
                    }
                }
            }
        }

        if edges.is_empty() {
            return Ok(edges);
        }

        let memory_store = require_memory(self.provider.as_ref())?;
        memory_store.create_connections(user_id, edges.clone()).await?;
        Ok(edges)
    }

    fn build_edge(
        &self,
        user_id: &str,
        from: &MemoryRecord,
        to: &MemoryRecord,
        kind: ConnectionType,
        strength: f64,
        method: TriageMethod,
    ) -> MemoryConnection {
        let mut edge = MemoryConnection::new(
            user_id,
            &from.id,
            &to.id,
            kind,
            strength,
            format!("{method:?} triage at similarity {strength:.3}"),
        );
        edge.triage_method = Some(method);
        edge
    }

    /// Bounded-depth BFS from `id` (spec §4.5). Delegates the traversal
    /// itself to the provider's `find_connected_memories`, which already
    /// maintains the visited set and tenant filter; this wrapper exists as
    /// the one call site the rest of the engine (recall expansion,
    /// consolidation) goes through.
    pub async fn traverse(
        &self,
        user_id: &str,
        id: &str,
        depth: usize,
    ) -> Result<crate::storage::ConnectedMemories> {
        let memory_store = require_memory(self.provider.as_ref())?;
        memory_store.find_connected_memories(user_id, id, depth).await
    }

    /// Degree of `id` within the connection graph, used by recall's
    /// centrality boost (spec §4.6: `boost = ln(1 + degree)`).
    pub async fn degree(&self, user_id: &str, id: &str) -> Result<usize> {
        let neighborhood = self.traverse(user_id, id, 1).await?;
        Ok(neighborhood
            .connections
            .iter()
            .filter(|c| c.source_memory_id == id || c.target_memory_id == id)
            .count())
    }
}

/// `ln(1 + degree)` (spec §4.6).
pub fn centrality_boost(degree: usize) -> f64 {
    (1.0 + degree as f64).ln()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::MemoryType;
    use crate::storage::InMemoryProvider;

    #[test]
    fn cosine_similarity_of_identical_vectors_is_one() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn cosine_similarity_of_orthogonal_vectors_is_zero() {
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-9);
    }

    #[test]
    fn keyword_jaccard_matches_known_ratio() {
        let a = vec!["rust".to_string(), "async".to_string()];
        let b = vec!["rust".to_string(), "sync".to_string()];
        assert!((keyword_jaccard(&a, &b) - (1.0 / 3.0)).abs() < 1e-9);
    }

    #[test]
    fn centrality_boost_is_zero_at_zero_degree() {
        assert_eq!(centrality_boost(0), 0.0);
        assert!(centrality_boost(10) > centrality_boost(1));
    }

    #[tokio::test]
    async fn discovery_creates_similar_edge_above_auto_similar_threshold() {
        let provider = Arc::new(InMemoryProvider::new());
        let mem = provider.clone();
        let store: Arc<dyn crate::storage::MemoryStore> = mem;

        let mut a = MemoryRecord::new("alice", "a1", MemoryType::Episodic, "rust async code", 0.5);
        a.keywords = vec!["rust".into(), "async".into(), "tokio".into()];
        let mut b = MemoryRecord::new("alice", "a1", MemoryType::Episodic, "rust async runtime", 0.5);
        b.keywords = vec!["rust".into(), "async".into(), "tokio".into()];

        let a_id = store.store(a.clone()).await.unwrap();
        let b_id = store.store(b.clone()).await.unwrap();
        a.id = a_id;
        b.id = b_id;

        let graph = ConnectionGraph::new(provider.clone(), TriageConfig::default());
        let edges = graph
            .discover_connections("alice", &a, std::slice::from_ref(&b), &[])
            .await
            .unwrap();

        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].connection_type, ConnectionType::Similar);
    }

    #[tokio::test]
    async fn traverse_depth_zero_returns_only_seed() {
        let provider = Arc::new(InMemoryProvider::new());
        let record = MemoryRecord::new("alice", "a1", MemoryType::Episodic, "x", 0.5);
        let store: Arc<dyn crate::storage::MemoryStore> = provider.clone();
        let id = store.store(record).await.unwrap();

        let graph = ConnectionGraph::new(provider, TriageConfig::default());
        let result = graph.traverse("alice", &id, 0).await.unwrap();
        assert_eq!(result.memories.len(), 1);
    }
}
