//! Pluggable intelligence providers (spec §6).
//!
//! These traits are the seam between the engine and whatever embedding
//! model, LLM classifier, or billing system a host application wires in —
//! mirroring how the teacher's `embeddings::mod` and `search::hybrid`
//! modules take a provider trait object rather than hard-coding a vendor
//! SDK. None of the three are required: [`crate::graph::ConnectionGraph`]
//! and [`crate::extraction`] both degrade gracefully when absent.

use async_trait::async_trait;

use crate::error::Result;
use crate::record::{ConnectionType, MemoryRecord};

/// Produces an embedding vector for a piece of text.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.embed(text).await?);
        }
        Ok(out)
    }

    fn dimensions(&self) -> usize;
}

/// Resolves ambiguous connection pairs the similarity triage can't decide
/// on its own (spec §4.5's `llmRequired` band).
#[async_trait]
pub trait Classifier: Send + Sync {
    /// `Ok(None)` means "no connection": the pair was considered and
    /// rejected, which is distinct from a classifier error.
    async fn classify_connection(
        &self,
        a: &MemoryRecord,
        b: &MemoryRecord,
    ) -> Result<Option<ConnectionType>>;
}

/// A single billable call, for attribution in [`CostTracker`].
#[derive(Debug, Clone)]
pub struct CostEvent {
    pub operation: String,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cost_usd: f64,
}

/// Tracks spend across embedding/classifier/extraction calls (spec §6).
pub trait CostTracker: Send + Sync {
    fn record(&self, event: CostEvent);
    fn total_cost_usd(&self) -> f64;
    fn total_calls(&self) -> u64;
}

/// In-process reference [`CostTracker`] backed by a mutex-guarded running
/// total. Good enough for single-process hosts and for tests; a
/// multi-process host would back this with its own billing system instead.
#[derive(Default)]
pub struct InMemoryCostTracker {
    events: std::sync::Mutex<Vec<CostEvent>>,
}

impl InMemoryCostTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<CostEvent> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl CostTracker for InMemoryCostTracker {
    fn record(&self, event: CostEvent) {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).push(event);
    }

    fn total_cost_usd(&self) -> f64 {
        self.events().iter().map(|e| e.cost_usd).sum()
    }

    fn total_calls(&self) -> u64 {
        self.events().len() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cost_tracker_accumulates_across_calls() {
        let tracker = InMemoryCostTracker::new();
        tracker.record(CostEvent {
            operation: "extract".into(),
            tokens_in: 100,
            tokens_out: 50,
            cost_usd: 0.002,
        });
        tracker.record(CostEvent {
            operation: "classify".into(),
            tokens_in: 20,
            tokens_out: 5,
            cost_usd: 0.0005,
        });
        assert_eq!(tracker.total_calls(), 2);
        assert!((tracker.total_cost_usd() - 0.0025).abs() < 1e-12);
    }
}
