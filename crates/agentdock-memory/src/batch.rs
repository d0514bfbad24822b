//! Batch update processor (spec §4.4, C4).
//!
//! Coalesces decay-induced writes from concurrent recalls and flushes them
//! on a timer or once a size threshold is hit. The `pending` map is
//! single-writer (an async mutex guards both `add` and `flush_now`, per
//! spec §5), and the background flush task's handle is owned by the
//! processor so `destroy()`, or simply dropping the last handle, cancels
//! it deterministically instead of leaking it — the same task-ownership
//! shape the teacher uses for its advanced-tier background cycles.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::warn;

use crate::error::Result;
use crate::storage::{MemoryStore, MemoryUpdate};

#[derive(Debug, Clone)]
pub struct BatchConfig {
    pub max_batch_size: usize,
    pub flush_interval: Duration,
    pub max_pending_updates: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 100,
            flush_interval: Duration::from_millis(5000),
            max_pending_updates: 10_000,
        }
    }
}

/// Result of a single flush (spec §4.4).
#[derive(Debug, Clone, Default)]
pub struct FlushResult {
    pub updates_written: usize,
    pub database_operations: usize,
    pub processing_time_ms: u64,
    pub errors: Vec<String>,
}

struct Inner {
    memory_store: Arc<dyn MemoryStore>,
    config: BatchConfig,
    pending: Mutex<HashMap<String, MemoryUpdate>>,
    destroyed: AtomicBool,
    dropped_for_backpressure: AtomicBool,
    shutdown: Notify,
}

/// Coalesces per-id resonance/access updates and flushes them in batches.
///
/// Cloning a [`BatchUpdateProcessor`] shares the same pending map and
/// background task (it holds an `Arc` to the shared state), matching how
/// the teacher shares its storage handle across concurrent tool calls.
#[derive(Clone)]
pub struct BatchUpdateProcessor {
    inner: Arc<Inner>,
    // Held only so the background task is aborted when the last processor
    // handle referencing this inner state is dropped without an explicit
    // `destroy()` call.
    _task: Arc<TaskGuard>,
}

struct TaskGuard(JoinHandle<()>);

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

impl BatchUpdateProcessor {
    /// Construct a processor bound to `memory_store`. Per spec §4.4,
    /// construction is where the `batchUpdateMemories` requirement is
    /// enforced; callers pass the already-unwrapped [`MemoryStore`]
    /// capability (typically via [`crate::storage::require_memory`]), so
    /// this constructor itself cannot fail.
    pub fn new(memory_store: Arc<dyn MemoryStore>, config: BatchConfig) -> Self {
        let inner = Arc::new(Inner {
            memory_store,
            config,
            pending: Mutex::new(HashMap::new()),
            destroyed: AtomicBool::new(false),
            dropped_for_backpressure: AtomicBool::new(false),
            shutdown: Notify::new(),
        });

        let background = Arc::clone(&inner);
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(background.config.flush_interval);
            interval.tick().await; // first tick fires immediately; skip it
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if background.destroyed.load(Ordering::SeqCst) {
                            break;
                        }
                        let _ = flush_inner(&background).await;
                    }
                    _ = background.shutdown.notified() => break,
                }
            }
        });

        Self {
            inner,
            _task: Arc::new(TaskGuard(task)),
        }
    }

    /// `add(update)` (spec §4.4): merges into the pending map by id, taking
    /// the max of monotone fields and the incoming resonance, then flushes
    /// immediately once `max_batch_size` is reached.
    pub async fn add(&self, update: MemoryUpdate) {
        if self.inner.destroyed.load(Ordering::SeqCst) {
            warn!(id = %update.id, "batch processor destroyed, dropping update");
            return;
        }

        let should_flush = {
            let mut pending = self.inner.pending.lock().await;

            if !pending.contains_key(&update.id)
                && pending.len() >= self.inner.config.max_pending_updates
            {
                self.inner
                    .dropped_for_backpressure
                    .store(true, Ordering::Relaxed);
                warn!(id = %update.id, pending = pending.len(), "pending updates at capacity, dropping update");
                return;
            }

            match pending.get_mut(&update.id) {
                Some(existing) => {
                    existing.access_count = existing.access_count.max(update.access_count);
                    existing.last_accessed_at = existing.last_accessed_at.max(update.last_accessed_at);
                    existing.resonance = update.resonance;
                }
                None => {
                    pending.insert(update.id.clone(), update);
                }
            }

            pending.len() >= self.inner.config.max_batch_size
        };

        if should_flush {
            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move {
                let _ = flush_inner(&inner).await;
            });
        }
    }

    /// `flushNow()` (spec §4.4).
    pub async fn flush_now(&self) -> Result<FlushResult> {
        flush_inner(&self.inner).await
    }

    pub async fn pending_len(&self) -> usize {
        self.inner.pending.lock().await.len()
    }

    /// Whether back-pressure has ever dropped an update (spec §5 metric).
    pub fn has_dropped_for_backpressure(&self) -> bool {
        self.inner.dropped_for_backpressure.load(Ordering::Relaxed)
    }

    /// Idempotent: cancels the timer, flushes remaining updates, marks the
    /// processor destroyed. Safe to call more than once.
    pub async fn destroy(&self) -> Result<FlushResult> {
        if self.inner.destroyed.swap(true, Ordering::SeqCst) {
            return Ok(FlushResult::default());
        }
        self.inner.shutdown.notify_waiters();
        flush_inner(&self.inner).await
    }
}

async fn flush_inner(inner: &Inner) -> Result<FlushResult> {
    let start = Instant::now();

    let snapshot: Vec<MemoryUpdate> = {
        let mut pending = inner.pending.lock().await;
        pending.drain().map(|(_, v)| v).collect()
    };

    if snapshot.is_empty() {
        return Ok(FlushResult {
            processing_time_ms: (start.elapsed().as_millis() as u64).max(1),
            ..Default::default()
        });
    }

    let count = snapshot.len();
    match inner.memory_store.batch_update_memories(snapshot.clone()).await {
        Ok(_) => Ok(FlushResult {
            updates_written: count,
            database_operations: 1,
            processing_time_ms: (start.elapsed().as_millis() as u64).max(1),
            errors: Vec::new(),
        }),
        Err(err) => {
            // Re-queue what fits back under the pending cap; oldest losers
            // within this retry batch are simply dropped.
            let mut pending = inner.pending.lock().await;
            for update in snapshot {
                if pending.len() >= inner.config.max_pending_updates {
                    break;
                }
                pending.entry(update.id.clone()).or_insert(update);
            }
            warn!(error = %err, "batch flush failed, updates re-queued");
            Ok(FlushResult {
                updates_written: 0,
                database_operations: 1,
                processing_time_ms: (start.elapsed().as_millis() as u64).max(1),
                errors: vec![err.to_string()],
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{MemoryRecord, MemoryType};
    use crate::storage::InMemoryProvider;
    use chrono::Utc;

    async fn make_processor() -> (Arc<InMemoryProvider>, BatchUpdateProcessor) {
        let provider = Arc::new(InMemoryProvider::new());
        let store: Arc<dyn MemoryStore> = provider.clone();
        let processor = BatchUpdateProcessor::new(store, BatchConfig::default());
        (provider, processor)
    }

    async fn make_processor_with_capacity(cap: usize) -> (Arc<InMemoryProvider>, BatchUpdateProcessor) {
        let provider = Arc::new(InMemoryProvider::new());
        let store: Arc<dyn MemoryStore> = provider.clone();
        let config = BatchConfig {
            max_pending_updates: cap,
            ..BatchConfig::default()
        };
        (provider, BatchUpdateProcessor::new(store, config))
    }

    async fn seed(provider: &InMemoryProvider) -> String {
        provider
            .store(MemoryRecord::new("alice", "a1", MemoryType::Episodic, "content", 0.5))
            .await
            .unwrap()
    }

    fn update_for(id: &str, resonance: f64, access_count: u64) -> MemoryUpdate {
        MemoryUpdate {
            id: id.to_string(),
            user_id: "alice".into(),
            agent_id: "a1".into(),
            resonance,
            last_accessed_at: Utc::now(),
            access_count,
        }
    }

    #[tokio::test]
    async fn distinct_ids_each_flush_exactly_once() {
        let (provider, processor) = make_processor().await;
        let mut ids = Vec::new();
        for _ in 0..5 {
            ids.push(seed(&provider).await);
        }

        for id in &ids {
            processor.add(update_for(id, 0.5, 1)).await;
        }

        let result = processor.flush_now().await.unwrap();
        assert_eq!(result.updates_written, 5);
        assert_eq!(processor.pending_len().await, 0);
    }

    #[tokio::test]
    async fn repeated_id_merges_by_max_access_count_and_latest_resonance() {
        let (provider, processor) = make_processor().await;
        let id = seed(&provider).await;

        let t1 = Utc::now();
        let t2 = t1 + chrono::Duration::seconds(10);

        processor
            .add(MemoryUpdate {
                last_accessed_at: t1,
                ..update_for(&id, 0.8, 5)
            })
            .await;
        processor
            .add(MemoryUpdate {
                last_accessed_at: t2,
                ..update_for(&id, 0.9, 3)
            })
            .await;

        assert_eq!(processor.pending_len().await, 1);
        processor.flush_now().await.unwrap();

        let record = provider.get_by_id("alice", &id).await.unwrap().unwrap();
        assert_eq!(record.resonance, 0.9);
        assert_eq!(record.access_count, 5);
        assert_eq!(record.last_accessed_at, t2);
    }

    #[tokio::test]
    async fn overflow_drops_new_updates_without_panicking() {
        let (provider, processor) = make_processor_with_capacity(1).await;
        let a = seed(&provider).await;
        let b = seed(&provider).await;

        processor.add(update_for(&a, 0.5, 1)).await;
        processor.add(update_for(&b, 0.5, 1)).await;

        assert_eq!(processor.pending_len().await, 1);
        assert!(processor.has_dropped_for_backpressure());
    }

    #[tokio::test]
    async fn destroy_is_idempotent_and_flushes_remaining() {
        let (provider, processor) = make_processor().await;
        let id = seed(&provider).await;
        processor.add(update_for(&id, 0.5, 1)).await;

        processor.destroy().await.unwrap();
        assert_eq!(processor.pending_len().await, 0);
        let record = provider.get_by_id("alice", &id).await.unwrap().unwrap();
        assert_eq!(record.resonance, 0.5);

        // Second call is a no-op, not an error.
        let second = processor.destroy().await.unwrap();
        assert_eq!(second.updates_written, 0);
    }

    #[tokio::test]
    async fn add_after_destroy_is_dropped() {
        let (provider, processor) = make_processor().await;
        processor.destroy().await.unwrap();
        let id = seed(&provider).await;
        processor.add(update_for(&id, 0.9, 1)).await;
        assert_eq!(processor.pending_len().await, 0);
    }
}
