//! Storage provider interface (spec §4.1, C1).
//!
//! A provider is capability-typed rather than a single fat trait: every
//! provider must implement [`KvStore`] and [`ListStore`], and may
//! additionally expose [`MemoryStore`] and [`VectorStore`]. Capabilities
//! are discovered at runtime through [`StorageProvider::memory`] /
//! [`StorageProvider::vector`] returning `None` when absent, so callers
//! (chiefly [`crate::recall::RecallService`]) downgrade features instead of
//! failing — text-only recall on a provider with no vector capability is
//! the expected path, not an error one.

mod memory;

pub use memory::InMemoryProvider;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::error::{MemoryError, Result};
use crate::record::{MemoryConnection, MemoryRecord, MemoryStats};

/// Default namespace used when neither the call site nor the provider
/// configures one (spec §4.1: `options.namespace ?? defaultNamespace ?? "default"`).
pub const DEFAULT_NAMESPACE: &str = "default";

#[derive(Debug, Clone, Default)]
pub struct SetOptions {
    pub ttl_seconds: Option<u64>,
    pub metadata: Option<Value>,
    pub namespace: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    pub namespace: Option<String>,
}

pub(crate) fn effective_namespace(requested: Option<&str>, default_ns: &str) -> String {
    requested.unwrap_or(default_ns).to_string()
}

/// Namespaced key/value store. Required of every provider (spec §4.1).
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str, namespace: Option<&str>) -> Result<Option<Vec<u8>>>;
    async fn set(&self, key: &str, value: Vec<u8>, options: SetOptions) -> Result<()>;
    async fn delete(&self, key: &str, namespace: Option<&str>) -> Result<bool>;
    async fn exists(&self, key: &str, namespace: Option<&str>) -> Result<bool>;

    async fn get_many(
        &self,
        keys: &[String],
        namespace: Option<&str>,
    ) -> Result<Vec<Option<Vec<u8>>>> {
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            out.push(self.get(key, namespace).await?);
        }
        Ok(out)
    }

    async fn set_many(&self, entries: Vec<(String, Vec<u8>)>, options: SetOptions) -> Result<()> {
        for (key, value) in entries {
            self.set(&key, value, options.clone()).await?;
        }
        Ok(())
    }

    async fn delete_many(&self, keys: &[String], namespace: Option<&str>) -> Result<u64> {
        let mut count = 0;
        for key in keys {
            if self.delete(key, namespace).await? {
                count += 1;
            }
        }
        Ok(count)
    }

    async fn list(&self, prefix: &str, options: ListOptions) -> Result<Vec<String>>;
    async fn clear(&self, prefix: Option<&str>) -> Result<u64>;
}

/// Namespaced ordered-list store (spec §4.1).
#[async_trait]
pub trait ListStore: Send + Sync {
    async fn get_list(&self, key: &str, namespace: Option<&str>) -> Result<Vec<Vec<u8>>>;
    async fn save_list(&self, key: &str, items: Vec<Vec<u8>>, namespace: Option<&str>)
        -> Result<()>;
    async fn delete_list(&self, key: &str, namespace: Option<&str>) -> Result<bool>;
}

/// A single coalesced resonance write (spec §4.4's `MemoryUpdate`).
#[derive(Debug, Clone)]
pub struct MemoryUpdate {
    pub id: String,
    pub user_id: String,
    pub agent_id: String,
    pub resonance: f64,
    pub last_accessed_at: DateTime<Utc>,
    pub access_count: u64,
}

/// Result of a `findConnectedMemories` traversal (spec §4.1).
///
/// `depths` carries each memory's BFS distance from the seed (the seed
/// itself is depth 0) so callers that discount by hop count — recall's
/// connection expansion (spec §4.7 step 5) — don't have to re-derive
/// distance from `connections`, which has no inherent order.
#[derive(Debug, Clone, Default)]
pub struct ConnectedMemories {
    pub memories: Vec<MemoryRecord>,
    pub connections: Vec<MemoryConnection>,
    pub depths: std::collections::HashMap<String, usize>,
}

/// Optional `memory` capability (spec §4.1).
///
/// `batch_update_memories` is REQUIRED by this capability, not optional
/// within it — [`crate::batch::BatchUpdateProcessor::new`] rejects any
/// provider whose `memory()` capability is absent entirely, exactly as
/// spec §4.4 requires ("Construction must reject providers lacking
/// `batchUpdateMemories`").
#[async_trait]
pub trait MemoryStore: Send + Sync {
    async fn store(&self, record: MemoryRecord) -> Result<String>;

    async fn recall(
        &self,
        user_id: &str,
        agent_id: &str,
        query: &str,
        memory_type: Option<crate::record::MemoryType>,
        limit: usize,
    ) -> Result<Vec<MemoryRecord>>;

    async fn update(
        &self,
        user_id: &str,
        id: &str,
        patch: serde_json::Value,
    ) -> Result<MemoryRecord>;

    async fn delete(&self, user_id: &str, id: &str) -> Result<bool>;

    async fn get_by_id(&self, user_id: &str, id: &str) -> Result<Option<MemoryRecord>>;

    async fn get_stats(&self, user_id: &str, agent_id: Option<&str>) -> Result<MemoryStats>;

    /// All-or-nothing per call (spec §4.4/§5): either every update in the
    /// batch is persisted, or none are.
    async fn batch_update_memories(&self, updates: Vec<MemoryUpdate>) -> Result<u64>;

    /// Validates both endpoints belong to `user_id` in one transaction;
    /// upserts on `(source, target, type)`.
    async fn create_connections(
        &self,
        user_id: &str,
        edges: Vec<MemoryConnection>,
    ) -> Result<u64>;

    async fn find_connected_memories(
        &self,
        user_id: &str,
        id: &str,
        depth: usize,
    ) -> Result<ConnectedMemories>;
}

/// Optional `vector` capability (spec §4.1).
#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn upsert(&self, id: &str, embedding: Vec<f32>) -> Result<()>;
    async fn query(
        &self,
        embedding: &[f32],
        k: usize,
        filters: Option<Value>,
    ) -> Result<Vec<(String, f32)>>;
    async fn delete(&self, id: &str) -> Result<bool>;
}

/// A storage provider: required KV/list capability plus runtime-discovered
/// optional capabilities.
pub trait StorageProvider: KvStore + ListStore {
    fn memory(&self) -> Option<&dyn MemoryStore> {
        None
    }

    fn vector(&self) -> Option<&dyn VectorStore> {
        None
    }

    /// True when the provider is ready to accept operations. Providers
    /// failing their own health check surface as [`MemoryError::Fatal`] on
    /// the next operation rather than being polled eagerly.
    fn is_healthy(&self) -> bool {
        true
    }
}

/// Convenience accessor mirroring spec §4.1's capability-missing downgrade:
/// returns [`MemoryError::CapabilityMissing`] instead of panicking when a
/// caller needs the `memory` capability but the provider lacks it.
pub fn require_memory(provider: &dyn StorageProvider) -> Result<&dyn MemoryStore> {
    provider
        .memory()
        .ok_or_else(|| MemoryError::CapabilityMissing("memory".to_string()))
}
