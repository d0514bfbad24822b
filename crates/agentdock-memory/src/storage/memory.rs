//! In-memory reference [`StorageProvider`] (spec §4.1).
//!
//! This is what ships with the engine: a full implementation of every
//! capability backed by `std::sync::RwLock`-guarded maps, matching the
//! teacher's posture of keeping connection state behind narrow locks
//! rather than one coarse lock around the whole store (`storage/sqlite.rs`'s
//! separate `writer`/`reader` `Mutex<Connection>` fields). It exists so the
//! engine's tests and examples can exercise the full store → decay →
//! recall → connection pipeline without depending on a real database, and
//! it is a reasonable starting point for an embedded host application.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;

use super::{
    effective_namespace, ConnectedMemories, KvStore, ListOptions, ListStore, MemoryStore,
    MemoryUpdate, SetOptions, StorageProvider, DEFAULT_NAMESPACE,
};
use crate::error::{MemoryError, Result};
use crate::record::{MemoryConnection, MemoryRecord, MemoryStats, MemoryType};

#[derive(Default)]
struct Namespaced<V> {
    by_namespace: HashMap<String, HashMap<String, V>>,
}

impl<V: Clone> Namespaced<V> {
    fn ns_mut(&mut self, ns: &str) -> &mut HashMap<String, V> {
        self.by_namespace.entry(ns.to_string()).or_default()
    }

    fn ns(&self, ns: &str) -> Option<&HashMap<String, V>> {
        self.by_namespace.get(ns)
    }
}

pub struct InMemoryProvider {
    default_namespace: String,
    kv: RwLock<Namespaced<Vec<u8>>>,
    lists: RwLock<Namespaced<Vec<Vec<u8>>>>,
    records: RwLock<HashMap<String, MemoryRecord>>,
    connections: RwLock<Vec<MemoryConnection>>,
}

impl Default for InMemoryProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryProvider {
    pub fn new() -> Self {
        Self {
            default_namespace: DEFAULT_NAMESPACE.to_string(),
            kv: RwLock::new(Namespaced::default()),
            lists: RwLock::new(Namespaced::default()),
            records: RwLock::new(HashMap::new()),
            connections: RwLock::new(Vec::new()),
        }
    }

    fn ns(&self, requested: Option<&str>) -> String {
        effective_namespace(requested, &self.default_namespace)
    }
}

#[async_trait]
impl KvStore for InMemoryProvider {
    async fn get(&self, key: &str, namespace: Option<&str>) -> Result<Option<Vec<u8>>> {
        let ns = self.ns(namespace);
        let guard = self.kv.read().map_err(|_| MemoryError::Fatal("kv store poisoned".into()))?;
        Ok(guard.ns(&ns).and_then(|m| m.get(key)).cloned())
    }

    async fn set(&self, key: &str, value: Vec<u8>, options: SetOptions) -> Result<()> {
        let ns = self.ns(options.namespace.as_deref());
        let mut guard = self.kv.write().map_err(|_| MemoryError::Fatal("kv store poisoned".into()))?;
        guard.ns_mut(&ns).insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str, namespace: Option<&str>) -> Result<bool> {
        let ns = self.ns(namespace);
        let mut guard = self.kv.write().map_err(|_| MemoryError::Fatal("kv store poisoned".into()))?;
        Ok(guard.ns_mut(&ns).remove(key).is_some())
    }

    async fn exists(&self, key: &str, namespace: Option<&str>) -> Result<bool> {
        Ok(self.get(key, namespace).await?.is_some())
    }

    async fn list(&self, prefix: &str, options: ListOptions) -> Result<Vec<String>> {
        let ns = self.ns(options.namespace.as_deref());
        let guard = self.kv.read().map_err(|_| MemoryError::Fatal("kv store poisoned".into()))?;
        let mut keys: Vec<String> = guard
            .ns(&ns)
            .map(|m| m.keys().filter(|k| k.starts_with(prefix)).cloned().collect())
            .unwrap_or_default();
        keys.sort();
        let offset = options.offset.unwrap_or(0);
        let keys = keys.into_iter().skip(offset);
        Ok(match options.limit {
            Some(limit) => keys.take(limit).collect(),
            None => keys.collect(),
        })
    }

    async fn clear(&self, prefix: Option<&str>) -> Result<u64> {
        let mut guard = self.kv.write().map_err(|_| MemoryError::Fatal("kv store poisoned".into()))?;
        let mut removed = 0u64;
        for map in guard.by_namespace.values_mut() {
            let keys: Vec<String> = match prefix {
                Some(p) => map.keys().filter(|k| k.starts_with(p)).cloned().collect(),
                None => map.keys().cloned().collect(),
            };
            for k in keys {
                map.remove(&k);
                removed += 1;
            }
        }
        Ok(removed)
    }
}

#[async_trait]
impl ListStore for InMemoryProvider {
    async fn get_list(&self, key: &str, namespace: Option<&str>) -> Result<Vec<Vec<u8>>> {
        let ns = self.ns(namespace);
        let guard = self.lists.read().map_err(|_| MemoryError::Fatal("list store poisoned".into()))?;
        Ok(guard.ns(&ns).and_then(|m| m.get(key)).cloned().unwrap_or_default())
    }

    async fn save_list(
        &self,
        key: &str,
        items: Vec<Vec<u8>>,
        namespace: Option<&str>,
    ) -> Result<()> {
        let ns = self.ns(namespace);
        let mut guard = self.lists.write().map_err(|_| MemoryError::Fatal("list store poisoned".into()))?;
        guard.ns_mut(&ns).insert(key.to_string(), items);
        Ok(())
    }

    async fn delete_list(&self, key: &str, namespace: Option<&str>) -> Result<bool> {
        let ns = self.ns(namespace);
        let mut guard = self.lists.write().map_err(|_| MemoryError::Fatal("list store poisoned".into()))?;
        Ok(guard.ns_mut(&ns).remove(key).is_some())
    }
}

#[async_trait]
impl MemoryStore for InMemoryProvider {
    async fn store(&self, mut record: MemoryRecord) -> Result<String> {
        if record.user_id.is_empty() || record.agent_id.is_empty() {
            return Err(MemoryError::invalid_argument(
                "userId and agentId must be non-empty",
            ));
        }
        record.updated_at = Utc::now();
        let id = record.id.clone();
        let mut guard = self.records.write().map_err(|_| MemoryError::Fatal("records poisoned".into()))?;
        guard.insert(id.clone(), record);
        Ok(id)
    }

    async fn recall(
        &self,
        user_id: &str,
        agent_id: &str,
        query: &str,
        memory_type: Option<MemoryType>,
        limit: usize,
    ) -> Result<Vec<MemoryRecord>> {
        let guard = self.records.read().map_err(|_| MemoryError::Fatal("records poisoned".into()))?;
        let q = query.to_lowercase();
        let mut matches: Vec<MemoryRecord> = guard
            .values()
            .filter(|r| r.user_id == user_id && r.agent_id == agent_id && r.is_active())
            .filter(|r| memory_type.is_none_or(|t| r.memory_type == t))
            .filter(|r| q.is_empty() || r.content.to_lowercase().contains(&q))
            .cloned()
            .collect();
        matches.sort_by(|a, b| {
            b.importance
                .partial_cmp(&a.importance)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.created_at.cmp(&a.created_at))
        });
        matches.truncate(limit);
        Ok(matches)
    }

    async fn update(
        &self,
        user_id: &str,
        id: &str,
        patch: Value,
    ) -> Result<MemoryRecord> {
        let mut guard = self.records.write().map_err(|_| MemoryError::Fatal("records poisoned".into()))?;
        let record = guard
            .get_mut(id)
            .filter(|r| r.user_id == user_id)
            .ok_or_else(|| MemoryError::not_found(format!("record {id}")))?;

        if let Some(content) = patch.get("content").and_then(Value::as_str) {
            record.content = content.to_string();
        }
        if let Some(importance) = patch.get("importance").and_then(Value::as_f64) {
            record.importance = importance.clamp(0.0, 1.0);
        }
        if let Some(resonance) = patch.get("resonance").and_then(Value::as_f64) {
            record.resonance = resonance;
            record.clamp_resonance();
        }
        if let Some(status) = patch.get("status").and_then(Value::as_str) {
            record.status = match status {
                "archived" => crate::record::MemoryStatus::Archived,
                _ => crate::record::MemoryStatus::Active,
            };
        }
        record.updated_at = Utc::now();
        Ok(record.clone())
    }

    async fn delete(&self, user_id: &str, id: &str) -> Result<bool> {
        let mut guard = self.records.write().map_err(|_| MemoryError::Fatal("records poisoned".into()))?;
        if guard.get(id).is_some_and(|r| r.user_id == user_id) {
            guard.remove(id);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn get_by_id(&self, user_id: &str, id: &str) -> Result<Option<MemoryRecord>> {
        let guard = self.records.read().map_err(|_| MemoryError::Fatal("records poisoned".into()))?;
        Ok(guard
            .get(id)
            .filter(|r| r.user_id == user_id)
            .cloned())
    }

    async fn get_stats(&self, user_id: &str, agent_id: Option<&str>) -> Result<MemoryStats> {
        let guard = self.records.read().map_err(|_| MemoryError::Fatal("records poisoned".into()))?;
        let mut stats = MemoryStats::default();
        let mut resonance_sum = 0.0;
        let mut importance_sum = 0.0;

        for record in guard.values() {
            if record.user_id != user_id {
                continue;
            }
            if let Some(agent) = agent_id {
                if record.agent_id != agent {
                    continue;
                }
            }
            stats.total_records += 1;
            if record.is_active() {
                stats.active_records += 1;
            } else {
                stats.archived_records += 1;
            }
            resonance_sum += record.resonance;
            importance_sum += record.importance;
            *stats
                .by_tier
                .entry(record.memory_type.as_str().to_string())
                .or_insert(0) += 1;
        }

        if stats.total_records > 0 {
            stats.average_resonance = resonance_sum / stats.total_records as f64;
            stats.average_importance = importance_sum / stats.total_records as f64;
        }
        Ok(stats)
    }

    async fn batch_update_memories(&self, updates: Vec<MemoryUpdate>) -> Result<u64> {
        // All-or-nothing: validate every target exists before mutating any
        // of them, so a partial batch never leaves the store half-written.
        let mut guard = self.records.write().map_err(|_| MemoryError::Fatal("records poisoned".into()))?;
        for update in &updates {
            if !guard.contains_key(&update.id) {
                return Err(MemoryError::not_found(format!(
                    "batch update references unknown record {}",
                    update.id
                )));
            }
        }
        for update in &updates {
            if let Some(record) = guard.get_mut(&update.id) {
                record.resonance = update.resonance;
                record.clamp_resonance();
                record.last_accessed_at = record.last_accessed_at.max(update.last_accessed_at);
                record.access_count = record.access_count.max(update.access_count);
                record.updated_at = Utc::now();
            }
        }
        Ok(updates.len() as u64)
    }

    async fn create_connections(
        &self,
        user_id: &str,
        edges: Vec<MemoryConnection>,
    ) -> Result<u64> {
        let records = self.records.read().map_err(|_| MemoryError::Fatal("records poisoned".into()))?;
        for edge in &edges {
            let source = records
                .get(&edge.source_memory_id)
                .ok_or_else(|| MemoryError::not_found(format!("source {}", edge.source_memory_id)))?;
            let target = records
                .get(&edge.target_memory_id)
                .ok_or_else(|| MemoryError::not_found(format!("target {}", edge.target_memory_id)))?;
            if source.user_id != user_id || target.user_id != user_id || source.user_id != target.user_id {
                return Err(MemoryError::conflict(
                    "connection endpoints must belong to the same user as the caller",
                ));
            }
        }
        drop(records);

        let mut connections = self.connections.write().map_err(|_| MemoryError::Fatal("connections poisoned".into()))?;
        let mut written = 0u64;
        for edge in edges {
            if let Some(existing) = connections.iter_mut().find(|c| {
                c.source_memory_id == edge.source_memory_id
                    && c.target_memory_id == edge.target_memory_id
                    && c.connection_type == edge.connection_type
            }) {
                *existing = edge;
            } else {
                connections.push(edge);
            }
            written += 1;
        }
        Ok(written)
    }

    async fn find_connected_memories(
        &self,
        user_id: &str,
        id: &str,
        depth: usize,
    ) -> Result<ConnectedMemories> {
        let records = self.records.read().map_err(|_| MemoryError::Fatal("records poisoned".into()))?;
        let connections = self.connections.read().map_err(|_| MemoryError::Fatal("connections poisoned".into()))?;

        let Some(seed) = records.get(id).filter(|r| r.user_id == user_id) else {
            return Ok(ConnectedMemories::default());
        };

        let mut visited = std::collections::HashSet::new();
        visited.insert(seed.id.clone());
        let mut depths = std::collections::HashMap::new();
        depths.insert(seed.id.clone(), 0usize);
        let mut frontier = vec![seed.id.clone()];
        let mut found_edges: Vec<MemoryConnection> = Vec::new();

        for hop in 1..=depth {
            let mut next_frontier = Vec::new();
            for node_id in &frontier {
                for edge in connections.iter().filter(|c| {
                    c.user_id == user_id && (&c.source_memory_id == node_id || &c.target_memory_id == node_id)
                }) {
                    let neighbor = if &edge.source_memory_id == node_id {
                        &edge.target_memory_id
                    } else {
                        &edge.source_memory_id
                    };
                    if records.get(neighbor).is_some_and(|r| r.user_id == user_id) {
                        found_edges.push(edge.clone());
                        if visited.insert(neighbor.clone()) {
                            depths.insert(neighbor.clone(), hop);
                            next_frontier.push(neighbor.clone());
                        }
                    }
                }
            }
            frontier = next_frontier;
            if frontier.is_empty() {
                break;
            }
        }

        found_edges.sort_by(|a, b| a.id.cmp(&b.id));
        found_edges.dedup_by(|a, b| a.id == b.id);

        let memories = visited
            .into_iter()
            .filter_map(|id| records.get(&id).cloned())
            .collect();

        Ok(ConnectedMemories {
            memories,
            connections: found_edges,
            depths,
        })
    }
}

impl StorageProvider for InMemoryProvider {
    fn memory(&self) -> Option<&dyn MemoryStore> {
        Some(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::ConnectionType;

    #[tokio::test]
    async fn kv_roundtrip() {
        let p = InMemoryProvider::new();
        p.set("k", b"v".to_vec(), SetOptions::default()).await.unwrap();
        assert_eq!(p.get("k", None).await.unwrap(), Some(b"v".to_vec()));
        assert!(KvStore::delete(&p, "k", None).await.unwrap());
        assert_eq!(p.get("k", None).await.unwrap(), None);
    }

    #[tokio::test]
    async fn tenant_isolation_on_get_by_id() {
        let p = InMemoryProvider::new();
        let r = MemoryRecord::new("alice", "agent1", MemoryType::Episodic, "alpha", 0.5);
        let id = p.store(r).await.unwrap();
        assert!(p.get_by_id("bob", &id).await.unwrap().is_none());
        assert!(p.get_by_id("alice", &id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn recall_never_crosses_tenants() {
        let p = InMemoryProvider::new();
        p.store(MemoryRecord::new("alice", "a1", MemoryType::Episodic, "alpha", 0.5))
            .await
            .unwrap();
        p.store(MemoryRecord::new("bob", "a1", MemoryType::Episodic, "beta", 0.5))
            .await
            .unwrap();

        let alice_results = p.recall("alice", "a1", "beta", None, 10).await.unwrap();
        assert!(alice_results.is_empty());
    }

    #[tokio::test]
    async fn find_connected_memories_is_tenant_filtered_and_idempotent_at_depth_zero() {
        let p = InMemoryProvider::new();
        let a = p
            .store(MemoryRecord::new("alice", "a1", MemoryType::Episodic, "alpha", 0.5))
            .await
            .unwrap();
        let b = p
            .store(MemoryRecord::new("alice", "a1", MemoryType::Episodic, "alpha2", 0.5))
            .await
            .unwrap();
        p.create_connections(
            "alice",
            vec![MemoryConnection::new(
                "alice",
                &a,
                &b,
                ConnectionType::Similar,
                0.9,
                "test",
            )],
        )
        .await
        .unwrap();

        let zero_hop = p.find_connected_memories("alice", &a, 0).await.unwrap();
        assert_eq!(zero_hop.memories.len(), 1);
        assert_eq!(zero_hop.memories[0].id, a);
        assert!(zero_hop.connections.is_empty());

        let one_hop = p.find_connected_memories("alice", &a, 1).await.unwrap();
        assert_eq!(one_hop.memories.len(), 2);
        assert_eq!(one_hop.connections.len(), 1);
    }

    #[tokio::test]
    async fn create_connections_rejects_cross_tenant_edges() {
        let p = InMemoryProvider::new();
        let a = p
            .store(MemoryRecord::new("alice", "a1", MemoryType::Episodic, "alpha", 0.5))
            .await
            .unwrap();
        let b = p
            .store(MemoryRecord::new("bob", "a1", MemoryType::Episodic, "beta", 0.5))
            .await
            .unwrap();

        let result = p
            .create_connections(
                "alice",
                vec![MemoryConnection::new("alice", &a, &b, ConnectionType::Related, 0.5, "x")],
            )
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn batch_update_merges_monotone_fields_via_max() {
        let p = InMemoryProvider::new();
        let id = p
            .store(MemoryRecord::new("alice", "a1", MemoryType::Episodic, "alpha", 0.5))
            .await
            .unwrap();

        p.batch_update_memories(vec![MemoryUpdate {
            id: id.clone(),
            user_id: "alice".into(),
            agent_id: "a1".into(),
            resonance: 0.9,
            last_accessed_at: Utc::now(),
            access_count: 7,
        }])
        .await
        .unwrap();

        let record = p.get_by_id("alice", &id).await.unwrap().unwrap();
        assert_eq!(record.resonance, 0.9);
        assert_eq!(record.access_count, 7);
    }
}
