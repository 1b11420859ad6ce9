//! In-memory graph store
//!
//! Holds nodes and edges in mutex-guarded maps. Faults and latency can be
//! injected so pipeline behaviour under store errors and slow writes can be
//! exercised without a database.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use harvest_core::RelationKey;
use uuid::Uuid;

use crate::{EdgeRecord, GraphStore, NodeRecord, StoreError, StoredEdge};

#[derive(Default)]
struct Graph {
    nodes: BTreeMap<Uuid, NodeRecord>,
    edges: BTreeMap<RelationKey, StoredEdge>,
}

/// Graph store backed by process memory
#[derive(Default)]
pub struct InMemoryGraphStore {
    graph: Mutex<Graph>,
    latency: Option<Duration>,
    /// Errors returned by upcoming writes, one per call
    faults: Mutex<VecDeque<StoreError>>,
    /// Predicates whose edge writes always fail
    rejected_predicates: Mutex<HashSet<String>>,
    unavailable: AtomicBool,
    node_writes: AtomicUsize,
    edge_writes: AtomicUsize,
}

impl InMemoryGraphStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every call by `latency`
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Fail the next writes with `errors`, in order
    pub fn fail_next(&self, errors: impl IntoIterator<Item = StoreError>) {
        lock(&self.faults).extend(errors);
    }

    /// Reject every edge write with `predicate` as a constraint violation
    pub fn reject_predicate(&self, predicate: &str) {
        lock(&self.rejected_predicates).insert(predicate.to_string());
    }

    /// Make every call, including `ping`, fail with `Unavailable`
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn nodes(&self) -> Vec<NodeRecord> {
        lock(&self.graph).nodes.values().cloned().collect()
    }

    pub fn edges(&self) -> Vec<StoredEdge> {
        lock(&self.graph).edges.values().cloned().collect()
    }

    pub fn node_count(&self) -> usize {
        lock(&self.graph).nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        lock(&self.graph).edges.len()
    }

    /// Node write calls received, failed ones included
    pub fn node_write_calls(&self) -> usize {
        self.node_writes.load(Ordering::SeqCst)
    }

    /// Edge write calls received, failed ones included
    pub fn edge_write_calls(&self) -> usize {
        self.edge_writes.load(Ordering::SeqCst)
    }

    async fn enter(&self) -> Result<(), StoreError> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("store marked unavailable".into()));
        }
        Ok(())
    }

    fn injected_fault(&self) -> Option<StoreError> {
        lock(&self.faults).pop_front()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl GraphStore for InMemoryGraphStore {
    async fn upsert_node(&self, node: &NodeRecord) -> Result<(), StoreError> {
        self.node_writes.fetch_add(1, Ordering::SeqCst);
        self.enter().await?;
        if let Some(fault) = self.injected_fault() {
            return Err(fault);
        }

        let mut graph = lock(&self.graph);
        graph
            .nodes
            .entry(node.entity_id)
            .and_modify(|existing| {
                existing.aliases.extend(node.aliases.iter().cloned());
                existing
                    .source_document_ids
                    .extend(node.source_document_ids.iter().copied());
            })
            .or_insert_with(|| node.clone());
        Ok(())
    }

    async fn upsert_edge(&self, edge: &EdgeRecord) -> Result<(), StoreError> {
        self.edge_writes.fetch_add(1, Ordering::SeqCst);
        self.enter().await?;
        if let Some(fault) = self.injected_fault() {
            return Err(fault);
        }
        if lock(&self.rejected_predicates).contains(&edge.key.predicate) {
            return Err(StoreError::ConstraintViolation(format!(
                "predicate '{}' rejected",
                edge.key.predicate
            )));
        }

        let mut graph = lock(&self.graph);
        for endpoint in [edge.key.subject_entity_id, edge.key.object_entity_id] {
            if !graph.nodes.contains_key(&endpoint) {
                return Err(StoreError::DanglingReference {
                    edge: edge.key.to_string(),
                    missing: endpoint,
                });
            }
        }

        graph
            .edges
            .entry(edge.key.clone())
            .and_modify(|existing| {
                existing.support_count += edge.observed_count;
                existing
                    .source_document_ids
                    .extend(edge.source_document_ids.iter().copied());
            })
            .or_insert_with(|| StoredEdge {
                key: edge.key.clone(),
                support_count: edge.observed_count,
                source_document_ids: edge.source_document_ids.clone(),
            });
        Ok(())
    }

    async fn node(&self, entity_id: Uuid) -> Result<Option<NodeRecord>, StoreError> {
        self.enter().await?;
        Ok(lock(&self.graph).nodes.get(&entity_id).cloned())
    }

    async fn edge(&self, key: &RelationKey) -> Result<Option<StoredEdge>, StoreError> {
        self.enter().await?;
        Ok(lock(&self.graph).edges.get(key).cloned())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.enter().await
    }

    fn name(&self) -> &str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use harvest_core::EntityType;
    use std::collections::BTreeSet;

    fn node(id: u128, name: &str, aliases: &[&str], doc: u128) -> NodeRecord {
        NodeRecord {
            entity_id: Uuid::from_u128(id),
            canonical_name: name.to_string(),
            entity_type: EntityType::Person,
            aliases: aliases.iter().map(|a| a.to_string()).collect(),
            source_document_ids: BTreeSet::from([Uuid::from_u128(doc)]),
        }
    }

    fn edge(subject: u128, object: u128, count: u64) -> EdgeRecord {
        EdgeRecord {
            key: RelationKey::new(Uuid::from_u128(subject), "works_at", Uuid::from_u128(object)),
            observed_count: count,
            source_document_ids: BTreeSet::from([Uuid::from_u128(99)]),
        }
    }

    #[tokio::test]
    async fn test_node_merge_keeps_name_and_unions_sets() {
        let store = InMemoryGraphStore::new();
        store.upsert_node(&node(1, "Jon Smith", &["Jon Smith"], 10)).await.unwrap();
        store.upsert_node(&node(1, "J. Smith", &["J. Smith"], 11)).await.unwrap();

        let stored = store.node(Uuid::from_u128(1)).await.unwrap().unwrap();
        assert_eq!(stored.canonical_name, "Jon Smith");
        assert_eq!(stored.aliases.len(), 2);
        assert_eq!(stored.source_document_ids.len(), 2);
        assert_eq!(store.node_count(), 1);
    }

    #[tokio::test]
    async fn test_edge_requires_both_nodes() {
        let store = InMemoryGraphStore::new();
        store.upsert_node(&node(1, "Jon Smith", &[], 10)).await.unwrap();

        let err = store.upsert_edge(&edge(1, 2, 1)).await.unwrap_err();
        assert_eq!(
            err,
            StoreError::DanglingReference {
                edge: edge(1, 2, 1).key.to_string(),
                missing: Uuid::from_u128(2),
            }
        );
        assert_eq!(store.edge_count(), 0);
    }

    #[tokio::test]
    async fn test_edge_support_accumulates() {
        let store = InMemoryGraphStore::new();
        store.upsert_node(&node(1, "Jon Smith", &[], 10)).await.unwrap();
        store.upsert_node(&node(2, "Acme", &[], 10)).await.unwrap();

        store.upsert_edge(&edge(1, 2, 2)).await.unwrap();
        store.upsert_edge(&edge(1, 2, 3)).await.unwrap();

        let stored = store.edge(&edge(1, 2, 0).key).await.unwrap().unwrap();
        assert_eq!(stored.support_count, 5);
        assert_eq!(store.edge_count(), 1);
    }

    #[tokio::test]
    async fn test_injected_faults_and_unavailability() {
        let store = InMemoryGraphStore::new();
        store.fail_next([StoreError::Timeout("slow".into())]);

        let first = store.upsert_node(&node(1, "Jon Smith", &[], 10)).await;
        assert_eq!(first, Err(StoreError::Timeout("slow".into())));
        assert!(store.upsert_node(&node(1, "Jon Smith", &[], 10)).await.is_ok());
        assert_eq!(store.node_write_calls(), 2);

        store.set_unavailable(true);
        assert!(matches!(store.ping().await, Err(StoreError::Unavailable(_))));
    }
}
