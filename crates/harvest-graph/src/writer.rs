//! Graph writer
//!
//! Validates canonical records, applies them to a [`GraphStore`] under the
//! write retry policy, and remembers which entities have been committed so
//! that no edge is ever written before both of its endpoints.

use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock};

use harvest_core::{CanonicalEntity, CanonicalRelation, RetryFailure, RetryPolicy};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{EdgeRecord, GraphStore, NodeRecord, StoreError};

/// One unit of work for the GraphWriter
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteRecord {
    Entity(CanonicalEntity),
    Relation(CanonicalRelation),
}

impl WriteRecord {
    /// Documents that contributed to this record
    pub fn source_document_ids(&self) -> &BTreeSet<Uuid> {
        match self {
            Self::Entity(entity) => &entity.source_document_ids,
            Self::Relation(relation) => &relation.source_document_ids,
        }
    }
}

impl std::fmt::Display for WriteRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Entity(entity) => write!(
                f,
                "entity {} ({} '{}')",
                entity.entity_id, entity.entity_type, entity.canonical_name
            ),
            Self::Relation(relation) => write!(f, "relation {}", relation.key()),
        }
    }
}

/// A successful write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteOutcome {
    /// Store calls made, retries included
    pub attempts: u32,
}

/// Applies canonical records to a graph store
pub struct GraphWriter {
    store: Arc<dyn GraphStore>,
    retry: RetryPolicy,
    committed: RwLock<HashSet<Uuid>>,
}

impl GraphWriter {
    pub fn new(store: Arc<dyn GraphStore>, retry: RetryPolicy) -> Self {
        Self {
            store,
            retry,
            committed: RwLock::new(HashSet::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn GraphStore> {
        &self.store
    }

    /// Whether an entity was written by this writer
    pub fn is_committed(&self, entity_id: &Uuid) -> bool {
        self.committed
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains(entity_id)
    }

    pub fn committed_count(&self) -> usize {
        self.committed
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    /// Write one record.
    ///
    /// Validation failures never reach the store and report zero attempts.
    /// Transient store errors are retried; an exhausted budget is reported
    /// with `exhausted` set.
    pub async fn write(&self, record: &WriteRecord) -> Result<WriteOutcome, RetryFailure<StoreError>> {
        self.validate(record).map_err(|error| RetryFailure {
            error,
            attempts: 0,
            exhausted: false,
        })?;

        let attempts = AtomicU32::new(0);
        let calls = &attempts;
        let store = self.store.as_ref();
        let operation = format!("write {record}");

        match record {
            WriteRecord::Entity(entity) => {
                let node = NodeRecord::from(entity);
                let node = &node;
                self.retry
                    .retry(&operation, move || {
                        calls.fetch_add(1, Ordering::SeqCst);
                        store.upsert_node(node)
                    })
                    .await
                    .inspect_err(|failure| warn!(%record, error = %failure, "Entity write failed"))?;

                self.committed
                    .write()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .insert(entity.entity_id);
            }
            WriteRecord::Relation(relation) => {
                let edge = EdgeRecord::from(relation);
                let edge = &edge;
                self.retry
                    .retry(&operation, move || {
                        calls.fetch_add(1, Ordering::SeqCst);
                        store.upsert_edge(edge)
                    })
                    .await
                    .inspect_err(|failure| warn!(%record, error = %failure, "Relation write failed"))?;
            }
        }

        let attempts = attempts.load(Ordering::SeqCst);
        debug!(%record, attempts, store = store.name(), "Record written");
        Ok(WriteOutcome { attempts })
    }

    fn validate(&self, record: &WriteRecord) -> Result<(), StoreError> {
        match record {
            WriteRecord::Entity(entity) => {
                if entity.entity_id.is_nil() {
                    return Err(StoreError::ConstraintViolation(
                        "entity id must not be nil".into(),
                    ));
                }
                if entity.canonical_name.trim().is_empty() {
                    return Err(StoreError::ConstraintViolation(format!(
                        "entity {} has an empty canonical name",
                        entity.entity_id
                    )));
                }
            }
            WriteRecord::Relation(relation) => {
                if relation.predicate.trim().is_empty() {
                    return Err(StoreError::ConstraintViolation(format!(
                        "relation {} has an empty predicate",
                        relation.key()
                    )));
                }
                if relation.subject_entity_id.is_nil() || relation.object_entity_id.is_nil() {
                    return Err(StoreError::ConstraintViolation(format!(
                        "relation {} has a nil endpoint",
                        relation.key()
                    )));
                }
                for endpoint in [relation.subject_entity_id, relation.object_entity_id] {
                    if !self.is_committed(&endpoint) {
                        return Err(StoreError::DanglingReference {
                            edge: relation.key().to_string(),
                            missing: endpoint,
                        });
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InMemoryGraphStore;
    use harvest_core::{EntityType, RelationKey};
    use std::time::Duration;

    fn entity(id: u128, name: &str) -> CanonicalEntity {
        CanonicalEntity {
            entity_id: Uuid::from_u128(id),
            canonical_name: name.to_string(),
            entity_type: EntityType::Person,
            alias_set: BTreeSet::from([name.to_string()]),
            source_document_ids: BTreeSet::from([Uuid::from_u128(100)]),
        }
    }

    fn relation(subject: u128, predicate: &str, object: u128, support: u64) -> CanonicalRelation {
        CanonicalRelation {
            subject_entity_id: Uuid::from_u128(subject),
            predicate: predicate.to_string(),
            object_entity_id: Uuid::from_u128(object),
            support_count: support,
            source_document_ids: BTreeSet::from([Uuid::from_u128(100)]),
        }
    }

    fn fast_retry(max_retries: u32) -> RetryPolicy {
        RetryPolicy::new(max_retries, Duration::from_millis(1), Duration::from_millis(2))
    }

    fn writer(store: &Arc<InMemoryGraphStore>, max_retries: u32) -> GraphWriter {
        GraphWriter::new(store.clone(), fast_retry(max_retries))
    }

    #[tokio::test]
    async fn test_rewriting_relation_accumulates_support() {
        let store = Arc::new(InMemoryGraphStore::new());
        let writer = writer(&store, 0);

        writer.write(&WriteRecord::Entity(entity(1, "Jon Smith"))).await.unwrap();
        writer.write(&WriteRecord::Entity(entity(2, "Acme Corp"))).await.unwrap();
        writer.write(&WriteRecord::Entity(entity(1, "Jon Smith"))).await.unwrap();

        let rel = WriteRecord::Relation(relation(1, "works_at", 2, 2));
        writer.write(&rel).await.unwrap();
        writer.write(&rel).await.unwrap();

        assert_eq!(store.node_count(), 2);
        let stored = store
            .edge(&RelationKey::new(Uuid::from_u128(1), "works_at", Uuid::from_u128(2)))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.support_count, 4);
        assert_eq!(writer.committed_count(), 2);
    }

    #[tokio::test]
    async fn test_relation_before_endpoints_never_reaches_store() {
        let store = Arc::new(InMemoryGraphStore::new());
        let writer = writer(&store, 3);

        writer.write(&WriteRecord::Entity(entity(1, "Jon Smith"))).await.unwrap();
        let failure = writer
            .write(&WriteRecord::Relation(relation(1, "works_at", 2, 1)))
            .await
            .unwrap_err();

        assert_eq!(failure.attempts, 0);
        assert!(matches!(
            failure.error,
            StoreError::DanglingReference { missing, .. } if missing == Uuid::from_u128(2)
        ));
        assert_eq!(store.edge_write_calls(), 0);
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let store = Arc::new(InMemoryGraphStore::new());
        store.fail_next([
            StoreError::Timeout("slow".into()),
            StoreError::Unavailable("restarting".into()),
        ]);
        let writer = writer(&store, 3);

        let outcome = writer
            .write(&WriteRecord::Entity(entity(1, "Jon Smith")))
            .await
            .unwrap();

        assert_eq!(outcome.attempts, 3);
        assert!(writer.is_committed(&Uuid::from_u128(1)));
    }

    #[tokio::test]
    async fn test_retry_budget_is_bounded() {
        let store = Arc::new(InMemoryGraphStore::new());
        store.set_unavailable(true);
        let writer = writer(&store, 2);

        let failure = writer
            .write(&WriteRecord::Entity(entity(1, "Jon Smith")))
            .await
            .unwrap_err();

        assert_eq!(failure.attempts, 3);
        assert!(failure.exhausted);
        assert_eq!(store.node_write_calls(), 3);
        assert!(!writer.is_committed(&Uuid::from_u128(1)));
    }

    #[tokio::test]
    async fn test_constraint_violation_is_not_retried() {
        let store = Arc::new(InMemoryGraphStore::new());
        store.reject_predicate("located_in");
        let writer = writer(&store, 3);

        writer.write(&WriteRecord::Entity(entity(1, "Acme"))).await.unwrap();
        writer.write(&WriteRecord::Entity(entity(2, "Berlin"))).await.unwrap();
        let failure = writer
            .write(&WriteRecord::Relation(relation(1, "located_in", 2, 1)))
            .await
            .unwrap_err();

        assert_eq!(failure.attempts, 1);
        assert!(!failure.exhausted);
        assert!(matches!(failure.error, StoreError::ConstraintViolation(_)));
    }

    #[tokio::test]
    async fn test_malformed_records_rejected() {
        let store = Arc::new(InMemoryGraphStore::new());
        let writer = writer(&store, 3);

        let unnamed = writer.write(&WriteRecord::Entity(entity(1, "  "))).await.unwrap_err();
        assert!(matches!(unnamed.error, StoreError::ConstraintViolation(_)));

        let nil = writer.write(&WriteRecord::Entity(entity(0, "Jon"))).await.unwrap_err();
        assert!(matches!(nil.error, StoreError::ConstraintViolation(_)));

        writer.write(&WriteRecord::Entity(entity(1, "Jon"))).await.unwrap();
        writer.write(&WriteRecord::Entity(entity(2, "Acme"))).await.unwrap();
        let blank = writer
            .write(&WriteRecord::Relation(relation(1, "", 2, 1)))
            .await
            .unwrap_err();
        assert!(matches!(blank.error, StoreError::ConstraintViolation(_)));
        assert_eq!(store.edge_write_calls(), 0);
    }
}
