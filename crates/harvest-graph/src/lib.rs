//! Harvest Graph - Graph store abstraction
//!
//! Provides abstraction over graph databases (SurrealDB, in-memory) for
//! storing canonical entities as nodes and canonical relations as edges,
//! plus the [`GraphWriter`] that applies the write-ordering rules.

use std::collections::BTreeSet;

use async_trait::async_trait;
use harvest_core::{
    CanonicalEntity, CanonicalRelation, Classify, EntityType, ErrorClass, RelationKey,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub mod memory;
pub mod surrealdb_store;
pub mod writer;

pub use memory::InMemoryGraphStore;
pub use surrealdb_store::SurrealDbStore;
pub use writer::{GraphWriter, WriteOutcome, WriteRecord};

// ============================================================================
// Errors
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Graph store unavailable: {0}")]
    Unavailable(String),

    #[error("Graph store timed out: {0}")]
    Timeout(String),

    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    /// An edge referenced a node that has not been written
    #[error("Dangling reference: {edge} refers to missing entity {missing}")]
    DanglingReference { edge: String, missing: Uuid },

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl Classify for StoreError {
    fn class(&self) -> ErrorClass {
        match self {
            Self::Unavailable(_) | Self::Timeout(_) => ErrorClass::TransientIO,
            Self::ConstraintViolation(_) | Self::DanglingReference { .. } => ErrorClass::InputError,
            Self::Serialization(_) => ErrorClass::ToolingError,
        }
    }
}

// ============================================================================
// Records
// ============================================================================

/// Node properties as held by a store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub entity_id: Uuid,
    pub canonical_name: String,
    pub entity_type: EntityType,
    pub aliases: BTreeSet<String>,
    pub source_document_ids: BTreeSet<Uuid>,
}

impl From<&CanonicalEntity> for NodeRecord {
    fn from(entity: &CanonicalEntity) -> Self {
        Self {
            entity_id: entity.entity_id,
            canonical_name: entity.canonical_name.clone(),
            entity_type: entity.entity_type,
            aliases: entity.alias_set.clone(),
            source_document_ids: entity.source_document_ids.clone(),
        }
    }
}

/// An edge write: the triple plus how often it was observed in this batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EdgeRecord {
    pub key: RelationKey,
    pub observed_count: u64,
    pub source_document_ids: BTreeSet<Uuid>,
}

impl From<&CanonicalRelation> for EdgeRecord {
    fn from(relation: &CanonicalRelation) -> Self {
        Self {
            key: relation.key(),
            observed_count: relation.support_count,
            source_document_ids: relation.source_document_ids.clone(),
        }
    }
}

/// Edge properties as held by a store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredEdge {
    pub key: RelationKey,
    pub support_count: u64,
    pub source_document_ids: BTreeSet<Uuid>,
}

// ============================================================================
// Store trait
// ============================================================================

/// Trait for graph database operations
///
/// Both upserts must be idempotent merges: writing a node that exists
/// unions its aliases and sources and keeps its other fields; writing an
/// edge that exists adds `observed_count` to its support count and unions
/// its sources. An edge whose endpoints are not stored is rejected with
/// [`StoreError::DanglingReference`].
#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Create or merge a node
    async fn upsert_node(&self, node: &NodeRecord) -> Result<(), StoreError>;

    /// Create or merge an edge
    async fn upsert_edge(&self, edge: &EdgeRecord) -> Result<(), StoreError>;

    /// Get node by entity ID
    async fn node(&self, entity_id: Uuid) -> Result<Option<NodeRecord>, StoreError>;

    /// Get edge by triple
    async fn edge(&self, key: &RelationKey) -> Result<Option<StoredEdge>, StoreError>;

    /// Check the store is reachable
    async fn ping(&self) -> Result<(), StoreError>;

    /// Get store name for logging
    fn name(&self) -> &str;
}
