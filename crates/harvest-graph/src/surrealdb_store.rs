//! SurrealDB implementation for graph storage
//!
//! Entities live in the `entity` table keyed by entity id; relations are
//! `relates` graph edges keyed by the deterministic edge id, so rewriting
//! the same triple lands on the same record.

use std::collections::BTreeSet;
use std::future::IntoFuture;
use std::time::Duration;

use async_trait::async_trait;
use harvest_core::{EntityType, GraphConfig, RelationKey};
use serde::Deserialize;
use surrealdb::engine::remote::ws::{Client, Ws};
use surrealdb::opt::auth::Root;
use surrealdb::Surreal;
use tracing::{debug, info};
use uuid::Uuid;

use crate::{EdgeRecord, GraphStore, NodeRecord, StoreError, StoredEdge};

const SCHEMA: &str = r#"
    DEFINE TABLE IF NOT EXISTS entity SCHEMAFULL;
    DEFINE FIELD IF NOT EXISTS canonical_name ON entity TYPE string;
    DEFINE FIELD IF NOT EXISTS entity_type ON entity TYPE string;
    DEFINE FIELD IF NOT EXISTS aliases ON entity TYPE array<string>;
    DEFINE FIELD IF NOT EXISTS source_document_ids ON entity TYPE array<string>;
    DEFINE FIELD IF NOT EXISTS created_at ON entity TYPE datetime DEFAULT time::now();
    DEFINE FIELD IF NOT EXISTS updated_at ON entity TYPE datetime DEFAULT time::now();
    DEFINE INDEX IF NOT EXISTS idx_entity_type ON entity FIELDS entity_type;

    DEFINE TABLE IF NOT EXISTS relates TYPE RELATION IN entity OUT entity SCHEMAFULL;
    DEFINE FIELD IF NOT EXISTS predicate ON relates TYPE string;
    DEFINE FIELD IF NOT EXISTS support_count ON relates TYPE int;
    DEFINE FIELD IF NOT EXISTS source_document_ids ON relates TYPE array<string>;
    DEFINE FIELD IF NOT EXISTS updated_at ON relates TYPE datetime DEFAULT time::now();
    DEFINE INDEX IF NOT EXISTS idx_relates_triple ON relates FIELDS in, predicate, out UNIQUE;
"#;

const UPSERT_NODE: &str = r#"
    UPSERT type::thing('entity', $id) SET
        canonical_name = canonical_name ?? $canonical_name,
        entity_type = entity_type ?? $entity_type,
        aliases = array::union(aliases ?? [], $aliases),
        source_document_ids = array::union(source_document_ids ?? [], $sources),
        updated_at = time::now();
"#;

const SELECT_NODE: &str = r#"
    SELECT canonical_name, entity_type, aliases, source_document_ids
    FROM ONLY type::thing('entity', $id);
"#;

const SELECT_EDGE: &str = r#"
    SELECT support_count, source_document_ids
    FROM ONLY type::thing('relates', $id);
"#;

/// SurrealDB graph store implementation
pub struct SurrealDbStore {
    client: Surreal<Client>,
    timeout: Duration,
}

impl SurrealDbStore {
    /// Create a new SurrealDB connection
    pub async fn new(config: &GraphConfig) -> Result<Self, StoreError> {
        // The ws engine adds its own scheme
        let url = config
            .surrealdb_url
            .strip_prefix("ws://")
            .or_else(|| config.surrealdb_url.strip_prefix("wss://"))
            .unwrap_or(&config.surrealdb_url);
        let timeout = config.request_timeout();

        let client = deadline(timeout, "connect", Surreal::new::<Ws>(url)).await?;

        deadline(
            timeout,
            "signin",
            client.signin(Root {
                username: &config.surrealdb_user,
                password: &config.surrealdb_pass,
            }),
        )
        .await?;

        deadline(
            timeout,
            "use_ns",
            client
                .use_ns(&config.surrealdb_namespace)
                .use_db(&config.surrealdb_database),
        )
        .await?;

        info!(
            url = %config.surrealdb_url,
            namespace = %config.surrealdb_namespace,
            database = %config.surrealdb_database,
            "Connected to SurrealDB"
        );

        Ok(Self { client, timeout })
    }

    /// Initialize schema (idempotent, run on setup)
    pub async fn init_schema(&self) -> Result<(), StoreError> {
        let response = deadline(self.timeout, "init_schema", self.client.query(SCHEMA)).await?;
        response
            .check()
            .map_err(|e| map_db_error("init_schema", e))?;
        info!("SurrealDB schema initialised");
        Ok(())
    }

    async fn fetch_node(&self, entity_id: Uuid) -> Result<Option<NodeRow>, StoreError> {
        let mut response = deadline(
            self.timeout,
            "select node",
            self.client
                .query(SELECT_NODE)
                .bind(("id", entity_id.to_string())),
        )
        .await?;
        response
            .take::<Option<NodeRow>>(0)
            .map_err(|e| map_db_error("select node", e))
    }
}

/// Entity row as stored
#[derive(Debug, Deserialize)]
struct NodeRow {
    canonical_name: String,
    entity_type: EntityType,
    #[serde(default)]
    aliases: Vec<String>,
    #[serde(default)]
    source_document_ids: Vec<String>,
}

/// Edge row as stored
#[derive(Debug, Deserialize)]
struct EdgeRow {
    support_count: u64,
    #[serde(default)]
    source_document_ids: Vec<String>,
}

fn parse_ids(ids: &[String]) -> Result<BTreeSet<Uuid>, StoreError> {
    ids.iter()
        .map(|id| {
            Uuid::parse_str(id)
                .map_err(|e| StoreError::Serialization(format!("bad document id '{id}': {e}")))
        })
        .collect()
}

fn id_strings(ids: &BTreeSet<Uuid>) -> Vec<String> {
    ids.iter().map(Uuid::to_string).collect()
}

/// Bound a database call by the configured deadline
async fn deadline<T, F>(timeout: Duration, operation: &str, fut: F) -> Result<T, StoreError>
where
    F: IntoFuture<Output = Result<T, surrealdb::Error>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result.map_err(|e| map_db_error(operation, e)),
        Err(_) => Err(StoreError::Timeout(format!(
            "{operation} exceeded {}ms",
            timeout.as_millis()
        ))),
    }
}

/// Sort a SurrealDB error into the store taxonomy by its message
fn map_db_error(operation: &str, error: surrealdb::Error) -> StoreError {
    let message = format!("{operation}: {error}");
    let lower = message.to_lowercase();

    if lower.contains("timed out") || lower.contains("timeout") {
        StoreError::Timeout(message)
    } else if lower.contains("connection")
        || lower.contains("websocket")
        || lower.contains("closed")
        || lower.contains("refused")
        || lower.contains("not connected")
    {
        StoreError::Unavailable(message)
    } else if lower.contains("serializ") || lower.contains("deserializ") {
        StoreError::Serialization(message)
    } else {
        StoreError::ConstraintViolation(message)
    }
}

#[async_trait]
impl GraphStore for SurrealDbStore {
    async fn upsert_node(&self, node: &NodeRecord) -> Result<(), StoreError> {
        let response = deadline(
            self.timeout,
            "upsert node",
            self.client
                .query(UPSERT_NODE)
                .bind(("id", node.entity_id.to_string()))
                .bind(("canonical_name", node.canonical_name.clone()))
                .bind(("entity_type", node.entity_type.as_str().to_string()))
                .bind(("aliases", node.aliases.iter().cloned().collect::<Vec<_>>()))
                .bind(("sources", id_strings(&node.source_document_ids))),
        )
        .await?;
        response.check().map_err(|e| map_db_error("upsert node", e))?;

        debug!(entity_id = %node.entity_id, "Upserted node");
        Ok(())
    }

    async fn upsert_edge(&self, edge: &EdgeRecord) -> Result<(), StoreError> {
        let key = &edge.key;
        for endpoint in [key.subject_entity_id, key.object_entity_id] {
            if self.fetch_node(endpoint).await?.is_none() {
                return Err(StoreError::DanglingReference {
                    edge: key.to_string(),
                    missing: endpoint,
                });
            }
        }

        // Record ids are generated uuids, so inlining them is safe
        let edge_id = key.edge_id();
        let query = format!(
            r#"
            BEGIN TRANSACTION;
            IF (SELECT VALUE id FROM ONLY relates:⟨{edge}⟩) != NONE {{
                UPDATE relates:⟨{edge}⟩ SET
                    support_count += $count,
                    source_document_ids = array::union(source_document_ids, $sources),
                    updated_at = time::now();
            }} ELSE {{
                RELATE entity:⟨{subject}⟩->relates:⟨{edge}⟩->entity:⟨{object}⟩ SET
                    predicate = $predicate,
                    support_count = $count,
                    source_document_ids = $sources;
            }};
            COMMIT TRANSACTION;
            "#,
            edge = edge_id,
            subject = key.subject_entity_id,
            object = key.object_entity_id,
        );

        let response = deadline(
            self.timeout,
            "upsert edge",
            self.client
                .query(query)
                .bind(("predicate", key.predicate.clone()))
                .bind(("count", i64::try_from(edge.observed_count).unwrap_or(i64::MAX)))
                .bind(("sources", id_strings(&edge.source_document_ids))),
        )
        .await?;
        response.check().map_err(|e| map_db_error("upsert edge", e))?;

        debug!(edge = %key, count = edge.observed_count, "Upserted edge");
        Ok(())
    }

    async fn node(&self, entity_id: Uuid) -> Result<Option<NodeRecord>, StoreError> {
        let Some(row) = self.fetch_node(entity_id).await? else {
            return Ok(None);
        };

        Ok(Some(NodeRecord {
            entity_id,
            canonical_name: row.canonical_name,
            entity_type: row.entity_type,
            aliases: row.aliases.into_iter().collect(),
            source_document_ids: parse_ids(&row.source_document_ids)?,
        }))
    }

    async fn edge(&self, key: &RelationKey) -> Result<Option<StoredEdge>, StoreError> {
        let mut response = deadline(
            self.timeout,
            "select edge",
            self.client
                .query(SELECT_EDGE)
                .bind(("id", key.edge_id().to_string())),
        )
        .await?;
        let row = response
            .take::<Option<EdgeRow>>(0)
            .map_err(|e| map_db_error("select edge", e))?;

        row.map(|row| {
            Ok(StoredEdge {
                key: key.clone(),
                support_count: row.support_count,
                source_document_ids: parse_ids(&row.source_document_ids)?,
            })
        })
        .transpose()
    }

    async fn ping(&self) -> Result<(), StoreError> {
        deadline(self.timeout, "health", self.client.health()).await
    }

    fn name(&self) -> &str {
        "surrealdb"
    }
}
