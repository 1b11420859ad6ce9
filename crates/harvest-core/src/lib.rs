//! Harvest Core - Domain models, traits, and shared types
//!
//! This crate defines the core abstractions used throughout the Harvest pipeline:
//! - Document, mention and relation models produced by the acquisition stages
//! - Canonical entities and relations produced by entity resolution
//! - The error taxonomy shared by every stage
//! - Configuration management
//! - The reusable retry policy

pub mod config;
pub mod retry;

pub use config::{
    AnnotatorBackendKind, AnnotatorConfig, AppConfig, ConfigError, ExtractorConfig,
    FetcherBackendKind, FetcherConfig, GazetteerEntry, GraphBackendKind, GraphConfig, LoggingConfig,
    PipelineConfig, ResolverConfig, RetryConfig,
};
pub use retry::{RetryFailure, RetryPolicy};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use thiserror::Error;
use uuid::Uuid;

// ============================================================================
// Error Types
// ============================================================================

/// Core error types for Harvest operations
#[derive(Error, Debug)]
pub enum HarvestError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, HarvestError>;

/// Error classification shared by every stage.
///
/// The class decides what happens to a failing document:
/// - `TransientIO`: retried with bounded exponential backoff
/// - `InputError`: dropped, logged and counted, never retried
/// - `ResourceExhausted`: turned into backpressure, never a failure
/// - `ToolingError`: recorded against the document, which moves to `Failed`
/// - `Fatal`: aborts the run at startup
/// - `Cancelled`: the run was cancelled before the document finished
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    #[serde(rename = "transient_io")]
    TransientIO,
    InputError,
    ResourceExhausted,
    ToolingError,
    Fatal,
    Cancelled,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TransientIO => "TransientIO",
            Self::InputError => "InputError",
            Self::ResourceExhausted => "ResourceExhausted",
            Self::ToolingError => "ToolingError",
            Self::Fatal => "Fatal",
            Self::Cancelled => "Cancelled",
        }
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Implemented by every stage error so the orchestrator and the retry
/// policy can treat them uniformly.
pub trait Classify {
    fn class(&self) -> ErrorClass;

    /// Whether the default retry predicate should retry this error
    fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::TransientIO
    }
}

// ============================================================================
// Pipeline Stages
// ============================================================================

/// Processing stage a document can fail in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Fetcher,
    Extractor,
    Annotator,
    Resolver,
    GraphWriter,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fetcher => "Fetcher",
            Self::Extractor => "Extractor",
            Self::Annotator => "Annotator",
            Self::Resolver => "Resolver",
            Self::GraphWriter => "GraphWriter",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// Document Models
// ============================================================================

/// An input to the pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Source {
    /// A page to fetch through the browser backend
    Url(String),
    /// Content supplied directly; skips the Fetcher
    Raw { label: String, content: String },
}

impl Source {
    pub fn url(url: impl Into<String>) -> Self {
        Self::Url(url.into())
    }

    pub fn raw(label: impl Into<String>, content: impl Into<String>) -> Self {
        Self::Raw {
            label: label.into(),
            content: content.into(),
        }
    }

    /// Human-readable origin used in documents and dead letters
    pub fn locator(&self) -> String {
        match self {
            Self::Url(url) => url.clone(),
            Self::Raw { label, .. } => format!("raw:{label}"),
        }
    }
}

/// A document submitted to a run, before any stage has touched it
#[derive(Debug, Clone)]
pub struct Submission {
    pub id: Uuid,
    pub source: Source,
}

impl Submission {
    pub fn new(source: Source) -> Self {
        Self {
            id: Uuid::new_v4(),
            source,
        }
    }
}

/// Clean document text plus source metadata
///
/// Produced by the Extractor and never mutated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    /// Unique identifier (assigned at submission)
    pub id: Uuid,

    /// Where the content came from
    pub source_url: String,

    /// When the content was retrieved
    pub fetched_at: DateTime<Utc>,

    /// Normalised document text
    pub raw_text: String,

    /// HTTP-equivalent status code reported by the fetch
    pub status: u16,

    /// Page title, if the markup carried one
    pub title: Option<String>,

    /// Hex SHA-256 of `raw_text`
    pub content_hash: String,
}

/// Byte span within a document's text
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `other` lies entirely inside this span
    pub fn contains(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

/// Entity types recognised by the annotators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntityType {
    Person,
    Organization,
    Location,
    Date,
    Money,
    Misc,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Person => "PERSON",
            Self::Organization => "ORGANIZATION",
            Self::Location => "LOCATION",
            Self::Date => "DATE",
            Self::Money => "MONEY",
            Self::Misc => "MISC",
        }
    }

    /// Map an annotator label onto an entity type.
    ///
    /// CoreNLP's fine-grained location labels collapse onto `Location`;
    /// anything unrecognised becomes `Misc`.
    pub fn from_label(label: &str) -> Self {
        match label.to_ascii_uppercase().as_str() {
            "PERSON" | "PER" => Self::Person,
            "ORGANIZATION" | "ORG" => Self::Organization,
            "LOCATION" | "LOC" | "CITY" | "COUNTRY" | "STATE_OR_PROVINCE" => Self::Location,
            "DATE" | "TIME" => Self::Date,
            "MONEY" => Self::Money,
            _ => Self::Misc,
        }
    }
}

impl std::fmt::Display for EntityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Identifier of a mention, scoped to its document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MentionId {
    pub document_id: Uuid,
    pub ordinal: u32,
}

impl std::fmt::Display for MentionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.document_id, self.ordinal)
    }
}

/// A single textual occurrence of a candidate entity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mention {
    pub id: MentionId,
    pub document_id: Uuid,
    pub surface_text: String,
    pub span: Span,
    pub entity_type: EntityType,
    pub confidence: f32,
}

/// A relation between two mentions of the same document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateRelation {
    pub subject: MentionId,
    pub predicate: String,
    pub object: MentionId,
    pub confidence: f32,
}

/// Annotator output for one document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Annotation {
    pub document_id: Uuid,
    pub mentions: Vec<Mention>,
    pub relations: Vec<CandidateRelation>,
}

impl Annotation {
    pub fn empty(document_id: Uuid) -> Self {
        Self {
            document_id,
            mentions: Vec::new(),
            relations: Vec::new(),
        }
    }

    pub fn mention(&self, id: &MentionId) -> Option<&Mention> {
        self.mentions.iter().find(|m| &m.id == id)
    }
}

// ============================================================================
// Canonical Models
// ============================================================================

/// Namespace for deterministic entity identifiers
const ENTITY_NAMESPACE: Uuid = Uuid::from_u128(0x8f1e_4b7a_2c39_4d5e_9a60_7b1c_3e2f_0a41);

/// Namespace for deterministic edge identifiers
const RELATION_NAMESPACE: Uuid = Uuid::from_u128(0x3d52_91c8_6e04_4fa7_b1d3_c28e_5f07_96b2);

/// The deduplicated, cross-document representation of an entity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalEntity {
    /// Stable identifier derived from the entity type and alias keys
    pub entity_id: Uuid,

    /// Most frequent surface form among the merged mentions
    pub canonical_name: String,

    pub entity_type: EntityType,

    /// Every surface form merged into this entity
    pub alias_set: BTreeSet<String>,

    pub source_document_ids: BTreeSet<Uuid>,
}

impl CanonicalEntity {
    /// Derive the identifier for an entity from its smallest normalised key.
    ///
    /// Identical alias input always yields the identical id, across runs.
    pub fn derive_id(entity_type: EntityType, key: &str) -> Uuid {
        let name = format!("{}:{}", entity_type.as_str(), key);
        Uuid::new_v5(&ENTITY_NAMESPACE, name.as_bytes())
    }
}

/// Identity of a canonical relation
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RelationKey {
    pub subject_entity_id: Uuid,
    pub predicate: String,
    pub object_entity_id: Uuid,
}

impl RelationKey {
    pub fn new(subject: Uuid, predicate: impl Into<String>, object: Uuid) -> Self {
        Self {
            subject_entity_id: subject,
            predicate: predicate.into(),
            object_entity_id: object,
        }
    }

    /// Deterministic edge identifier for stores that need a single key
    pub fn edge_id(&self) -> Uuid {
        let name = format!(
            "{}|{}|{}",
            self.subject_entity_id, self.predicate, self.object_entity_id
        );
        Uuid::new_v5(&RELATION_NAMESPACE, name.as_bytes())
    }
}

impl std::fmt::Display for RelationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "({})-[{}]->({})",
            self.subject_entity_id, self.predicate, self.object_entity_id
        )
    }
}

/// The deduplicated, cross-document representation of a fact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalRelation {
    pub subject_entity_id: Uuid,
    pub predicate: String,
    pub object_entity_id: Uuid,

    /// How many times the triple was observed
    pub support_count: u64,

    pub source_document_ids: BTreeSet<Uuid>,
}

impl CanonicalRelation {
    pub fn key(&self) -> RelationKey {
        RelationKey::new(
            self.subject_entity_id,
            self.predicate.clone(),
            self.object_entity_id,
        )
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_id_is_deterministic() {
        let a = CanonicalEntity::derive_id(EntityType::Person, "j smith");
        let b = CanonicalEntity::derive_id(EntityType::Person, "j smith");
        let c = CanonicalEntity::derive_id(EntityType::Organization, "j smith");

        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_edge_id_depends_on_whole_triple() {
        let s = Uuid::new_v4();
        let o = Uuid::new_v4();

        let forward = RelationKey::new(s, "works_at", o);
        let reverse = RelationKey::new(o, "works_at", s);
        let other = RelationKey::new(s, "founded", o);

        assert_eq!(forward.edge_id(), RelationKey::new(s, "works_at", o).edge_id());
        assert_ne!(forward.edge_id(), reverse.edge_id());
        assert_ne!(forward.edge_id(), other.edge_id());
    }

    #[test]
    fn test_entity_type_labels() {
        assert_eq!(EntityType::from_label("PERSON"), EntityType::Person);
        assert_eq!(EntityType::from_label("city"), EntityType::Location);
        assert_eq!(
            EntityType::from_label("STATE_OR_PROVINCE"),
            EntityType::Location
        );
        assert_eq!(EntityType::from_label("TITLE"), EntityType::Misc);
        assert_eq!(EntityType::Organization.to_string(), "ORGANIZATION");
    }

    #[test]
    fn test_span_containment() {
        let outer = Span::new(0, 10);
        assert!(outer.contains(&Span::new(2, 5)));
        assert!(outer.contains(&outer));
        assert!(!outer.contains(&Span::new(5, 11)));
        assert_eq!(Span::new(3, 1).len(), 0);
    }

    #[test]
    fn test_source_locator() {
        assert_eq!(
            Source::url("https://example.com").locator(),
            "https://example.com"
        );
        assert_eq!(Source::raw("memo", "text").locator(), "raw:memo");
    }

    #[test]
    fn test_error_class_default_retryable() {
        struct Flaky;
        impl Classify for Flaky {
            fn class(&self) -> ErrorClass {
                ErrorClass::TransientIO
            }
        }
        struct Broken;
        impl Classify for Broken {
            fn class(&self) -> ErrorClass {
                ErrorClass::ToolingError
            }
        }

        assert!(Flaky.is_retryable());
        assert!(!Broken.is_retryable());
    }
}
