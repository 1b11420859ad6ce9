//! Harvest Extractor - Knowledge extraction pipeline
//!
//! Implements Named Entity Recognition (NER) and Relation Extraction (RE)
//! over document text, shapes the results into typed mentions and candidate
//! relations, and resolves mentions across documents into canonical
//! entities and relations.

use async_trait::async_trait;
use harvest_core::{Classify, EntityType, ErrorClass};
use thiserror::Error;

pub mod annotator;
pub mod corenlp;
pub mod ner;
pub mod relation;
pub mod resolver;
pub mod union_find;

pub use annotator::{Annotator, AnnotatorContext, RuleBasedBackend};
pub use corenlp::CoreNlpBackend;
pub use resolver::{normalize_key, similarity, Resolution, Resolver};

/// Errors raised while annotating a document
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AnnotateError {
    /// Processing exceeded the per-document budget
    #[error("Annotation exceeded budget of {budget_ms}ms")]
    AnnotationTimeout { budget_ms: u64 },

    /// The NLP backend could not be reached
    #[error("NLP backend unavailable: {0}")]
    Unavailable(String),

    /// The NLP backend failed on this document
    #[error("NLP backend failed: {0}")]
    Backend(String),

    /// The NLP backend answered with something unparseable
    #[error("Invalid NLP response: {0}")]
    InvalidResponse(String),

    /// The shared model could not be initialised
    #[error("Annotator initialisation failed: {0}")]
    Init(String),
}

impl Classify for AnnotateError {
    fn class(&self) -> ErrorClass {
        match self {
            Self::AnnotationTimeout { .. } | Self::Unavailable(_) => ErrorClass::TransientIO,
            Self::Backend(_) | Self::InvalidResponse(_) => ErrorClass::ToolingError,
            Self::Init(_) => ErrorClass::Fatal,
        }
    }
}

/// Extracted entity from text
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedEntity {
    pub text: String,
    pub entity_type: EntityType,
    pub start: usize,
    pub end: usize,
    pub confidence: f32,
}

/// Extracted relation between entities
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedRelation {
    pub subject: ExtractedEntity,
    pub predicate: String,
    pub object: ExtractedEntity,
    pub confidence: f32,
}

/// Raw output of an NLP backend, before shaping into mentions
#[derive(Debug, Clone, Default)]
pub struct RawAnnotation {
    pub entities: Vec<ExtractedEntity>,
    pub relations: Vec<ExtractedRelation>,
}

/// Trait for entity extractors
pub trait EntityExtractor: Send + Sync {
    fn extract(&self, text: &str) -> Vec<ExtractedEntity>;
}

/// Trait for relation extractors
pub trait RelationExtractor: Send + Sync {
    fn extract(&self, text: &str, entities: &[ExtractedEntity]) -> Vec<ExtractedRelation>;
}

/// An NLP toolkit pipeline (tokenize, sentence-split, NER, relations)
#[async_trait]
pub trait NlpBackend: Send + Sync {
    async fn annotate(&self, text: &str) -> Result<RawAnnotation, AnnotateError>;

    /// Get backend name for logging
    fn name(&self) -> &str;
}
