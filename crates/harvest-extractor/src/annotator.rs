//! Annotator
//!
//! Runs the NLP backend over a document under a per-document budget and
//! shapes its output into typed mentions and candidate relations.
//!
//! The backend is expensive to build (compiled rule sets, or a connection to
//! an NLP server) so it lives in an [`AnnotatorContext`] shared by every
//! annotator worker and is initialised at most once, on first use.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use harvest_core::{
    AnnotatorBackendKind, AnnotatorConfig, Annotation, CandidateRelation, Document, GazetteerEntry,
    Mention, MentionId, RetryFailure, RetryPolicy, Span,
};
use tokio::sync::OnceCell;
use tracing::{debug, info, instrument};

use crate::ner::RuleBasedNer;
use crate::relation::RuleBasedRe;
use crate::{
    AnnotateError, CoreNlpBackend, EntityExtractor, ExtractedEntity, NlpBackend, RawAnnotation,
    RelationExtractor,
};

/// Builds the NLP backend from configuration
pub type BackendFactory =
    Box<dyn Fn(&AnnotatorConfig) -> Result<Arc<dyn NlpBackend>, AnnotateError> + Send + Sync>;

// ============================================================================
// Shared context
// ============================================================================

/// Process-wide annotator state: configuration plus the lazily built backend
pub struct AnnotatorContext {
    config: AnnotatorConfig,
    backend: OnceCell<Arc<dyn NlpBackend>>,
    factory: BackendFactory,
}

impl AnnotatorContext {
    /// Context that builds the configured backend on first use
    pub fn new(config: AnnotatorConfig) -> Self {
        Self::with_factory(config, Box::new(build_backend))
    }

    pub fn with_factory(config: AnnotatorConfig, factory: BackendFactory) -> Self {
        Self {
            config,
            backend: OnceCell::new(),
            factory,
        }
    }

    /// Context around an already built backend
    pub fn with_backend(config: AnnotatorConfig, backend: Arc<dyn NlpBackend>) -> Self {
        let fallback = backend.clone();
        Self {
            config,
            backend: OnceCell::new_with(Some(backend)),
            factory: Box::new(move |_| Ok(fallback.clone())),
        }
    }

    pub fn config(&self) -> &AnnotatorConfig {
        &self.config
    }

    pub fn is_initialized(&self) -> bool {
        self.backend.initialized()
    }

    /// The shared backend, built by whichever caller gets here first
    pub async fn backend(&self) -> Result<Arc<dyn NlpBackend>, AnnotateError> {
        let backend = self
            .backend
            .get_or_try_init(|| async {
                let backend = (self.factory)(&self.config)?;
                info!(backend = backend.name(), "Annotator backend initialised");
                Ok::<_, AnnotateError>(backend)
            })
            .await?;
        Ok(backend.clone())
    }
}

fn build_backend(config: &AnnotatorConfig) -> Result<Arc<dyn NlpBackend>, AnnotateError> {
    let backend: Arc<dyn NlpBackend> = match config.backend {
        AnnotatorBackendKind::Rules => Arc::new(RuleBasedBackend::new(&config.gazetteer)),
        AnnotatorBackendKind::CoreNlp => {
            Arc::new(CoreNlpBackend::new(&config.corenlp_url, config.budget())?)
        }
    };
    Ok(backend)
}

// ============================================================================
// Rule-based backend
// ============================================================================

/// In-process backend over the rule-based NER and RE
pub struct RuleBasedBackend {
    ner: Arc<RuleBasedNer>,
    re: Arc<RuleBasedRe>,
}

impl RuleBasedBackend {
    pub fn new(gazetteer: &[GazetteerEntry]) -> Self {
        Self {
            ner: Arc::new(RuleBasedNer::with_gazetteer(gazetteer)),
            re: Arc::new(RuleBasedRe::new()),
        }
    }
}

#[async_trait]
impl NlpBackend for RuleBasedBackend {
    async fn annotate(&self, text: &str) -> Result<RawAnnotation, AnnotateError> {
        let ner = self.ner.clone();
        let re = self.re.clone();
        let text = text.to_string();

        // Regex scanning is CPU-bound; keep it off the async workers
        tokio::task::spawn_blocking(move || {
            let entities = ner.extract(&text);
            let relations = re.extract(&text, &entities);
            RawAnnotation {
                entities,
                relations,
            }
        })
        .await
        .map_err(|e| AnnotateError::Backend(format!("rule-based annotator failed: {e}")))
    }

    fn name(&self) -> &str {
        "rules"
    }
}

// ============================================================================
// Annotator
// ============================================================================

pub struct Annotator {
    context: Arc<AnnotatorContext>,
    retry: RetryPolicy,
}

impl Annotator {
    pub fn new(context: Arc<AnnotatorContext>, retry: RetryPolicy) -> Self {
        Self { context, retry }
    }

    pub fn context(&self) -> &Arc<AnnotatorContext> {
        &self.context
    }

    /// Annotate a document, retrying budget overruns and unreachable backends
    #[instrument(skip(self, document), fields(document_id = %document.id))]
    pub async fn annotate(&self, document: &Document) -> Result<Annotation, RetryFailure<AnnotateError>> {
        self.retry
            .retry("annotate", || self.annotate_once(document))
            .await
    }

    /// One budgeted pass of the backend over `document`
    pub async fn annotate_once(&self, document: &Document) -> Result<Annotation, AnnotateError> {
        let backend = self.context.backend().await?;
        let config = self.context.config();

        let raw = tokio::time::timeout(config.budget(), backend.annotate(&document.raw_text))
            .await
            .map_err(|_| AnnotateError::AnnotationTimeout {
                budget_ms: config.budget_ms,
            })??;

        let annotation = shape(document, raw, config.min_confidence);
        debug!(
            mentions = annotation.mentions.len(),
            relations = annotation.relations.len(),
            "Document annotated"
        );
        Ok(annotation)
    }
}

/// Turn raw backend output into mentions and relations of `document`.
///
/// Mentions below `min_confidence`, with spans outside the text, or with
/// blank surface text are dropped; of several mentions on one span the most
/// confident is kept. Relations whose arguments did not survive are dropped.
pub fn shape(document: &Document, raw: RawAnnotation, min_confidence: f32) -> Annotation {
    let text = &document.raw_text;

    let mut entities: Vec<ExtractedEntity> = raw
        .entities
        .into_iter()
        .filter(|e| e.confidence >= min_confidence && e.start < e.end)
        .filter(|e| {
            text.get(e.start..e.end)
                .map(|s| !s.trim().is_empty())
                .unwrap_or(false)
        })
        .collect();

    entities.sort_by(|a, b| {
        a.start
            .cmp(&b.start)
            .then(a.end.cmp(&b.end))
            .then(b.confidence.total_cmp(&a.confidence))
    });
    entities.dedup_by(|later, kept| later.start == kept.start && later.end == kept.end);

    let mentions: Vec<Mention> = entities
        .iter()
        .enumerate()
        .map(|(ordinal, e)| Mention {
            id: MentionId {
                document_id: document.id,
                ordinal: ordinal as u32,
            },
            document_id: document.id,
            surface_text: text[e.start..e.end].to_string(),
            span: Span::new(e.start, e.end),
            entity_type: e.entity_type,
            confidence: e.confidence,
        })
        .collect();

    let mut relations: BTreeMap<(MentionId, String, MentionId), f32> = BTreeMap::new();
    for relation in raw.relations {
        if relation.confidence < min_confidence || relation.predicate.trim().is_empty() {
            continue;
        }
        let (Some(subject), Some(object)) = (
            locate(&mentions, &relation.subject),
            locate(&mentions, &relation.object),
        ) else {
            continue;
        };
        if subject == object {
            continue;
        }

        let confidence = relations
            .entry((subject, relation.predicate, object))
            .or_insert(relation.confidence);
        *confidence = confidence.max(relation.confidence);
    }

    Annotation {
        document_id: document.id,
        mentions,
        relations: relations
            .into_iter()
            .map(|((subject, predicate, object), confidence)| CandidateRelation {
                subject,
                predicate,
                object,
                confidence,
            })
            .collect(),
    }
}

/// The mention of the same type that overlaps `entity` the most
fn locate(mentions: &[Mention], entity: &ExtractedEntity) -> Option<MentionId> {
    mentions
        .iter()
        .filter(|m| m.entity_type == entity.entity_type)
        .filter(|m| m.span.start < entity.end && entity.start < m.span.end)
        .max_by_key(|m| m.span.end.min(entity.end) - m.span.start.max(entity.start))
        .map(|m| m.id)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ExtractedRelation;
    use chrono::Utc;
    use harvest_core::{Classify, EntityType, ErrorClass};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use uuid::Uuid;

    fn document(text: &str) -> Document {
        Document {
            id: Uuid::new_v4(),
            source_url: "raw:test".to_string(),
            fetched_at: Utc::now(),
            raw_text: text.to_string(),
            status: 200,
            title: None,
            content_hash: String::new(),
        }
    }

    fn entity(text: &str, full: &str, entity_type: EntityType, confidence: f32) -> ExtractedEntity {
        let start = full.find(text).unwrap();
        ExtractedEntity {
            text: text.to_string(),
            entity_type,
            start,
            end: start + text.len(),
            confidence,
        }
    }

    /// Backend answering with a fixed annotation
    struct FixedBackend(RawAnnotation);

    #[async_trait]
    impl NlpBackend for FixedBackend {
        async fn annotate(&self, _text: &str) -> Result<RawAnnotation, AnnotateError> {
            Ok(self.0.clone())
        }

        fn name(&self) -> &str {
            "fixed"
        }
    }

    /// Backend that never finishes within any sensible budget
    struct SlowBackend;

    #[async_trait]
    impl NlpBackend for SlowBackend {
        async fn annotate(&self, _text: &str) -> Result<RawAnnotation, AnnotateError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(RawAnnotation::default())
        }

        fn name(&self) -> &str {
            "slow"
        }
    }

    fn quick_retry(max_retries: u32) -> RetryPolicy {
        RetryPolicy::new(max_retries, Duration::from_millis(1), Duration::from_millis(2))
    }

    #[tokio::test]
    async fn test_rule_based_annotation() {
        let context = Arc::new(AnnotatorContext::new(AnnotatorConfig::default()));
        let annotator = Annotator::new(context, RetryPolicy::no_retry());
        let doc = document("Jon Smith works at Acme Corp.");

        let annotation = annotator.annotate(&doc).await.unwrap();

        assert_eq!(annotation.document_id, doc.id);
        let surfaces: Vec<&str> = annotation
            .mentions
            .iter()
            .map(|m| m.surface_text.as_str())
            .collect();
        assert_eq!(surfaces, vec!["Jon Smith", "Acme Corp"]);
        for mention in &annotation.mentions {
            assert_eq!(&doc.raw_text[mention.span.start..mention.span.end], mention.surface_text);
        }

        assert_eq!(annotation.relations.len(), 1);
        let rel = &annotation.relations[0];
        assert_eq!(rel.predicate, "works_at");
        assert_eq!(annotation.mention(&rel.subject).unwrap().entity_type, EntityType::Person);
        assert_eq!(
            annotation.mention(&rel.object).unwrap().entity_type,
            EntityType::Organization
        );
    }

    #[tokio::test]
    async fn test_backend_initialised_once_under_concurrency() {
        let builds = Arc::new(AtomicUsize::new(0));
        let counter = builds.clone();
        let factory: BackendFactory = Box::new(move |config| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(RuleBasedBackend::new(&config.gazetteer)) as Arc<dyn NlpBackend>)
        });

        let context = Arc::new(AnnotatorContext::with_factory(AnnotatorConfig::default(), factory));
        assert!(!context.is_initialized());
        let annotator = Arc::new(Annotator::new(context.clone(), RetryPolicy::no_retry()));

        let mut handles = Vec::new();
        for i in 0..8 {
            let annotator = annotator.clone();
            handles.push(tokio::spawn(async move {
                let doc = document(&format!("Jon Smith joined Acme Corp in {}.", 2000 + i));
                annotator.annotate(&doc).await.map(|a| a.mentions.len())
            }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().unwrap() >= 2);
        }

        assert_eq!(builds.load(Ordering::SeqCst), 1);
        assert!(context.is_initialized());
    }

    #[tokio::test]
    async fn test_budget_overrun_is_retried_then_surfaces() {
        let config = AnnotatorConfig {
            budget_ms: 20,
            ..AnnotatorConfig::default()
        };
        let context = Arc::new(AnnotatorContext::with_backend(config, Arc::new(SlowBackend)));
        let annotator = Annotator::new(context, quick_retry(1));

        let failure = annotator
            .annotate(&document("Jon Smith works at Acme Corp."))
            .await
            .unwrap_err();

        assert_eq!(failure.error, AnnotateError::AnnotationTimeout { budget_ms: 20 });
        assert_eq!(failure.attempts, 2);
        assert!(failure.exhausted);
    }

    #[tokio::test]
    async fn test_init_failure_is_fatal_and_not_retried() {
        let factory: BackendFactory =
            Box::new(|_| Err(AnnotateError::Init("model files missing".into())));
        let context = Arc::new(AnnotatorContext::with_factory(AnnotatorConfig::default(), factory));
        let annotator = Annotator::new(context, quick_retry(3));

        let failure = annotator.annotate(&document("Jon Smith")).await.unwrap_err();
        assert_eq!(failure.attempts, 1);
        assert_eq!(failure.error.class(), ErrorClass::Fatal);
    }

    #[test]
    fn test_shape_filters_and_links() {
        let text = "Jon Smith works at Acme Corp.";
        let doc = document(text);
        let jon = entity("Jon Smith", text, EntityType::Person, 0.9);
        let jon_weak = entity("Jon Smith", text, EntityType::Person, 0.6);
        let acme_weak = entity("Acme Corp", text, EntityType::Organization, 0.2);
        let out_of_range = ExtractedEntity {
            text: "ghost".into(),
            entity_type: EntityType::Person,
            start: 100,
            end: 105,
            confidence: 0.99,
        };

        let raw = RawAnnotation {
            entities: vec![jon_weak, jon.clone(), acme_weak.clone(), out_of_range],
            relations: vec![ExtractedRelation {
                subject: jon,
                predicate: "works_at".into(),
                object: acme_weak,
                confidence: 0.8,
            }],
        };

        let annotation = shape(&doc, raw, 0.5);

        assert_eq!(annotation.mentions.len(), 1);
        assert_eq!(annotation.mentions[0].confidence, 0.9);
        assert_eq!(annotation.mentions[0].id.ordinal, 0);
        // The object mention fell below the confidence floor
        assert!(annotation.relations.is_empty());
    }

    #[tokio::test]
    async fn test_fixed_backend_relations_are_deduplicated() {
        let text = "Jon Smith works at Acme Corp. Jon Smith works at Acme Corp.";
        let jon = entity("Jon Smith", text, EntityType::Person, 0.9);
        let acme = entity("Acme Corp", text, EntityType::Organization, 0.9);
        let relation = |confidence| ExtractedRelation {
            subject: jon.clone(),
            predicate: "works_at".into(),
            object: acme.clone(),
            confidence,
        };
        let raw = RawAnnotation {
            entities: vec![jon.clone(), acme.clone()],
            relations: vec![relation(0.6), relation(0.8)],
        };

        let context = Arc::new(AnnotatorContext::with_backend(
            AnnotatorConfig::default(),
            Arc::new(FixedBackend(raw)),
        ));
        let annotation = Annotator::new(context, RetryPolicy::no_retry())
            .annotate(&document(text))
            .await
            .unwrap();

        assert_eq!(annotation.relations.len(), 1);
        assert_eq!(annotation.relations[0].confidence, 0.8);
    }
}
