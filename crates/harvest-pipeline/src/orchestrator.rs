//! Pipeline orchestrator
//!
//! A run has three phases:
//! 1. Acquisition. Admission, the fetch pool (fetch, extract, dedup) and the
//!    annotate pool run concurrently, joined by bounded queues, and feed
//!    annotations to the resolver task.
//! 2. Resolution. Once the annotate pool has drained, the resolver task
//!    finalises the whole batch.
//! 3. Write. Every entity is written, then every relation; the relation
//!    pool starts only after the entity pool has finished.
//!
//! Cancellation stops admission and makes workers stop taking new items.
//! Whatever a worker already holds finishes its current stage; documents
//! that did not reach `Done` are recorded as cancelled.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use harvest_core::{
    AppConfig, Classify, Document, ErrorClass, PipelineConfig, ResolverConfig, RetryFailure,
    RetryPolicy, Source, Stage, Submission,
};
use harvest_extractor::{Annotator, AnnotatorContext, Resolution};
use harvest_fetch::{ExtractError, Extractor, FetchedPage, Fetcher};
use harvest_graph::{GraphStore, GraphWriter, StoreError, WriteRecord};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{DocumentState, PipelineError, ResolverHandle, RunLedger, RunSummary};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ============================================================================
// Builder
// ============================================================================

/// Assembles a [`Pipeline`]; components not supplied are built from config
pub struct PipelineBuilder {
    config: AppConfig,
    store: Arc<dyn GraphStore>,
    fetcher: Option<Fetcher>,
    annotator: Option<Annotator>,
}

impl PipelineBuilder {
    pub fn fetcher(mut self, fetcher: Fetcher) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    pub fn annotator(mut self, annotator: Annotator) -> Self {
        self.annotator = Some(annotator);
        self
    }

    pub fn build(self) -> Result<Pipeline, PipelineError> {
        self.config.validate()?;
        let pipeline = self.config.pipeline.clone();

        let fetcher = match self.fetcher {
            Some(fetcher) => fetcher,
            None => Fetcher::from_config(
                &self.config.fetcher,
                RetryPolicy::from(&pipeline.fetch_retry),
            )
            .map_err(|e| PipelineError::Fatal {
                component: "fetcher",
                reason: e.to_string(),
            })?,
        };

        let annotator = match self.annotator {
            Some(annotator) => annotator,
            None => Annotator::new(
                Arc::new(AnnotatorContext::new(self.config.annotator.clone())),
                RetryPolicy::from(&pipeline.annotate_retry),
            ),
        };

        Ok(Pipeline {
            extractor: Arc::new(Extractor::new(self.config.extractor.clone())),
            write_retry: RetryPolicy::from(&pipeline.write_retry),
            resolver: self.config.resolver.clone(),
            config: pipeline,
            fetcher: Arc::new(fetcher),
            annotator: Arc::new(annotator),
            store: self.store,
        })
    }
}

// ============================================================================
// Pipeline
// ============================================================================

/// The staged pipeline; one value can execute any number of runs
pub struct Pipeline {
    config: PipelineConfig,
    resolver: ResolverConfig,
    write_retry: RetryPolicy,
    fetcher: Arc<Fetcher>,
    extractor: Arc<Extractor>,
    annotator: Arc<Annotator>,
    store: Arc<dyn GraphStore>,
}

/// Shared state of one run
struct RunContext {
    fetcher: Arc<Fetcher>,
    extractor: Arc<Extractor>,
    annotator: Arc<Annotator>,
    writer: GraphWriter,
    ledger: RunLedger,
    cancel: CancellationToken,
    seen_hashes: Mutex<HashSet<String>>,
}

impl RunContext {
    fn advance(&self, document_id: &Uuid, next: DocumentState) -> bool {
        match self.ledger.advance(document_id, next) {
            Ok(()) => true,
            Err(e) => {
                error!(%document_id, error = %e, "Rejected state transition");
                false
            }
        }
    }

    fn fail(&self, document_id: &Uuid, stage: Stage, class: ErrorClass, reason: String, attempts: u32) {
        warn!(%document_id, %stage, %class, attempts, reason = %reason, "Document failed");
        self.ledger.record_attempts(document_id, stage, attempts);
        if let Err(e) = self.ledger.fail(document_id, stage, class, reason) {
            error!(%document_id, error = %e, "Could not record failure");
        }
    }

    /// True the first time a content hash is seen in this run
    fn first_sighting(&self, hash: &str) -> bool {
        lock(&self.seen_hashes).insert(hash.to_string())
    }
}

impl Pipeline {
    pub fn builder(config: AppConfig, store: Arc<dyn GraphStore>) -> PipelineBuilder {
        PipelineBuilder {
            config,
            store,
            fetcher: None,
            annotator: None,
        }
    }

    pub fn store(&self) -> &Arc<dyn GraphStore> {
        &self.store
    }

    pub fn fetcher(&self) -> &Arc<Fetcher> {
        &self.fetcher
    }

    /// Check every external component the pipeline depends on
    pub async fn check(&self) -> Result<(), PipelineError> {
        self.fetcher
            .warm_up()
            .await
            .map_err(|e| fatal("browser backend", e))?;
        self.check_backends().await
    }

    async fn check_backends(&self) -> Result<(), PipelineError> {
        self.annotator
            .context()
            .backend()
            .await
            .map_err(|e| fatal("annotator backend", e))?;
        self.store.ping().await.map_err(|e| fatal("graph store", e))?;
        Ok(())
    }

    /// Process `sources` to completion or until `cancel` fires
    pub async fn run(
        &self,
        sources: Vec<Source>,
        cancel: CancellationToken,
    ) -> Result<RunSummary, PipelineError> {
        let started = Instant::now();
        let submissions: Vec<Submission> = sources.into_iter().map(Submission::new).collect();
        info!(
            documents = submissions.len(),
            store = self.store.name(),
            fetch_workers = self.config.fetch_workers,
            annotate_workers = self.config.annotate_workers,
            write_workers = self.config.write_workers,
            queue_capacity = self.config.queue_capacity,
            "Run starting"
        );

        if submissions.iter().any(|s| matches!(s.source, Source::Url(_))) {
            self.fetcher
                .warm_up()
                .await
                .map_err(|e| fatal("browser backend", e))?;
        }
        self.check_backends().await?;

        let ctx = Arc::new(RunContext {
            fetcher: self.fetcher.clone(),
            extractor: self.extractor.clone(),
            annotator: self.annotator.clone(),
            writer: GraphWriter::new(self.store.clone(), self.write_retry.clone()),
            ledger: RunLedger::new(),
            cancel: cancel.clone(),
            seen_hashes: Mutex::new(HashSet::new()),
        });
        for submission in &submissions {
            ctx.ledger.register(submission);
        }

        let capacity = self.config.queue_capacity;
        let (fetch_tx, fetch_rx) = mpsc::channel::<Submission>(capacity);
        let (annotate_tx, annotate_rx) = mpsc::channel::<Document>(capacity);
        let (resolver, resolver_task) = ResolverHandle::spawn(&self.resolver, capacity);

        let admission = tokio::spawn(admit(submissions, fetch_tx, cancel.clone()));

        let fetch_pool = {
            let ctx = ctx.clone();
            spawn_pool(
                "fetch",
                self.config.fetch_workers,
                fetch_rx,
                cancel.clone(),
                move |submission| {
                    let ctx = ctx.clone();
                    let next = annotate_tx.clone();
                    async move { fetch_stage(&ctx, submission, &next).await }
                },
            )
        };

        let annotate_pool = {
            let ctx = ctx.clone();
            let resolver = resolver.clone();
            spawn_pool(
                "annotate",
                self.config.annotate_workers,
                annotate_rx,
                cancel.clone(),
                move |document| {
                    let ctx = ctx.clone();
                    let resolver = resolver.clone();
                    async move { annotate_stage(&ctx, document, &resolver).await }
                },
            )
        };

        match admission.await {
            Ok(admitted) => debug!(admitted, "Admission finished"),
            Err(e) => error!(error = %e, "Admission task failed"),
        }
        drain(fetch_pool).await;
        drain(annotate_pool).await;

        let mut counts = WriteCounts::default();
        if !cancel.is_cancelled() {
            match resolver.finalize().await {
                Ok(resolution) => counts = self.write_phase(&ctx, resolution).await,
                Err(e) => error!(error = %e, "Resolution failed"),
            }
        }
        drop(resolver);
        if let Err(e) = resolver_task.await {
            error!(error = %e, "Resolver task failed");
        }

        let cancelled = cancel.is_cancelled();
        let (class, reason) = if cancelled {
            (ErrorClass::Cancelled, "run cancelled before the document finished")
        } else {
            (ErrorClass::ToolingError, "run ended before the document finished")
        };
        let unfinished = ctx.ledger.close(class, reason);
        if unfinished > 0 {
            warn!(unfinished, cancelled, "Documents left unfinished");
        }

        let mut summary = ctx
            .ledger
            .summary(cancelled, started.elapsed().as_millis() as u64);
        summary.entities_written = counts.entities;
        summary.relations_written = counts.relations;

        info!(
            submitted = summary.documents_submitted,
            processed = summary.documents_processed,
            failed = summary.failed_total(),
            cancelled_documents = summary.documents_cancelled,
            entities = summary.entities_written,
            relations = summary.relations_written,
            elapsed_ms = summary.elapsed_ms,
            "Run finished"
        );
        Ok(summary)
    }

    async fn write_phase(&self, ctx: &Arc<RunContext>, resolution: Resolution) -> WriteCounts {
        let resolved = ctx.ledger.in_state(&DocumentState::Annotated);
        for document_id in &resolved {
            ctx.advance(document_id, DocumentState::Resolved);
        }

        let entities: Vec<WriteRecord> = resolution
            .entities
            .into_iter()
            .map(WriteRecord::Entity)
            .collect();
        let relations: Vec<WriteRecord> = resolution
            .relations
            .into_iter()
            .map(WriteRecord::Relation)
            .collect();
        let tally = Arc::new(WriteTally::new(entities.iter().chain(relations.iter())));

        info!(
            documents = resolved.len(),
            entities = entities.len(),
            relations = relations.len(),
            "Write phase starting"
        );
        self.write_records(ctx, &tally, entities).await;
        self.write_records(ctx, &tally, relations).await;

        for document_id in resolved {
            match tally.outcome(&document_id) {
                DocumentWrites::Complete => {
                    if ctx.advance(&document_id, DocumentState::Written) {
                        ctx.advance(&document_id, DocumentState::Done);
                        debug!(%document_id, "Document done");
                    }
                }
                DocumentWrites::Failed {
                    class,
                    reason,
                    attempts,
                } => ctx.fail(&document_id, Stage::GraphWriter, class, reason, attempts),
                // Interrupted by cancellation; closed with the rest of the run
                DocumentWrites::Incomplete => {}
            }
        }

        tally.counts()
    }

    async fn write_records(
        &self,
        ctx: &Arc<RunContext>,
        tally: &Arc<WriteTally>,
        records: Vec<WriteRecord>,
    ) {
        if records.is_empty() {
            return;
        }

        let (tx, rx) = mpsc::channel::<WriteRecord>(self.config.queue_capacity);
        let pool = {
            let ctx = ctx.clone();
            let tally = tally.clone();
            spawn_pool(
                "write",
                self.config.write_workers,
                rx,
                ctx.cancel.clone(),
                move |record| {
                    let ctx = ctx.clone();
                    let tally = tally.clone();
                    async move {
                        match ctx.writer.write(&record).await {
                            Ok(_) => tally.written(&record),
                            Err(failure) => tally.failed(&record, &failure),
                        }
                    }
                },
            )
        };

        for record in records {
            tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => break,
                sent = tx.send(record) => {
                    if sent.is_err() {
                        break;
                    }
                }
            }
        }
        drop(tx);
        drain(pool).await;
    }
}

fn fatal(component: &'static str, error: impl std::fmt::Display) -> PipelineError {
    error!(component, error = %error, "Startup check failed");
    PipelineError::Fatal {
        component,
        reason: error.to_string(),
    }
}

// ============================================================================
// Stages
// ============================================================================

async fn admit(
    submissions: Vec<Submission>,
    queue: mpsc::Sender<Submission>,
    cancel: CancellationToken,
) -> usize {
    let mut admitted = 0;
    for submission in submissions {
        let document_id = submission.id;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!(admitted, "Cancellation received, admission stopped");
                break;
            }
            sent = queue.send(submission) => {
                if sent.is_err() {
                    break;
                }
                debug!(%document_id, "Document admitted");
                admitted += 1;
            }
        }
    }
    admitted
}

async fn fetch_stage(ctx: &RunContext, submission: Submission, next: &mpsc::Sender<Document>) {
    let document_id = submission.id;

    let page = match &submission.source {
        Source::Url(url) => match ctx.fetcher.fetch(url, ctx.fetcher.timeout()).await {
            Ok(page) => page,
            Err(failure) => {
                ctx.fail(
                    &document_id,
                    Stage::Fetcher,
                    failure.error.class(),
                    failure.to_string(),
                    failure.attempts,
                );
                return;
            }
        },
        Source::Raw { content, .. } => FetchedPage::raw(submission.source.locator(), content.clone()),
    };
    if !ctx.advance(&document_id, DocumentState::Fetched) {
        return;
    }

    let document = match ctx.extractor.extract(document_id, &page) {
        Ok(document) => document,
        Err(e) => {
            ctx.fail(&document_id, Stage::Extractor, e.class(), e.to_string(), 1);
            return;
        }
    };
    if !ctx.first_sighting(&document.content_hash) {
        let duplicate = ExtractError::DuplicateContent {
            hash: document.content_hash.clone(),
        };
        ctx.fail(&document_id, Stage::Extractor, duplicate.class(), duplicate.to_string(), 1);
        return;
    }
    if !ctx.advance(&document_id, DocumentState::Extracted) {
        return;
    }
    debug!(%document_id, chars = document.raw_text.len(), "Document extracted");

    tokio::select! {
        biased;
        _ = ctx.cancel.cancelled() => {
            debug!(%document_id, "Cancelled before annotation");
        }
        sent = next.send(document) => {
            if sent.is_err() {
                ctx.fail(
                    &document_id,
                    Stage::Annotator,
                    ErrorClass::ToolingError,
                    "annotate queue closed".to_string(),
                    0,
                );
            }
        }
    }
}

async fn annotate_stage(ctx: &RunContext, document: Document, resolver: &ResolverHandle) {
    let document_id = document.id;

    let annotation = match ctx.annotator.annotate(&document).await {
        Ok(annotation) => annotation,
        Err(failure) => {
            ctx.fail(
                &document_id,
                Stage::Annotator,
                failure.error.class(),
                failure.to_string(),
                failure.attempts,
            );
            return;
        }
    };
    if !ctx.advance(&document_id, DocumentState::Annotated) {
        return;
    }
    debug!(
        %document_id,
        mentions = annotation.mentions.len(),
        relations = annotation.relations.len(),
        "Document annotated"
    );

    tokio::select! {
        biased;
        _ = ctx.cancel.cancelled() => {
            debug!(%document_id, "Cancelled before resolution");
        }
        added = resolver.add(annotation) => {
            if let Err(e) = added {
                ctx.fail(&document_id, Stage::Resolver, e.class(), e.to_string(), 0);
            }
        }
    }
}

// ============================================================================
// Worker pools
// ============================================================================

/// Spawn `workers` tasks sharing one receiver.
///
/// Each worker takes the next item, runs `work` on it to completion, and
/// stops when the queue closes or `cancel` fires.
fn spawn_pool<T, F, Fut>(
    name: &'static str,
    workers: usize,
    rx: mpsc::Receiver<T>,
    cancel: CancellationToken,
    work: F,
) -> JoinSet<()>
where
    T: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let rx = Arc::new(tokio::sync::Mutex::new(rx));
    let work = Arc::new(work);
    let mut pool = JoinSet::new();

    for worker in 0..workers.max(1) {
        let rx = rx.clone();
        let work = work.clone();
        let cancel = cancel.clone();
        pool.spawn(async move {
            loop {
                let item = {
                    let mut rx = rx.lock().await;
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => None,
                        item = rx.recv() => item,
                    }
                };
                let Some(item) = item else {
                    break;
                };
                work(item).await;
            }
            debug!(pool = name, worker, "Worker stopped");
        });
    }

    pool
}

async fn drain(mut pool: JoinSet<()>) {
    while let Some(joined) = pool.join_next().await {
        if let Err(e) = joined {
            error!(error = %e, "Worker task failed");
        }
    }
}

// ============================================================================
// Write bookkeeping
// ============================================================================

#[derive(Debug, Default, Clone, Copy)]
struct WriteCounts {
    entities: usize,
    relations: usize,
}

#[derive(Debug, Default)]
struct Progress {
    expected: usize,
    written: usize,
    /// First failure among this document's records
    failure: Option<(ErrorClass, String, u32)>,
}

enum DocumentWrites {
    Complete,
    Failed {
        class: ErrorClass,
        reason: String,
        attempts: u32,
    },
    Incomplete,
}

/// Which records each document is waiting on
struct WriteTally {
    documents: Mutex<HashMap<Uuid, Progress>>,
    entities: AtomicUsize,
    relations: AtomicUsize,
}

impl WriteTally {
    fn new<'a>(records: impl Iterator<Item = &'a WriteRecord>) -> Self {
        let mut documents: HashMap<Uuid, Progress> = HashMap::new();
        for record in records {
            for document_id in record.source_document_ids() {
                documents.entry(*document_id).or_default().expected += 1;
            }
        }
        Self {
            documents: Mutex::new(documents),
            entities: AtomicUsize::new(0),
            relations: AtomicUsize::new(0),
        }
    }

    fn written(&self, record: &WriteRecord) {
        let counter = match record {
            WriteRecord::Entity(_) => &self.entities,
            WriteRecord::Relation(_) => &self.relations,
        };
        counter.fetch_add(1, Ordering::SeqCst);

        let mut documents = lock(&self.documents);
        for document_id in record.source_document_ids() {
            if let Some(progress) = documents.get_mut(document_id) {
                progress.written += 1;
            }
        }
    }

    fn failed(&self, record: &WriteRecord, failure: &RetryFailure<StoreError>) {
        let mut documents = lock(&self.documents);
        for document_id in record.source_document_ids() {
            if let Some(progress) = documents.get_mut(document_id) {
                if progress.failure.is_none() {
                    progress.failure = Some((
                        failure.error.class(),
                        format!("{record}: {failure}"),
                        failure.attempts,
                    ));
                }
            }
        }
    }

    fn outcome(&self, document_id: &Uuid) -> DocumentWrites {
        let documents = lock(&self.documents);
        let Some(progress) = documents.get(document_id) else {
            return DocumentWrites::Complete;
        };
        match &progress.failure {
            Some((class, reason, attempts)) => DocumentWrites::Failed {
                class: *class,
                reason: reason.clone(),
                attempts: *attempts,
            },
            None if progress.written >= progress.expected => DocumentWrites::Complete,
            None => DocumentWrites::Incomplete,
        }
    }

    fn counts(&self) -> WriteCounts {
        WriteCounts {
            entities: self.entities.load(Ordering::SeqCst),
            relations: self.relations.load(Ordering::SeqCst),
        }
    }
}
