//! Resolver task
//!
//! The `Resolver` holds the union-find and canonical tables, so it has a
//! single owner: a task fed over a bounded channel. Annotate workers send
//! `Add` as documents complete; the orchestrator sends `Finalize` after the
//! annotate stage has drained.

use harvest_core::{Annotation, ResolverConfig};
use harvest_extractor::{Resolution, Resolver};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::PipelineError;

pub enum ResolverCommand {
    Add(Annotation),
    Finalize(oneshot::Sender<Resolution>),
}

/// Sending side of the resolver task
#[derive(Clone)]
pub struct ResolverHandle {
    tx: mpsc::Sender<ResolverCommand>,
}

impl ResolverHandle {
    /// Spawn the resolver task with a queue of `capacity` commands
    pub fn spawn(config: &ResolverConfig, capacity: usize) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let resolver = Resolver::new(config);
        let task = tokio::spawn(run(resolver, rx));
        (Self { tx }, task)
    }

    /// Queue a document's annotation; waits while the queue is full
    pub async fn add(&self, annotation: Annotation) -> Result<(), PipelineError> {
        self.tx
            .send(ResolverCommand::Add(annotation))
            .await
            .map_err(|_| PipelineError::Internal("resolver task stopped".into()))
    }

    /// Resolve everything added so far; the task exits afterwards
    pub async fn finalize(&self) -> Result<Resolution, PipelineError> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(ResolverCommand::Finalize(reply))
            .await
            .map_err(|_| PipelineError::Internal("resolver task stopped".into()))?;
        response
            .await
            .map_err(|_| PipelineError::Internal("resolver task dropped the resolution".into()))
    }
}

async fn run(mut resolver: Resolver, mut rx: mpsc::Receiver<ResolverCommand>) {
    while let Some(command) = rx.recv().await {
        match command {
            ResolverCommand::Add(annotation) => {
                let document_id = annotation.document_id;
                let added = resolver.add(&annotation);
                debug!(%document_id, mentions = added, "Annotation added to resolver");
            }
            ResolverCommand::Finalize(reply) => {
                let resolution = resolver.finalize();
                info!(
                    mentions = resolver.mention_count(),
                    entities = resolution.entities.len(),
                    relations = resolution.relations.len(),
                    self_relations_dropped = resolution.self_relations_dropped,
                    "Resolution finalised"
                );
                let _ = reply.send(resolution);
                return;
            }
        }
    }
}
