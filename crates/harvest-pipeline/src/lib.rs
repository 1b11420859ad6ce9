//! Harvest Pipeline - Staged orchestration
//!
//! Wires the Fetcher, Extractor, Annotator, Resolver and GraphWriter into a
//! staged pipeline. Each stage has its own worker pool; stages are joined
//! by bounded queues so a slow consumer blocks its producers instead of
//! buffering without limit.
//!
//! Per-document progress is tracked by [`RunLedger`], and every run ends
//! with a [`RunSummary`] that accounts for every submitted document.

use harvest_core::{Classify, ConfigError, ErrorClass};
use thiserror::Error;

pub mod orchestrator;
pub mod resolver_task;
pub mod state;
pub mod summary;

pub use orchestrator::{Pipeline, PipelineBuilder};
pub use resolver_task::{ResolverCommand, ResolverHandle};
pub use state::{DocumentState, RunLedger};
pub use summary::{DeadLetter, RunSummary};

/// Errors that end a run as a whole
#[derive(Error, Debug)]
pub enum PipelineError {
    /// A required component could not be reached at startup
    #[error("{component} unavailable at startup: {reason}")]
    Fatal {
        component: &'static str,
        reason: String,
    },

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Internal pipeline error: {0}")]
    Internal(String),
}

impl Classify for PipelineError {
    fn class(&self) -> ErrorClass {
        match self {
            Self::Fatal { .. } | Self::Config(_) => ErrorClass::Fatal,
            Self::Internal(_) => ErrorClass::ToolingError,
        }
    }
}
