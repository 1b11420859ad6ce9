//! Per-document state machine and the run ledger
//!
//! Every submitted document moves strictly forward through
//! `Pending → Fetched → Extracted → Annotated → Resolved → Written → Done`
//! or ends in `Failed`. The ledger is the single record of where each
//! document is, and the run summary is computed from it.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use harvest_core::{ErrorClass, HarvestError, Source, Stage, Submission};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::summary::{DeadLetter, RunSummary};

// ============================================================================
// Document state
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum DocumentState {
    Pending,
    Fetched,
    Extracted,
    Annotated,
    Resolved,
    Written,
    Done,
    Failed {
        stage: Stage,
        class: ErrorClass,
        reason: String,
    },
}

impl DocumentState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Fetched => "Fetched",
            Self::Extracted => "Extracted",
            Self::Annotated => "Annotated",
            Self::Resolved => "Resolved",
            Self::Written => "Written",
            Self::Done => "Done",
            Self::Failed { .. } => "Failed",
        }
    }

    /// The only state `advance` accepts from here
    pub fn successor(&self) -> Option<DocumentState> {
        match self {
            Self::Pending => Some(Self::Fetched),
            Self::Fetched => Some(Self::Extracted),
            Self::Extracted => Some(Self::Annotated),
            Self::Annotated => Some(Self::Resolved),
            Self::Resolved => Some(Self::Written),
            Self::Written => Some(Self::Done),
            Self::Done | Self::Failed { .. } => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed { .. })
    }

    /// Stage a document in this state is waiting for or running
    pub fn pending_stage(&self) -> Stage {
        match self {
            Self::Pending => Stage::Fetcher,
            Self::Fetched => Stage::Extractor,
            Self::Extracted => Stage::Annotator,
            Self::Annotated => Stage::Resolver,
            Self::Resolved | Self::Written | Self::Done => Stage::GraphWriter,
            Self::Failed { stage, .. } => *stage,
        }
    }

    /// Move to `next`, which must be the immediate successor
    pub fn advance(&mut self, next: DocumentState) -> Result<(), HarvestError> {
        if self.successor().as_ref() != Some(&next) {
            return Err(self.invalid(next.name()));
        }
        *self = next;
        Ok(())
    }

    /// Move to `Failed`; allowed from every non-terminal state
    pub fn fail(
        &mut self,
        stage: Stage,
        class: ErrorClass,
        reason: impl Into<String>,
    ) -> Result<(), HarvestError> {
        if self.is_terminal() {
            return Err(self.invalid("Failed"));
        }
        *self = Self::Failed {
            stage,
            class,
            reason: reason.into(),
        };
        Ok(())
    }

    fn invalid(&self, to: &str) -> HarvestError {
        HarvestError::InvalidTransition {
            from: self.name().to_string(),
            to: to.to_string(),
        }
    }
}

impl std::fmt::Display for DocumentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Failed {
                stage,
                class,
                reason,
            } => write!(f, "Failed({stage}, {class}: {reason})"),
            other => write!(f, "{}", other.name()),
        }
    }
}

// ============================================================================
// Run ledger
// ============================================================================

#[derive(Debug, Clone)]
struct Entry {
    source: Source,
    state: DocumentState,
    /// Attempts per stage, for dead letters
    attempts: BTreeMap<Stage, u32>,
}

/// All documents of one run and their states
#[derive(Debug, Default)]
pub struct RunLedger {
    entries: Mutex<HashMap<Uuid, Entry>>,
    /// Submission order, so summaries list documents deterministically
    order: Mutex<Vec<Uuid>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl RunLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, submission: &Submission) {
        let mut entries = lock(&self.entries);
        if entries.contains_key(&submission.id) {
            return;
        }
        entries.insert(
            submission.id,
            Entry {
                source: submission.source.clone(),
                state: DocumentState::Pending,
                attempts: BTreeMap::new(),
            },
        );
        lock(&self.order).push(submission.id);
    }

    pub fn len(&self) -> usize {
        lock(&self.order).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn state(&self, document_id: &Uuid) -> Option<DocumentState> {
        lock(&self.entries).get(document_id).map(|e| e.state.clone())
    }

    /// Advance a document to `next`
    pub fn advance(&self, document_id: &Uuid, next: DocumentState) -> Result<(), HarvestError> {
        let mut entries = lock(&self.entries);
        let entry = entries
            .get_mut(document_id)
            .ok_or_else(|| HarvestError::InvalidInput(format!("unknown document {document_id}")))?;
        entry.state.advance(next)
    }

    pub fn record_attempts(&self, document_id: &Uuid, stage: Stage, attempts: u32) {
        if let Some(entry) = lock(&self.entries).get_mut(document_id) {
            entry.attempts.insert(stage, attempts);
        }
    }

    /// Fail a document; a document that already reached a terminal state
    /// keeps it
    pub fn fail(
        &self,
        document_id: &Uuid,
        stage: Stage,
        class: ErrorClass,
        reason: impl Into<String>,
    ) -> Result<(), HarvestError> {
        let mut entries = lock(&self.entries);
        let entry = entries
            .get_mut(document_id)
            .ok_or_else(|| HarvestError::InvalidInput(format!("unknown document {document_id}")))?;
        entry.state.fail(stage, class, reason)
    }

    /// Documents currently in `state`
    pub fn in_state(&self, state: &DocumentState) -> Vec<Uuid> {
        let entries = lock(&self.entries);
        lock(&self.order)
            .iter()
            .filter(|id| entries.get(id).is_some_and(|e| &e.state == state))
            .copied()
            .collect()
    }

    /// Fail every document that has not reached a terminal state
    pub fn close(&self, class: ErrorClass, reason: &str) -> usize {
        let mut entries = lock(&self.entries);
        let mut closed = 0;
        for entry in entries.values_mut() {
            if entry.state.is_terminal() {
                continue;
            }
            let stage = entry.state.pending_stage();
            if entry.state.fail(stage, class, reason).is_ok() {
                closed += 1;
            }
        }
        closed
    }

    /// Summarise the run; every document lands in exactly one bucket
    pub fn summary(&self, cancelled: bool, elapsed_ms: u64) -> RunSummary {
        let entries = lock(&self.entries);
        let order = lock(&self.order);

        let mut summary = RunSummary {
            documents_submitted: order.len(),
            cancelled,
            elapsed_ms,
            ..RunSummary::default()
        };

        for id in order.iter() {
            let Some(entry) = entries.get(id) else {
                continue;
            };
            match &entry.state {
                DocumentState::Done => summary.documents_processed += 1,
                DocumentState::Failed {
                    class: ErrorClass::Cancelled,
                    ..
                } => summary.documents_cancelled += 1,
                DocumentState::Failed {
                    stage,
                    class,
                    reason,
                } => {
                    *summary.documents_failed.entry(*stage).or_insert(0) += 1;
                    summary.dead_letters.push(DeadLetter {
                        document_id: *id,
                        source: entry.source.locator(),
                        stage: *stage,
                        class: *class,
                        reason: reason.clone(),
                        attempts: entry.attempts.get(stage).copied().unwrap_or(0),
                    });
                }
                // Unreachable after close(); counted as in-flight cancellations
                _ => summary.documents_cancelled += 1,
            }
        }

        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_states_advance_in_order() {
        let mut state = DocumentState::Pending;
        for next in [
            DocumentState::Fetched,
            DocumentState::Extracted,
            DocumentState::Annotated,
            DocumentState::Resolved,
            DocumentState::Written,
            DocumentState::Done,
        ] {
            state.advance(next.clone()).unwrap();
            assert_eq!(state, next);
        }
        assert!(state.is_terminal());
    }

    #[test]
    fn test_skipping_a_stage_is_rejected() {
        let mut state = DocumentState::Fetched;
        let err = state.advance(DocumentState::Annotated).unwrap_err();
        assert!(matches!(err, HarvestError::InvalidTransition { .. }));
        assert_eq!(state, DocumentState::Fetched);

        assert!(state.advance(DocumentState::Pending).is_err());
    }

    #[test]
    fn test_terminal_states_reject_everything() {
        let mut done = DocumentState::Done;
        assert!(done.advance(DocumentState::Pending).is_err());
        assert!(done.fail(Stage::Fetcher, ErrorClass::InputError, "late").is_err());

        let mut failed = DocumentState::Pending;
        failed
            .fail(Stage::Fetcher, ErrorClass::TransientIO, "timeout")
            .unwrap();
        assert!(failed.advance(DocumentState::Fetched).is_err());
        assert!(failed.fail(Stage::Annotator, ErrorClass::ToolingError, "x").is_err());
        assert_eq!(failed.pending_stage(), Stage::Fetcher);
    }

    #[test]
    fn test_ledger_summary_buckets() {
        let ledger = RunLedger::new();
        let subs: Vec<Submission> = (0..4)
            .map(|i| Submission::new(Source::raw(format!("doc{i}"), "text")))
            .collect();
        for sub in &subs {
            ledger.register(sub);
        }

        let done = &subs[0].id;
        for next in [
            DocumentState::Fetched,
            DocumentState::Extracted,
            DocumentState::Annotated,
            DocumentState::Resolved,
            DocumentState::Written,
            DocumentState::Done,
        ] {
            ledger.advance(done, next).unwrap();
        }

        ledger.record_attempts(&subs[1].id, Stage::Fetcher, 4);
        ledger
            .fail(&subs[1].id, Stage::Fetcher, ErrorClass::TransientIO, "timed out")
            .unwrap();
        ledger.advance(&subs[2].id, DocumentState::Fetched).unwrap();

        assert_eq!(ledger.close(ErrorClass::Cancelled, "run cancelled"), 2);
        assert_eq!(
            ledger.state(&subs[2].id),
            Some(DocumentState::Failed {
                stage: Stage::Extractor,
                class: ErrorClass::Cancelled,
                reason: "run cancelled".into(),
            })
        );

        let summary = ledger.summary(true, 5);
        assert_eq!(summary.documents_submitted, 4);
        assert_eq!(summary.documents_processed, 1);
        assert_eq!(summary.documents_cancelled, 2);
        assert_eq!(summary.documents_failed.get(&Stage::Fetcher), Some(&1));
        assert_eq!(summary.dead_letters.len(), 1);
        assert_eq!(summary.dead_letters[0].attempts, 4);
        assert_eq!(summary.dead_letters[0].source, "raw:doc1");
    }
}
