//! Run summary and dead letters

use std::collections::BTreeMap;

use harvest_core::{ErrorClass, Stage};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A document that failed, with enough context to replay it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub document_id: Uuid,
    pub source: String,
    pub stage: Stage,
    pub class: ErrorClass,
    pub reason: String,
    pub attempts: u32,
}

/// Outcome of one run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub documents_submitted: usize,
    pub documents_processed: usize,
    pub documents_failed: BTreeMap<Stage, usize>,
    pub documents_cancelled: usize,
    pub entities_written: usize,
    pub relations_written: usize,
    pub dead_letters: Vec<DeadLetter>,
    pub cancelled: bool,
    pub elapsed_ms: u64,
}

impl RunSummary {
    pub fn failed_total(&self) -> usize {
        self.documents_failed.values().sum()
    }

    /// Whether every submitted document is accounted for exactly once
    pub fn is_balanced(&self) -> bool {
        self.documents_processed + self.failed_total() + self.documents_cancelled
            == self.documents_submitted
    }

    /// Failures of one stage
    pub fn failed_at(&self, stage: Stage) -> usize {
        self.documents_failed.get(&stage).copied().unwrap_or(0)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_serializes_stage_keys() {
        let mut summary = RunSummary {
            documents_submitted: 3,
            documents_processed: 1,
            documents_cancelled: 1,
            ..RunSummary::default()
        };
        summary.documents_failed.insert(Stage::Fetcher, 1);
        summary.dead_letters.push(DeadLetter {
            document_id: Uuid::nil(),
            source: "https://example.com/slow".into(),
            stage: Stage::Fetcher,
            class: ErrorClass::TransientIO,
            reason: "Timed out after 50ms waiting for page".into(),
            attempts: 3,
        });

        assert!(summary.is_balanced());
        let json: serde_json::Value =
            serde_json::from_str(&summary.to_json().unwrap()).unwrap();
        assert_eq!(json["documents_failed"]["fetcher"], 1);
        assert_eq!(json["dead_letters"][0]["class"], "transient_io");
    }
}
