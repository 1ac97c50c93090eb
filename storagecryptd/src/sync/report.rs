use serde::Serialize;
use storagecrypt_core::Reason;

use crate::model::SyncAction;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Replanned { reason: String },
    Failed { reason: String, message: String },
    Canceled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReportEntry {
    pub document_id: i64,
    pub display_name: String,
    pub action: SyncAction,
    #[serde(flatten)]
    pub outcome: Outcome,
}

/// Per-document outcomes of one run, from first dequeue until the queue
/// drains.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub entries: Vec<ReportEntry>,
}

impl SyncReport {
    pub fn record(
        &mut self,
        document_id: i64,
        display_name: &str,
        action: SyncAction,
        outcome: Outcome,
    ) {
        self.entries.push(ReportEntry {
            document_id,
            display_name: display_name.to_string(),
            action,
            outcome,
        });
    }

    pub fn replanned(reason: Reason) -> Outcome {
        Outcome::Replanned {
            reason: reason.as_str().to_string(),
        }
    }

    pub fn failed(reason: Reason, message: impl Into<String>) -> Outcome {
        Outcome::Failed {
            reason: reason.as_str().to_string(),
            message: message.into(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn succeeded(&self) -> usize {
        self.count(|o| matches!(o, Outcome::Success))
    }

    pub fn failures(&self) -> impl Iterator<Item = &ReportEntry> {
        self.entries
            .iter()
            .filter(|e| matches!(e.outcome, Outcome::Failed { .. }))
    }

    fn count(&self, pred: impl Fn(&Outcome) -> bool) -> usize {
        self.entries.iter().filter(|e| pred(&e.outcome)).count()
    }

    pub fn summary(&self) -> String {
        let replanned = self.count(|o| matches!(o, Outcome::Replanned { .. }));
        let canceled = self.count(|o| matches!(o, Outcome::Canceled));
        format!(
            "{} succeeded, {} failed, {} replanned, {} canceled",
            self.succeeded(),
            self.failures().count(),
            replanned,
            canceled
        )
    }
}
