use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::record::{Record, RecordId, RecordStatus};

/// Current on-disk schema version.
pub const SCHEMA_VERSION: u32 = 1;

/// The full persisted annotation set.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub schema_version: u32,
    pub records: BTreeMap<RecordId, Record>,
    /// Set by the durable writer on each successful commit.
    pub document_updated_at: Option<DateTime<Utc>>,
}

impl Default for Document {
    fn default() -> Self {
        Self::empty()
    }
}

impl Document {
    pub fn empty() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            records: BTreeMap::new(),
            document_updated_at: None,
        }
    }

    pub fn get(&self, id: &RecordId) -> Option<&Record> {
        self.records.get(id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Insert or replace a record, keyed by its id.
    pub fn upsert(&mut self, record: Record) -> Option<Record> {
        self.records.insert(record.id.clone(), record)
    }

    /// Whether the region already has a final annotation.
    pub fn is_annotated(&self, id: &RecordId) -> bool {
        self.records
            .get(id)
            .is_some_and(|r| r.status.is_annotated())
    }

    /// First id of `order` that still needs an annotation.
    pub fn next_unannotated<'a, I>(&self, order: I) -> Option<&'a RecordId>
    where
        I: IntoIterator<Item = &'a RecordId>,
    {
        order.into_iter().find(|id| !self.is_annotated(id))
    }

    /// Same records, ignoring the commit timestamp.
    pub fn same_content(&self, other: &Document) -> bool {
        self.schema_version == other.schema_version && self.records == other.records
    }

    pub fn summary(&self) -> Summary {
        let mut summary = Summary {
            total: self.records.len(),
            ..Summary::default()
        };
        for record in self.records.values() {
            match record.status {
                RecordStatus::Pending => summary.pending += 1,
                RecordStatus::Dated => summary.dated += 1,
                RecordStatus::Illegible => summary.illegible += 1,
                RecordStatus::Skipped => summary.skipped += 1,
            }
            if !record.conflicts.is_empty() {
                summary.conflicted += 1;
            }
        }
        summary.last_commit = self.document_updated_at;
        summary
    }
}

/// Totals by status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Summary {
    pub total: usize,
    pub pending: usize,
    pub dated: usize,
    pub illegible: usize,
    pub skipped: usize,
    /// Records carrying at least one conflict note.
    pub conflicted: usize,
    pub last_commit: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn record(id: &str, status: RecordStatus) -> Record {
        let r = Record::pending(RecordId::from(id), serde_json::Value::Null);
        match status {
            RecordStatus::Pending => r,
            RecordStatus::Dated => r.with_date(NaiveDate::from_ymd_opt(2025, 5, 31).unwrap(), "05/25"),
            RecordStatus::Illegible => r.illegible(None),
            RecordStatus::Skipped => r.skipped(),
        }
    }

    #[test]
    fn test_summary_counts() {
        let mut doc = Document::empty();
        doc.upsert(record("a#0", RecordStatus::Dated));
        doc.upsert(record("a#1", RecordStatus::Dated));
        doc.upsert(record("b#0", RecordStatus::Illegible));
        doc.upsert(record("c#0", RecordStatus::Skipped));
        doc.upsert(record("d#0", RecordStatus::Pending));

        let summary = doc.summary();
        assert_eq!(summary.total, 5);
        assert_eq!(summary.dated, 2);
        assert_eq!(summary.illegible, 1);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.pending, 1);
        assert_eq!(summary.conflicted, 0);
    }

    #[test]
    fn test_next_unannotated_resumes_after_final_outcomes() {
        let mut doc = Document::empty();
        doc.upsert(record("a#0", RecordStatus::Dated));
        doc.upsert(record("a#1", RecordStatus::Illegible));
        doc.upsert(record("b#0", RecordStatus::Skipped));

        let order: Vec<RecordId> = ["a#0", "a#1", "b#0", "c#0"].into_iter().map(RecordId::from).collect();
        assert_eq!(doc.next_unannotated(&order), Some(&order[2]));

        doc.upsert(record("b#0", RecordStatus::Dated));
        assert_eq!(doc.next_unannotated(&order), Some(&order[3]));
        assert!(doc.is_annotated(&order[0]));
        assert!(!doc.is_annotated(&order[3]));
    }
}
