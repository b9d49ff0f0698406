use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Stable identifier of an annotated region: `{image_name}#{region_index}`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(String);

impl RecordId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Derive the id of region `region_index` on image `image_name`.
    pub fn for_region(image_name: &str, region_index: usize) -> Self {
        Self(format!("{}#{}", image_name, region_index))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RecordId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Annotation status of a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    Pending,
    Dated,
    Illegible,
    Skipped,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::Pending => "pending",
            RecordStatus::Dated => "dated",
            RecordStatus::Illegible => "illegible",
            RecordStatus::Skipped => "skipped",
        }
    }

    /// Final outcomes. Pending and skipped regions are revisited on resume.
    pub fn is_annotated(&self) -> bool {
        matches!(self, RecordStatus::Dated | RecordStatus::Illegible)
    }
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The state a record held before its most recent transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriorState {
    pub status: RecordStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_value: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_input: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// A value superseded during a merge, kept for audit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictNote {
    pub status: RecordStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_value: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_input: Option<String>,
    pub annotator: String,
    pub updated_at: DateTime<Utc>,
    /// Annotator whose value won.
    pub superseded_by: String,
}

/// One annotation unit.
///
/// `date_value` is present if and only if `status` is `Dated`. The
/// `geometry_ref` belongs to the external geometry system and is carried
/// through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: RecordId,
    #[serde(default)]
    pub geometry_ref: serde_json::Value,
    pub status: RecordStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_value: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_input: Option<String>,
    #[serde(default)]
    pub annotator: String,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous: Option<PriorState>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conflicts: Vec<ConflictNote>,
}

impl Record {
    /// A freshly visited region.
    pub fn pending(id: RecordId, geometry_ref: serde_json::Value) -> Self {
        Self {
            id,
            geometry_ref,
            status: RecordStatus::Pending,
            date_value: None,
            raw_input: None,
            annotator: String::new(),
            updated_at: Utc::now(),
            previous: None,
            conflicts: Vec::new(),
        }
    }

    /// Mark as dated with an already-normalized date and the text typed.
    pub fn with_date(mut self, date: NaiveDate, raw_input: impl Into<String>) -> Self {
        self.status = RecordStatus::Dated;
        self.date_value = Some(date);
        self.raw_input = Some(raw_input.into());
        self
    }

    pub fn illegible(mut self, raw_input: Option<String>) -> Self {
        self.status = RecordStatus::Illegible;
        self.date_value = None;
        self.raw_input = raw_input;
        self
    }

    pub fn skipped(mut self) -> Self {
        self.status = RecordStatus::Skipped;
        self.date_value = None;
        self.raw_input = None;
        self
    }

    /// Check the per-record invariants, returning the violated one.
    pub fn check_invariants(&self) -> Result<(), String> {
        if self.id.as_str().trim().is_empty() {
            return Err("id must not be empty".to_string());
        }
        check_date_pairing(self.status, self.date_value.as_ref())?;
        if let Some(prior) = &self.previous {
            check_date_pairing(prior.status, prior.date_value.as_ref())
                .map_err(|reason| format!("previous state: {}", reason))?;
            if prior.updated_at > self.updated_at {
                return Err("previous state is newer than the record".to_string());
            }
        }
        Ok(())
    }

    /// Whether both records carry the same annotation, ignoring provenance.
    pub fn same_annotation(&self, other: &Record) -> bool {
        self.status == other.status
            && self.date_value == other.date_value
            && self.raw_input == other.raw_input
            && self.geometry_ref == other.geometry_ref
    }

    pub fn prior_state(&self) -> PriorState {
        PriorState {
            status: self.status,
            date_value: self.date_value,
            raw_input: self.raw_input.clone(),
            updated_at: self.updated_at,
        }
    }

    /// Undo the most recent transition. Only one step is kept, so a second
    /// call without an intervening transition returns `false`.
    pub fn revert(&mut self, at: DateTime<Utc>) -> bool {
        let Some(prior) = self.previous.take() else {
            return false;
        };
        self.status = prior.status;
        self.date_value = if prior.status == RecordStatus::Dated {
            prior.date_value
        } else {
            None
        };
        self.raw_input = prior.raw_input;
        self.updated_at = at.max(self.updated_at);
        true
    }

    /// The note describing this record when it loses a conflict to `winner`.
    pub fn conflict_note(&self, winner: &Record) -> ConflictNote {
        ConflictNote {
            status: self.status,
            date_value: self.date_value,
            raw_input: self.raw_input.clone(),
            annotator: self.annotator.clone(),
            updated_at: self.updated_at,
            superseded_by: winner.annotator.clone(),
        }
    }
}

fn check_date_pairing(status: RecordStatus, date: Option<&NaiveDate>) -> Result<(), String> {
    match (status, date) {
        (RecordStatus::Dated, None) => Err("status 'dated' requires date_value".to_string()),
        (RecordStatus::Dated, Some(_)) | (_, None) => Ok(()),
        (other, Some(_)) => Err(format!("status '{}' must not carry date_value", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_region_id_format() {
        assert_eq!(RecordId::for_region("img1.jpg", 0).as_str(), "img1.jpg#0");
        assert_eq!(RecordId::for_region("img2", 3).to_string(), "img2#3");
    }

    #[test]
    fn test_status_serializes_lowercase() {
        let json = serde_json::to_string(&RecordStatus::Illegible).unwrap();
        assert_eq!(json, "\"illegible\"");
        let back: RecordStatus = serde_json::from_str("\"skipped\"").unwrap();
        assert_eq!(back, RecordStatus::Skipped);
    }

    #[test]
    fn test_date_pairing_invariant() {
        let id = RecordId::from("img#0");
        let dated = Record::pending(id.clone(), serde_json::Value::Null).with_date(date(2025, 2, 1), "01/02/25");
        assert!(dated.check_invariants().is_ok());

        let mut broken = dated.clone();
        broken.status = RecordStatus::Illegible;
        assert!(broken.check_invariants().unwrap_err().contains("illegible"));

        let mut missing = dated;
        missing.date_value = None;
        assert!(missing.check_invariants().unwrap_err().contains("requires date_value"));
    }

    #[test]
    fn test_empty_id_rejected() {
        let record = Record::pending(RecordId::from("  "), serde_json::Value::Null);
        assert!(record.check_invariants().is_err());
    }

    #[test]
    fn test_revert_restores_prior_and_clears_date() {
        let t0 = Utc.with_ymd_and_hms(2025, 1, 1, 10, 0, 0).unwrap();
        let t1 = Utc.with_ymd_and_hms(2025, 1, 1, 10, 0, 5).unwrap();

        let mut record = Record::pending(RecordId::from("img#0"), serde_json::Value::Null);
        record.updated_at = t0;
        let prior = record.prior_state();
        let mut record = record.with_date(date(2025, 3, 1), "010325");
        record.previous = Some(prior);

        assert!(record.revert(t1));
        assert_eq!(record.status, RecordStatus::Pending);
        assert_eq!(record.date_value, None);
        assert_eq!(record.raw_input, None);
        assert_eq!(record.updated_at, t1);

        // Single step only
        assert!(!record.revert(t1));
    }

    #[test]
    fn test_same_annotation_ignores_provenance() {
        let a = Record::pending(RecordId::from("img#0"), serde_json::Value::Null).with_date(date(2025, 3, 1), "1/3/25");
        let mut b = a.clone();
        b.annotator = "someone-else".to_string();
        b.updated_at = a.updated_at + chrono::Duration::seconds(30);
        assert!(a.same_annotation(&b));

        b.raw_input = Some("01/03/2025".to_string());
        assert!(!a.same_annotation(&b));
    }
}
