//! Reference data, interval rows, and reconciliation results.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use crate::measurement::{TagRef, ValueRef};

// =============================================================================
// REFERENCE DATA
// =============================================================================

/// Full taxonomy row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Taxonomy {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub allows_auto_tags: bool,
    pub allows_auto_values: bool,
}

/// The part of a taxonomy the resolver needs: its ID and whether it permits
/// auto-generation of tags and values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaxonomyInfo {
    pub id: i64,
    pub allows_auto_tags: bool,
    pub allows_auto_values: bool,
}

impl From<&Taxonomy> for TaxonomyInfo {
    fn from(t: &Taxonomy) -> Self {
        Self {
            id: t.id,
            allows_auto_tags: t.allows_auto_tags,
            allows_auto_values: t.allows_auto_values,
        }
    }
}

/// Tag row. `tag_name` is unique within its taxonomy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tag {
    pub tag_id: i64,
    pub tag_name: String,
    pub taxonomy_id: i64,
    pub tag_description: Option<String>,
    #[serde(default)]
    pub extras: Map<String, JsonValue>,
}

/// Value row attached to a tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Value {
    pub value_id: i64,
    pub tag_id: i64,
    pub value: String,
}

/// Tag to be created by the resolver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTag {
    pub tag_name: String,
    pub tag_description: String,
    pub taxonomy_id: i64,
    #[serde(default)]
    pub extras: Map<String, JsonValue>,
}

/// Value to be created by the resolver.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NewValue {
    pub tag_id: i64,
    pub value: String,
}

// =============================================================================
// INTERVALS
// =============================================================================

/// Identity of an interval within one (tag_type, entity, taxonomy) scope.
///
/// The derived ordering sorts by `tag_id` first, then `value_id` with a
/// missing value ordered before any present one. Change sets are reported in
/// this order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct TagState {
    pub tag_id: i64,
    pub value_id: Option<i64>,
}

impl TagState {
    pub fn new(tag_id: i64, value_id: Option<i64>) -> Self {
        Self { tag_id, value_id }
    }
}

impl std::fmt::Display for TagState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.value_id {
            Some(v) => write!(f, "{}-{}", self.tag_id, v),
            None => write!(f, "{}-None", self.tag_id),
        }
    }
}

/// An open interval (end_ts is null) as seen by the reconciler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenInterval {
    pub tag_id: i64,
    pub value_id: Option<i64>,
    pub measured_at: DateTime<Utc>,
    pub producer: Option<String>,
}

impl OpenInterval {
    pub fn state(&self) -> TagState {
        TagState::new(self.tag_id, self.value_id)
    }
}

/// Historical interval row, open or closed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntervalRecord {
    pub tag_id: i64,
    pub value_id: Option<i64>,
    pub start_ts: DateTime<Utc>,
    pub measured_at: DateTime<Utc>,
    pub end_ts: Option<DateTime<Utc>>,
    pub producer: Option<String>,
}

impl IntervalRecord {
    pub fn is_open(&self) -> bool {
        self.end_ts.is_none()
    }

    /// Calendar day the interval started.
    pub fn start_date(&self) -> NaiveDate {
        self.start_ts.date_naive()
    }

    /// Calendar day the interval ended, if it did.
    pub fn end_date(&self) -> Option<NaiveDate> {
        self.end_ts.map(|ts| ts.date_naive())
    }
}

/// Interval together with the entity it belongs to, for taxonomy-wide reads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaggedInterval {
    pub tagged_id: i64,
    #[serde(flatten)]
    pub interval: IntervalRecord,
}

// =============================================================================
// RESOLUTION
// =============================================================================

/// A measurement tag entry with its canonical IDs.
///
/// Every `tag_id` and `value_id` here refers to a row that exists in the
/// store (possibly created during resolution, inside the same transaction).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedTag {
    /// Reference as given in the measurement.
    pub tag: TagRef,
    pub tag_id: i64,
    /// Value reference as given in the measurement.
    pub value: Option<ValueRef>,
    pub value_id: Option<i64>,
}

impl ResolvedTag {
    pub fn state(&self) -> TagState {
        TagState::new(self.tag_id, self.value_id)
    }
}

/// Output of the reference resolver.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedTaxonomyInfo {
    pub taxonomy: TaxonomyInfo,
    pub tags: Vec<ResolvedTag>,
    /// Tags created while resolving, by name.
    pub created_tags: Vec<String>,
    /// Values created while resolving, as (tag_id, value).
    pub created_values: Vec<NewValue>,
}

// =============================================================================
// RECONCILIATION
// =============================================================================

/// Interval operations required to move stored state to a measurement.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagChanges {
    /// Keys to open.
    pub insert: Vec<TagState>,
    /// Open keys confirmed by the measurement.
    pub prolong: Vec<TagState>,
    /// Open keys the measurement no longer asserts.
    pub end: Vec<TagState>,
}

impl TagChanges {
    pub fn is_empty(&self) -> bool {
        self.insert.is_empty() && self.prolong.is_empty() && self.end.is_empty()
    }

    /// Keys that already have a stored interval (and therefore an owner).
    pub fn touched_existing(&self) -> impl Iterator<Item = &TagState> {
        self.prolong.iter().chain(self.end.iter())
    }
}

/// Result of handling one measurement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MeasurementResult {
    pub tag_type: String,
    pub tagged_id: i64,
    pub taxonomy_id: i64,
    pub measured_at: DateTime<Utc>,
    pub tag_changes: TagChanges,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_tag_state_orders_missing_value_first() {
        let mut states = vec![
            TagState::new(2, Some(1)),
            TagState::new(1, Some(7)),
            TagState::new(2, None),
            TagState::new(1, None),
        ];
        states.sort();
        assert_eq!(
            states,
            vec![
                TagState::new(1, None),
                TagState::new(1, Some(7)),
                TagState::new(2, None),
                TagState::new(2, Some(1)),
            ]
        );
    }

    #[test]
    fn test_tag_state_display() {
        assert_eq!(TagState::new(4, None).to_string(), "4-None");
        assert_eq!(TagState::new(4, Some(9)).to_string(), "4-9");
    }

    #[test]
    fn test_interval_record_dates() {
        let start = Utc.with_ymd_and_hms(2021, 3, 4, 23, 59, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2021, 3, 6, 0, 0, 1).unwrap();
        let record = IntervalRecord {
            tag_id: 1,
            value_id: None,
            start_ts: start,
            measured_at: end,
            end_ts: Some(end),
            producer: None,
        };
        assert!(!record.is_open());
        assert_eq!(
            record.start_date(),
            NaiveDate::from_ymd_opt(2021, 3, 4).unwrap()
        );
        assert_eq!(record.end_date(), NaiveDate::from_ymd_opt(2021, 3, 6));
    }

    #[test]
    fn test_tag_changes_touched_existing() {
        let changes = TagChanges {
            insert: vec![TagState::new(5, None)],
            prolong: vec![TagState::new(1, None)],
            end: vec![TagState::new(2, None)],
        };
        let touched: Vec<_> = changes.touched_existing().copied().collect();
        assert_eq!(touched, vec![TagState::new(1, None), TagState::new(2, None)]);
        assert!(!changes.is_empty());
        assert!(TagChanges::default().is_empty());
    }
}
