//! In-memory storage adapter for deterministic testing.
//!
//! [`MemoryAdapter`] keeps a committed copy and a working copy of all
//! reference data and intervals. Writes go to the working copy; `commit`
//! publishes it and `rollback` discards it, so tests can assert that a failed
//! measurement left nothing behind.
//!
//! ## Usage
//!
//! ```rust
//! use tag2domain_core::mock::MemoryAdapter;
//!
//! let adapter = MemoryAdapter::new()
//!     .with_taxonomy(1, "colors", false, false)
//!     .with_tag(10, 1, "red")
//!     .with_value(100, 10, "dark");
//!
//! assert_eq!(adapter.committed_tags().len(), 1);
//! ```

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Map;

use crate::defaults::{TAG_TYPE_DELEGATION, TAG_TYPE_DOMAIN, TAG_TYPE_INTERSECTION};
use crate::error::{Error, Result};
use crate::models::*;
use crate::traits::{StorageAdapter, TagIdsByName, ValueIdsByValue};

#[derive(Debug, Clone, PartialEq)]
struct StoredInterval {
    tag_type: String,
    tagged_id: i64,
    taxonomy_id: i64,
    record: IntervalRecord,
}

impl StoredInterval {
    fn in_scope(&self, tag_type: &str, tagged_id: i64, taxonomy_id: i64) -> bool {
        self.tag_type == tag_type && self.tagged_id == tagged_id && self.taxonomy_id == taxonomy_id
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
struct MemoryStore {
    taxonomies: Vec<Taxonomy>,
    tags: Vec<Tag>,
    values: Vec<Value>,
    intervals: Vec<StoredInterval>,
}

impl MemoryStore {
    fn next_tag_id(&self) -> i64 {
        self.tags.iter().map(|t| t.tag_id).max().unwrap_or(0) + 1
    }

    fn next_value_id(&self) -> i64 {
        self.values.iter().map(|v| v.value_id).max().unwrap_or(0) + 1
    }

    fn open_mut<'a>(
        &'a mut self,
        tag_type: &'a str,
        tagged_id: i64,
        taxonomy_id: i64,
        state: TagState,
    ) -> impl Iterator<Item = &'a mut StoredInterval> + 'a {
        self.intervals.iter_mut().filter(move |i| {
            i.in_scope(tag_type, tagged_id, taxonomy_id)
                && i.record.is_open()
                && i.record.tag_id == state.tag_id
                && i.record.value_id == state.value_id
        })
    }
}

/// Transactional in-memory [`StorageAdapter`].
#[derive(Debug, Clone)]
pub struct MemoryAdapter {
    tag_types: BTreeSet<String>,
    committed: MemoryStore,
    working: MemoryStore,
    fail_on: Option<String>,
    commits: usize,
    rollbacks: usize,
}

impl Default for MemoryAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryAdapter {
    /// Create an empty adapter knowing the default tag types.
    pub fn new() -> Self {
        Self {
            tag_types: [TAG_TYPE_DOMAIN, TAG_TYPE_DELEGATION, TAG_TYPE_INTERSECTION]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            committed: MemoryStore::default(),
            working: MemoryStore::default(),
            fail_on: None,
            commits: 0,
            rollbacks: 0,
        }
    }

    fn seed(mut self, f: impl Fn(&mut MemoryStore)) -> Self {
        f(&mut self.committed);
        f(&mut self.working);
        self
    }

    /// Register an additional tag type.
    pub fn with_tag_type(mut self, tag_type: impl Into<String>) -> Self {
        self.tag_types.insert(tag_type.into());
        self
    }

    /// Seed a taxonomy. Duplicate names are allowed to simulate corrupted
    /// reference data.
    pub fn with_taxonomy(
        self,
        id: i64,
        name: &str,
        allows_auto_tags: bool,
        allows_auto_values: bool,
    ) -> Self {
        let taxonomy = Taxonomy {
            id,
            name: name.to_string(),
            description: None,
            allows_auto_tags,
            allows_auto_values,
        };
        self.seed(|s| s.taxonomies.push(taxonomy.clone()))
    }

    /// Seed a tag.
    pub fn with_tag(self, tag_id: i64, taxonomy_id: i64, name: &str) -> Self {
        let tag = Tag {
            tag_id,
            tag_name: name.to_string(),
            taxonomy_id,
            tag_description: None,
            extras: Map::new(),
        };
        self.seed(|s| s.tags.push(tag.clone()))
    }

    /// Seed a value.
    pub fn with_value(self, value_id: i64, tag_id: i64, value: &str) -> Self {
        let row = Value {
            value_id,
            tag_id,
            value: value.to_string(),
        };
        self.seed(|s| s.values.push(row.clone()))
    }

    /// Seed an open interval started and last measured at `ts`.
    pub fn with_open_interval(
        self,
        tag_type: &str,
        tagged_id: i64,
        taxonomy_id: i64,
        state: TagState,
        ts: DateTime<Utc>,
        producer: Option<&str>,
    ) -> Self {
        let stored = StoredInterval {
            tag_type: tag_type.to_string(),
            tagged_id,
            taxonomy_id,
            record: IntervalRecord {
                tag_id: state.tag_id,
                value_id: state.value_id,
                start_ts: ts,
                measured_at: ts,
                end_ts: None,
                producer: producer.map(str::to_string),
            },
        };
        self.seed(|s| s.intervals.push(stored.clone()))
    }

    /// Make the named operation fail with a connection error.
    pub fn failing_on(mut self, operation: impl Into<String>) -> Self {
        self.fail_on = Some(operation.into());
        self
    }

    /// Stop injecting failures.
    pub fn clear_failure(&mut self) {
        self.fail_on = None;
    }

    fn check_failure(&self, operation: &str) -> Result<()> {
        match &self.fail_on {
            Some(op) if op == operation => Err(Error::Connection(format!(
                "injected failure in {}",
                operation
            ))),
            _ => Ok(()),
        }
    }

    fn check_tag_type(&self, tag_type: &str) -> Result<()> {
        if self.is_valid_tag_type(tag_type) {
            Ok(())
        } else {
            Err(Error::InvalidMeasurement(format!(
                "unknown tag_type '{}'",
                tag_type
            )))
        }
    }

    // -------------------------------------------------------------------------
    // Inspection
    // -------------------------------------------------------------------------

    /// Committed intervals of one entity, sorted by `(tag_id, value_id, start_ts)`.
    pub fn committed_intervals(
        &self,
        tag_type: &str,
        tagged_id: i64,
        taxonomy_id: i64,
    ) -> Vec<IntervalRecord> {
        let mut records: Vec<IntervalRecord> = self
            .committed
            .intervals
            .iter()
            .filter(|i| i.in_scope(tag_type, tagged_id, taxonomy_id))
            .map(|i| i.record.clone())
            .collect();
        records.sort_by_key(|r| (r.tag_id, r.value_id, r.start_ts));
        records
    }

    pub fn committed_tags(&self) -> Vec<Tag> {
        self.committed.tags.clone()
    }

    pub fn committed_values(&self) -> Vec<Value> {
        self.committed.values.clone()
    }

    /// Whether the working copy differs from the committed one.
    pub fn has_uncommitted_changes(&self) -> bool {
        self.working != self.committed
    }

    pub fn commit_count(&self) -> usize {
        self.commits
    }

    pub fn rollback_count(&self) -> usize {
        self.rollbacks
    }
}

#[async_trait]
impl StorageAdapter for MemoryAdapter {
    fn is_valid_tag_type(&self, tag_type: &str) -> bool {
        self.tag_types.contains(tag_type)
    }

    async fn get_open_tags(
        &mut self,
        taxonomy_id: i64,
        tag_type: &str,
        tagged_id: i64,
    ) -> Result<Vec<OpenInterval>> {
        self.check_failure("get_open_tags")?;
        self.check_tag_type(tag_type)?;
        let mut open: Vec<OpenInterval> = self
            .working
            .intervals
            .iter()
            .filter(|i| i.in_scope(tag_type, tagged_id, taxonomy_id) && i.record.is_open())
            .map(|i| OpenInterval {
                tag_id: i.record.tag_id,
                value_id: i.record.value_id,
                measured_at: i.record.measured_at,
                producer: i.record.producer.clone(),
            })
            .collect();
        open.sort_by_key(|i| i.state());
        Ok(open)
    }

    async fn get_all_tags(
        &mut self,
        taxonomy_id: i64,
        tag_type: &str,
        tagged_id: i64,
    ) -> Result<Vec<IntervalRecord>> {
        self.check_failure("get_all_tags")?;
        self.check_tag_type(tag_type)?;
        let mut records: Vec<IntervalRecord> = self
            .working
            .intervals
            .iter()
            .filter(|i| i.in_scope(tag_type, tagged_id, taxonomy_id))
            .map(|i| i.record.clone())
            .collect();
        records.sort_by_key(|r| (r.tag_id, r.value_id, r.start_ts));
        Ok(records)
    }

    async fn insert_intersections(
        &mut self,
        taxonomy_id: i64,
        ts: DateTime<Utc>,
        pairs: &[TagState],
        tag_type: &str,
        tagged_id: i64,
        producer: Option<&str>,
    ) -> Result<()> {
        self.check_failure("insert_intersections")?;
        self.check_tag_type(tag_type)?;
        for pair in pairs {
            self.working.intervals.push(StoredInterval {
                tag_type: tag_type.to_string(),
                tagged_id,
                taxonomy_id,
                record: IntervalRecord {
                    tag_id: pair.tag_id,
                    value_id: pair.value_id,
                    start_ts: ts,
                    measured_at: ts,
                    end_ts: None,
                    producer: producer.map(str::to_string),
                },
            });
        }
        Ok(())
    }

    async fn prolong_intersections(
        &mut self,
        taxonomy_id: i64,
        ts: DateTime<Utc>,
        pairs: &[TagState],
        tag_type: &str,
        tagged_id: i64,
        producer: Option<&str>,
    ) -> Result<()> {
        self.check_failure("prolong_intersections")?;
        self.check_tag_type(tag_type)?;
        for pair in pairs {
            for interval in self.working.open_mut(tag_type, tagged_id, taxonomy_id, *pair) {
                interval.record.measured_at = ts;
                interval.record.producer = producer.map(str::to_string);
            }
        }
        Ok(())
    }

    async fn end_intersections(
        &mut self,
        taxonomy_id: i64,
        ts: DateTime<Utc>,
        pairs: &[TagState],
        tag_type: &str,
        tagged_id: i64,
        producer: Option<&str>,
    ) -> Result<()> {
        self.check_failure("end_intersections")?;
        self.check_tag_type(tag_type)?;
        for pair in pairs {
            for interval in self.working.open_mut(tag_type, tagged_id, taxonomy_id, *pair) {
                interval.record.measured_at = ts;
                interval.record.end_ts = Some(ts);
                interval.record.producer = producer.map(str::to_string);
            }
        }
        Ok(())
    }

    async fn fetch_taxonomy_by_id(&mut self, taxonomy_id: i64) -> Result<Option<TaxonomyInfo>> {
        self.check_failure("fetch_taxonomy_by_id")?;
        Ok(self
            .working
            .taxonomies
            .iter()
            .find(|t| t.id == taxonomy_id)
            .map(TaxonomyInfo::from))
    }

    async fn fetch_taxonomy_by_name(&mut self, name: &str) -> Result<Option<TaxonomyInfo>> {
        self.check_failure("fetch_taxonomy_by_name")?;
        let matches: Vec<&Taxonomy> = self
            .working
            .taxonomies
            .iter()
            .filter(|t| t.name == name)
            .collect();
        match matches.as_slice() {
            [] => Ok(None),
            [one] => Ok(Some(TaxonomyInfo::from(*one))),
            _ => Err(Error::InconsistentTaxonomy(format!(
                "found {} taxonomies named '{}'",
                matches.len(),
                name
            ))),
        }
    }

    async fn fetch_tag_ids_by_name(
        &mut self,
        taxonomy_id: i64,
        names: &[String],
    ) -> Result<TagIdsByName> {
        self.check_failure("fetch_tag_ids_by_name")?;
        let mut result = TagIdsByName::new();
        for name in names {
            let ids: Vec<i64> = self
                .working
                .tags
                .iter()
                .filter(|t| t.taxonomy_id == taxonomy_id && &t.tag_name == name)
                .map(|t| t.tag_id)
                .collect();
            if ids.len() > 1 {
                return Err(Error::InconsistentTaxonomy(format!(
                    "found {} tags named '{}' in taxonomy {}",
                    ids.len(),
                    name,
                    taxonomy_id
                )));
            }
            result.insert(name.clone(), ids.first().copied());
        }
        Ok(result)
    }

    async fn check_tag_ids_exist(
        &mut self,
        taxonomy_id: i64,
        tag_ids: &[i64],
    ) -> Result<Vec<i64>> {
        self.check_failure("check_tag_ids_exist")?;
        Ok(tag_ids
            .iter()
            .copied()
            .filter(|id| {
                !self
                    .working
                    .tags
                    .iter()
                    .any(|t| t.taxonomy_id == taxonomy_id && t.tag_id == *id)
            })
            .collect())
    }

    async fn fetch_value_ids_by_value(
        &mut self,
        pairs: &[(i64, String)],
    ) -> Result<ValueIdsByValue> {
        self.check_failure("fetch_value_ids_by_value")?;
        let mut result = ValueIdsByValue::new();
        for (tag_id, value) in pairs {
            let ids: Vec<i64> = self
                .working
                .values
                .iter()
                .filter(|v| v.tag_id == *tag_id && &v.value == value)
                .map(|v| v.value_id)
                .collect();
            if ids.len() > 1 {
                return Err(Error::InconsistentTaxonomy(format!(
                    "found {} values '{}' for tag {}",
                    ids.len(),
                    value,
                    tag_id
                )));
            }
            result.insert((*tag_id, value.clone()), ids.first().copied());
        }
        Ok(result)
    }

    async fn check_value_ids_exist(&mut self, pairs: &[(i64, i64)]) -> Result<Vec<(i64, i64)>> {
        self.check_failure("check_value_ids_exist")?;
        Ok(pairs
            .iter()
            .copied()
            .filter(|(tag_id, value_id)| {
                !self
                    .working
                    .values
                    .iter()
                    .any(|v| v.tag_id == *tag_id && v.value_id == *value_id)
            })
            .collect())
    }

    async fn insert_tags(&mut self, tags: &[NewTag]) -> Result<BTreeMap<String, i64>> {
        self.check_failure("insert_tags")?;
        let mut ids = BTreeMap::new();
        for tag in tags {
            let tag_id = self.working.next_tag_id();
            self.working.tags.push(Tag {
                tag_id,
                tag_name: tag.tag_name.clone(),
                taxonomy_id: tag.taxonomy_id,
                tag_description: Some(tag.tag_description.clone()),
                extras: tag.extras.clone(),
            });
            ids.insert(tag.tag_name.clone(), tag_id);
        }
        Ok(ids)
    }

    async fn insert_values(
        &mut self,
        values: &[NewValue],
    ) -> Result<BTreeMap<(i64, String), i64>> {
        self.check_failure("insert_values")?;
        let mut ids = BTreeMap::new();
        for value in values {
            let value_id = self.working.next_value_id();
            self.working.values.push(Value {
                value_id,
                tag_id: value.tag_id,
                value: value.value.clone(),
            });
            ids.insert((value.tag_id, value.value.clone()), value_id);
        }
        Ok(ids)
    }

    async fn commit(&mut self) -> Result<()> {
        self.check_failure("commit")?;
        self.committed = self.working.clone();
        self.commits += 1;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        self.working = self.committed.clone();
        self.rollbacks += 1;
        Ok(())
    }
}
