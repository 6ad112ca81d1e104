//! Storage seam for measurement handling.
//!
//! A [`StorageAdapter`] is one connection with one open transaction. The
//! handler issues every read and write for a measurement through the same
//! adapter and finishes with exactly one [`commit`](StorageAdapter::commit)
//! or [`rollback`](StorageAdapter::rollback).

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::models::*;

/// Batch lookup result for tag names: `None` for names with no row.
pub type TagIdsByName = BTreeMap<String, Option<i64>>;

/// Batch lookup result for values keyed by `(tag_id, value)`.
pub type ValueIdsByValue = BTreeMap<(i64, String), Option<i64>>;

/// Transactional access to reference data and intersection tables.
///
/// Methods take `&mut self` because they all run on the adapter's single
/// transaction. Implementations must surface duplicate reference rows (two
/// taxonomies or tags with one name) as `Error::InconsistentTaxonomy`.
#[async_trait]
pub trait StorageAdapter: Send {
    /// Whether `tag_type` has an intersection table mapping.
    fn is_valid_tag_type(&self, tag_type: &str) -> bool;

    // -------------------------------------------------------------------------
    // Intersections
    // -------------------------------------------------------------------------

    /// Open intervals (end_ts is null) of one entity in one taxonomy.
    async fn get_open_tags(
        &mut self,
        taxonomy_id: i64,
        tag_type: &str,
        tagged_id: i64,
    ) -> Result<Vec<OpenInterval>>;

    /// Every interval of one entity in one taxonomy, open or closed.
    async fn get_all_tags(
        &mut self,
        taxonomy_id: i64,
        tag_type: &str,
        tagged_id: i64,
    ) -> Result<Vec<IntervalRecord>>;

    /// Open a new interval per pair, starting and measured at `ts`.
    async fn insert_intersections(
        &mut self,
        taxonomy_id: i64,
        ts: DateTime<Utc>,
        pairs: &[TagState],
        tag_type: &str,
        tagged_id: i64,
        producer: Option<&str>,
    ) -> Result<()>;

    /// Set `measured_at` and `producer` on the matching open intervals.
    async fn prolong_intersections(
        &mut self,
        taxonomy_id: i64,
        ts: DateTime<Utc>,
        pairs: &[TagState],
        tag_type: &str,
        tagged_id: i64,
        producer: Option<&str>,
    ) -> Result<()>;

    /// Close the matching open intervals at `ts`.
    async fn end_intersections(
        &mut self,
        taxonomy_id: i64,
        ts: DateTime<Utc>,
        pairs: &[TagState],
        tag_type: &str,
        tagged_id: i64,
        producer: Option<&str>,
    ) -> Result<()>;

    // -------------------------------------------------------------------------
    // Reference data
    // -------------------------------------------------------------------------

    async fn fetch_taxonomy_by_id(&mut self, taxonomy_id: i64) -> Result<Option<TaxonomyInfo>>;

    async fn fetch_taxonomy_by_name(&mut self, name: &str) -> Result<Option<TaxonomyInfo>>;

    /// Look up tag IDs by name within a taxonomy. Every requested name is a
    /// key in the result.
    async fn fetch_tag_ids_by_name(
        &mut self,
        taxonomy_id: i64,
        names: &[String],
    ) -> Result<TagIdsByName>;

    /// Return the subset of `tag_ids` not present in the taxonomy.
    async fn check_tag_ids_exist(&mut self, taxonomy_id: i64, tag_ids: &[i64])
        -> Result<Vec<i64>>;

    /// Look up value IDs by `(tag_id, value)`. Every requested pair is a key
    /// in the result.
    async fn fetch_value_ids_by_value(
        &mut self,
        pairs: &[(i64, String)],
    ) -> Result<ValueIdsByValue>;

    /// Return the subset of `(tag_id, value_id)` pairs with no such value row.
    async fn check_value_ids_exist(&mut self, pairs: &[(i64, i64)]) -> Result<Vec<(i64, i64)>>;

    /// Create tags, returning their IDs by name.
    async fn insert_tags(&mut self, tags: &[NewTag]) -> Result<BTreeMap<String, i64>>;

    /// Create values, returning their IDs by `(tag_id, value)`.
    async fn insert_values(&mut self, values: &[NewValue]) -> Result<BTreeMap<(i64, String), i64>>;

    // -------------------------------------------------------------------------
    // Transaction
    // -------------------------------------------------------------------------

    async fn commit(&mut self) -> Result<()>;

    async fn rollback(&mut self) -> Result<()>;
}
