//! PostgreSQL implementation of [`StorageAdapter`].
//!
//! One adapter is one unit of work: the first call opens a transaction on a
//! pooled connection, every later call runs inside it, and `commit` or
//! `rollback` ends it. The next call after that opens a fresh transaction,
//! so a single adapter can be reused for a stream of measurements.
//!
//! ```rust,ignore
//! let pool = create_pool(&url).await?;
//! let mut adapter = PgStorageAdapter::new(pool, &IntersectionTables::default())?;
//! let open = adapter.get_open_tags(taxonomy_id, "domain", domain_id).await?;
//! adapter.commit().await?;
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgPool, Postgres, Row, Transaction};
use tracing::{debug, trace, warn};

use tag2domain_core::{
    Error, IntervalRecord, NewTag, NewValue, OpenInterval, Result, StorageAdapter, Tag,
    TagIdsByName, TagState, TaggedInterval, Taxonomy, TaxonomyInfo, Value, ValueIdsByValue,
};

use crate::intersection_mapping::IntersectionTables;
use crate::statements::{IntersectionStatements, StatementRegistry};
use crate::taxonomy;

/// Open a transaction on first use.
///
/// Takes the fields rather than `&mut self` so callers can keep borrowing
/// the statement registry.
async fn current_tx<'a>(
    pool: &PgPool,
    tx: &'a mut Option<Transaction<'static, Postgres>>,
) -> Result<&'a mut PgConnection> {
    if tx.is_none() {
        let started = pool
            .begin()
            .await
            .map_err(|e| Error::Connection(e.to_string()))?;
        trace!(subsystem = "database", component = "adapter", "Transaction started");
        *tx = Some(started);
    }
    match tx.as_mut() {
        Some(tx) => Ok(&mut **tx),
        None => Err(Error::Internal("transaction missing after begin".to_string())),
    }
}

/// Split keys into tag IDs without a value and (tag, value) ID pairs.
fn split_pairs(pairs: &[TagState]) -> (Vec<i64>, Vec<i64>, Vec<i64>) {
    let mut no_value = Vec::new();
    let mut tag_ids = Vec::new();
    let mut value_ids = Vec::new();
    for pair in pairs {
        match pair.value_id {
            None => no_value.push(pair.tag_id),
            Some(value_id) => {
                tag_ids.push(pair.tag_id);
                value_ids.push(value_id);
            }
        }
    }
    (no_value, tag_ids, value_ids)
}

/// Transactional storage adapter backed by PostgreSQL.
pub struct PgStorageAdapter {
    pool: PgPool,
    tx: Option<Transaction<'static, Postgres>>,
    statements: Arc<StatementRegistry>,
}

impl PgStorageAdapter {
    /// Create an adapter, validating the intersection table mappings and
    /// compiling their statements.
    pub fn new(pool: PgPool, tables: &IntersectionTables) -> Result<Self> {
        let statements = StatementRegistry::build(tables)?;
        Ok(Self::with_statements(pool, Arc::new(statements)))
    }

    /// Create an adapter sharing an already compiled registry.
    pub fn with_statements(pool: PgPool, statements: Arc<StatementRegistry>) -> Self {
        Self {
            pool,
            tx: None,
            statements,
        }
    }

    /// The underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Whether a transaction is currently open.
    pub fn in_transaction(&self) -> bool {
        self.tx.is_some()
    }

    fn statements_for(&self, tag_type: &str) -> Result<Arc<IntersectionStatements>> {
        self.statements.get(tag_type)
    }

    // -------------------------------------------------------------------------
    // Reads outside the measurement transaction
    // -------------------------------------------------------------------------

    async fn acquire(&self) -> Result<sqlx::pool::PoolConnection<Postgres>> {
        self.pool
            .acquire()
            .await
            .map_err(|e| Error::Connection(e.to_string()))
    }

    /// All taxonomies, ordered by ID.
    pub async fn list_taxonomies(&self) -> Result<Vec<Taxonomy>> {
        let mut conn = self.acquire().await?;
        taxonomy::list_taxonomies(&mut conn).await
    }

    /// Tags of one taxonomy, ordered by ID.
    pub async fn list_taxonomy_tags(&self, taxonomy_id: i64) -> Result<Vec<Tag>> {
        let mut conn = self.acquire().await?;
        taxonomy::list_taxonomy_tags(&mut conn, taxonomy_id).await
    }

    /// Values of one tag, ordered by ID.
    pub async fn list_tag_values(&self, tag_id: i64) -> Result<Vec<Value>> {
        let mut conn = self.acquire().await?;
        taxonomy::list_tag_values(&mut conn, tag_id).await
    }

    /// Every interval of every entity in one taxonomy for a tag type.
    pub async fn get_taxonomy_intersections(
        &self,
        taxonomy_id: i64,
        tag_type: &str,
    ) -> Result<Vec<TaggedInterval>> {
        let stmts = self.statements_for(tag_type)?;
        let mut conn = self.acquire().await?;

        let rows = sqlx::query(&stmts.get_taxonomy_intersections)
            .bind(taxonomy_id)
            .fetch_all(&mut *conn)
            .await
            .map_err(Error::Database)?;

        rows.into_iter()
            .map(|row| -> std::result::Result<TaggedInterval, sqlx::Error> {
                Ok(TaggedInterval {
                    tagged_id: row.try_get("tagged_id")?,
                    interval: IntervalRecord {
                        tag_id: row.try_get("tag_id")?,
                        value_id: row.try_get("value_id")?,
                        start_ts: row.try_get("start_ts")?,
                        measured_at: row.try_get("measured_at")?,
                        end_ts: row.try_get("end_ts")?,
                        producer: row.try_get("producer")?,
                    },
                })
            })
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::Database)
    }

    // -------------------------------------------------------------------------
    // Batched interval updates
    // -------------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    async fn update_open_intervals(
        &mut self,
        op: &'static str,
        taxonomy_id: i64,
        ts: DateTime<Utc>,
        pairs: &[TagState],
        tag_type: &str,
        tagged_id: i64,
        producer: Option<&str>,
    ) -> Result<()> {
        if pairs.is_empty() {
            return Ok(());
        }
        let stmts = self.statements_for(tag_type)?;
        let conn = current_tx(&self.pool, &mut self.tx).await?;
        let start = Instant::now();
        let (no_value, tag_ids, value_ids) = split_pairs(pairs);
        let ending = op == "end_intersections";

        let mut updated = 0u64;
        if !no_value.is_empty() {
            let query = if ending {
                sqlx::query(&stmts.end_no_value)
                    .bind(ts)
                    .bind(ts.date_naive())
                    .bind(producer)
            } else {
                sqlx::query(&stmts.prolong_no_value).bind(ts).bind(producer)
            };
            updated += query
                .bind(tagged_id)
                .bind(taxonomy_id)
                .bind(&no_value)
                .execute(&mut *conn)
                .await
                .map_err(Error::Database)?
                .rows_affected();
        }
        if !tag_ids.is_empty() {
            let query = if ending {
                sqlx::query(&stmts.end_with_value)
                    .bind(ts)
                    .bind(ts.date_naive())
                    .bind(producer)
            } else {
                sqlx::query(&stmts.prolong_with_value)
                    .bind(ts)
                    .bind(producer)
            };
            updated += query
                .bind(tagged_id)
                .bind(taxonomy_id)
                .bind(&tag_ids)
                .bind(&value_ids)
                .execute(&mut *conn)
                .await
                .map_err(Error::Database)?
                .rows_affected();
        }

        if updated != pairs.len() as u64 {
            warn!(
                subsystem = "database",
                component = "adapter",
                op,
                tag_type,
                tagged_id,
                taxonomy_id,
                expected = pairs.len(),
                result_count = updated,
                "Open interval count differs from requested keys"
            );
        }
        debug!(
            subsystem = "database",
            component = "adapter",
            op,
            db_table = %stmts.table_name,
            tagged_id,
            taxonomy_id,
            result_count = updated,
            duration_ms = start.elapsed().as_millis() as u64,
            "Intervals updated"
        );
        Ok(())
    }
}

#[async_trait]
impl StorageAdapter for PgStorageAdapter {
    fn is_valid_tag_type(&self, tag_type: &str) -> bool {
        self.statements.contains(tag_type)
    }

    async fn get_open_tags(
        &mut self,
        taxonomy_id: i64,
        tag_type: &str,
        tagged_id: i64,
    ) -> Result<Vec<OpenInterval>> {
        let stmts = self.statements_for(tag_type)?;
        let conn = current_tx(&self.pool, &mut self.tx).await?;

        let rows = sqlx::query(&stmts.get_open_tags)
            .bind(tagged_id)
            .bind(taxonomy_id)
            .fetch_all(&mut *conn)
            .await
            .map_err(Error::Database)?;

        let open = rows
            .into_iter()
            .map(|row| -> std::result::Result<OpenInterval, sqlx::Error> {
                Ok(OpenInterval {
                    tag_id: row.try_get("tag_id")?,
                    value_id: row.try_get("value_id")?,
                    measured_at: row.try_get("measured_at")?,
                    producer: row.try_get("producer")?,
                })
            })
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::Database)?;

        trace!(
            subsystem = "database",
            component = "adapter",
            op = "get_open_tags",
            tag_type,
            tagged_id,
            taxonomy_id,
            result_count = open.len(),
            "Fetched open intervals"
        );
        Ok(open)
    }

    async fn get_all_tags(
        &mut self,
        taxonomy_id: i64,
        tag_type: &str,
        tagged_id: i64,
    ) -> Result<Vec<IntervalRecord>> {
        let stmts = self.statements_for(tag_type)?;
        let conn = current_tx(&self.pool, &mut self.tx).await?;

        let rows = sqlx::query(&stmts.get_all_tags)
            .bind(tagged_id)
            .bind(taxonomy_id)
            .fetch_all(&mut *conn)
            .await
            .map_err(Error::Database)?;

        rows.into_iter()
            .map(|row| -> std::result::Result<IntervalRecord, sqlx::Error> {
                Ok(IntervalRecord {
                    tag_id: row.try_get("tag_id")?,
                    value_id: row.try_get("value_id")?,
                    start_ts: row.try_get("start_ts")?,
                    measured_at: row.try_get("measured_at")?,
                    end_ts: row.try_get("end_ts")?,
                    producer: row.try_get("producer")?,
                })
            })
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::Database)
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
        if pairs.is_empty() {
            return Ok(());
        }
        let stmts = self.statements_for(tag_type)?;
        let conn = current_tx(&self.pool, &mut self.tx).await?;
        let start = Instant::now();

        let tag_ids: Vec<i64> = pairs.iter().map(|p| p.tag_id).collect();
        let value_ids: Vec<Option<i64>> = pairs.iter().map(|p| p.value_id).collect();

        let inserted = sqlx::query(&stmts.insert_intersections)
            .bind(tagged_id)
            .bind(taxonomy_id)
            .bind(ts.date_naive())
            .bind(ts)
            .bind(producer)
            .bind(&tag_ids)
            .bind(&value_ids)
            .execute(&mut *conn)
            .await
            .map_err(Error::Database)?
            .rows_affected();

        debug!(
            subsystem = "database",
            component = "adapter",
            op = "insert_intersections",
            db_table = %stmts.table_name,
            tagged_id,
            taxonomy_id,
            result_count = inserted,
            duration_ms = start.elapsed().as_millis() as u64,
            "Intervals inserted"
        );
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
        self.update_open_intervals(
            "prolong_intersections",
            taxonomy_id,
            ts,
            pairs,
            tag_type,
            tagged_id,
            producer,
        )
        .await
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
        self.update_open_intervals(
            "end_intersections",
            taxonomy_id,
            ts,
            pairs,
            tag_type,
            tagged_id,
            producer,
        )
        .await
    }

    async fn fetch_taxonomy_by_id(&mut self, taxonomy_id: i64) -> Result<Option<TaxonomyInfo>> {
        let conn = current_tx(&self.pool, &mut self.tx).await?;
        taxonomy::fetch_taxonomy_by_id(conn, taxonomy_id).await
    }

    async fn fetch_taxonomy_by_name(&mut self, name: &str) -> Result<Option<TaxonomyInfo>> {
        let conn = current_tx(&self.pool, &mut self.tx).await?;
        taxonomy::fetch_taxonomy_by_name(conn, name).await
    }

    async fn fetch_tag_ids_by_name(
        &mut self,
        taxonomy_id: i64,
        names: &[String],
    ) -> Result<TagIdsByName> {
        let conn = current_tx(&self.pool, &mut self.tx).await?;
        taxonomy::fetch_tag_ids_by_name(conn, taxonomy_id, names).await
    }

    async fn check_tag_ids_exist(
        &mut self,
        taxonomy_id: i64,
        tag_ids: &[i64],
    ) -> Result<Vec<i64>> {
        let conn = current_tx(&self.pool, &mut self.tx).await?;
        taxonomy::check_tag_ids_exist(conn, taxonomy_id, tag_ids).await
    }

    async fn fetch_value_ids_by_value(
        &mut self,
        pairs: &[(i64, String)],
    ) -> Result<ValueIdsByValue> {
        let conn = current_tx(&self.pool, &mut self.tx).await?;
        taxonomy::fetch_value_ids_by_value(conn, pairs).await
    }

    async fn check_value_ids_exist(&mut self, pairs: &[(i64, i64)]) -> Result<Vec<(i64, i64)>> {
        let conn = current_tx(&self.pool, &mut self.tx).await?;
        taxonomy::check_value_ids_exist(conn, pairs).await
    }

    async fn insert_tags(&mut self, tags: &[NewTag]) -> Result<BTreeMap<String, i64>> {
        let conn = current_tx(&self.pool, &mut self.tx).await?;
        taxonomy::insert_tags(conn, tags).await
    }

    async fn insert_values(
        &mut self,
        values: &[NewValue],
    ) -> Result<BTreeMap<(i64, String), i64>> {
        let conn = current_tx(&self.pool, &mut self.tx).await?;
        taxonomy::insert_values(conn, values).await
    }

    async fn commit(&mut self) -> Result<()> {
        match self.tx.take() {
            Some(tx) => {
                tx.commit().await.map_err(Error::Database)?;
                trace!(subsystem = "database", component = "adapter", "Transaction committed");
            }
            None => {
                trace!(subsystem = "database", component = "adapter", "Commit without open transaction");
            }
        }
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        if let Some(tx) = self.tx.take() {
            tx.rollback().await.map_err(Error::Database)?;
            trace!(subsystem = "database", component = "adapter", "Transaction rolled back");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_pairs() {
        let pairs = [
            TagState::new(1, None),
            TagState::new(2, Some(20)),
            TagState::new(3, None),
            TagState::new(2, Some(21)),
        ];
        let (no_value, tag_ids, value_ids) = split_pairs(&pairs);
        assert_eq!(no_value, vec![1, 3]);
        assert_eq!(tag_ids, vec![2, 2]);
        assert_eq!(value_ids, vec![20, 21]);
    }

    #[test]
    fn test_split_pairs_empty() {
        let (no_value, tag_ids, value_ids) = split_pairs(&[]);
        assert!(no_value.is_empty() && tag_ids.is_empty() && value_ids.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_tag_type_is_rejected_before_connecting() {
        // Lazy pool: no connection is attempted unless a query runs.
        let pool = sqlx::postgres::PgPoolOptions::new()
            .connect_lazy("postgres://nobody@localhost:1/none")
            .unwrap();
        let mut adapter = PgStorageAdapter::new(pool, &IntersectionTables::default()).unwrap();

        assert!(adapter.is_valid_tag_type("domain"));
        assert!(!adapter.is_valid_tag_type("prefix"));
        let err = adapter.get_open_tags(1, "prefix", 1).await.unwrap_err();
        assert!(matches!(err, Error::InvalidMeasurement(_)));
        assert!(!adapter.in_transaction());
    }

    #[tokio::test]
    async fn test_empty_batches_do_not_open_transaction() {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .connect_lazy("postgres://nobody@localhost:1/none")
            .unwrap();
        let mut adapter = PgStorageAdapter::new(pool, &IntersectionTables::default()).unwrap();
        let ts = Utc::now();

        adapter
            .insert_intersections(1, ts, &[], "domain", 1, None)
            .await
            .unwrap();
        adapter
            .end_intersections(1, ts, &[], "domain", 1, None)
            .await
            .unwrap();
        adapter.commit().await.unwrap();
        assert!(!adapter.in_transaction());
    }
}
