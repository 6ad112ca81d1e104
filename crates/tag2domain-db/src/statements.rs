//! SQL statements compiled once per tag type.
//!
//! Table and column names are validated before they are spliced into the
//! statement text; all values are bound as parameters. Batches are passed as
//! arrays and expanded with `UNNEST`, so each operation is a single round
//! trip regardless of how many intervals it touches.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::debug;

use tag2domain_core::{Error, Result};

use crate::intersection_mapping::{ColumnMapping, IntersectionTables};

/// Statements for one intersection table.
///
/// Parameter order is documented per statement; the adapter binds in that
/// order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntersectionStatements {
    pub table_name: String,
    /// `$1` entity, `$2` taxonomy.
    pub get_open_tags: String,
    /// `$1` entity, `$2` taxonomy.
    pub get_all_tags: String,
    /// `$1` taxonomy.
    pub get_taxonomy_intersections: String,
    /// `$1` entity, `$2` taxonomy, `$3` start date, `$4` ts, `$5` producer,
    /// `$6` tag ids, `$7` value ids (nullable elements).
    pub insert_intersections: String,
    /// `$1` ts, `$2` producer, `$3` entity, `$4` taxonomy, `$5` tag ids.
    pub prolong_no_value: String,
    /// `$1` ts, `$2` producer, `$3` entity, `$4` taxonomy, `$5` tag ids,
    /// `$6` value ids.
    pub prolong_with_value: String,
    /// `$1` ts, `$2` end date, `$3` producer, `$4` entity, `$5` taxonomy,
    /// `$6` tag ids.
    pub end_no_value: String,
    /// `$1` ts, `$2` end date, `$3` producer, `$4` entity, `$5` taxonomy,
    /// `$6` tag ids, `$7` value ids.
    pub end_with_value: String,
}

impl IntersectionStatements {
    /// Build statements for a mapping. The mapping must already be validated.
    pub fn compile(m: &ColumnMapping) -> Self {
        let t = &m.table_name;

        let open_filter = format!(
            "{end_date} IS NULL AND {end_ts} IS NULL",
            end_date = m.end_date,
            end_ts = m.end_ts
        );
        let open_filter_t = format!(
            "t.{end_date} IS NULL AND t.{end_ts} IS NULL",
            end_date = m.end_date,
            end_ts = m.end_ts
        );

        let get_open_tags = format!(
            "SELECT {tag_id}::bigint AS tag_id, {value_id}::bigint AS value_id, \
             {measured_at} AS measured_at, {producer} AS producer \
             FROM {t} \
             WHERE {id} = $1 AND {taxonomy_id} = $2 AND {open_filter} \
             ORDER BY 1, 2 NULLS FIRST",
            tag_id = m.tag_id,
            value_id = m.value_id,
            measured_at = m.measured_at,
            producer = m.producer,
            id = m.id,
            taxonomy_id = m.taxonomy_id,
        );

        let get_all_tags = format!(
            "SELECT {tag_id}::bigint AS tag_id, {value_id}::bigint AS value_id, \
             {start_ts} AS start_ts, {measured_at} AS measured_at, \
             {end_ts} AS end_ts, {producer} AS producer \
             FROM {t} \
             WHERE {id} = $1 AND {taxonomy_id} = $2 \
             ORDER BY 1, 2 NULLS FIRST, 3",
            tag_id = m.tag_id,
            value_id = m.value_id,
            start_ts = m.start_ts,
            measured_at = m.measured_at,
            end_ts = m.end_ts,
            producer = m.producer,
            id = m.id,
            taxonomy_id = m.taxonomy_id,
        );

        let get_taxonomy_intersections = format!(
            "SELECT {id}::bigint AS tagged_id, {tag_id}::bigint AS tag_id, \
             {value_id}::bigint AS value_id, {start_ts} AS start_ts, \
             {measured_at} AS measured_at, {end_ts} AS end_ts, {producer} AS producer \
             FROM {t} \
             WHERE {taxonomy_id} = $1 \
             ORDER BY 1, 2, 3 NULLS FIRST, 4",
            id = m.id,
            tag_id = m.tag_id,
            value_id = m.value_id,
            start_ts = m.start_ts,
            measured_at = m.measured_at,
            end_ts = m.end_ts,
            producer = m.producer,
            taxonomy_id = m.taxonomy_id,
        );

        // End columns are left to their NULL default.
        let insert_intersections = format!(
            "INSERT INTO {t} \
             ({id}, {taxonomy_id}, {tag_id}, {value_id}, {start_date}, \
             {start_ts}, {measured_at}, {producer}) \
             SELECT $1::bigint, $2::bigint, p.tag_id, p.value_id, $3::date, \
             $4::timestamptz, $4::timestamptz, $5::text \
             FROM UNNEST($6::bigint[], $7::bigint[]) AS p(tag_id, value_id)",
            id = m.id,
            taxonomy_id = m.taxonomy_id,
            tag_id = m.tag_id,
            value_id = m.value_id,
            start_date = m.start_date,
            start_ts = m.start_ts,
            measured_at = m.measured_at,
            producer = m.producer,
        );

        // NULL never compares equal, so null-valued keys need IS NULL.
        let prolong_no_value = format!(
            "UPDATE {t} SET {measured_at} = $1, {producer} = $2 \
             WHERE {id} = $3 AND {taxonomy_id} = $4 AND {tag_id} = ANY($5::bigint[]) \
             AND {value_id} IS NULL AND {open_filter}",
            measured_at = m.measured_at,
            producer = m.producer,
            id = m.id,
            taxonomy_id = m.taxonomy_id,
            tag_id = m.tag_id,
            value_id = m.value_id,
        );

        let prolong_with_value = format!(
            "UPDATE {t} AS t SET {measured_at} = $1, {producer} = $2 \
             FROM UNNEST($5::bigint[], $6::bigint[]) AS p(tag_id, value_id) \
             WHERE t.{id} = $3 AND t.{taxonomy_id} = $4 \
             AND t.{tag_id} = p.tag_id AND t.{value_id} = p.value_id AND {open_filter_t}",
            measured_at = m.measured_at,
            producer = m.producer,
            id = m.id,
            taxonomy_id = m.taxonomy_id,
            tag_id = m.tag_id,
            value_id = m.value_id,
        );

        let end_no_value = format!(
            "UPDATE {t} SET {measured_at} = $1, {end_date} = $2, {end_ts} = $1, {producer} = $3 \
             WHERE {id} = $4 AND {taxonomy_id} = $5 AND {tag_id} = ANY($6::bigint[]) \
             AND {value_id} IS NULL AND {open_filter}",
            measured_at = m.measured_at,
            end_date = m.end_date,
            end_ts = m.end_ts,
            producer = m.producer,
            id = m.id,
            taxonomy_id = m.taxonomy_id,
            tag_id = m.tag_id,
            value_id = m.value_id,
        );

        let end_with_value = format!(
            "UPDATE {t} AS t SET {measured_at} = $1, {end_date} = $2, {end_ts} = $1, {producer} = $3 \
             FROM UNNEST($6::bigint[], $7::bigint[]) AS p(tag_id, value_id) \
             WHERE t.{id} = $4 AND t.{taxonomy_id} = $5 \
             AND t.{tag_id} = p.tag_id AND t.{value_id} = p.value_id AND {open_filter_t}",
            measured_at = m.measured_at,
            end_date = m.end_date,
            end_ts = m.end_ts,
            producer = m.producer,
            id = m.id,
            taxonomy_id = m.taxonomy_id,
            tag_id = m.tag_id,
            value_id = m.value_id,
        );

        Self {
            table_name: t.clone(),
            get_open_tags,
            get_all_tags,
            get_taxonomy_intersections,
            insert_intersections,
            prolong_no_value,
            prolong_with_value,
            end_no_value,
            end_with_value,
        }
    }
}

/// Compiled statements for every configured tag type.
#[derive(Debug, Clone, Default)]
pub struct StatementRegistry {
    by_tag_type: BTreeMap<String, Arc<IntersectionStatements>>,
}

impl StatementRegistry {
    /// Validate the mappings and compile their statements.
    pub fn build(tables: &IntersectionTables) -> Result<Self> {
        tables.validate()?;

        let by_tag_type = tables
            .iter()
            .map(|(tag_type, mapping)| {
                debug!(
                    subsystem = "database",
                    component = "statements",
                    tag_type,
                    db_table = %mapping.table_name,
                    "Compiled intersection statements"
                );
                (
                    tag_type.to_string(),
                    Arc::new(IntersectionStatements::compile(mapping)),
                )
            })
            .collect();

        Ok(Self { by_tag_type })
    }

    pub fn contains(&self, tag_type: &str) -> bool {
        self.by_tag_type.contains_key(tag_type)
    }

    pub fn tag_types(&self) -> impl Iterator<Item = &str> {
        self.by_tag_type.keys().map(String::as_str)
    }

    /// Statements for `tag_type`, or `InvalidMeasurement` for an unknown type.
    pub fn get(&self, tag_type: &str) -> Result<Arc<IntersectionStatements>> {
        self.by_tag_type.get(tag_type).cloned().ok_or_else(|| {
            Error::InvalidMeasurement(format!("unknown tag_type '{}'", tag_type))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compile_uses_mapped_names() {
        let mut mapping = ColumnMapping::standard("t2d.domain_tags", "domain_id");
        mapping.producer = "source".to_string();
        let stmts = IntersectionStatements::compile(&mapping);

        assert!(stmts.get_open_tags.contains("FROM t2d.domain_tags"));
        assert!(stmts.get_open_tags.contains("domain_id = $1"));
        assert!(stmts.get_open_tags.contains("source AS producer"));
        assert!(stmts.prolong_no_value.contains("source = $2"));
        assert!(!stmts.prolong_no_value.contains(" producer "));
    }

    #[test]
    fn test_null_and_value_statements_differ() {
        let stmts =
            IntersectionStatements::compile(&ColumnMapping::standard("domain_tags", "domain_id"));
        assert!(stmts.prolong_no_value.contains("value_id IS NULL"));
        assert!(stmts.prolong_with_value.contains("t.value_id = p.value_id"));
        assert!(stmts.end_no_value.contains("value_id IS NULL"));
        assert!(stmts.end_with_value.contains("t.value_id = p.value_id"));
        assert!(stmts.end_with_value.contains("end_ts = $1"));
    }

    #[test]
    fn test_only_open_rows_are_updated() {
        let stmts =
            IntersectionStatements::compile(&ColumnMapping::standard("domain_tags", "domain_id"));
        for sql in [
            &stmts.get_open_tags,
            &stmts.prolong_no_value,
            &stmts.prolong_with_value,
            &stmts.end_no_value,
            &stmts.end_with_value,
        ] {
            assert!(sql.contains("end_ts IS NULL"), "{}", sql);
            assert!(sql.contains("end_date IS NULL"), "{}", sql);
        }
    }

    #[test]
    fn test_registry_rejects_invalid_mapping() {
        let tables = IntersectionTables::new()
            .with("domain", ColumnMapping::standard("domain tags", "domain_id"));
        assert!(matches!(
            StatementRegistry::build(&tables),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_registry_unknown_tag_type() {
        let registry = StatementRegistry::build(&IntersectionTables::default()).unwrap();
        assert!(registry.contains("domain"));
        assert!(!registry.contains("prefix"));
        assert!(matches!(
            registry.get("prefix"),
            Err(Error::InvalidMeasurement(_))
        ));
    }
}
