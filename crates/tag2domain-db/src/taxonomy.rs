//! Reference-data queries: taxonomies, tags, and tag values.
//!
//! Functions take a connection so the adapter can run them inside its
//! measurement transaction and the list helpers can run them on a pooled
//! connection.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::{Map, Value as JsonValue};
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, Row};
use tracing::{debug, trace};

use tag2domain_core::{
    Error, NewTag, NewValue, Result, Tag, TagIdsByName, Taxonomy, TaxonomyInfo, Value,
    ValueIdsByValue,
};

fn taxonomy_info_from_rows(rows: Vec<PgRow>, what: &str) -> Result<Option<TaxonomyInfo>> {
    if rows.len() > 1 {
        return Err(Error::InconsistentTaxonomy(format!(
            "encountered {} taxonomies with {}",
            rows.len(),
            what
        )));
    }
    rows.into_iter()
        .next()
        .map(|row| -> std::result::Result<TaxonomyInfo, sqlx::Error> {
            Ok(TaxonomyInfo {
                id: row.try_get("id")?,
                allows_auto_tags: row.try_get("allows_auto_tags")?,
                allows_auto_values: row.try_get("allows_auto_values")?,
            })
        })
        .transpose()
        .map_err(Error::Database)
}

pub async fn fetch_taxonomy_by_id(
    conn: &mut PgConnection,
    taxonomy_id: i64,
) -> Result<Option<TaxonomyInfo>> {
    debug!(subsystem = "database", component = "taxonomy", taxonomy_id, "Fetching taxonomy by id");
    let rows = sqlx::query(
        "SELECT id, allows_auto_tags, allows_auto_values FROM taxonomy WHERE id = $1",
    )
    .bind(taxonomy_id)
    .fetch_all(&mut *conn)
    .await
    .map_err(Error::Database)?;

    taxonomy_info_from_rows(rows, &format!("id {}", taxonomy_id))
}

pub async fn fetch_taxonomy_by_name(
    conn: &mut PgConnection,
    name: &str,
) -> Result<Option<TaxonomyInfo>> {
    debug!(subsystem = "database", component = "taxonomy", taxonomy = name, "Fetching taxonomy by name");
    let rows = sqlx::query(
        "SELECT id, allows_auto_tags, allows_auto_values FROM taxonomy WHERE name = $1",
    )
    .bind(name)
    .fetch_all(&mut *conn)
    .await
    .map_err(Error::Database)?;

    taxonomy_info_from_rows(rows, &format!("name '{}'", name))
}

pub async fn fetch_tag_ids_by_name(
    conn: &mut PgConnection,
    taxonomy_id: i64,
    names: &[String],
) -> Result<TagIdsByName> {
    if names.is_empty() {
        return Ok(TagIdsByName::new());
    }

    let rows = sqlx::query(
        "SELECT tag_name, tag_id FROM tags WHERE taxonomy_id = $1 AND tag_name = ANY($2::text[])",
    )
    .bind(taxonomy_id)
    .bind(names)
    .fetch_all(&mut *conn)
    .await
    .map_err(Error::Database)?;

    let mut found: BTreeMap<String, Vec<i64>> = BTreeMap::new();
    for row in rows {
        let name: String = row.try_get("tag_name").map_err(Error::Database)?;
        let id: i64 = row.try_get("tag_id").map_err(Error::Database)?;
        found.entry(name).or_default().push(id);
    }

    let mut result = TagIdsByName::new();
    for name in names {
        match found.get(name).map(Vec::as_slice) {
            None | Some([]) => {
                trace!(subsystem = "database", component = "taxonomy", tag = %name, "Tag not found");
                result.insert(name.clone(), None);
            }
            Some([id]) => {
                result.insert(name.clone(), Some(*id));
            }
            Some(ids) => {
                return Err(Error::InconsistentTaxonomy(format!(
                    "found {} tags named '{}' in taxonomy {}",
                    ids.len(),
                    name,
                    taxonomy_id
                )))
            }
        }
    }
    Ok(result)
}

pub async fn check_tag_ids_exist(
    conn: &mut PgConnection,
    taxonomy_id: i64,
    tag_ids: &[i64],
) -> Result<Vec<i64>> {
    if tag_ids.is_empty() {
        return Ok(Vec::new());
    }

    let rows = sqlx::query(
        "SELECT tag_id FROM tags WHERE taxonomy_id = $1 AND tag_id = ANY($2::bigint[])",
    )
    .bind(taxonomy_id)
    .bind(tag_ids)
    .fetch_all(&mut *conn)
    .await
    .map_err(Error::Database)?;

    let existing = rows
        .iter()
        .map(|row| row.try_get::<i64, _>("tag_id"))
        .collect::<std::result::Result<BTreeSet<i64>, _>>()
        .map_err(Error::Database)?;

    Ok(tag_ids
        .iter()
        .copied()
        .filter(|id| !existing.contains(id))
        .collect())
}

pub async fn fetch_value_ids_by_value(
    conn: &mut PgConnection,
    pairs: &[(i64, String)],
) -> Result<ValueIdsByValue> {
    if pairs.is_empty() {
        return Ok(ValueIdsByValue::new());
    }

    let tag_ids: Vec<i64> = pairs.iter().map(|(t, _)| *t).collect();
    let values: Vec<String> = pairs.iter().map(|(_, v)| v.clone()).collect();

    let rows = sqlx::query(
        r#"
        SELECT v.tag_id, v.value, v.id
        FROM taxonomy_tag_val v
        JOIN UNNEST($1::bigint[], $2::text[]) AS p(tag_id, value)
          ON v.tag_id = p.tag_id AND v.value = p.value
        "#,
    )
    .bind(&tag_ids)
    .bind(&values)
    .fetch_all(&mut *conn)
    .await
    .map_err(Error::Database)?;

    let mut found: BTreeMap<(i64, String), BTreeSet<i64>> = BTreeMap::new();
    for row in rows {
        let tag_id: i64 = row.try_get("tag_id").map_err(Error::Database)?;
        let value: String = row.try_get("value").map_err(Error::Database)?;
        let id: i64 = row.try_get("id").map_err(Error::Database)?;
        found.entry((tag_id, value)).or_default().insert(id);
    }

    let mut result = ValueIdsByValue::new();
    for key in pairs {
        let ids = found.get(key);
        if let Some(ids) = ids.filter(|ids| ids.len() > 1) {
            return Err(Error::InconsistentTaxonomy(format!(
                "found {} values '{}' for tag {}",
                ids.len(),
                key.1,
                key.0
            )));
        }
        result.insert(key.clone(), ids.and_then(|ids| ids.iter().next().copied()));
    }
    Ok(result)
}

pub async fn check_value_ids_exist(
    conn: &mut PgConnection,
    pairs: &[(i64, i64)],
) -> Result<Vec<(i64, i64)>> {
    if pairs.is_empty() {
        return Ok(Vec::new());
    }

    let tag_ids: Vec<i64> = pairs.iter().map(|(t, _)| *t).collect();
    let value_ids: Vec<i64> = pairs.iter().map(|(_, v)| *v).collect();

    let rows = sqlx::query(
        r#"
        SELECT v.tag_id, v.id
        FROM taxonomy_tag_val v
        JOIN UNNEST($1::bigint[], $2::bigint[]) AS p(tag_id, id)
          ON v.tag_id = p.tag_id AND v.id = p.id
        "#,
    )
    .bind(&tag_ids)
    .bind(&value_ids)
    .fetch_all(&mut *conn)
    .await
    .map_err(Error::Database)?;

    let mut existing = BTreeSet::new();
    for row in rows {
        let tag_id: i64 = row.try_get("tag_id").map_err(Error::Database)?;
        let id: i64 = row.try_get("id").map_err(Error::Database)?;
        existing.insert((tag_id, id));
    }

    Ok(pairs
        .iter()
        .copied()
        .filter(|pair| !existing.contains(pair))
        .collect())
}

pub async fn insert_tags(
    conn: &mut PgConnection,
    tags: &[NewTag],
) -> Result<BTreeMap<String, i64>> {
    let mut ids = BTreeMap::new();
    for tag in tags {
        let tag_id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO tags (tag_name, tag_description, taxonomy_id, extras)
            VALUES ($1, $2, $3, $4)
            RETURNING tag_id
            "#,
        )
        .bind(&tag.tag_name)
        .bind(&tag.tag_description)
        .bind(tag.taxonomy_id)
        .bind(JsonValue::Object(tag.extras.clone()))
        .fetch_one(&mut *conn)
        .await
        .map_err(Error::Database)?;

        debug!(
            subsystem = "database",
            component = "taxonomy",
            op = "insert_tag",
            tag = %tag.tag_name,
            tag_id,
            taxonomy_id = tag.taxonomy_id,
            "Created tag"
        );
        ids.insert(tag.tag_name.clone(), tag_id);
    }
    Ok(ids)
}

pub async fn insert_values(
    conn: &mut PgConnection,
    values: &[NewValue],
) -> Result<BTreeMap<(i64, String), i64>> {
    let mut ids = BTreeMap::new();
    for value in values {
        let value_id: i64 = sqlx::query_scalar(
            "INSERT INTO taxonomy_tag_val (value, tag_id) VALUES ($1, $2) RETURNING id",
        )
        .bind(&value.value)
        .bind(value.tag_id)
        .fetch_one(&mut *conn)
        .await
        .map_err(Error::Database)?;

        debug!(
            subsystem = "database",
            component = "taxonomy",
            op = "insert_value",
            tag_id = value.tag_id,
            value_id,
            "Created value '{}'",
            value.value
        );
        ids.insert((value.tag_id, value.value.clone()), value_id);
    }
    Ok(ids)
}

// =============================================================================
// LISTINGS
// =============================================================================

pub async fn list_taxonomies(conn: &mut PgConnection) -> Result<Vec<Taxonomy>> {
    let rows = sqlx::query(
        r#"
        SELECT id, name, description, allows_auto_tags, allows_auto_values
        FROM taxonomy
        ORDER BY id
        "#,
    )
    .fetch_all(&mut *conn)
    .await
    .map_err(Error::Database)?;

    rows.into_iter()
        .map(|row| -> std::result::Result<Taxonomy, sqlx::Error> {
            Ok(Taxonomy {
                id: row.try_get("id")?,
                name: row.try_get("name")?,
                description: row.try_get("description")?,
                allows_auto_tags: row.try_get("allows_auto_tags")?,
                allows_auto_values: row.try_get("allows_auto_values")?,
            })
        })
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(Error::Database)
}

pub async fn list_taxonomy_tags(conn: &mut PgConnection, taxonomy_id: i64) -> Result<Vec<Tag>> {
    let rows = sqlx::query(
        r#"
        SELECT tag_id, tag_name, taxonomy_id, tag_description, extras
        FROM tags
        WHERE taxonomy_id = $1
        ORDER BY tag_id
        "#,
    )
    .bind(taxonomy_id)
    .fetch_all(&mut *conn)
    .await
    .map_err(Error::Database)?;

    rows.into_iter()
        .map(|row| -> std::result::Result<Tag, sqlx::Error> {
            let extras: Option<JsonValue> = row.try_get("extras")?;
            Ok(Tag {
                tag_id: row.try_get("tag_id")?,
                tag_name: row.try_get("tag_name")?,
                taxonomy_id: row.try_get("taxonomy_id")?,
                tag_description: row.try_get("tag_description")?,
                extras: match extras {
                    Some(JsonValue::Object(map)) => map,
                    _ => Map::new(),
                },
            })
        })
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(Error::Database)
}

pub async fn list_tag_values(conn: &mut PgConnection, tag_id: i64) -> Result<Vec<Value>> {
    let rows = sqlx::query(
        "SELECT id, tag_id, value FROM taxonomy_tag_val WHERE tag_id = $1 ORDER BY id",
    )
    .bind(tag_id)
    .fetch_all(&mut *conn)
    .await
    .map_err(Error::Database)?;

    rows.into_iter()
        .map(|row| -> std::result::Result<Value, sqlx::Error> {
            Ok(Value {
                value_id: row.try_get("id")?,
                tag_id: row.try_get("tag_id")?,
                value: row.try_get("value")?,
            })
        })
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(Error::Database)
}
