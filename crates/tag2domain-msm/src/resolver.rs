//! Reference resolution.
//!
//! Turns the taxonomy, tag and value references of a measurement (IDs or
//! names) into canonical IDs. Unknown names are created when both the
//! measurement asks for it and the taxonomy allows it; unknown IDs are
//! always an error.
//!
//! All lookups are batched: one call per reference kind, regardless of how
//! many tags the measurement carries.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::Map;
use tracing::{debug, info};

use tag2domain_core::{
    Error, IdOrName, Measurement, MeasurementTag, NewTag, NewValue, ResolvedTag,
    ResolvedTaxonomyInfo, Result, StorageAdapter, TaxonomyInfo,
};

/// Value reference after lookup, before creation.
#[derive(Debug, Clone, PartialEq, Eq)]
enum PendingValue {
    None,
    Known(i64),
    /// Named value that does not exist yet.
    Create(String),
}

/// Tag entry after lookup, before creation. `tag_id` is `None` for a tag
/// that will be created.
#[derive(Debug, Clone)]
struct PendingTag<'m> {
    entry: &'m MeasurementTag,
    tag_id: Option<i64>,
    value: PendingValue,
}

fn join<T: std::fmt::Display>(items: impl IntoIterator<Item = T>) -> String {
    items
        .into_iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Resolve every reference in `msm`, creating missing tags and values where
/// permitted. Runs inside the adapter's current transaction.
pub async fn resolve<A: StorageAdapter + ?Sized>(
    adapter: &mut A,
    msm: &Measurement,
) -> Result<ResolvedTaxonomyInfo> {
    let taxonomy = resolve_taxonomy(adapter, msm).await?;
    check_taxonomy_flags(&taxonomy, msm)?;

    let tag_ids = resolve_tags(adapter, &taxonomy, msm).await?;
    let mut pending = resolve_values(adapter, &taxonomy, msm, &tag_ids).await?;

    let created_tags = create_missing_tags(adapter, &taxonomy, &mut pending).await?;
    let (created_values, value_ids) =
        create_missing_values(adapter, &taxonomy, &pending).await?;

    let tags = pending
        .into_iter()
        .map(|p| -> Result<ResolvedTag> {
            let tag_id = p.tag_id.ok_or_else(|| {
                Error::Internal(format!("tag {} has no ID after resolution", p.entry.tag))
            })?;
            let value_id = match p.value {
                PendingValue::None => None,
                PendingValue::Known(id) => Some(id),
                PendingValue::Create(value) => {
                    Some(*value_ids.get(&(tag_id, value.clone())).ok_or_else(|| {
                        Error::Internal(format!(
                            "value '{}' of tag {} has no ID after resolution",
                            value, tag_id
                        ))
                    })?)
                }
            };
            Ok(ResolvedTag {
                tag: p.entry.tag.clone(),
                tag_id,
                value: p.entry.value.clone(),
                value_id,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(ResolvedTaxonomyInfo {
        taxonomy,
        tags,
        created_tags,
        created_values,
    })
}

async fn resolve_taxonomy<A: StorageAdapter + ?Sized>(
    adapter: &mut A,
    msm: &Measurement,
) -> Result<TaxonomyInfo> {
    let found = match &msm.taxonomy {
        IdOrName::Id(id) => adapter.fetch_taxonomy_by_id(*id).await?,
        IdOrName::Name(name) => adapter.fetch_taxonomy_by_name(name).await?,
    };
    let taxonomy = found.ok_or_else(|| {
        Error::InvalidMeasurement(format!("taxonomy {} not found", msm.taxonomy))
    })?;
    debug!(
        subsystem = "msm",
        component = "resolver",
        taxonomy_id = taxonomy.id,
        allows_auto_tags = taxonomy.allows_auto_tags,
        allows_auto_values = taxonomy.allows_auto_values,
        "Resolved taxonomy"
    );
    Ok(taxonomy)
}

/// Auto-generation requests are checked against the taxonomy before any
/// tag is looked up.
fn check_taxonomy_flags(taxonomy: &TaxonomyInfo, msm: &Measurement) -> Result<()> {
    if msm.autogenerate_tags && !taxonomy.allows_auto_tags {
        return Err(Error::DisallowedTaxonomyModification(format!(
            "taxonomy with ID {} does not allow automatic tag generation",
            taxonomy.id
        )));
    }
    if msm.autogenerate_values && !taxonomy.allows_auto_values {
        return Err(Error::DisallowedTaxonomyModification(format!(
            "taxonomy with ID {} does not allow automatic value generation",
            taxonomy.id
        )));
    }
    Ok(())
}

/// Map each tag reference to its ID; `None` marks a name to be created.
async fn resolve_tags<A: StorageAdapter + ?Sized>(
    adapter: &mut A,
    taxonomy: &TaxonomyInfo,
    msm: &Measurement,
) -> Result<BTreeMap<IdOrName, Option<i64>>> {
    let names: Vec<String> = msm
        .tags
        .iter()
        .filter_map(|t| t.tag.as_name().map(str::to_string))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    let ids: Vec<i64> = msm
        .tags
        .iter()
        .filter_map(|t| t.tag.as_id())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();

    let by_name = if names.is_empty() {
        Default::default()
    } else {
        adapter.fetch_tag_ids_by_name(taxonomy.id, &names).await?
    };

    let missing_names: Vec<&str> = by_name
        .iter()
        .filter(|(_, id)| id.is_none())
        .map(|(name, _)| name.as_str())
        .collect();
    if !missing_names.is_empty() {
        if !msm.autogenerate_tags {
            return Err(Error::InvalidMeasurement(format!(
                "tags not in taxonomy {}: {}",
                taxonomy.id,
                join(missing_names.iter().map(|n| format!("'{}'", n)))
            )));
        }
        debug!(
            subsystem = "msm",
            component = "resolver",
            taxonomy_id = taxonomy.id,
            missing = %join(&missing_names),
            "Tags will be created"
        );
    }

    if !ids.is_empty() {
        let missing_ids = adapter.check_tag_ids_exist(taxonomy.id, &ids).await?;
        if !missing_ids.is_empty() {
            return Err(Error::InvalidMeasurement(format!(
                "tag IDs not in taxonomy {}: {}",
                taxonomy.id,
                join(&missing_ids)
            )));
        }
    }

    let mut resolved: BTreeMap<IdOrName, Option<i64>> = by_name
        .into_iter()
        .map(|(name, id)| (IdOrName::Name(name), id))
        .collect();
    resolved.extend(ids.into_iter().map(|id| (IdOrName::Id(id), Some(id))));
    Ok(resolved)
}

/// Look up every value reference, scoped to its (possibly pending) tag.
async fn resolve_values<'m, A: StorageAdapter + ?Sized>(
    adapter: &mut A,
    taxonomy: &TaxonomyInfo,
    msm: &'m Measurement,
    tag_ids: &BTreeMap<IdOrName, Option<i64>>,
) -> Result<Vec<PendingTag<'m>>> {
    let mut pending = Vec::with_capacity(msm.tags.len());
    let mut by_value: BTreeSet<(i64, String)> = BTreeSet::new();
    let mut by_id: BTreeSet<(i64, i64)> = BTreeSet::new();
    let mut not_creatable: Vec<String> = Vec::new();

    for entry in &msm.tags {
        let tag_id = tag_ids.get(&entry.tag).copied().ok_or_else(|| {
            Error::Internal(format!("tag {} was not looked up", entry.tag))
        })?;

        let value = match (&entry.value, tag_id) {
            (None, _) => PendingValue::None,
            (Some(IdOrName::Name(value)), Some(tag_id)) => {
                by_value.insert((tag_id, value.clone()));
                PendingValue::Create(value.clone())
            }
            // A tag that does not exist yet has no values.
            (Some(IdOrName::Name(value)), None) => {
                if !msm.autogenerate_values {
                    not_creatable.push(format!("'{}' (tag {})", value, entry.tag));
                }
                PendingValue::Create(value.clone())
            }
            (Some(IdOrName::Id(value_id)), Some(tag_id)) => {
                by_id.insert((tag_id, *value_id));
                PendingValue::Known(*value_id)
            }
            (Some(IdOrName::Id(value_id)), None) => {
                return Err(Error::InvalidMeasurement(format!(
                    "value ID {} refers to tag {} which does not exist yet",
                    value_id, entry.tag
                )));
            }
        };
        pending.push(PendingTag {
            entry,
            tag_id,
            value,
        });
    }

    if !not_creatable.is_empty() {
        return Err(Error::InvalidMeasurement(format!(
            "values can not be generated in taxonomy {} because autogenerating \
             values is not allowed: {}",
            taxonomy.id,
            not_creatable.join(", ")
        )));
    }

    if !by_value.is_empty() {
        let pairs: Vec<(i64, String)> = by_value.into_iter().collect();
        let found = adapter.fetch_value_ids_by_value(&pairs).await?;

        let missing: Vec<String> = found
            .iter()
            .filter(|(_, id)| id.is_none())
            .map(|((tag_id, value), _)| format!("'{}' (tag ID {})", value, tag_id))
            .collect();
        if !missing.is_empty() && !msm.autogenerate_values {
            return Err(Error::InvalidMeasurement(format!(
                "values not associated with their tags in taxonomy {} and \
                 autogenerating values is not allowed: {}",
                taxonomy.id,
                join(&missing)
            )));
        }

        for p in &mut pending {
            let Some(tag_id) = p.tag_id else { continue };
            let known = match &p.value {
                PendingValue::Create(value) => found.get(&(tag_id, value.clone())).copied().flatten(),
                _ => None,
            };
            if let Some(id) = known {
                p.value = PendingValue::Known(id);
            }
        }
    }

    if !by_id.is_empty() {
        let pairs: Vec<(i64, i64)> = by_id.into_iter().collect();
        let missing = adapter.check_value_ids_exist(&pairs).await?;
        if !missing.is_empty() {
            return Err(Error::InvalidMeasurement(format!(
                "value IDs not associated with their tags: {}",
                join(missing.iter().map(|(t, v)| format!("{} (tag ID {})", v, t)))
            )));
        }
    }

    Ok(pending)
}

/// Create tags still missing an ID and fill in their IDs.
async fn create_missing_tags<A: StorageAdapter + ?Sized>(
    adapter: &mut A,
    taxonomy: &TaxonomyInfo,
    pending: &mut [PendingTag<'_>],
) -> Result<Vec<String>> {
    let mut to_create: BTreeMap<String, NewTag> = BTreeMap::new();
    for p in pending.iter().filter(|p| p.tag_id.is_none()) {
        let name = p.entry.tag.as_name().ok_or_else(|| {
            Error::Internal(format!("tag {} by ID cannot be created", p.entry.tag))
        })?;
        to_create.entry(name.to_string()).or_insert_with(|| NewTag {
            tag_name: name.to_string(),
            tag_description: p.entry.description.clone().unwrap_or_default(),
            taxonomy_id: taxonomy.id,
            extras: p.entry.extras.clone().unwrap_or_else(Map::new),
        });
    }
    if to_create.is_empty() {
        return Ok(Vec::new());
    }

    if !taxonomy.allows_auto_tags {
        return Err(Error::DisallowedTaxonomyModification(format!(
            "taxonomy with ID {} does not allow automatic tag generation",
            taxonomy.id
        )));
    }

    for name in to_create.keys() {
        info!(
            subsystem = "msm",
            component = "resolver",
            taxonomy_id = taxonomy.id,
            tag_name = %name,
            "Adding new tag to taxonomy"
        );
    }
    let new_tags: Vec<NewTag> = to_create.into_values().collect();
    let created = adapter.insert_tags(&new_tags).await?;

    for p in pending.iter_mut().filter(|p| p.tag_id.is_none()) {
        if let Some(name) = p.entry.tag.as_name() {
            p.tag_id = created.get(name).copied();
        }
    }
    Ok(new_tags.into_iter().map(|t| t.tag_name).collect())
}

/// Create values still missing an ID. Tags must already be created.
async fn create_missing_values<A: StorageAdapter + ?Sized>(
    adapter: &mut A,
    taxonomy: &TaxonomyInfo,
    pending: &[PendingTag<'_>],
) -> Result<(Vec<NewValue>, BTreeMap<(i64, String), i64>)> {
    let mut to_create: BTreeSet<NewValue> = BTreeSet::new();
    for p in pending {
        if let PendingValue::Create(value) = &p.value {
            let tag_id = p.tag_id.ok_or_else(|| {
                Error::Internal(format!("tag {} missing before value creation", p.entry.tag))
            })?;
            to_create.insert(NewValue {
                tag_id,
                value: value.clone(),
            });
        }
    }
    if to_create.is_empty() {
        return Ok((Vec::new(), BTreeMap::new()));
    }

    if !taxonomy.allows_auto_values {
        return Err(Error::DisallowedTaxonomyModification(format!(
            "taxonomy with ID {} does not allow automatic value generation",
            taxonomy.id
        )));
    }

    for v in &to_create {
        info!(
            subsystem = "msm",
            component = "resolver",
            tag_id = v.tag_id,
            value = %v.value,
            "Adding new value to tag"
        );
    }
    let new_values: Vec<NewValue> = to_create.into_iter().collect();
    let created = adapter.insert_values(&new_values).await?;
    Ok((new_values, created))
}
