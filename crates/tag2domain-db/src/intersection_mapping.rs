//! Column mappings from tag types to intersection tables.
//!
//! Each tag type ("domain", "delegation", ...) stores its intervals in its
//! own table. The tables are structurally identical but may name their
//! columns differently, so every tag type carries a [`ColumnMapping`].
//!
//! ```yaml
//! intersection_tables:
//!   domain:
//!     table_name: domain_tags
//!     id: domain_id
//!     taxonomy_id: taxonomy_id
//!     tag_id: tag_id
//!     value_id: value_id
//!     measured_at: measured_at
//!     producer: producer
//!     start_date: start_date
//!     end_date: end_date
//!     start_ts: start_ts
//!     end_ts: end_ts
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use tag2domain_core::defaults::{
    DELEGATION_TABLE, DOMAIN_TABLE, INTERSECTION_TABLE, TAG_TYPE_DELEGATION, TAG_TYPE_DOMAIN,
    TAG_TYPE_INTERSECTION,
};
use tag2domain_core::{Error, Result};

use crate::schema_validation::{validate_identifier, validate_table_name};

/// Physical layout of one intersection table. Every key is required.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ColumnMapping {
    pub table_name: String,
    /// Column holding the tagged entity's ID.
    pub id: String,
    pub taxonomy_id: String,
    pub tag_id: String,
    pub value_id: String,
    pub measured_at: String,
    pub producer: String,
    pub start_date: String,
    pub end_date: String,
    pub start_ts: String,
    pub end_ts: String,
}

impl ColumnMapping {
    /// Mapping for the shipped schema, where only the table and entity
    /// column differ between tag types.
    pub fn standard(table_name: &str, id: &str) -> Self {
        Self {
            table_name: table_name.to_string(),
            id: id.to_string(),
            taxonomy_id: "taxonomy_id".to_string(),
            tag_id: "tag_id".to_string(),
            value_id: "value_id".to_string(),
            measured_at: "measured_at".to_string(),
            producer: "producer".to_string(),
            start_date: "start_date".to_string(),
            end_date: "end_date".to_string(),
            start_ts: "start_ts".to_string(),
            end_ts: "end_ts".to_string(),
        }
    }

    /// Check every name is a safe SQL identifier.
    pub fn validate(&self) -> Result<()> {
        validate_table_name(&self.table_name)?;
        for column in self.columns() {
            validate_identifier(column)?;
        }
        Ok(())
    }

    /// Column names, excluding the table name.
    pub fn columns(&self) -> [&str; 10] {
        [
            self.id.as_str(),
            self.taxonomy_id.as_str(),
            self.tag_id.as_str(),
            self.value_id.as_str(),
            self.measured_at.as_str(),
            self.producer.as_str(),
            self.start_date.as_str(),
            self.end_date.as_str(),
            self.start_ts.as_str(),
            self.end_ts.as_str(),
        ]
    }
}

/// Mapping of tag type to intersection table layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IntersectionTables(BTreeMap<String, ColumnMapping>);

impl Default for IntersectionTables {
    /// Tag types backed by the tables in the bundled migrations.
    fn default() -> Self {
        let mut tables = BTreeMap::new();
        tables.insert(
            TAG_TYPE_DOMAIN.to_string(),
            ColumnMapping::standard(DOMAIN_TABLE, "domain_id"),
        );
        tables.insert(
            TAG_TYPE_DELEGATION.to_string(),
            ColumnMapping::standard(DELEGATION_TABLE, "delegation_id"),
        );
        tables.insert(
            TAG_TYPE_INTERSECTION.to_string(),
            ColumnMapping::standard(INTERSECTION_TABLE, "intersected_id"),
        );
        Self(tables)
    }
}

impl IntersectionTables {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    pub fn with(mut self, tag_type: impl Into<String>, mapping: ColumnMapping) -> Self {
        self.0.insert(tag_type.into(), mapping);
        self
    }

    pub fn get(&self, tag_type: &str) -> Option<&ColumnMapping> {
        self.0.get(tag_type)
    }

    pub fn tag_types(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ColumnMapping)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Validate every mapping; the error names the offending tag type.
    pub fn validate(&self) -> Result<()> {
        if self.0.is_empty() {
            return Err(Error::Config(
                "no intersection tables configured".to_string(),
            ));
        }
        for (tag_type, mapping) in &self.0 {
            if tag_type.is_empty() {
                return Err(Error::Config("empty tag type in intersection tables".to_string()));
            }
            mapping.validate().map_err(|e| match e {
                Error::Config(msg) => {
                    Error::Config(format!("intersection table for '{}': {}", tag_type, msg))
                }
                other => other,
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn mapping_json() -> serde_json::Value {
        json!({
            "table_name": "t2d.domain_tags",
            "id": "domain_id",
            "taxonomy_id": "taxonomy_id",
            "tag_id": "tag_id",
            "value_id": "value_id",
            "measured_at": "measured_at",
            "producer": "producer",
            "start_date": "start_date",
            "end_date": "end_date",
            "start_ts": "start_ts",
            "end_ts": "end_ts"
        })
    }

    #[test]
    fn test_defaults_cover_shipped_tables() {
        let tables = IntersectionTables::default();
        let types: Vec<&str> = tables.tag_types().collect();
        assert_eq!(types, vec!["delegation", "domain", "intersection"]);
        assert_eq!(tables.get("domain").unwrap().table_name, "domain_tags");
        assert_eq!(tables.get("delegation").unwrap().id, "delegation_id");
        assert!(tables.validate().is_ok());
    }

    #[test]
    fn test_mapping_deserializes() {
        let mapping: ColumnMapping = serde_json::from_value(mapping_json()).unwrap();
        assert_eq!(mapping.table_name, "t2d.domain_tags");
        assert!(mapping.validate().is_ok());
    }

    #[test]
    fn test_mapping_missing_key_fails() {
        let mut doc = mapping_json();
        doc.as_object_mut().unwrap().remove("end_ts");
        let err = serde_json::from_value::<ColumnMapping>(doc).unwrap_err();
        assert!(err.to_string().contains("end_ts"));
    }

    #[test]
    fn test_mapping_unknown_key_fails() {
        let mut doc = mapping_json();
        doc["extra_column"] = json!("x");
        assert!(serde_json::from_value::<ColumnMapping>(doc).is_err());
    }

    #[test]
    fn test_invalid_column_names_tag_type_in_error() {
        let mut mapping = ColumnMapping::standard("domain_tags", "domain_id");
        mapping.producer = "producer; DROP TABLE tags".to_string();
        let tables = IntersectionTables::new().with("domain", mapping);
        match tables.validate() {
            Err(Error::Config(msg)) => {
                assert!(msg.contains("'domain'"));
                assert!(msg.contains("invalid character"));
            }
            other => panic!("Expected Config error, got {:?}", other),
        }
    }

    #[test]
    fn test_empty_registry_is_invalid() {
        assert!(IntersectionTables::new().validate().is_err());
    }
}
