//! Measurement documents and their validation.
//!
//! A producer describes its current belief about an entity as a JSON
//! document. [`MeasurementDocument`] mirrors that document field for field;
//! [`Measurement`] is the validated form every later stage works with.
//!
//! ```json
//! {
//!     "version": "1",
//!     "tag_type": "intersection",
//!     "tagged_id": 3,
//!     "taxonomy": "colors",
//!     "producer": "test",
//!     "measured_at": "2020-12-22T12:35:32",
//!     "measurement_id": "test/12345",
//!     "tags": [{"tag": "rgb::blue"}, {"tag": 7, "value": "dark"}]
//! }
//! ```

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use crate::error::{Error, Result};
use crate::temporal::parse_timestamp;

/// Reference to a row given either by numeric ID or by name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IdOrName {
    Id(i64),
    Name(String),
}

/// Reference to a taxonomy.
pub type TaxonomyRef = IdOrName;
/// Reference to a tag within the measurement's taxonomy.
pub type TagRef = IdOrName;
/// Reference to a value of a tag.
pub type ValueRef = IdOrName;

impl IdOrName {
    pub fn as_id(&self) -> Option<i64> {
        match self {
            IdOrName::Id(id) => Some(*id),
            IdOrName::Name(_) => None,
        }
    }

    pub fn as_name(&self) -> Option<&str> {
        match self {
            IdOrName::Id(_) => None,
            IdOrName::Name(name) => Some(name),
        }
    }
}

impl fmt::Display for IdOrName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdOrName::Id(id) => write!(f, "{}", id),
            IdOrName::Name(name) => write!(f, "'{}'", name),
        }
    }
}

impl From<i64> for IdOrName {
    fn from(id: i64) -> Self {
        IdOrName::Id(id)
    }
}

impl From<&str> for IdOrName {
    fn from(name: &str) -> Self {
        IdOrName::Name(name.to_string())
    }
}

/// One tag entry of a measurement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementTag {
    pub tag: TagRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<ValueRef>,
    /// Required for every entry when the measurement asks for tag creation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extras: Option<Map<String, JsonValue>>,
}

impl MeasurementTag {
    pub fn new(tag: impl Into<TagRef>) -> Self {
        Self {
            tag: tag.into(),
            value: None,
            description: None,
            extras: None,
        }
    }

    pub fn with_value(mut self, value: impl Into<ValueRef>) -> Self {
        self.value = Some(value.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Measurement as it arrives on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementDocument {
    pub version: String,
    pub tag_type: String,
    pub tagged_id: i64,
    pub taxonomy: TaxonomyRef,
    pub producer: String,
    pub measured_at: String,
    pub tags: Vec<MeasurementTag>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub measurement_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub autogenerate_tags: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub autogenerate_values: Option<bool>,
}

/// Validated measurement.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Measurement {
    pub version: String,
    pub tag_type: String,
    pub tagged_id: i64,
    pub taxonomy: TaxonomyRef,
    pub producer: String,
    pub measured_at: DateTime<Utc>,
    pub tags: Vec<MeasurementTag>,
    pub measurement_id: Option<String>,
    pub autogenerate_tags: bool,
    pub autogenerate_values: bool,
}

impl Measurement {
    /// Parse and validate a JSON measurement.
    pub fn from_json(json: &str) -> Result<Self> {
        let doc: MeasurementDocument = serde_json::from_str(json)
            .map_err(|e| Error::InvalidMeasurement(e.to_string()))?;
        Self::try_from(doc)
    }

    /// Validate an already decoded JSON value.
    pub fn from_value(value: JsonValue) -> Result<Self> {
        let doc: MeasurementDocument = serde_json::from_value(value)
            .map_err(|e| Error::InvalidMeasurement(e.to_string()))?;
        Self::try_from(doc)
    }

    /// Human-readable identification for log lines.
    pub fn label(&self) -> String {
        match &self.measurement_id {
            Some(id) => format!("{}:{}", self.producer, id),
            None => format!("{} (no measurement_id)", self.producer),
        }
    }
}

impl TryFrom<MeasurementDocument> for Measurement {
    type Error = Error;

    fn try_from(doc: MeasurementDocument) -> Result<Self> {
        validate_document(&doc)?;
        let measured_at = parse_timestamp(&doc.measured_at)?;

        Ok(Self {
            version: doc.version,
            tag_type: doc.tag_type,
            tagged_id: doc.tagged_id,
            taxonomy: doc.taxonomy,
            producer: doc.producer,
            measured_at,
            tags: doc.tags,
            measurement_id: doc.measurement_id,
            autogenerate_tags: doc.autogenerate_tags.unwrap_or(false),
            autogenerate_values: doc.autogenerate_values.unwrap_or(false),
        })
    }
}

/// Check the rules serde cannot express.
pub fn validate_document(doc: &MeasurementDocument) -> Result<()> {
    if doc.version.is_empty() {
        return Err(Error::InvalidMeasurement(
            "field 'version' must not be empty".to_string(),
        ));
    }
    if doc.tag_type.is_empty() {
        return Err(Error::InvalidMeasurement(
            "field 'tag_type' must not be empty".to_string(),
        ));
    }
    if doc.producer.is_empty() {
        return Err(Error::InvalidMeasurement(
            "field 'producer' must not be empty".to_string(),
        ));
    }

    if doc.autogenerate_tags.unwrap_or(false) {
        for item in &doc.tags {
            if item.description.is_none() {
                return Err(Error::InvalidMeasurement(format!(
                    "missing tag description in tag {} required by autogenerate_tags",
                    item.tag
                )));
            }
            // An ID cannot be both a reference and a request to create.
            if item.tag.as_name().is_none() {
                return Err(Error::InvalidMeasurement(
                    "field 'tag' must contain a string if autogenerate_tags is true".to_string(),
                ));
            }
        }
    }

    Ok(())
}
