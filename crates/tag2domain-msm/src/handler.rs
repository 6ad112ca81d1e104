//! Measurement orchestration.
//!
//! [`MeasurementToTags`] owns a [`StorageAdapter`] and runs one measurement
//! at a time through every stage inside a single transaction:
//!
//! 1. reject unknown tag types
//! 2. maximum age check
//! 3. reference resolution (may create tags and values)
//! 4. reconciliation against the open intervals, including the staleness and
//!    producer ownership guards
//! 5. insert, prolong and end writes
//! 6. commit
//!
//! Any failure rolls the transaction back, so a rejected measurement leaves
//! no trace, including tags or values created while resolving it.

use std::collections::BTreeSet;
use std::time::Instant;

use tracing::{debug, info, warn};

use tag2domain_core::{
    reconcile, Error, Measurement, MeasurementDocument, MeasurementResult, Result,
    StorageAdapter, TagChanges, TagState,
};

use crate::freshness::FreshnessGuard;
use crate::resolver::resolve;

/// Updates stored intervals from measurements.
pub struct MeasurementToTags<A> {
    adapter: A,
    freshness: FreshnessGuard,
}

impl<A: StorageAdapter> MeasurementToTags<A> {
    /// Handler without a maximum measurement age.
    pub fn new(adapter: A) -> Self {
        Self {
            adapter,
            freshness: FreshnessGuard::disabled(),
        }
    }

    pub fn with_freshness(mut self, freshness: FreshnessGuard) -> Self {
        self.freshness = freshness;
        self
    }

    pub fn adapter(&self) -> &A {
        &self.adapter
    }

    pub fn adapter_mut(&mut self) -> &mut A {
        &mut self.adapter
    }

    pub fn into_adapter(self) -> A {
        self.adapter
    }

    /// Parse, validate and handle a JSON measurement.
    pub async fn handle_json(&mut self, json: &str) -> Result<MeasurementResult> {
        let msm = Measurement::from_json(json)?;
        self.handle_measurement(&msm).await
    }

    /// Validate and handle a decoded measurement document.
    pub async fn handle_document(&mut self, doc: MeasurementDocument) -> Result<MeasurementResult> {
        let msm = Measurement::try_from(doc)?;
        self.handle_measurement(&msm).await
    }

    /// Handle one validated measurement, committing on success and rolling
    /// back on any error.
    pub async fn handle_measurement(&mut self, msm: &Measurement) -> Result<MeasurementResult> {
        let start = Instant::now();
        info!(
            subsystem = "msm",
            component = "handler",
            op = "handle_measurement",
            producer = %msm.producer,
            measurement_id = msm.measurement_id.as_deref(),
            tag_type = %msm.tag_type,
            tagged_id = msm.tagged_id,
            measured_at = %msm.measured_at,
            "Received measurement"
        );

        match self.process(msm).await {
            Ok(result) => {
                info!(
                    subsystem = "msm",
                    component = "handler",
                    op = "handle_measurement",
                    producer = %msm.producer,
                    taxonomy_id = result.taxonomy_id,
                    insert_count = result.tag_changes.insert.len(),
                    prolong_count = result.tag_changes.prolong.len(),
                    end_count = result.tag_changes.end.len(),
                    duration_ms = start.elapsed().as_millis() as u64,
                    "Finished handling measurement"
                );
                Ok(result)
            }
            Err(e) => {
                if let Err(rollback_err) = self.adapter.rollback().await {
                    warn!(
                        subsystem = "msm",
                        component = "handler",
                        error = %rollback_err,
                        "Rollback after failed measurement failed"
                    );
                }
                Err(e)
            }
        }
    }

    async fn process(&mut self, msm: &Measurement) -> Result<MeasurementResult> {
        if !self.adapter.is_valid_tag_type(&msm.tag_type) {
            return Err(Error::InvalidMeasurement(format!(
                "unknown tag_type '{}'",
                msm.tag_type
            )));
        }

        self.freshness.check_max_age(msm.measured_at)?;

        let phase = Instant::now();
        let resolved = resolve(&mut self.adapter, msm).await?;
        let taxonomy_id = resolved.taxonomy.id;
        debug!(
            subsystem = "msm",
            component = "handler",
            taxonomy_id,
            duration_ms = phase.elapsed().as_millis() as u64,
            "Finished preparing taxonomy"
        );

        let phase = Instant::now();
        let open = self
            .adapter
            .get_open_tags(taxonomy_id, &msm.tag_type, msm.tagged_id)
            .await?;
        let new: BTreeSet<TagState> = resolved.tags.iter().map(|t| t.state()).collect();
        let changes = reconcile(&open, &new, msm.measured_at, Some(&msm.producer))?;
        debug!(
            subsystem = "msm",
            component = "handler",
            taxonomy_id,
            duration_ms = phase.elapsed().as_millis() as u64,
            "Finished calculating intersection changes"
        );

        let phase = Instant::now();
        self.write_changes(msm, taxonomy_id, &changes).await?;
        debug!(
            subsystem = "msm",
            component = "handler",
            taxonomy_id,
            duration_ms = phase.elapsed().as_millis() as u64,
            "Finished writing intersection changes"
        );

        let phase = Instant::now();
        self.adapter.commit().await?;
        debug!(
            subsystem = "msm",
            component = "handler",
            duration_ms = phase.elapsed().as_millis() as u64,
            "Committed"
        );

        Ok(MeasurementResult {
            tag_type: msm.tag_type.clone(),
            tagged_id: msm.tagged_id,
            taxonomy_id,
            measured_at: msm.measured_at,
            tag_changes: changes,
        })
    }

    async fn write_changes(
        &mut self,
        msm: &Measurement,
        taxonomy_id: i64,
        changes: &TagChanges,
    ) -> Result<()> {
        let producer = Some(msm.producer.as_str());

        log_changes(msm, taxonomy_id, "opening", &changes.insert);
        self.adapter
            .insert_intersections(
                taxonomy_id,
                msm.measured_at,
                &changes.insert,
                &msm.tag_type,
                msm.tagged_id,
                producer,
            )
            .await?;

        log_changes(msm, taxonomy_id, "prolonging", &changes.prolong);
        self.adapter
            .prolong_intersections(
                taxonomy_id,
                msm.measured_at,
                &changes.prolong,
                &msm.tag_type,
                msm.tagged_id,
                producer,
            )
            .await?;

        log_changes(msm, taxonomy_id, "ending", &changes.end);
        self.adapter
            .end_intersections(
                taxonomy_id,
                msm.measured_at,
                &changes.end,
                &msm.tag_type,
                msm.tagged_id,
                producer,
            )
            .await
    }
}

fn log_changes(msm: &Measurement, taxonomy_id: i64, action: &str, states: &[TagState]) {
    for state in states {
        info!(
            subsystem = "msm",
            component = "handler",
            tag_type = %msm.tag_type,
            tagged_id = msm.tagged_id,
            taxonomy_id,
            tag_id = state.tag_id,
            value_id = state.value_id,
            "{} tag-value-pair {}",
            action,
            state
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use tag2domain_core::mock::MemoryAdapter;
    use tag2domain_core::{IdOrName, MeasurementTag};

    fn measurement(hour: u32, tags: Vec<MeasurementTag>) -> Measurement {
        Measurement {
            version: "1".to_string(),
            tag_type: "domain".to_string(),
            tagged_id: 5,
            taxonomy: IdOrName::Id(1),
            producer: "P1".to_string(),
            measured_at: Utc.with_ymd_and_hms(2024, 1, 1, hour, 0, 0).unwrap(),
            tags,
            measurement_id: Some("m".to_string()),
            autogenerate_tags: false,
            autogenerate_values: false,
        }
    }

    fn handler() -> MeasurementToTags<MemoryAdapter> {
        MeasurementToTags::new(
            MemoryAdapter::new()
                .with_taxonomy(1, "colors", true, true)
                .with_tag(1, 1, "red")
                .with_tag(2, 1, "blue"),
        )
    }

    #[tokio::test]
    async fn test_unknown_tag_type_touches_nothing() {
        let mut handler = handler();
        let mut msm = measurement(1, vec![MeasurementTag::new("red")]);
        msm.tag_type = "prefix".to_string();

        let err = handler.handle_measurement(&msm).await.unwrap_err();
        assert!(matches!(err, Error::InvalidMeasurement(ref m) if m.contains("prefix")));
        assert_eq!(handler.adapter().commit_count(), 0);
    }

    #[tokio::test]
    async fn test_max_age_rejects_old_measurement() {
        let mut handler = handler().with_freshness(FreshnessGuard::from_minutes(Some(5)).unwrap());
        let msm = measurement(1, vec![MeasurementTag::new("red")]);
        assert!(matches!(
            handler.handle_measurement(&msm).await,
            Err(Error::StaleMeasurement(_))
        ));
    }

    #[tokio::test]
    async fn test_failed_write_rolls_back_created_tags() {
        let mut handler = MeasurementToTags::new(
            MemoryAdapter::new()
                .with_taxonomy(1, "colors", true, true)
                .failing_on("insert_intersections"),
        );
        let mut msm = measurement(1, vec![MeasurementTag::new("green").with_description("g")]);
        msm.autogenerate_tags = true;

        let err = handler.handle_measurement(&msm).await.unwrap_err();
        assert!(matches!(err, Error::Connection(_)));
        assert!(handler.adapter().committed_tags().is_empty());
        assert!(!handler.adapter().has_uncommitted_changes());
        assert_eq!(handler.adapter().rollback_count(), 1);
    }

    #[tokio::test]
    async fn test_result_reports_changes() {
        let mut handler = handler();
        let result = handler
            .handle_json(
                r#"{
                    "version": "1",
                    "tag_type": "domain",
                    "tagged_id": 5,
                    "taxonomy": "colors",
                    "producer": "P1",
                    "measured_at": "2024-01-01T01:00:00",
                    "tags": [{"tag": "red"}, {"tag": 2}]
                }"#,
            )
            .await
            .unwrap();

        assert_eq!(result.tag_type, "domain");
        assert_eq!(result.tagged_id, 5);
        assert_eq!(result.taxonomy_id, 1);
        assert_eq!(
            result.tag_changes.insert,
            vec![TagState::new(1, None), TagState::new(2, None)]
        );
        assert!(result.tag_changes.prolong.is_empty());
        assert!(result.tag_changes.end.is_empty());
        assert_eq!(handler.adapter().commit_count(), 1);
    }
}
