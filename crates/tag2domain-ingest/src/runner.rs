//! Consumption loop.
//!
//! Every document is handled to completion before the next one is read.
//! What happens after a failed measurement follows its
//! [`Disposition`](tag2domain_core::Disposition): stale and rejected
//! measurements are logged and skipped, storage failures are retried with a
//! linear backoff, and anything else stops the run.

use std::io;
use std::time::Duration;

use serde_json::Value as JsonValue;
use tracing::{debug, error, info, warn};

use tag2domain_core::{Disposition, Error, Measurement, Result, StorageAdapter};
use tag2domain_msm::MeasurementToTags;

use crate::config::RetryConfig;

/// Counters for one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub read: u64,
    pub handled: u64,
    pub stale: u64,
    pub rejected: u64,
    /// Blank, undecodable or non-JSON documents.
    pub skipped: u64,
    pub retries: u64,
}

pub struct Runner<A> {
    handler: MeasurementToTags<A>,
    retry: RetryConfig,
    summary: RunSummary,
}

impl<A: StorageAdapter> Runner<A> {
    pub fn new(handler: MeasurementToTags<A>, retry: RetryConfig) -> Self {
        Self {
            handler,
            retry,
            summary: RunSummary::default(),
        }
    }

    pub fn summary(&self) -> RunSummary {
        self.summary
    }

    #[allow(dead_code)]
    pub fn handler(&self) -> &MeasurementToTags<A> {
        &self.handler
    }

    /// Consume every document. Returns the error that stopped the run, if
    /// any; the summary is available either way.
    pub async fn run<I>(&mut self, documents: I) -> Result<()>
    where
        I: IntoIterator<Item = io::Result<Vec<u8>>>,
    {
        info!(subsystem = "ingest", component = "runner", "Reading measurements");
        for document in documents {
            let document = document?;
            self.summary.read += 1;
            self.handle_document(&document).await?;
        }
        info!(
            subsystem = "ingest",
            component = "runner",
            "All measurements consumed"
        );
        Ok(())
    }

    async fn handle_document(&mut self, bytes: &[u8]) -> Result<()> {
        let document = match std::str::from_utf8(bytes) {
            Ok(document) => document,
            Err(e) => {
                warn!(
                    subsystem = "ingest",
                    component = "runner",
                    error = %e,
                    "Document is not valid UTF-8"
                );
                self.summary.skipped += 1;
                return Ok(());
            }
        };

        if document.trim().is_empty() {
            debug!(subsystem = "ingest", component = "runner", "Skipping blank document");
            self.summary.skipped += 1;
            return Ok(());
        }

        let value: JsonValue = match serde_json::from_str(document) {
            Ok(value) => value,
            Err(e) => {
                warn!(
                    subsystem = "ingest",
                    component = "runner",
                    error = %e,
                    "Could not parse JSON"
                );
                self.summary.skipped += 1;
                return Ok(());
            }
        };

        let msm = match Measurement::from_value(value) {
            Ok(msm) => msm,
            Err(e) => return self.settle(e, 1),
        };

        let mut attempt = 1;
        loop {
            match self.handler.handle_measurement(&msm).await {
                Ok(result) => {
                    debug!(
                        subsystem = "ingest",
                        component = "runner",
                        taxonomy_id = result.taxonomy_id,
                        "Handled measurement successfully"
                    );
                    self.summary.handled += 1;
                    return Ok(());
                }
                Err(e) if e.disposition() == Disposition::Retry && attempt < self.retry.max_attempts => {
                    let backoff = Duration::from_millis(self.retry.backoff_ms * u64::from(attempt));
                    warn!(
                        subsystem = "ingest",
                        component = "runner",
                        measurement = %msm.label(),
                        attempt,
                        error_kind = e.kind(),
                        error = %e,
                        backoff_ms = backoff.as_millis() as u64,
                        "Storage failure, retrying measurement"
                    );
                    self.summary.retries += 1;
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => return self.settle(e, attempt),
            }
        }
    }

    /// Record a failed measurement; errors that must stop the run are
    /// returned.
    fn settle(&mut self, e: Error, attempt: u32) -> Result<()> {
        match e.disposition() {
            Disposition::Acknowledge => {
                warn!(
                    subsystem = "ingest",
                    component = "runner",
                    error_kind = e.kind(),
                    error = %e,
                    "Stale measurement"
                );
                self.summary.stale += 1;
                Ok(())
            }
            Disposition::Reject => {
                warn!(
                    subsystem = "ingest",
                    component = "runner",
                    error_kind = e.kind(),
                    error = %e,
                    "Invalid measurement"
                );
                self.summary.rejected += 1;
                Ok(())
            }
            Disposition::Retry => {
                error!(
                    subsystem = "ingest",
                    component = "runner",
                    attempt,
                    error_kind = e.kind(),
                    error = %e,
                    "Giving up on measurement after repeated storage failures"
                );
                Err(e)
            }
            Disposition::Alert => {
                error!(
                    subsystem = "ingest",
                    component = "runner",
                    error_kind = e.kind(),
                    error = %e,
                    "Unrecoverable error while handling measurement"
                );
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::DocumentStream;
    use std::io::Cursor;
    use tag2domain_core::defaults::STREAM_SEPARATOR;
    use tag2domain_core::mock::MemoryAdapter;

    fn doc(hour: u32, tags: &str) -> String {
        format!(
            r#"{{"version": "1", "tag_type": "domain", "tagged_id": 1, "taxonomy": "colors",
                "producer": "P1", "measured_at": "2024-01-01T{:02}:00:00", "tags": {}}}"#,
            hour, tags
        )
    }

    fn stream(docs: &[String]) -> DocumentStream<Cursor<Vec<u8>>> {
        DocumentStream::new(Cursor::new(docs.join(STREAM_SEPARATOR).into_bytes()))
    }

    fn adapter() -> MemoryAdapter {
        MemoryAdapter::new()
            .with_taxonomy(1, "colors", false, false)
            .with_tag(1, 1, "red")
    }

    fn retry() -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            backoff_ms: 100,
        }
    }

    #[tokio::test]
    async fn test_dispositions_are_counted() {
        let mut runner = Runner::new(MeasurementToTags::new(adapter()), retry());
        let docs = vec![
            doc(2, r#"[{"tag": "red"}]"#),
            doc(1, r#"[{"tag": "red"}]"#),
            doc(3, r#"[{"tag": "purple"}]"#),
            "not json".to_string(),
            "  \n".to_string(),
            doc(4, r#"[]"#),
        ];

        runner.run(stream(&docs)).await.unwrap();
        assert_eq!(
            runner.summary(),
            RunSummary {
                read: 6,
                handled: 2,
                stale: 1,
                rejected: 1,
                skipped: 2,
                retries: 0,
            }
        );
        assert_eq!(runner.handler().adapter().commit_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_storage_failures_retry_then_stop() {
        let handler = MeasurementToTags::new(adapter().failing_on("get_open_tags"));
        let mut runner = Runner::new(handler, retry());

        let err = runner
            .run(stream(&[doc(1, r#"[{"tag": "red"}]"#), doc(2, "[]")]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Connection(_)));
        assert_eq!(runner.summary().retries, 2);
        assert_eq!(runner.summary().read, 1);
        assert_eq!(runner.handler().adapter().rollback_count(), 3);
    }

    #[tokio::test]
    async fn test_inconsistent_taxonomy_stops_run() {
        let adapter = adapter().with_tag(2, 1, "red");
        let mut runner = Runner::new(MeasurementToTags::new(adapter), retry());

        let err = runner
            .run(stream(&[doc(1, r#"[{"tag": "red"}]"#)]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InconsistentTaxonomy(_)));
        assert_eq!(runner.summary().handled, 0);
    }

    #[tokio::test]
    async fn test_undecodable_document_is_skipped() {
        let mut input = b"\xff\xfe garbage\n".to_vec();
        input.extend_from_slice(STREAM_SEPARATOR.as_bytes());
        input.extend_from_slice(doc(1, r#"[{"tag": "red"}]"#).as_bytes());

        let mut runner = Runner::new(MeasurementToTags::new(adapter()), retry());
        runner
            .run(DocumentStream::new(Cursor::new(input)))
            .await
            .unwrap();

        let summary = runner.summary();
        assert_eq!(summary.read, 2);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.handled, 1);
        assert_eq!(runner.handler().adapter().commit_count(), 1);
    }
}
