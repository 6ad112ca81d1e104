//! Error types for tag2domain.

use thiserror::Error;

/// Result type alias using tag2domain's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for measurement handling and storage operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed measurement, unresolvable reference, or a producer that is
    /// not allowed to touch an existing interval.
    #[error("Invalid measurement: {0}")]
    InvalidMeasurement(String),

    /// Measurement is not newer than the recorded state or exceeds the
    /// configured maximum age.
    #[error("Stale measurement: {0}")]
    StaleMeasurement(String),

    /// Auto-creation of tags or values requested in a taxonomy that forbids it.
    #[error("Disallowed taxonomy modification: {0}")]
    DisallowedTaxonomyModification(String),

    /// Duplicate reference rows where uniqueness is assumed.
    #[error("Inconsistent taxonomy: {0}")]
    InconsistentTaxonomy(String),

    /// Database operation failed (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Connection to the storage backend could not be established
    #[error("Connection error: {0}")]
    Connection(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// File I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

/// What the transport boundary should do with a measurement whose handling
/// returned an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Benign outcome; the message can be acknowledged without retry.
    Acknowledge,
    /// Client error; retrying the same message will fail the same way.
    Reject,
    /// Infrastructure failure; the transaction was rolled back, redeliver.
    Retry,
    /// Corrupted reference data or broken setup; stop and page an operator.
    Alert,
}

impl Error {
    /// Classify the error for the caller feeding measurements in.
    pub fn disposition(&self) -> Disposition {
        match self {
            Error::StaleMeasurement(_) => Disposition::Acknowledge,
            Error::InvalidMeasurement(_)
            | Error::DisallowedTaxonomyModification(_)
            | Error::Serialization(_) => Disposition::Reject,
            Error::Database(_) | Error::Connection(_) => Disposition::Retry,
            Error::InconsistentTaxonomy(_)
            | Error::Config(_)
            | Error::Internal(_)
            | Error::Io(_) => Disposition::Alert,
        }
    }

    /// Short machine-readable name of the error kind, used in log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::InvalidMeasurement(_) => "invalid_measurement",
            Error::StaleMeasurement(_) => "stale_measurement",
            Error::DisallowedTaxonomyModification(_) => "disallowed_taxonomy_modification",
            Error::InconsistentTaxonomy(_) => "inconsistent_taxonomy",
            Error::Database(_) => "database",
            Error::Connection(_) => "connection",
            Error::Serialization(_) => "serialization",
            Error::Config(_) => "config",
            Error::Internal(_) => "internal",
            Error::Io(_) => "io",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_invalid_measurement() {
        let err = Error::InvalidMeasurement("tag 'x' is not in taxonomy".to_string());
        assert_eq!(
            err.to_string(),
            "Invalid measurement: tag 'x' is not in taxonomy"
        );
    }

    #[test]
    fn test_error_display_stale_measurement() {
        let err = Error::StaleMeasurement("older than 60 minutes".to_string());
        assert_eq!(err.to_string(), "Stale measurement: older than 60 minutes");
    }

    #[test]
    fn test_error_display_disallowed() {
        let err = Error::DisallowedTaxonomyModification("taxonomy 3".to_string());
        assert_eq!(
            err.to_string(),
            "Disallowed taxonomy modification: taxonomy 3"
        );
    }

    #[test]
    fn test_error_display_connection() {
        let err = Error::Connection("refused".to_string());
        assert_eq!(err.to_string(), "Connection error: refused");
    }

    #[test]
    fn test_stale_is_acknowledged() {
        let err = Error::StaleMeasurement("t".to_string());
        assert_eq!(err.disposition(), Disposition::Acknowledge);
    }

    #[test]
    fn test_client_errors_are_rejected() {
        assert_eq!(
            Error::InvalidMeasurement("x".into()).disposition(),
            Disposition::Reject
        );
        assert_eq!(
            Error::DisallowedTaxonomyModification("x".into()).disposition(),
            Disposition::Reject
        );
        assert_eq!(
            Error::Serialization("x".into()).disposition(),
            Disposition::Reject
        );
    }

    #[test]
    fn test_storage_failures_are_retried() {
        assert_eq!(
            Error::Database(sqlx::Error::PoolTimedOut).disposition(),
            Disposition::Retry
        );
        assert_eq!(
            Error::Connection("down".into()).disposition(),
            Disposition::Retry
        );
    }

    #[test]
    fn test_inconsistent_taxonomy_alerts() {
        let err = Error::InconsistentTaxonomy("two taxonomies named x".to_string());
        assert_eq!(err.disposition(), Disposition::Alert);
        assert_eq!(err.kind(), "inconsistent_taxonomy");
    }

    #[test]
    fn test_from_serde_json_error() {
        let json_err = serde_json::from_str::<i32>("not a number");
        assert!(json_err.is_err());

        let err: Error = json_err.unwrap_err().into();
        match err {
            Error::Serialization(msg) => {
                assert!(!msg.is_empty());
            }
            _ => panic!("Expected Serialization error"),
        }
    }

    #[test]
    fn test_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "access denied");
        let err: Error = io_err.into();
        match err {
            Error::Io(_) => {}
            _ => panic!("Expected Io error"),
        }
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<Error>();
        assert_sync::<Error>();
    }
}
