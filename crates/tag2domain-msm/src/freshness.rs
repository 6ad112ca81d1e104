//! Maximum measurement age.

use chrono::{DateTime, Duration, Utc};

use tag2domain_core::temporal::format_timestamp;
use tag2domain_core::{Error, Result};

/// Rejects measurements older than a configured age. Disabled when no age
/// is set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FreshnessGuard {
    max_age: Option<Duration>,
}

impl FreshnessGuard {
    pub fn new(max_age: Option<Duration>) -> Self {
        Self { max_age }
    }

    /// Guard from a configured age in minutes. Ages that do not fit a
    /// [`Duration`] are a configuration error.
    pub fn from_minutes(minutes: Option<i64>) -> Result<Self> {
        let max_age = minutes
            .map(|m| {
                Duration::try_minutes(m).ok_or_else(|| {
                    Error::Config(format!("maximum measurement age of {} minutes is out of range", m))
                })
            })
            .transpose()?;
        Ok(Self::new(max_age))
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn max_age(&self) -> Option<Duration> {
        self.max_age
    }

    pub fn check_max_age(&self, measured_at: DateTime<Utc>) -> Result<()> {
        self.check_max_age_at(measured_at, Utc::now())
    }

    /// Same as [`check_max_age`](Self::check_max_age) against a fixed clock.
    /// A cutoff before the earliest representable time rejects nothing.
    pub fn check_max_age_at(&self, measured_at: DateTime<Utc>, now: DateTime<Utc>) -> Result<()> {
        let cutoff = self.max_age.and_then(|max_age| now.checked_sub_signed(max_age));
        match cutoff {
            Some(cutoff) if measured_at < cutoff => Err(Error::StaleMeasurement(format!(
                "received measurement with timestamp {} at time {}",
                format_timestamp(&measured_at),
                format_timestamp(&now)
            ))),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_disabled_accepts_anything() {
        let guard = FreshnessGuard::disabled();
        let ancient = Utc.with_ymd_and_hms(1999, 1, 1, 0, 0, 0).unwrap();
        assert!(guard.check_max_age_at(ancient, now()).is_ok());
    }

    #[test]
    fn test_within_max_age() {
        let guard = FreshnessGuard::from_minutes(Some(60)).unwrap();
        assert!(guard.check_max_age_at(now() - Duration::minutes(59), now()).is_ok());
        assert!(guard.check_max_age_at(now() - Duration::minutes(60), now()).is_ok());
    }

    #[test]
    fn test_older_than_max_age_is_stale() {
        let guard = FreshnessGuard::from_minutes(Some(60)).unwrap();
        let err = guard
            .check_max_age_at(now() - Duration::minutes(61), now())
            .unwrap_err();
        assert!(matches!(err, Error::StaleMeasurement(_)));
    }

    #[test]
    fn test_future_timestamps_pass() {
        let guard = FreshnessGuard::from_minutes(Some(1)).unwrap();
        assert!(guard.check_max_age_at(now() + Duration::hours(1), now()).is_ok());
    }

    #[test]
    fn test_out_of_range_age_is_config_error() {
        let err = FreshnessGuard::from_minutes(Some(i64::MAX)).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_age_beyond_calendar_range_rejects_nothing() {
        let guard = FreshnessGuard::from_minutes(Some(1_000_000_000_000)).unwrap();
        let ancient = Utc.with_ymd_and_hms(1, 1, 1, 0, 0, 0).unwrap();
        assert!(guard.check_max_age_at(ancient, now()).is_ok());
        assert!(guard.check_max_age(Utc::now()).is_ok());
    }
}
