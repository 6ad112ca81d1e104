//! Measurement timestamp parsing.

use chrono::{DateTime, NaiveDateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{Error, Result};

/// Accepted shape of `measured_at`: `YYYY-MM-DDTHH:MM:SS` with optional
/// fractional seconds. No offset; timestamps are UTC.
pub static MEASURED_AT_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[0-9]{4}-[0-9]{2}-[0-9]{2}T[0-9]{2}:[0-9]{2}:[0-9]{2}(?:\.[0-9]+)?$")
        .expect("static regex")
});

/// Parse a measurement timestamp into a UTC instant.
pub fn parse_timestamp(ts: &str) -> Result<DateTime<Utc>> {
    if !MEASURED_AT_PATTERN.is_match(ts) {
        return Err(Error::InvalidMeasurement(format!(
            "measured_at '{}' does not match YYYY-MM-DDTHH:MM:SS[.ffffff]",
            ts
        )));
    }

    let naive = NaiveDateTime::parse_from_str(ts, "%Y-%m-%dT%H:%M:%S%.f").map_err(|e| {
        Error::InvalidMeasurement(format!("could not parse timestamp '{}' - {}", ts, e))
    })?;

    Ok(naive.and_utc())
}

/// Render a timestamp the way measurements carry it, for log and error text.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.format("%Y-%m-%dT%H:%M:%S").to_string()
}
