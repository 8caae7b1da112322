//! # RFC3339 Timestamps
//!
//! Conversions between unix timestamps and RFC3339 strings, as stored in the
//! `time_created` / `time_uploaded` fields of habitat documents.

use chrono::{DateTime, Local, SecondsFormat, TimeZone, Utc};

use crate::error::{HabitatError, Result};

/// Current unix timestamp
pub fn now() -> i64 {
    Utc::now().timestamp()
}

/// Is `rfc3339` a valid RFC3339 date-time?
pub fn validate_rfc3339(rfc3339: &str) -> bool {
    DateTime::parse_from_rfc3339(rfc3339).is_ok()
}

/// Parse an RFC3339 string into a unix timestamp (fractions are dropped)
///
/// # Examples
///
/// ```
/// use habitat_listener::rfc3339::rfc3339_to_timestamp;
///
/// assert_eq!(rfc3339_to_timestamp("1970-01-01T01:00:00+01:00").unwrap(), 0);
/// ```
pub fn rfc3339_to_timestamp(rfc3339: &str) -> Result<i64> {
    DateTime::parse_from_rfc3339(rfc3339)
        .map(|dt| dt.timestamp())
        .map_err(|e| HabitatError::Time(format!("invalid RFC3339 '{}': {}", rfc3339, e)))
}

/// Format `timestamp` in UTC, with a `Z` suffix
pub fn timestamp_to_rfc3339_utcoffset(timestamp: i64) -> Result<String> {
    Utc.timestamp_opt(timestamp, 0)
        .single()
        .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Secs, true))
        .ok_or_else(|| out_of_range(timestamp))
}

/// Format `timestamp` in the local timezone, with its numeric offset
pub fn timestamp_to_rfc3339_localoffset(timestamp: i64) -> Result<String> {
    Local
        .timestamp_opt(timestamp, 0)
        .single()
        .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Secs, false))
        .ok_or_else(|| out_of_range(timestamp))
}

/// Current time in UTC
pub fn now_to_rfc3339_utcoffset() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Current time in the local timezone
pub fn now_to_rfc3339_localoffset() -> String {
    Local::now().to_rfc3339_opts(SecondsFormat::Secs, false)
}

fn out_of_range(timestamp: i64) -> HabitatError {
    HabitatError::Time(format!("timestamp {} out of range", timestamp))
}
