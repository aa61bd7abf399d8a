//! Timestamps for blocks, bundles, and file metadata.
//!
//! All persisted timestamps count seconds since 2001-01-01T00:00:00Z as
//! fractional seconds, which keeps bundle JSON compact and stable across
//! platforms.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Datelike, Months, Utc};

/// 2001-01-01T00:00:00Z expressed in Unix seconds.
pub const EPOCH_OFFSET_SECONDS: f64 = 978_307_200.0;

/// Current time as fractional seconds since the 2001 epoch.
pub fn now() -> f64 {
    from_system_time(SystemTime::now())
}

/// Convert a `SystemTime` to 2001-epoch seconds.
pub fn from_system_time(time: SystemTime) -> f64 {
    let unix = time
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0);
    unix - EPOCH_OFFSET_SECONDS
}

/// Convert 2001-epoch seconds back to a `SystemTime`.
pub fn to_system_time(timestamp: f64) -> SystemTime {
    UNIX_EPOCH + Duration::from_secs_f64((timestamp + EPOCH_OFFSET_SECONDS).max(0.0))
}

/// The `YYYY-MM` label of the calendar month `months_ago` whole months
/// before `when`, in UTC. Used to derive per-month backup target
/// identifiers.
pub fn month_label(when: DateTime<Utc>, months_ago: u32) -> String {
    let shifted = when
        .checked_sub_months(Months::new(months_ago))
        .unwrap_or(when);
    format!("{:04}-{:02}", shifted.year(), shifted.month())
}
