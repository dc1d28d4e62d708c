//! Wall-clock helpers for control-file timestamps.
//!
//! Timestamps are written as RFC 3339 in UTC with second precision. Bare
//! integer epoch seconds are accepted on read so hand-edited or older
//! control files still parse.

use std::time::{Duration, SystemTime};

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};

/// A point in wall-clock time as stored in control files.
pub type Instant = DateTime<Utc>;

/// Returns the current wall-clock time, truncated to whole seconds.
///
/// Truncation keeps `parse_time(format_time(now()))` exact.
pub fn current_time() -> Instant {
    let now = Utc::now();
    Utc.timestamp_opt(now.timestamp(), 0).single().unwrap_or(now)
}

/// Formats an instant for a control file.
pub fn format_time(t: Instant) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Parses a control-file timestamp.
///
/// Accepts RFC 3339 or integer seconds since the Unix epoch.
pub fn parse_time(s: &str) -> Option<Instant> {
    let s = s.trim();
    if let Ok(t) = DateTime::parse_from_rfc3339(s) {
        return Some(t.with_timezone(&Utc));
    }
    s.parse::<i64>()
        .ok()
        .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
}

/// Converts a filesystem timestamp to an [`Instant`].
pub fn from_system_time(t: SystemTime) -> Instant {
    DateTime::<Utc>::from(t)
}

/// Returns how long ago `t` was relative to `now`, or `None` if `t` lies in
/// the future.
pub fn age(now: Instant, t: Instant) -> Option<Duration> {
    (now - t).to_std().ok()
}
