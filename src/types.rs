// =============================================================================
// Shared types used across the coinlake pipeline
// =============================================================================

use chrono::{DateTime, Datelike, Timelike, Utc};
use serde::{Deserialize, Serialize};

/// Seconds in one fetch window (windows are aligned UTC hours).
const WINDOW_SECS: i64 = 3600;

/// Natural key of a snapshot row: `(asset_id, observed_at)`.
pub type NaturalKey = (String, i64);

/// One aligned UTC-hour window of the data lake.
///
/// A window is identified by the four partition-key values
/// `year/month/day/hour`; internally it is stored as its start instant, so
/// an invalid combination of keys cannot be constructed. Serializes as the
/// RFC 3339 start instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FetchWindow {
    start: DateTime<Utc>,
}

impl FetchWindow {
    /// Window containing the given instant (floored to the UTC hour).
    pub fn containing(at: DateTime<Utc>) -> Self {
        let secs = at.timestamp();
        let floored = secs - secs.rem_euclid(WINDOW_SECS);
        Self {
            start: DateTime::from_timestamp(floored, 0).unwrap_or(at),
        }
    }

    /// The window one hour before the one containing `now`.
    ///
    /// For `now` strictly inside an hour this is the most recent window whose
    /// end is already in the past.  For `now` exactly on an hour boundary the
    /// returned window ends at `now`, which `is_complete` still refuses; the
    /// caller is expected to retry once the boundary instant has elapsed.
    pub fn previous_completed(now: DateTime<Utc>) -> Self {
        let current = Self::containing(now);
        Self {
            start: current.start - chrono::Duration::seconds(WINDOW_SECS),
        }
    }

    /// The window immediately after this one.
    pub fn next(&self) -> Self {
        Self { start: self.end() }
    }

    /// Inclusive start of the window.
    #[cfg(test)]
    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    /// Exclusive end of the window (start of the next hour).
    pub fn end(&self) -> DateTime<Utc> {
        self.start + chrono::Duration::seconds(WINDOW_SECS)
    }

    /// Whether the window is fully in the past at `now`.
    ///
    /// The end boundary must be strictly before `now`; the window containing
    /// `now` is never complete, and neither is a window ending exactly at
    /// `now` (a fetch could still land on the boundary instant).
    pub fn is_complete(&self, now: DateTime<Utc>) -> bool {
        self.end() < now
    }

    pub fn year(&self) -> i32 {
        self.start.year()
    }

    pub fn month(&self) -> u32 {
        self.start.month()
    }

    pub fn day(&self) -> u32 {
        self.start.day()
    }

    pub fn hour(&self) -> u32 {
        self.start.hour()
    }

    /// Hive-style relative partition path, e.g. `year=2025/month=09/day=08/hour=02`.
    pub fn partition_path(&self) -> String {
        format!(
            "year={:04}/month={:02}/day={:02}/hour={:02}",
            self.year(),
            self.month(),
            self.day(),
            self.hour()
        )
    }

    /// RFC 3339 start instant, used as the `source_fetch_window` column value.
    pub fn label(&self) -> String {
        self.start.format("%Y-%m-%dT%H:%M:%SZ").to_string()
    }

    /// Parse the CLI form `YYYY-MM-DDTHH`, e.g. `2025-09-08T02`.
    pub fn parse(s: &str) -> Result<Self, String> {
        let naive = chrono::NaiveDateTime::parse_from_str(&format!("{s}:00:00"), "%Y-%m-%dT%H:%M:%S")
            .map_err(|e| format!("invalid window '{s}' (expected YYYY-MM-DDTHH): {e}"))?;
        Ok(Self {
            start: DateTime::from_naive_utc_and_offset(naive, Utc),
        })
    }
}

impl std::fmt::Display for FetchWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.start.format("%Y-%m-%dT%H"))
    }
}
