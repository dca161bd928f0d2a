//! Sleep interval totals.
//!
//! Intervals that touch the queried range are counted whole and overlapping
//! sessions are not merged, so two devices reporting the same night count
//! twice. Totals are exposed in minutes and in whole hours.

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Serialize, Serializer};

use super::{parse_timestamp, EngineError};

const INTERVAL_SEPARATOR: char = '/';
const STORAGE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Closed time range `[start, end]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeRange {
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

impl TimeRange {
    pub fn new(start: NaiveDateTime, end: NaiveDateTime) -> Result<Self, EngineError> {
        if start > end {
            return Err(EngineError::InvalidTimeRange(format!(
                "start {} is after end {}",
                start, end
            )));
        }
        Ok(TimeRange { start, end })
    }

    /// Every second of one calendar day.
    pub fn day(date: NaiveDate) -> Self {
        let start = date.and_time(NaiveTime::MIN);
        let end = start + chrono::Duration::days(1) - chrono::Duration::seconds(1);
        TimeRange { start, end }
    }
}

/// One sleep session as reported by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SleepInterval {
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

impl SleepInterval {
    pub fn new(start: NaiveDateTime, end: NaiveDateTime) -> Option<Self> {
        (start <= end).then_some(SleepInterval { start, end })
    }

    pub fn minutes(&self) -> i64 {
        (self.end - self.start).num_minutes()
    }

    pub fn overlaps(&self, range: &TimeRange) -> bool {
        self.start <= range.end && self.end >= range.start
    }

    /// Detail-row encoding: ISO 8601 `start/end`.
    pub fn encode(&self) -> String {
        format!(
            "{}{}{}",
            self.start.format(STORAGE_FORMAT),
            INTERVAL_SEPARATOR,
            self.end.format(STORAGE_FORMAT)
        )
    }

    pub fn decode(raw: &str) -> Option<Self> {
        let (start, end) = raw.split_once(INTERVAL_SEPARATOR)?;
        SleepInterval::new(parse_timestamp(start)?, parse_timestamp(end)?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct SleepTotal {
    #[serde(rename = "totalSleepMinutes")]
    pub minutes: i64,
    #[serde(rename = "totalSleepTime", serialize_with = "hours_as_text")]
    pub hours: i64,
}

impl SleepTotal {
    pub fn from_minutes(minutes: i64) -> Self {
        SleepTotal {
            minutes,
            hours: minutes / 60,
        }
    }
}

// The dashboard reads the hour total as a string.
fn hours_as_text<S: Serializer>(hours: &i64, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&hours.to_string())
}

/// Sum the durations of every interval overlapping `range`.
pub fn aggregate_sleep(intervals: &[SleepInterval], range: &TimeRange) -> SleepTotal {
    let minutes = intervals
        .iter()
        .filter(|interval| interval.overlaps(range))
        .map(SleepInterval::minutes)
        .sum();
    SleepTotal::from_minutes(minutes)
}
