//! Measurement normalization and reconstruction
//!
//! This module contains the row model every vital-sign reading is stored in
//! and the engine that moves readings in and out of it:
//! - `schema`: which attributes each metric kind carries
//! - `decompose`: raw reading -> header + detail rows
//! - `reconstruct`: header + detail rows -> per-metric views
//! - `sleep`: sleep interval totals
//! - `summary`: one day of every metric for the dashboard
//!
//! Nothing here performs I/O or holds mutable state apart from the
//! sequence counter handed in by the caller.

pub mod decompose;
pub mod reconstruct;
pub mod schema;
pub mod sleep;
pub mod summary;

pub use decompose::{BatchDecomposition, BatchFailure, Decomposer, SequenceCounter};
pub use reconstruct::{ReconstructedView, Reconstructor, SleepView};
pub use schema::SchemaRegistry;
pub use sleep::{aggregate_sleep, SleepInterval, SleepTotal, TimeRange};
pub use summary::DailySummary;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Category of vital-sign measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MetricKind {
    BodyTemperature,
    BloodPressure,
    HeartRate,
    OxygenSaturation,
    StepCount,
    Sleep,
}

impl MetricKind {
    pub const ALL: [MetricKind; 6] = [
        MetricKind::BodyTemperature,
        MetricKind::BloodPressure,
        MetricKind::HeartRate,
        MetricKind::OxygenSaturation,
        MetricKind::StepCount,
        MetricKind::Sleep,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::BodyTemperature => "BODY_TEMPERATURE",
            MetricKind::BloodPressure => "BLOOD_PRESSURE",
            MetricKind::HeartRate => "HEART_RATE",
            MetricKind::OxygenSaturation => "OXYGEN_SATURATION",
            MetricKind::StepCount => "STEP_COUNT",
            MetricKind::Sleep => "SLEEP",
        }
    }

    /// Human-readable name used in response messages.
    pub fn label(&self) -> &'static str {
        match self {
            MetricKind::BodyTemperature => "body temperature",
            MetricKind::BloodPressure => "blood pressure",
            MetricKind::HeartRate => "heart rate",
            MetricKind::OxygenSaturation => "oxygen saturation",
            MetricKind::StepCount => "step count",
            MetricKind::Sleep => "sleep time",
        }
    }

    /// Resolve the short route segment clients use (`bt`, `bp`, `spO2`, ...).
    pub fn from_path_segment(segment: &str) -> Result<Self, EngineError> {
        match segment {
            "bt" => Ok(MetricKind::BodyTemperature),
            "bp" => Ok(MetricKind::BloodPressure),
            "hr" => Ok(MetricKind::HeartRate),
            "spO2" => Ok(MetricKind::OxygenSaturation),
            "step" | "stepCount" => Ok(MetricKind::StepCount),
            "sleep" | "sleepTime" => Ok(MetricKind::Sleep),
            other => Err(EngineError::UnknownMetricKind(other.to_string())),
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetricKind {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MetricKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| EngineError::UnknownMetricKind(s.to_string()))
    }
}

/// One named facet of a metric kind's schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttributeKind {
    SingleValue,
    MinBloodPressure,
    MaxBloodPressure,
    StepCount,
    Distance,
    SleepInterval,
}

impl AttributeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttributeKind::SingleValue => "SINGLE_VALUE",
            AttributeKind::MinBloodPressure => "MIN_BLOOD_PRESSURE",
            AttributeKind::MaxBloodPressure => "MAX_BLOOD_PRESSURE",
            AttributeKind::StepCount => "STEP_COUNT",
            AttributeKind::Distance => "DISTANCE",
            AttributeKind::SleepInterval => "SLEEP_INTERVAL",
        }
    }
}

impl fmt::Display for AttributeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Generated identity of one measurement event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResultSeq(pub u64);

impl fmt::Display for ResultSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Admission (quarantine / treatment-center stay) a result belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AdmissionId(String);

impl AdmissionId {
    pub fn new(id: impl Into<String>) -> Self {
        AdmissionId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AdmissionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AdmissionId {
    fn from(id: &str) -> Self {
        AdmissionId::new(id)
    }
}

/// Stored value of a detail row. Devices send either JSON numbers or
/// numeric strings, and whichever arrived is kept as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DetailValue {
    Number(f64),
    Text(String),
}

impl DetailValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            DetailValue::Number(n) => Some(*n),
            DetailValue::Text(s) => s.trim().parse().ok(),
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            DetailValue::Text(s) => Some(s),
            DetailValue::Number(_) => None,
        }
    }
}

impl fmt::Display for DetailValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DetailValue::Number(n) => write!(f, "{}", n),
            DetailValue::Text(s) => f.write_str(s),
        }
    }
}

/// Identity and timestamp of one measurement event. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultHeader {
    pub result_seq: ResultSeq,
    pub admission_id: AdmissionId,
    pub kind: MetricKind,
    pub captured_at: NaiveDateTime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
}

/// One attribute/value pair belonging to a header.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultDetailRow {
    pub result_seq: ResultSeq,
    pub attribute: AttributeKind,
    pub value: DetailValue,
}

/// A header together with its detail rows; the unit that is written atomically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredResult {
    pub header: ResultHeader,
    pub details: Vec<ResultDetailRow>,
}

impl StoredResult {
    /// Rows written for this result: the header plus every detail.
    pub fn affected_rows(&self) -> usize {
        1 + self.details.len()
    }
}

/// Field name -> raw JSON value, exactly as the client sent it.
pub type RawFields = serde_json::Map<String, serde_json::Value>;

/// One submitted reading before decomposition.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawReading {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_date_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(flatten)]
    pub fields: RawFields,
}

impl RawReading {
    pub fn new() -> Self {
        RawReading::default()
    }

    pub fn with_field(mut self, name: &str, value: impl Into<serde_json::Value>) -> Self {
        self.fields.insert(name.to_string(), value.into());
        self
    }

    pub fn captured_at(mut self, timestamp: &str) -> Self {
        self.result_date_time = Some(timestamp.to_string());
        self
    }

    pub fn device(mut self, device_id: &str) -> Self {
        self.device_id = Some(device_id.to_string());
        self
    }
}

const TIMESTAMP_FORMATS: [&str; 4] = [
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
];

/// Parse the timestamp spellings devices are known to send.
pub fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    TIMESTAMP_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EngineError {
    #[error("unknown metric kind: {0}")]
    UnknownMetricKind(String),

    #[error("metric kind {0} has no schema entry")]
    UnrecognizedMetricKind(MetricKind),

    #[error("{kind} reading is missing `{field}` ({attribute})")]
    MissingAttributeValue {
        kind: MetricKind,
        attribute: AttributeKind,
        field: String,
    },

    #[error("{kind} reading has an unusable `{field}` ({attribute}): {reason}")]
    InvalidAttributeValue {
        kind: MetricKind,
        attribute: AttributeKind,
        field: String,
        reason: String,
    },

    #[error("invalid timestamp in `{field}`: {value}")]
    InvalidTimestamp { field: String, value: String },

    #[error("invalid time range: {0}")]
    InvalidTimeRange(String),

    #[error("result {seq} ({kind}) does not match its schema: expected {expected:?}, found {found:?}")]
    SchemaMismatch {
        seq: ResultSeq,
        kind: MetricKind,
        expected: Vec<AttributeKind>,
        found: Vec<AttributeKind>,
    },

    #[error("result {seq} has a malformed {attribute} value: {value}")]
    MalformedValue {
        seq: ResultSeq,
        attribute: AttributeKind,
        value: String,
    },
}

impl EngineError {
    /// Errors caused by what the client sent, as opposed to corrupt stored rows.
    pub fn is_client_error(&self) -> bool {
        !matches!(
            self,
            EngineError::UnrecognizedMetricKind(_)
                | EngineError::SchemaMismatch { .. }
                | EngineError::MalformedValue { .. }
        )
    }
}
