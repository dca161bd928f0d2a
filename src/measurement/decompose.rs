//! Raw reading -> header + detail rows.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::NaiveDateTime;
use serde_json::Value;
use tracing::debug;

use super::schema::{FieldMapping, FieldSource, SchemaRegistry};
use super::sleep::SleepInterval;
use super::{
    parse_timestamp, AdmissionId, AttributeKind, DetailValue, EngineError, MetricKind,
    RawReading, ResultDetailRow, ResultHeader, ResultSeq, StoredResult,
};

/// Source of result sequence ids, shared by every writer of one store.
#[derive(Debug, Default)]
pub struct SequenceCounter {
    last: AtomicU64,
}

impl SequenceCounter {
    /// A counter whose first id is `last + 1`.
    pub fn starting_after(last: u64) -> Self {
        SequenceCounter {
            last: AtomicU64::new(last),
        }
    }

    pub fn next(&self) -> ResultSeq {
        ResultSeq(self.last.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// Make sure ids already handed out (e.g. replayed from disk) are never reissued.
    pub fn advance_past(&self, seq: ResultSeq) {
        self.last.fetch_max(seq.0, Ordering::SeqCst);
    }

    pub fn last(&self) -> ResultSeq {
        ResultSeq(self.last.load(Ordering::SeqCst))
    }
}

/// A reading of a batch that could not be decomposed.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchFailure {
    pub index: usize,
    pub error: EngineError,
}

/// Per-item outcome of a batch; failures do not discard the successes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchDecomposition {
    pub decomposed: Vec<StoredResult>,
    pub failures: Vec<BatchFailure>,
}

impl BatchDecomposition {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Decomposer<'r> {
    registry: &'r SchemaRegistry,
}

impl<'r> Decomposer<'r> {
    pub fn new(registry: &'r SchemaRegistry) -> Self {
        Decomposer { registry }
    }

    /// Split one reading into a header and one detail row per schema attribute.
    ///
    /// `default_captured_at` is used when the reading carries no
    /// `resultDateTime`; sleep readings fall back to the interval start first.
    /// A sequence id is only taken once every attribute has been extracted.
    pub fn decompose(
        &self,
        kind: MetricKind,
        reading: &RawReading,
        admission_id: &AdmissionId,
        default_captured_at: NaiveDateTime,
        sequence: &SequenceCounter,
    ) -> Result<StoredResult, EngineError> {
        let mappings = self.registry.ordered_mappings(kind)?;

        let mut values = Vec::with_capacity(mappings.len());
        let mut interval_start = None;
        for mapping in &mappings {
            let (value, start) = extract(kind, mapping, reading)?;
            interval_start = interval_start.or(start);
            values.push((mapping.attribute, value));
        }

        let captured_at = match reading.result_date_time.as_deref() {
            Some(raw) => parse_timestamp(raw).ok_or_else(|| EngineError::InvalidTimestamp {
                field: "resultDateTime".to_string(),
                value: raw.to_string(),
            })?,
            None => interval_start.unwrap_or(default_captured_at),
        };

        let result_seq = sequence.next();
        let header = ResultHeader {
            result_seq,
            admission_id: admission_id.clone(),
            kind,
            captured_at,
            device_id: reading.device_id.clone(),
        };
        let details = values
            .into_iter()
            .map(|(attribute, value)| ResultDetailRow {
                result_seq,
                attribute,
                value,
            })
            .collect::<Vec<_>>();

        debug!(%kind, seq = %result_seq, details = details.len(), "decomposed reading");
        Ok(StoredResult { header, details })
    }

    /// Decompose each reading independently, keeping successes next to failures.
    pub fn decompose_batch(
        &self,
        kind: MetricKind,
        readings: &[RawReading],
        admission_id: &AdmissionId,
        default_captured_at: NaiveDateTime,
        sequence: &SequenceCounter,
    ) -> BatchDecomposition {
        let mut batch = BatchDecomposition::default();
        for (index, reading) in readings.iter().enumerate() {
            match self.decompose(kind, reading, admission_id, default_captured_at, sequence) {
                Ok(result) => batch.decomposed.push(result),
                Err(error) => batch.failures.push(BatchFailure { index, error }),
            }
        }
        batch
    }
}

/// Pull one attribute's value out of the raw fields. Also returns the
/// interval start for interval-sourced attributes.
fn extract(
    kind: MetricKind,
    mapping: &FieldMapping,
    reading: &RawReading,
) -> Result<(DetailValue, Option<NaiveDateTime>), EngineError> {
    match mapping.source {
        FieldSource::Scalar(field) => {
            let value = scalar(kind, mapping.attribute, field, reading)?;
            Ok((value, None))
        }
        FieldSource::Interval { start, end } => {
            let start_at = timestamp(kind, mapping.attribute, start, reading)?;
            let end_at = timestamp(kind, mapping.attribute, end, reading)?;
            let interval = SleepInterval::new(start_at, end_at).ok_or_else(|| {
                EngineError::InvalidAttributeValue {
                    kind,
                    attribute: mapping.attribute,
                    field: end.to_string(),
                    reason: "interval ends before it starts".to_string(),
                }
            })?;
            Ok((DetailValue::Text(interval.encode()), Some(start_at)))
        }
    }
}

fn scalar(
    kind: MetricKind,
    attribute: AttributeKind,
    field: &str,
    reading: &RawReading,
) -> Result<DetailValue, EngineError> {
    let missing = || EngineError::MissingAttributeValue {
        kind,
        attribute,
        field: field.to_string(),
    };

    match reading.fields.get(field) {
        None | Some(Value::Null) => Err(missing()),
        Some(Value::String(s)) if s.trim().is_empty() => Err(missing()),
        Some(Value::String(s)) => Ok(DetailValue::Text(s.clone())),
        Some(Value::Number(n)) => n.as_f64().map(DetailValue::Number).ok_or_else(|| {
            EngineError::InvalidAttributeValue {
                kind,
                attribute,
                field: field.to_string(),
                reason: format!("{} is out of range", n),
            }
        }),
        Some(other) => Err(EngineError::InvalidAttributeValue {
            kind,
            attribute,
            field: field.to_string(),
            reason: format!("expected a number or string, got {}", other),
        }),
    }
}

fn timestamp(
    kind: MetricKind,
    attribute: AttributeKind,
    field: &str,
    reading: &RawReading,
) -> Result<NaiveDateTime, EngineError> {
    match scalar(kind, attribute, field, reading)? {
        DetailValue::Text(raw) => parse_timestamp(&raw).ok_or(EngineError::InvalidTimestamp {
            field: field.to_string(),
            value: raw,
        }),
        DetailValue::Number(n) => Err(EngineError::InvalidTimestamp {
            field: field.to_string(),
            value: n.to_string(),
        }),
    }
}
