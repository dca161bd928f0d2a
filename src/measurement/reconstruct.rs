//! Header + detail rows -> per-metric views.
//!
//! Detail rows are regrouped by sequence id before projection, so rows that
//! were filed under the wrong header are caught as a schema mismatch rather
//! than silently attached. Views serialize with the field names the
//! dashboard client expects.

use std::collections::BTreeMap;

use chrono::NaiveDateTime;
use serde::Serialize;
use tracing::debug;

use super::schema::SchemaRegistry;
use super::sleep::{aggregate_sleep, SleepInterval, SleepTotal, TimeRange};
use super::{
    AttributeKind, DetailValue, EngineError, MetricKind, ResultDetailRow, ResultHeader,
    ResultSeq, StoredResult,
};

/// Body temperature, heart rate and oxygen saturation entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SingleValueEntry {
    pub result_seq: ResultSeq,
    pub result_date_time: NaiveDateTime,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    pub result: DetailValue,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BloodPressureEntry {
    pub result_seq: ResultSeq,
    pub result_date_time: NaiveDateTime,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    /// MIN_BLOOD_PRESSURE
    pub result_sbp: DetailValue,
    /// MAX_BLOOD_PRESSURE
    pub result_dbp: DetailValue,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepCountEntry {
    pub result_seq: ResultSeq,
    pub result_date_time: NaiveDateTime,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    pub result_step_count: DetailValue,
    pub result_distance: DetailValue,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SleepEntry {
    pub result_seq: ResultSeq,
    pub result_date_time: NaiveDateTime,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    pub result_start_date_time: NaiveDateTime,
    pub result_end_date_time: NaiveDateTime,
    pub sleep_minutes: i64,
}

impl SleepEntry {
    pub fn interval(&self) -> SleepInterval {
        SleepInterval {
            start: self.result_start_date_time,
            end: self.result_end_date_time,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SleepView {
    pub sleep_time_list: Vec<SleepEntry>,
    #[serde(flatten)]
    pub total: SleepTotal,
}

impl SleepView {
    fn from_entries(entries: Vec<SleepEntry>) -> Self {
        let total = entries.iter().map(|entry| entry.sleep_minutes).sum();
        SleepView {
            sleep_time_list: entries,
            total: SleepTotal::from_minutes(total),
        }
    }

    /// Keep only sessions touching `range` and total them.
    pub fn within(self, range: &TimeRange) -> Self {
        let entries: Vec<SleepEntry> = self
            .sleep_time_list
            .into_iter()
            .filter(|entry| entry.interval().overlaps(range))
            .collect();
        let intervals: Vec<SleepInterval> = entries.iter().map(SleepEntry::interval).collect();
        SleepView {
            total: aggregate_sleep(&intervals, range),
            sleep_time_list: entries,
        }
    }
}

/// Per-metric shape returned to callers. Built per query, never stored.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ReconstructedView {
    BodyTemperature {
        #[serde(rename = "btList")]
        readings: Vec<SingleValueEntry>,
    },
    HeartRate {
        #[serde(rename = "hrList")]
        readings: Vec<SingleValueEntry>,
    },
    OxygenSaturation {
        #[serde(rename = "spO2List")]
        readings: Vec<SingleValueEntry>,
    },
    BloodPressure {
        #[serde(rename = "bpList")]
        readings: Vec<BloodPressureEntry>,
    },
    StepCount {
        #[serde(rename = "stepCountList")]
        readings: Vec<StepCountEntry>,
    },
    Sleep(SleepView),
}

impl ReconstructedView {
    pub fn empty(kind: MetricKind) -> Self {
        match kind {
            MetricKind::BodyTemperature => ReconstructedView::BodyTemperature { readings: vec![] },
            MetricKind::HeartRate => ReconstructedView::HeartRate { readings: vec![] },
            MetricKind::OxygenSaturation => ReconstructedView::OxygenSaturation { readings: vec![] },
            MetricKind::BloodPressure => ReconstructedView::BloodPressure { readings: vec![] },
            MetricKind::StepCount => ReconstructedView::StepCount { readings: vec![] },
            MetricKind::Sleep => ReconstructedView::Sleep(SleepView::default()),
        }
    }

    pub fn kind(&self) -> MetricKind {
        match self {
            ReconstructedView::BodyTemperature { .. } => MetricKind::BodyTemperature,
            ReconstructedView::HeartRate { .. } => MetricKind::HeartRate,
            ReconstructedView::OxygenSaturation { .. } => MetricKind::OxygenSaturation,
            ReconstructedView::BloodPressure { .. } => MetricKind::BloodPressure,
            ReconstructedView::StepCount { .. } => MetricKind::StepCount,
            ReconstructedView::Sleep(_) => MetricKind::Sleep,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            ReconstructedView::BodyTemperature { readings }
            | ReconstructedView::HeartRate { readings }
            | ReconstructedView::OxygenSaturation { readings } => readings.len(),
            ReconstructedView::BloodPressure { readings } => readings.len(),
            ReconstructedView::StepCount { readings } => readings.len(),
            ReconstructedView::Sleep(view) => view.sleep_time_list.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Restrict a sleep view to `range`; other kinds are returned unchanged.
    pub fn within(self, range: &TimeRange) -> Self {
        match self {
            ReconstructedView::Sleep(view) => ReconstructedView::Sleep(view.within(range)),
            other => other,
        }
    }
}

/// Attribute -> value for one header, already checked against the schema.
struct Attributes<'a> {
    header: &'a ResultHeader,
    values: BTreeMap<AttributeKind, &'a DetailValue>,
}

impl<'a> Attributes<'a> {
    fn take(&self, attribute: AttributeKind) -> Result<DetailValue, EngineError> {
        self.values
            .get(&attribute)
            .map(|value| (*value).clone())
            .ok_or_else(|| self.mismatch(vec![attribute]))
    }

    fn mismatch(&self, expected: Vec<AttributeKind>) -> EngineError {
        EngineError::SchemaMismatch {
            seq: self.header.result_seq,
            kind: self.header.kind,
            expected,
            found: self.values.keys().copied().collect(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Reconstructor<'r> {
    registry: &'r SchemaRegistry,
}

impl<'r> Reconstructor<'r> {
    pub fn new(registry: &'r SchemaRegistry) -> Self {
        Reconstructor { registry }
    }

    /// Rebuild the `kind` view from stored results.
    ///
    /// Empty input is not an error. Any header whose detail rows differ from
    /// the schema (missing, extra or duplicate attributes) fails the whole
    /// call with `SchemaMismatch`.
    pub fn reconstruct(
        &self,
        kind: MetricKind,
        rows: &[StoredResult],
    ) -> Result<ReconstructedView, EngineError> {
        let schema = self.registry.schema_for(kind)?;
        let groups = group_by_header(kind, schema, rows)?;

        let mut checked = Vec::with_capacity(groups.len());
        for (header, details) in groups {
            checked.push(check_schema(kind, schema, header, details)?);
        }
        checked.sort_by_key(|group| (group.header.captured_at, group.header.result_seq));

        debug!(%kind, headers = checked.len(), "reconstructing view");

        let view = match kind {
            MetricKind::BodyTemperature => ReconstructedView::BodyTemperature {
                readings: single_values(&checked)?,
            },
            MetricKind::HeartRate => ReconstructedView::HeartRate {
                readings: single_values(&checked)?,
            },
            MetricKind::OxygenSaturation => ReconstructedView::OxygenSaturation {
                readings: single_values(&checked)?,
            },
            MetricKind::BloodPressure => ReconstructedView::BloodPressure {
                readings: checked
                    .iter()
                    .map(|group| -> Result<BloodPressureEntry, EngineError> {
                        Ok(BloodPressureEntry {
                            result_seq: group.header.result_seq,
                            result_date_time: group.header.captured_at,
                            device_id: group.header.device_id.clone(),
                            result_sbp: group.take(AttributeKind::MinBloodPressure)?,
                            result_dbp: group.take(AttributeKind::MaxBloodPressure)?,
                        })
                    })
                    .collect::<Result<_, EngineError>>()?,
            },
            MetricKind::StepCount => ReconstructedView::StepCount {
                readings: checked
                    .iter()
                    .map(|group| -> Result<StepCountEntry, EngineError> {
                        Ok(StepCountEntry {
                            result_seq: group.header.result_seq,
                            result_date_time: group.header.captured_at,
                            device_id: group.header.device_id.clone(),
                            result_step_count: group.take(AttributeKind::StepCount)?,
                            result_distance: group.take(AttributeKind::Distance)?,
                        })
                    })
                    .collect::<Result<_, EngineError>>()?,
            },
            MetricKind::Sleep => ReconstructedView::Sleep(SleepView::from_entries(
                checked.iter().map(sleep_entry).collect::<Result<_, EngineError>>()?,
            )),
        };
        Ok(view)
    }
}

/// Regroup every detail row under the header with the same sequence id.
fn group_by_header<'a>(
    kind: MetricKind,
    schema: &[AttributeKind],
    rows: &'a [StoredResult],
) -> Result<Vec<(&'a ResultHeader, Vec<&'a ResultDetailRow>)>, EngineError> {
    let mut groups: BTreeMap<ResultSeq, (&'a ResultHeader, Vec<&'a ResultDetailRow>)> =
        rows.iter()
            .map(|row| (row.header.result_seq, (&row.header, Vec::new())))
            .collect();

    for detail in rows.iter().flat_map(|row| row.details.iter()) {
        match groups.get_mut(&detail.result_seq) {
            Some((_, details)) => details.push(detail),
            None => {
                return Err(EngineError::SchemaMismatch {
                    seq: detail.result_seq,
                    kind,
                    expected: schema.to_vec(),
                    found: vec![detail.attribute],
                })
            }
        }
    }

    Ok(groups.into_values().collect())
}

fn check_schema<'a>(
    kind: MetricKind,
    schema: &[AttributeKind],
    header: &'a ResultHeader,
    details: Vec<&'a ResultDetailRow>,
) -> Result<Attributes<'a>, EngineError> {
    let found: Vec<AttributeKind> = details.iter().map(|detail| detail.attribute).collect();
    let mismatch = || EngineError::SchemaMismatch {
        seq: header.result_seq,
        kind: header.kind,
        expected: schema.to_vec(),
        found: found.clone(),
    };

    if header.kind != kind {
        return Err(mismatch());
    }

    let mut values = BTreeMap::new();
    for detail in &details {
        if values.insert(detail.attribute, &detail.value).is_some() {
            return Err(mismatch());
        }
    }

    let mut expected = schema.to_vec();
    expected.sort();
    if !values.keys().copied().eq(expected.into_iter()) {
        return Err(mismatch());
    }

    Ok(Attributes { header, values })
}

fn single_values(groups: &[Attributes<'_>]) -> Result<Vec<SingleValueEntry>, EngineError> {
    groups
        .iter()
        .map(|group| -> Result<SingleValueEntry, EngineError> {
            Ok(SingleValueEntry {
                result_seq: group.header.result_seq,
                result_date_time: group.header.captured_at,
                device_id: group.header.device_id.clone(),
                result: group.take(AttributeKind::SingleValue)?,
            })
        })
        .collect()
}

fn sleep_entry(group: &Attributes<'_>) -> Result<SleepEntry, EngineError> {
    let raw = group.take(AttributeKind::SleepInterval)?;
    let interval = raw
        .as_text()
        .and_then(SleepInterval::decode)
        .ok_or_else(|| EngineError::MalformedValue {
            seq: group.header.result_seq,
            attribute: AttributeKind::SleepInterval,
            value: raw.to_string(),
        })?;

    Ok(SleepEntry {
        result_seq: group.header.result_seq,
        result_date_time: group.header.captured_at,
        device_id: group.header.device_id.clone(),
        result_start_date_time: interval.start,
        result_end_date_time: interval.end,
        sleep_minutes: interval.minutes(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::measurement::decompose::{Decomposer, SequenceCounter};
    use crate::measurement::{parse_timestamp, AdmissionId, RawReading};
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn registry() -> &'static SchemaRegistry {
        SchemaRegistry::standard()
    }

    fn store(kind: MetricKind, readings: &[RawReading]) -> Vec<StoredResult> {
        let sequence = SequenceCounter::default();
        let decomposer = Decomposer::new(registry());
        readings
            .iter()
            .map(|reading| {
                decomposer
                    .decompose(
                        kind,
                        reading,
                        &AdmissionId::new("A-0001"),
                        parse_timestamp("2022-03-01 12:00").unwrap(),
                        &sequence,
                    )
                    .unwrap()
            })
            .collect()
    }

    #[test]
    fn empty_input_is_an_empty_view() {
        for kind in MetricKind::ALL {
            let view = Reconstructor::new(registry()).reconstruct(kind, &[]).unwrap();
            assert!(view.is_empty());
            assert_eq!(view, ReconstructedView::empty(kind));
        }
    }

    #[test]
    fn blood_pressure_pairs_min_and_max() {
        let rows = store(
            MetricKind::BloodPressure,
            &[RawReading::new().with_field("resultSbp", 80).with_field("resultDbp", 120)],
        );

        let view = Reconstructor::new(registry())
            .reconstruct(MetricKind::BloodPressure, &rows)
            .unwrap();

        match view {
            ReconstructedView::BloodPressure { readings } => {
                assert_eq!(readings.len(), 1);
                assert_eq!(readings[0].result_sbp, DetailValue::Number(80.0));
                assert_eq!(readings[0].result_dbp, DetailValue::Number(120.0));
            }
            other => panic!("unexpected view {:?}", other),
        }
    }

    #[test]
    fn readings_are_ordered_by_capture_time() {
        let rows = store(
            MetricKind::HeartRate,
            &[
                RawReading::new().with_field("result", 80).captured_at("2022-03-01 10:00"),
                RawReading::new().with_field("result", 70).captured_at("2022-03-01 08:00"),
            ],
        );

        let view = Reconstructor::new(registry())
            .reconstruct(MetricKind::HeartRate, &rows)
            .unwrap();

        let json = serde_json::to_value(&view).unwrap();
        assert_eq!(json["hrList"][0]["result"], serde_json::json!(70.0));
        assert_eq!(json["hrList"][1]["result"], serde_json::json!(80.0));
        assert_eq!(json["hrList"][0]["resultSeq"], serde_json::json!(2));
    }

    #[test]
    fn sleep_view_totals_every_interval() {
        let rows = store(
            MetricKind::Sleep,
            &[
                RawReading::new()
                    .with_field("resultStartDateTime", "2022-03-01 00:00")
                    .with_field("resultEndDateTime", "2022-03-01 01:30"),
                RawReading::new()
                    .with_field("resultStartDateTime", "2022-03-01 03:00")
                    .with_field("resultEndDateTime", "2022-03-01 03:45"),
                RawReading::new()
                    .with_field("resultStartDateTime", "2022-03-01 13:00")
                    .with_field("resultEndDateTime", "2022-03-01 15:00"),
            ],
        );

        let view = Reconstructor::new(registry())
            .reconstruct(MetricKind::Sleep, &rows)
            .unwrap();

        let ReconstructedView::Sleep(sleep) = view else {
            panic!("expected a sleep view");
        };
        assert_eq!(sleep.total, SleepTotal { minutes: 255, hours: 4 });
        assert_eq!(
            sleep.sleep_time_list.iter().map(|e| e.sleep_minutes).collect::<Vec<_>>(),
            vec![90, 45, 120]
        );

        let afternoon = TimeRange::new(
            parse_timestamp("2022-03-01 12:00").unwrap(),
            parse_timestamp("2022-03-01 23:59").unwrap(),
        )
        .unwrap();
        let narrowed = sleep.within(&afternoon);
        assert_eq!(narrowed.sleep_time_list.len(), 1);
        assert_eq!(narrowed.total, SleepTotal { minutes: 120, hours: 2 });
    }

    #[test]
    fn missing_detail_is_a_schema_mismatch() {
        let mut rows = store(
            MetricKind::StepCount,
            &[RawReading::new().with_field("resultStepCount", 10).with_field("resultDistance", 0.1)],
        );
        rows[0].details.pop();

        let err = Reconstructor::new(registry())
            .reconstruct(MetricKind::StepCount, &rows)
            .unwrap_err();

        assert_eq!(
            err,
            EngineError::SchemaMismatch {
                seq: ResultSeq(1),
                kind: MetricKind::StepCount,
                expected: vec![AttributeKind::StepCount, AttributeKind::Distance],
                found: vec![AttributeKind::StepCount],
            }
        );
    }

    #[test]
    fn duplicate_and_extra_details_are_rejected() {
        let mut duplicated = store(MetricKind::HeartRate, &[RawReading::new().with_field("result", 60)]);
        let copy = duplicated[0].details[0].clone();
        duplicated[0].details.push(copy);

        let mut extra = store(MetricKind::HeartRate, &[RawReading::new().with_field("result", 60)]);
        let seq = extra[0].header.result_seq;
        extra[0].details.push(ResultDetailRow {
            result_seq: seq,
            attribute: AttributeKind::Distance,
            value: DetailValue::Number(1.0),
        });

        let reconstructor = Reconstructor::new(registry());
        for rows in [duplicated, extra] {
            assert!(matches!(
                reconstructor.reconstruct(MetricKind::HeartRate, &rows),
                Err(EngineError::SchemaMismatch { .. })
            ));
        }
    }

    #[test]
    fn misfiled_details_are_regrouped_by_sequence() {
        let mut rows = store(
            MetricKind::BodyTemperature,
            &[
                RawReading::new().with_field("result", 36.5),
                RawReading::new().with_field("result", 37.1),
            ],
        );
        // Move the second header's detail under the first header.
        let moved = rows[1].details.pop().unwrap();
        rows[0].details.push(moved);

        let view = Reconstructor::new(registry())
            .reconstruct(MetricKind::BodyTemperature, &rows)
            .unwrap();
        assert_eq!(view.len(), 2);
    }

    #[test]
    fn orphan_details_are_rejected() {
        let mut rows = store(MetricKind::HeartRate, &[RawReading::new().with_field("result", 60)]);
        rows[0].details[0].result_seq = ResultSeq(99);

        assert!(matches!(
            Reconstructor::new(registry()).reconstruct(MetricKind::HeartRate, &rows),
            Err(EngineError::SchemaMismatch { seq: ResultSeq(99), .. })
        ));
    }

    #[test]
    fn wrong_kind_headers_are_rejected() {
        let rows = store(MetricKind::HeartRate, &[RawReading::new().with_field("result", 60)]);
        assert!(matches!(
            Reconstructor::new(registry()).reconstruct(MetricKind::OxygenSaturation, &rows),
            Err(EngineError::SchemaMismatch { .. })
        ));
    }

    #[test]
    fn unparseable_sleep_interval_is_malformed() {
        let mut rows = store(
            MetricKind::Sleep,
            &[RawReading::new()
                .with_field("resultStartDateTime", "2022-03-01 00:00")
                .with_field("resultEndDateTime", "2022-03-01 01:30")],
        );
        rows[0].details[0].value = DetailValue::Number(90.0);

        assert!(matches!(
            Reconstructor::new(registry()).reconstruct(MetricKind::Sleep, &rows),
            Err(EngineError::MalformedValue { .. })
        ));
    }

    fn scalar() -> impl Strategy<Value = serde_json::Value> {
        prop_oneof![
            (0u32..100_000).prop_map(serde_json::Value::from),
            (0.0f64..1000.0).prop_map(serde_json::Value::from),
            "[0-9]{1,3}\\.[0-9]".prop_map(serde_json::Value::from),
        ]
    }

    fn reading_for(kind: MetricKind) -> BoxedStrategy<RawReading> {
        match kind {
            MetricKind::BloodPressure => (scalar(), scalar())
                .prop_map(|(min, max)| {
                    RawReading::new().with_field("resultSbp", min).with_field("resultDbp", max)
                })
                .boxed(),
            MetricKind::StepCount => (scalar(), scalar())
                .prop_map(|(count, distance)| {
                    RawReading::new()
                        .with_field("resultStepCount", count)
                        .with_field("resultDistance", distance)
                })
                .boxed(),
            MetricKind::Sleep => (0i64..600, 0i64..900)
                .prop_map(|(offset, length)| {
                    let start = parse_timestamp("2022-03-01 00:00").unwrap()
                        + chrono::Duration::minutes(offset);
                    let end = start + chrono::Duration::minutes(length);
                    RawReading::new()
                        .with_field("resultStartDateTime", start.format("%Y-%m-%d %H:%M").to_string())
                        .with_field("resultEndDateTime", end.format("%Y-%m-%d %H:%M").to_string())
                })
                .boxed(),
            _ => scalar()
                .prop_map(|value| RawReading::new().with_field("result", value))
                .boxed(),
        }
    }

    fn as_detail(value: &serde_json::Value) -> DetailValue {
        serde_json::from_value(value.clone()).unwrap()
    }

    fn any_kind_and_reading() -> impl Strategy<Value = (MetricKind, RawReading)> {
        proptest::sample::select(MetricKind::ALL.to_vec())
            .prop_flat_map(|kind| reading_for(kind).prop_map(move |reading| (kind, reading)))
    }

    proptest! {
        #[test]
        fn decomposed_headers_carry_exactly_their_schema((kind, reading) in any_kind_and_reading()) {
            let rows = store(kind, &[reading]);
            let mut found: Vec<_> = rows[0].details.iter().map(|d| d.attribute).collect();
            let mut expected = registry().schema_for(kind).unwrap().to_vec();
            found.sort();
            expected.sort();
            prop_assert_eq!(found, expected);
        }

        #[test]
        fn reconstruction_returns_the_submitted_values((kind, reading) in any_kind_and_reading()) {
            let rows = store(kind, &[reading.clone()]);
            let view = Reconstructor::new(registry()).reconstruct(kind, &rows).unwrap();
            prop_assert_eq!(view.len(), 1);

            let field = |name: &str| as_detail(&reading.fields[name]);
            match view {
                ReconstructedView::BodyTemperature { readings }
                | ReconstructedView::HeartRate { readings }
                | ReconstructedView::OxygenSaturation { readings } => {
                    prop_assert_eq!(&readings[0].result, &field("result"));
                }
                ReconstructedView::BloodPressure { readings } => {
                    prop_assert_eq!(&readings[0].result_sbp, &field("resultSbp"));
                    prop_assert_eq!(&readings[0].result_dbp, &field("resultDbp"));
                }
                ReconstructedView::StepCount { readings } => {
                    prop_assert_eq!(&readings[0].result_step_count, &field("resultStepCount"));
                    prop_assert_eq!(&readings[0].result_distance, &field("resultDistance"));
                }
                ReconstructedView::Sleep(sleep) => {
                    let entry = &sleep.sleep_time_list[0];
                    let start = parse_timestamp(reading.fields["resultStartDateTime"].as_str().unwrap());
                    let end = parse_timestamp(reading.fields["resultEndDateTime"].as_str().unwrap());
                    prop_assert_eq!(Some(entry.result_start_date_time), start);
                    prop_assert_eq!(Some(entry.result_end_date_time), end);
                    prop_assert_eq!(sleep.total.minutes, entry.sleep_minutes);
                }
            }
        }
    }
}
