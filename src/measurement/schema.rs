//! Metric kind -> attribute schema, and where each attribute comes from in a
//! raw reading.
//!
//! Both tables are constants. Adding a metric kind means adding a row to each.

use super::{AttributeKind, EngineError, MetricKind};

/// The attribute set a metric kind must carry, in storage order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchemaEntry {
    pub kind: MetricKind,
    pub attributes: &'static [AttributeKind],
}

/// Where a raw reading keeps the value for one attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldSource {
    /// One scalar field, number or numeric string.
    Scalar(&'static str),
    /// Two timestamp fields stored together as one interval value.
    Interval {
        start: &'static str,
        end: &'static str,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldMapping {
    pub attribute: AttributeKind,
    pub source: FieldSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KindMapping {
    pub kind: MetricKind,
    pub fields: &'static [FieldMapping],
}

const SINGLE_VALUE: &[AttributeKind] = &[AttributeKind::SingleValue];

static STANDARD_SCHEMA: [SchemaEntry; 6] = [
    SchemaEntry { kind: MetricKind::BodyTemperature, attributes: SINGLE_VALUE },
    SchemaEntry {
        kind: MetricKind::BloodPressure,
        attributes: &[AttributeKind::MinBloodPressure, AttributeKind::MaxBloodPressure],
    },
    SchemaEntry { kind: MetricKind::HeartRate, attributes: SINGLE_VALUE },
    SchemaEntry { kind: MetricKind::OxygenSaturation, attributes: SINGLE_VALUE },
    SchemaEntry {
        kind: MetricKind::StepCount,
        attributes: &[AttributeKind::StepCount, AttributeKind::Distance],
    },
    SchemaEntry { kind: MetricKind::Sleep, attributes: &[AttributeKind::SleepInterval] },
];

const RESULT_FIELD: &[FieldMapping] = &[FieldMapping {
    attribute: AttributeKind::SingleValue,
    source: FieldSource::Scalar("result"),
}];

// Pairing follows the device payload: `resultSbp` carries the minimum reading.
static STANDARD_FIELDS: [KindMapping; 6] = [
    KindMapping { kind: MetricKind::BodyTemperature, fields: RESULT_FIELD },
    KindMapping {
        kind: MetricKind::BloodPressure,
        fields: &[
            FieldMapping {
                attribute: AttributeKind::MinBloodPressure,
                source: FieldSource::Scalar("resultSbp"),
            },
            FieldMapping {
                attribute: AttributeKind::MaxBloodPressure,
                source: FieldSource::Scalar("resultDbp"),
            },
        ],
    },
    KindMapping { kind: MetricKind::HeartRate, fields: RESULT_FIELD },
    KindMapping { kind: MetricKind::OxygenSaturation, fields: RESULT_FIELD },
    KindMapping {
        kind: MetricKind::StepCount,
        fields: &[
            FieldMapping {
                attribute: AttributeKind::StepCount,
                source: FieldSource::Scalar("resultStepCount"),
            },
            FieldMapping {
                attribute: AttributeKind::Distance,
                source: FieldSource::Scalar("resultDistance"),
            },
        ],
    },
    KindMapping {
        kind: MetricKind::Sleep,
        fields: &[FieldMapping {
            attribute: AttributeKind::SleepInterval,
            source: FieldSource::Interval {
                start: "resultStartDateTime",
                end: "resultEndDateTime",
            },
        }],
    },
];

static STANDARD: SchemaRegistry = SchemaRegistry::new(&STANDARD_SCHEMA, &STANDARD_FIELDS);

/// Lookup over the schema and field-mapping tables. Immutable, so one
/// instance is shared by every request.
#[derive(Debug, Clone, Copy)]
pub struct SchemaRegistry {
    entries: &'static [SchemaEntry],
    mappings: &'static [KindMapping],
}

impl SchemaRegistry {
    pub const fn new(entries: &'static [SchemaEntry], mappings: &'static [KindMapping]) -> Self {
        SchemaRegistry { entries, mappings }
    }

    /// The registry covering every [`MetricKind`].
    pub fn standard() -> &'static SchemaRegistry {
        &STANDARD
    }

    pub fn schema_for(&self, kind: MetricKind) -> Result<&'static [AttributeKind], EngineError> {
        self.entries
            .iter()
            .find(|entry| entry.kind == kind)
            .map(|entry| entry.attributes)
            .ok_or(EngineError::UnrecognizedMetricKind(kind))
    }

    /// Schema lookup by wire name, for callers holding an unparsed kind.
    pub fn schema_for_name(&self, name: &str) -> Result<&'static [AttributeKind], EngineError> {
        let kind: MetricKind = name.parse()?;
        self.schema_for(kind).map_err(|_| EngineError::UnknownMetricKind(name.to_string()))
    }

    pub fn field_mappings(&self, kind: MetricKind) -> Result<&'static [FieldMapping], EngineError> {
        self.mappings
            .iter()
            .find(|mapping| mapping.kind == kind)
            .map(|mapping| mapping.fields)
            .ok_or(EngineError::UnrecognizedMetricKind(kind))
    }

    /// Field mappings in schema order. Fails if any schema attribute has no mapping.
    pub fn ordered_mappings(&self, kind: MetricKind) -> Result<Vec<FieldMapping>, EngineError> {
        let attributes = self.schema_for(kind)?;
        let mappings = self.field_mappings(kind)?;

        attributes
            .iter()
            .map(|attribute| {
                mappings
                    .iter()
                    .find(|mapping| mapping.attribute == *attribute)
                    .copied()
                    .ok_or(EngineError::UnrecognizedMetricKind(kind))
            })
            .collect()
    }

    /// Metric kinds whose schema includes `attribute`.
    pub fn kinds_with(&self, attribute: AttributeKind) -> Vec<MetricKind> {
        self.entries
            .iter()
            .filter(|entry| entry.attributes.contains(&attribute))
            .map(|entry| entry.kind)
            .collect()
    }
}
