//! VitalDB: a vital-sign measurement store for treatment-center monitoring
//!
//! VitalDB accepts heterogeneous vital-sign readings (temperature, blood
//! pressure, heart rate, oxygen saturation, step count, sleep), flattens them
//! into a uniform header + detail row model and rebuilds per-metric views and
//! daily summaries for the patient dashboard.

pub mod admission;
pub mod api;
pub mod config;
pub mod error;
pub mod measurement;
pub mod service;
pub mod storage;

pub use error::VitalError;
pub use measurement::{
    AdmissionId, AttributeKind, DetailValue, EngineError, MetricKind, RawReading,
    ResultDetailRow, ResultHeader, ResultSeq, StoredResult,
};
