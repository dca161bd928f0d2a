//! Row store for measurement results
//!
//! Handles the storage side of the result model:
//! - Atomic writes of a header together with its detail rows
//! - Per-admission, per-kind indexing ordered by capture time
//! - Optional durable log replayed on startup

mod partition;
mod persistence;
pub use partition::AdmissionPartition;
pub use persistence::ResultLog;

use std::collections::HashMap;
use std::io;
use std::sync::RwLock;

use tracing::info;

use crate::config::StorageConfig;
use crate::measurement::{AdmissionId, MetricKind, SequenceCounter, StoredResult, TimeRange};

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage I/O failed: {0}")]
    Io(#[from] io::Error),

    #[error("result serialization failed: {0}")]
    Serialization(String),

    #[error("storage lock poisoned")]
    LockPoisoned,

    #[error("result {header} carries a detail row for result {detail}")]
    InconsistentGroup { header: u64, detail: u64 },
}

impl From<serde_json::Error> for StorageError {
    fn from(error: serde_json::Error) -> Self {
        StorageError::Serialization(error.to_string())
    }
}

/// Insert/query primitives the result service needs from a store.
///
/// Implementations must write a header and its details as one unit.
pub trait RowStore: Send + Sync {
    /// Write one header with its details. Returns the number of rows written.
    fn insert_header_and_details(&self, result: &StoredResult) -> Result<usize, StorageError> {
        self.insert_batch(std::slice::from_ref(result))
    }

    /// Write every result or none of them.
    fn insert_batch(&self, results: &[StoredResult]) -> Result<usize, StorageError>;

    /// Results of `kind` for `admission_id`, optionally limited to `range`, in capture order.
    fn query_rows(
        &self,
        admission_id: &AdmissionId,
        kind: MetricKind,
        range: Option<&TimeRange>,
    ) -> Result<Vec<StoredResult>, StorageError>;

    /// Sequence ids for new results written to this store.
    fn sequence(&self) -> &SequenceCounter;
}

#[derive(Debug, Default)]
pub struct StorageEngine {
    partitions: RwLock<HashMap<AdmissionId, AdmissionPartition>>,
    sequence: SequenceCounter,
    log: Option<ResultLog>,
}

impl StorageEngine {
    /// Memory-only store; contents are lost on shutdown.
    pub fn in_memory() -> Self {
        StorageEngine::default()
    }

    /// Build the store described by `config`, replaying the result log if one is configured.
    pub fn new(config: &StorageConfig) -> Result<Self, StorageError> {
        let Some(path) = config.path.as_deref() else {
            info!("storage path not configured, results are kept in memory only");
            return Ok(StorageEngine::in_memory());
        };

        let log = ResultLog::open(path)?;
        let replayed = log.replay()?;

        let engine = StorageEngine {
            log: Some(log),
            ..StorageEngine::default()
        };
        let count = replayed.len();
        engine.index(replayed)?;

        info!(path, results = count, last_seq = %engine.sequence.last(), "replayed result log");
        Ok(engine)
    }

    fn index(&self, results: Vec<StoredResult>) -> Result<(), StorageError> {
        let mut partitions = self.partitions.write().map_err(|_| StorageError::LockPoisoned)?;
        for result in results {
            self.sequence.advance_past(result.header.result_seq);
            partitions
                .entry(result.header.admission_id.clone())
                .or_default()
                .append(result);
        }
        Ok(())
    }

    /// Total results held across all admissions.
    pub fn len(&self) -> Result<usize, StorageError> {
        let partitions = self.partitions.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(partitions.values().map(AdmissionPartition::len).sum())
    }

    pub fn is_empty(&self) -> Result<bool, StorageError> {
        let partitions = self.partitions.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(partitions.values().all(AdmissionPartition::is_empty))
    }

    pub fn flush_all(&self) -> Result<(), StorageError> {
        match &self.log {
            Some(log) => log.sync(),
            None => Ok(()),
        }
    }
}

fn check_group(result: &StoredResult) -> Result<(), StorageError> {
    let header = result.header.result_seq;
    match result.details.iter().find(|detail| detail.result_seq != header) {
        Some(detail) => Err(StorageError::InconsistentGroup {
            header: header.0,
            detail: detail.result_seq.0,
        }),
        None => Ok(()),
    }
}

impl RowStore for StorageEngine {
    fn insert_batch(&self, results: &[StoredResult]) -> Result<usize, StorageError> {
        if results.is_empty() {
            return Ok(0);
        }
        for result in results {
            check_group(result)?;
        }

        // Hold the write lock across the log append so replay order matches index order.
        let mut partitions = self.partitions.write().map_err(|_| StorageError::LockPoisoned)?;
        if let Some(log) = &self.log {
            log.append(results)?;
        }

        let mut affected = 0;
        for result in results {
            self.sequence.advance_past(result.header.result_seq);
            affected += result.affected_rows();
            partitions
                .entry(result.header.admission_id.clone())
                .or_default()
                .append(result.clone());
        }
        Ok(affected)
    }

    fn query_rows(
        &self,
        admission_id: &AdmissionId,
        kind: MetricKind,
        range: Option<&TimeRange>,
    ) -> Result<Vec<StoredResult>, StorageError> {
        let partitions = self.partitions.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(partitions
            .get(admission_id)
            .map(|partition| partition.query(kind, range))
            .unwrap_or_default())
    }

    fn sequence(&self) -> &SequenceCounter {
        &self.sequence
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::measurement::{
        parse_timestamp, AttributeKind, DetailValue, ResultDetailRow, ResultHeader, ResultSeq,
    };
    use pretty_assertions::assert_eq;

    fn temperature(store: &StorageEngine, admission: &str, at: &str, value: f64) -> StoredResult {
        let result_seq = store.sequence().next();
        StoredResult {
            header: ResultHeader {
                result_seq,
                admission_id: AdmissionId::new(admission),
                kind: MetricKind::BodyTemperature,
                captured_at: parse_timestamp(at).unwrap(),
                device_id: None,
            },
            details: vec![ResultDetailRow {
                result_seq,
                attribute: AttributeKind::SingleValue,
                value: DetailValue::Number(value),
            }],
        }
    }

    #[test]
    fn test_basic_operations() {
        let store = StorageEngine::in_memory();
        let result = temperature(&store, "A-0001", "2022-03-01 08:00", 36.5);

        assert_eq!(store.insert_header_and_details(&result).unwrap(), 2);

        let rows = store
            .query_rows(&AdmissionId::new("A-0001"), MetricKind::BodyTemperature, None)
            .unwrap();
        assert_eq!(rows, vec![result]);
        assert_eq!(store.len().unwrap(), 1);
    }

    #[test]
    fn queries_are_scoped_by_admission() {
        let store = StorageEngine::in_memory();
        let ours = temperature(&store, "A-0001", "2022-03-01 08:00", 36.5);
        let theirs = temperature(&store, "A-0002", "2022-03-01 08:00", 38.0);
        store.insert_batch(&[ours.clone(), theirs]).unwrap();

        let rows = store
            .query_rows(&AdmissionId::new("A-0001"), MetricKind::BodyTemperature, None)
            .unwrap();
        assert_eq!(rows, vec![ours]);
        assert!(store
            .query_rows(&AdmissionId::new("A-0404"), MetricKind::BodyTemperature, None)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn inconsistent_groups_are_rejected_before_writing() {
        let store = StorageEngine::in_memory();
        let good = temperature(&store, "A-0001", "2022-03-01 08:00", 36.5);
        let mut bad = temperature(&store, "A-0001", "2022-03-01 09:00", 36.6);
        bad.details[0].result_seq = ResultSeq(77);

        assert!(matches!(
            store.insert_batch(&[good, bad]),
            Err(StorageError::InconsistentGroup { detail: 77, .. })
        ));
        assert!(store.is_empty().unwrap());
    }

    #[test]
    fn durable_store_replays_and_resumes_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let config = StorageConfig {
            path: Some(dir.path().to_string_lossy().into_owned()),
        };

        let first = {
            let store = StorageEngine::new(&config).unwrap();
            let first = temperature(&store, "A-0001", "2022-03-01 08:00", 36.5);
            store.insert_header_and_details(&first).unwrap();
            store.flush_all().unwrap();
            first
        };

        let reopened = StorageEngine::new(&config).unwrap();
        assert_eq!(
            reopened
                .query_rows(&AdmissionId::new("A-0001"), MetricKind::BodyTemperature, None)
                .unwrap(),
            vec![first]
        );
        assert_eq!(reopened.sequence().next(), ResultSeq(2));
    }

    #[test]
    fn store_reopens_after_crash_mid_append() {
        use std::io::Write;

        let dir = tempfile::tempdir().unwrap();
        let config = StorageConfig {
            path: Some(dir.path().to_string_lossy().into_owned()),
        };

        let first = {
            let store = StorageEngine::new(&config).unwrap();
            let first = temperature(&store, "A-0001", "2022-03-01 08:00", 36.5);
            store.insert_header_and_details(&first).unwrap();
            first
        };
        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(dir.path().join("results.log"))
            .unwrap();
        file.write_all(&64u32.to_be_bytes()).unwrap();
        file.write_all(b"[{\"header\"").unwrap();

        let second = {
            let store = StorageEngine::new(&config).unwrap();
            let second = temperature(&store, "A-0001", "2022-03-01 09:00", 36.8);
            store.insert_header_and_details(&second).unwrap();
            second
        };

        let reopened = StorageEngine::new(&config).unwrap();
        assert_eq!(
            reopened
                .query_rows(&AdmissionId::new("A-0001"), MetricKind::BodyTemperature, None)
                .unwrap(),
            vec![first, second]
        );
    }
}
