use std::collections::HashMap;

use crate::measurement::{MetricKind, StoredResult, TimeRange};

/// All results of one admission, grouped by metric kind for faster access.
#[derive(Debug, Default)]
pub struct AdmissionPartition {
    // Each list is kept sorted by captured-at.
    results: HashMap<MetricKind, Vec<StoredResult>>,
}

impl AdmissionPartition {
    pub fn new() -> Self {
        AdmissionPartition::default()
    }

    pub fn append(&mut self, result: StoredResult) {
        let list = self.results.entry(result.header.kind).or_default();
        let at = list.partition_point(|existing| {
            existing.header.captured_at <= result.header.captured_at
        });
        list.insert(at, result);
    }

    /// Results of `kind`, optionally limited to headers captured inside `range`.
    pub fn query(&self, kind: MetricKind, range: Option<&TimeRange>) -> Vec<StoredResult> {
        let Some(list) = self.results.get(&kind) else {
            return Vec::new();
        };

        match range {
            Some(range) => {
                let from = list.partition_point(|r| r.header.captured_at < range.start);
                let to = list.partition_point(|r| r.header.captured_at <= range.end);
                list[from..to.max(from)].to_vec()
            }
            None => list.clone(),
        }
    }

    pub fn len(&self) -> usize {
        self.results.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
