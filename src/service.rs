//! Save and query operations scoped to a caller's active admission.
//!
//! `ResultService` sits between the REST layer and the engine: it resolves
//! the login to an admission, runs the decomposer or reconstructor, applies
//! the batch policy and talks to the row store.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{Local, NaiveDate, NaiveDateTime};
use tracing::{debug, info, warn};

use crate::admission::AdmissionResolver;
use crate::config::BatchPolicy;
use crate::error::{Result, VitalError};
use crate::measurement::{
    AdmissionId, BatchFailure, DailySummary, Decomposer, MetricKind, RawReading,
    ReconstructedView, Reconstructor, SchemaRegistry, TimeRange,
};
use crate::storage::RowStore;

/// What a save call stored.
#[derive(Debug, Clone, PartialEq)]
pub struct SaveOutcome {
    pub kind: MetricKind,
    pub saved: usize,
    pub affected_rows: usize,
    /// Readings skipped under `BatchPolicy::Partial`. Always empty otherwise.
    pub failures: Vec<BatchFailure>,
}

pub struct ResultService {
    store: Arc<dyn RowStore>,
    admissions: Arc<dyn AdmissionResolver>,
    registry: &'static SchemaRegistry,
    batch_policy: BatchPolicy,
}

impl ResultService {
    pub fn new(
        store: Arc<dyn RowStore>,
        admissions: Arc<dyn AdmissionResolver>,
        batch_policy: BatchPolicy,
    ) -> Self {
        ResultService {
            store,
            admissions,
            registry: SchemaRegistry::standard(),
            batch_policy,
        }
    }

    pub fn save(&self, kind: MetricKind, login_id: &str, readings: &[RawReading]) -> Result<SaveOutcome> {
        self.save_at(kind, login_id, readings, Local::now().naive_local())
    }

    /// Save `readings`, using `received_at` for readings without a timestamp.
    pub fn save_at(
        &self,
        kind: MetricKind,
        login_id: &str,
        readings: &[RawReading],
        received_at: NaiveDateTime,
    ) -> Result<SaveOutcome> {
        let admission_id = self.resolve(login_id)?;
        if readings.is_empty() {
            return Err(VitalError::Validation(format!("no {} readings submitted", kind.label())));
        }

        let batch = Decomposer::new(self.registry).decompose_batch(
            kind,
            readings,
            &admission_id,
            received_at,
            self.store.sequence(),
        );

        let reject = match self.batch_policy {
            BatchPolicy::AllOrNothing => !batch.is_complete(),
            BatchPolicy::Partial => batch.decomposed.is_empty(),
        };
        if reject {
            warn!(
                %kind,
                login_id,
                rejected = batch.failures.len(),
                submitted = readings.len(),
                "rejected reading batch"
            );
            return Err(VitalError::BatchRejected(batch.failures));
        }

        let affected_rows = self.store.insert_batch(&batch.decomposed)?;
        info!(
            %kind,
            login_id,
            admission = %admission_id,
            saved = batch.decomposed.len(),
            skipped = batch.failures.len(),
            affected_rows,
            "saved readings"
        );

        Ok(SaveOutcome {
            kind,
            saved: batch.decomposed.len(),
            affected_rows,
            failures: batch.failures,
        })
    }

    /// Rebuild the `kind` view for the caller's admission.
    ///
    /// Sleep sessions are selected by overlap with `range`; every other kind
    /// by capture time inside it.
    pub fn query(
        &self,
        kind: MetricKind,
        login_id: &str,
        range: Option<TimeRange>,
    ) -> Result<ReconstructedView> {
        let admission_id = self.resolve(login_id)?;
        let reconstructor = Reconstructor::new(self.registry);

        let view = match (kind, range) {
            (MetricKind::Sleep, Some(range)) => {
                let rows = self.store.query_rows(&admission_id, kind, None)?;
                reconstructor.reconstruct(kind, &rows)?.within(&range)
            }
            (_, range) => {
                let rows = self.store.query_rows(&admission_id, kind, range.as_ref())?;
                reconstructor.reconstruct(kind, &rows)?
            }
        };

        debug!(%kind, login_id, readings = view.len(), "queried results");
        Ok(view)
    }

    /// Every metric kind for one day of the caller's admission.
    pub fn daily_summary(&self, login_id: &str, date: NaiveDate) -> Result<DailySummary> {
        let admission_id = self.resolve(login_id)?;
        let day = TimeRange::day(date);

        let mut rows = BTreeMap::new();
        for kind in MetricKind::ALL {
            let range = (kind != MetricKind::Sleep).then_some(&day);
            rows.insert(kind, self.store.query_rows(&admission_id, kind, range)?);
        }

        let summary = DailySummary::build(&Reconstructor::new(self.registry), date, &rows)?;
        debug!(login_id, %date, readings = summary.total_readings(), "built daily summary");
        Ok(summary)
    }

    fn resolve(&self, login_id: &str) -> Result<AdmissionId> {
        if login_id.trim().is_empty() {
            return Err(VitalError::Validation("loginId is required".to_string()));
        }
        Ok(self.admissions.resolve_active_admission(login_id)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::{AdmissionError, AdmissionRegistry};
    use crate::error::ErrorStatus;
    use crate::measurement::{parse_timestamp, EngineError};
    use crate::storage::StorageEngine;
    use pretty_assertions::assert_eq;

    fn service(policy: BatchPolicy) -> (ResultService, Arc<StorageEngine>) {
        let store = Arc::new(StorageEngine::in_memory());
        let admissions = AdmissionRegistry::new();
        admissions.admit("patient01", AdmissionId::new("A-0001")).unwrap();
        admissions.admit("patient02", AdmissionId::new("A-0002")).unwrap();
        let service = ResultService::new(store.clone(), Arc::new(admissions), policy);
        (service, store)
    }

    fn received() -> NaiveDateTime {
        parse_timestamp("2022-03-02 12:00").unwrap()
    }

    fn heart_rate(at: &str, bpm: i64) -> RawReading {
        RawReading::new().captured_at(at).with_field("result", bpm)
    }

    fn range(start: &str, end: &str) -> TimeRange {
        TimeRange::new(parse_timestamp(start).unwrap(), parse_timestamp(end).unwrap()).unwrap()
    }

    #[test]
    fn saves_and_queries_back() {
        let (service, store) = service(BatchPolicy::AllOrNothing);
        let readings = [heart_rate("2022-03-02 09:00", 72), heart_rate("2022-03-02 08:00", 80)];

        let outcome = service
            .save_at(MetricKind::HeartRate, "patient01", &readings, received())
            .unwrap();
        assert_eq!(outcome.saved, 2);
        assert_eq!(outcome.affected_rows, 4);
        assert_eq!(store.len().unwrap(), 2);

        let ReconstructedView::HeartRate { readings } =
            service.query(MetricKind::HeartRate, "patient01", None).unwrap()
        else {
            panic!("expected a heart rate view");
        };
        let values: Vec<String> = readings.iter().map(|r| r.result.to_string()).collect();
        assert_eq!(values, vec!["80", "72"]);
    }

    #[test]
    fn empty_store_is_an_empty_view() {
        let (service, _) = service(BatchPolicy::AllOrNothing);
        let view = service.query(MetricKind::BloodPressure, "patient01", None).unwrap();
        assert!(view.is_empty());
        assert_eq!(view.kind(), MetricKind::BloodPressure);
    }

    #[test]
    fn queries_do_not_cross_admissions() {
        let (service, _) = service(BatchPolicy::AllOrNothing);
        service
            .save_at(MetricKind::HeartRate, "patient02", &[heart_rate("2022-03-02 08:00", 90)], received())
            .unwrap();

        assert!(service.query(MetricKind::HeartRate, "patient01", None).unwrap().is_empty());
    }

    #[test]
    fn all_or_nothing_stores_nothing_on_failure() {
        let (service, store) = service(BatchPolicy::AllOrNothing);
        let readings = [heart_rate("2022-03-02 08:00", 72), RawReading::new()];

        let err = service
            .save_at(MetricKind::HeartRate, "patient01", &readings, received())
            .unwrap_err();
        let VitalError::BatchRejected(failures) = &err else {
            panic!("expected a rejected batch, got {err:?}");
        };
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].index, 1);
        assert_eq!(err.status(), ErrorStatus::Validation);
        assert!(store.is_empty().unwrap());
    }

    #[test]
    fn partial_policy_keeps_valid_readings() {
        let (service, store) = service(BatchPolicy::Partial);
        let readings = [RawReading::new(), heart_rate("2022-03-02 08:00", 72)];

        let outcome = service
            .save_at(MetricKind::HeartRate, "patient01", &readings, received())
            .unwrap();
        assert_eq!(outcome.saved, 1);
        assert_eq!(outcome.failures.len(), 1);
        assert!(matches!(
            outcome.failures[0].error,
            EngineError::MissingAttributeValue { .. }
        ));
        assert_eq!(store.len().unwrap(), 1);
    }

    #[test]
    fn partial_policy_rejects_a_batch_with_no_valid_readings() {
        let (service, store) = service(BatchPolicy::Partial);
        let readings = [
            RawReading::new(),
            RawReading::new().with_field("result", serde_json::Value::Null),
            RawReading::new().with_field("result", 72).captured_at("yesterday"),
        ];

        let err = service
            .save_at(MetricKind::HeartRate, "patient01", &readings, received())
            .unwrap_err();
        let VitalError::BatchRejected(failures) = &err else {
            panic!("expected a rejected batch, got {err:?}");
        };
        assert_eq!(
            failures.iter().map(|f| f.index).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
        assert_eq!(err.status(), ErrorStatus::Validation);
        assert!(store.is_empty().unwrap());
    }

    #[test]
    fn rejects_blank_login_and_empty_batches() {
        let (service, _) = service(BatchPolicy::AllOrNothing);

        assert!(matches!(
            service.save_at(MetricKind::HeartRate, " ", &[heart_rate("2022-03-02 08:00", 72)], received()),
            Err(VitalError::Validation(_))
        ));
        assert!(matches!(
            service.save_at(MetricKind::HeartRate, "patient01", &[], received()),
            Err(VitalError::Validation(_))
        ));
    }

    #[test]
    fn unknown_login_has_no_admission() {
        let (service, _) = service(BatchPolicy::AllOrNothing);
        let err = service.query(MetricKind::Sleep, "patient99", None).unwrap_err();
        assert!(matches!(
            err,
            VitalError::Admission(AdmissionError::NoActiveAdmission(_))
        ));
        assert_eq!(err.status(), ErrorStatus::NotFound);
    }

    #[test]
    fn range_filters_by_capture_time() {
        let (service, _) = service(BatchPolicy::AllOrNothing);
        let readings = [
            heart_rate("2022-03-01 08:00", 70),
            heart_rate("2022-03-02 08:00", 71),
            heart_rate("2022-03-03 08:00", 72),
        ];
        service
            .save_at(MetricKind::HeartRate, "patient01", &readings, received())
            .unwrap();

        let view = service
            .query(
                MetricKind::HeartRate,
                "patient01",
                Some(range("2022-03-02 00:00", "2022-03-02 23:59")),
            )
            .unwrap();
        assert_eq!(view.len(), 1);
    }

    #[test]
    fn sleep_query_totals_overlapping_sessions() {
        let (service, _) = service(BatchPolicy::AllOrNothing);
        let session = |start: &str, end: &str| {
            RawReading::new()
                .with_field("resultStartDateTime", start)
                .with_field("resultEndDateTime", end)
        };
        let readings = [
            session("2022-03-01 22:30", "2022-03-02 00:00"),
            session("2022-03-02 13:00", "2022-03-02 13:45"),
            session("2022-03-02 22:00", "2022-03-03 00:00"),
            session("2022-03-05 22:00", "2022-03-06 06:00"),
        ];
        service
            .save_at(MetricKind::Sleep, "patient01", &readings, received())
            .unwrap();

        let ReconstructedView::Sleep(view) = service
            .query(
                MetricKind::Sleep,
                "patient01",
                Some(range("2022-03-02 00:00", "2022-03-02 23:59")),
            )
            .unwrap()
        else {
            panic!("expected a sleep view");
        };
        assert_eq!(view.sleep_time_list.len(), 3);
        assert_eq!(view.total.minutes, 255);
        assert_eq!(view.total.hours, 4);
    }

    #[test]
    fn daily_summary_covers_one_day() {
        let (service, _) = service(BatchPolicy::AllOrNothing);
        service
            .save_at(
                MetricKind::BodyTemperature,
                "patient01",
                &[
                    RawReading::new().captured_at("2022-03-02 07:00").with_field("result", 36.4),
                    RawReading::new().captured_at("2022-03-03 07:00").with_field("result", 37.9),
                ],
                received(),
            )
            .unwrap();

        let date = NaiveDate::from_ymd_opt(2022, 3, 2).unwrap();
        let summary = service.daily_summary("patient01", date).unwrap();
        assert_eq!(summary.today_bt_list.len(), 1);
        assert_eq!(summary.total_readings(), 1);
    }
}
