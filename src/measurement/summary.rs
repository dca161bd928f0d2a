//! One day of every metric for the dashboard's main screen.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::Serialize;

use super::reconstruct::{
    BloodPressureEntry, ReconstructedView, Reconstructor, SingleValueEntry, SleepView,
    StepCountEntry,
};
use super::sleep::TimeRange;
use super::{EngineError, MetricKind, StoredResult};

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DailySummary {
    pub date: Option<NaiveDate>,
    pub today_bt_list: Vec<SingleValueEntry>,
    pub today_bp_list: Vec<BloodPressureEntry>,
    pub today_hr_list: Vec<SingleValueEntry>,
    #[serde(rename = "todaySpO2List")]
    pub today_spo2_list: Vec<SingleValueEntry>,
    pub today_step_count_list: Vec<StepCountEntry>,
    #[serde(flatten)]
    pub today_sleep: SleepView,
}

impl DailySummary {
    /// Reconstruct every metric kind for `date`.
    ///
    /// `rows` holds whatever the store returned per kind; kinds without an
    /// entry are treated as having no results. Sleep sessions are kept when
    /// they touch the day at all.
    pub fn build(
        reconstructor: &Reconstructor<'_>,
        date: NaiveDate,
        rows: &BTreeMap<MetricKind, Vec<StoredResult>>,
    ) -> Result<Self, EngineError> {
        let day = TimeRange::day(date);
        let mut summary = DailySummary {
            date: Some(date),
            ..DailySummary::default()
        };

        for kind in MetricKind::ALL {
            let results = rows.get(&kind).map(Vec::as_slice).unwrap_or_default();
            match reconstructor.reconstruct(kind, results)?.within(&day) {
                ReconstructedView::BodyTemperature { readings } => summary.today_bt_list = readings,
                ReconstructedView::BloodPressure { readings } => summary.today_bp_list = readings,
                ReconstructedView::HeartRate { readings } => summary.today_hr_list = readings,
                ReconstructedView::OxygenSaturation { readings } => summary.today_spo2_list = readings,
                ReconstructedView::StepCount { readings } => summary.today_step_count_list = readings,
                ReconstructedView::Sleep(view) => summary.today_sleep = view,
            }
        }

        Ok(summary)
    }

    /// Number of readings across all metric kinds.
    pub fn total_readings(&self) -> usize {
        self.today_bt_list.len()
            + self.today_bp_list.len()
            + self.today_hr_list.len()
            + self.today_spo2_list.len()
            + self.today_step_count_list.len()
            + self.today_sleep.sleep_time_list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.total_readings() == 0
    }
}
