use std::convert::Infallible;
use std::sync::Arc;

use chrono::{Local, NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use tracing::{error, warn};
use warp::http::StatusCode;
use warp::reply::{Json, WithStatus};
use warp::{Filter, Rejection, Reply};

use crate::error::{ErrorStatus, VitalError};
use crate::measurement::{
    parse_timestamp, BatchFailure, EngineError, MetricKind, RawReading, ReconstructedView,
    SleepView, TimeRange,
};
use crate::service::{ResultService, SaveOutcome};

const BODY_LIMIT: u64 = 1024 * 1024;

pub const CODE_SUCCESS: &str = "00";
pub const CODE_VALIDATION: &str = "10";
pub const CODE_NOT_FOUND: &str = "20";
pub const CODE_INTERNAL: &str = "99";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveRequest {
    #[serde(default)]
    pub login_id: String,
    #[serde(default)]
    pub results: Vec<RawReading>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryRequest {
    #[serde(default)]
    pub login_id: String,
    pub result_start_date_time: Option<String>,
    pub result_end_date_time: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryRequest {
    #[serde(default)]
    pub login_id: String,
    pub date: Option<String>,
}

/// `{ code, message, ...payload }`
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub code: &'static str,
    pub message: String,
    #[serde(flatten)]
    pub payload: T,
}

#[derive(Debug, Serialize)]
pub struct FailureBody {
    pub index: usize,
    pub message: String,
}

impl From<&BatchFailure> for FailureBody {
    fn from(failure: &BatchFailure) -> Self {
        FailureBody {
            index: failure.index,
            message: failure.error.to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SavedBody {
    saved: usize,
    affected_rows: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    failures: Vec<FailureBody>,
}

#[derive(Debug, Serialize)]
struct FailuresBody {
    failures: Vec<FailureBody>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SleepBody {
    result_start_date_time: Option<NaiveDateTime>,
    result_end_date_time: Option<NaiveDateTime>,
    #[serde(flatten)]
    view: SleepView,
}

type ApiReply = WithStatus<Json>;

pub struct RestApi {
    service: Arc<ResultService>,
}

impl RestApi {
    pub fn new(service: Arc<ResultService>) -> Self {
        RestApi { service }
    }

    pub fn routes(&self) -> impl Filter<Extract = impl Reply, Error = Infallible> + Clone {
        self.save_results()
            .or(self.query_results())
            .or(self.daily_summary())
            .or(health())
            .recover(handle_rejection)
    }

    fn with_service(&self) -> impl Filter<Extract = (Arc<ResultService>,), Error = Infallible> + Clone {
        let service = Arc::clone(&self.service);
        warp::any().map(move || Arc::clone(&service))
    }

    fn save_results(&self) -> impl Filter<Extract = (ApiReply,), Error = Rejection> + Clone {
        warp::path!("api" / "result" / String)
            .and(warp::post())
            .and(warp::body::content_length_limit(BODY_LIMIT))
            .and(warp::body::json())
            .and(self.with_service())
            .and_then(|segment: String, request: SaveRequest, service: Arc<ResultService>| async move {
                let reply = match save(&service, &segment, &request) {
                    Ok(outcome) => success(
                        format!("{} saved", outcome.kind.label()),
                        SavedBody {
                            saved: outcome.saved,
                            affected_rows: outcome.affected_rows,
                            failures: outcome.failures.iter().map(FailureBody::from).collect(),
                        },
                    ),
                    Err(e) => failure(&e),
                };
                Ok::<ApiReply, Infallible>(reply)
            })
    }

    fn query_results(&self) -> impl Filter<Extract = (ApiReply,), Error = Rejection> + Clone {
        warp::path!("api" / "result" / String)
            .and(warp::get())
            .and(warp::body::content_length_limit(BODY_LIMIT))
            .and(warp::body::json())
            .and(self.with_service())
            .and_then(|segment: String, request: QueryRequest, service: Arc<ResultService>| async move {
                let reply = match query(&service, &segment, &request) {
                    Ok((kind, range, view)) => {
                        let message = found_message(kind, view.is_empty());
                        match view {
                            ReconstructedView::Sleep(view) => success(
                                message,
                                SleepBody {
                                    result_start_date_time: range.map(|r| r.start),
                                    result_end_date_time: range.map(|r| r.end),
                                    view,
                                },
                            ),
                            other => success(message, other),
                        }
                    }
                    Err(e) => failure(&e),
                };
                Ok::<ApiReply, Infallible>(reply)
            })
    }

    fn daily_summary(&self) -> impl Filter<Extract = (ApiReply,), Error = Rejection> + Clone {
        warp::path!("api" / "main")
            .and(warp::get())
            .and(warp::body::content_length_limit(BODY_LIMIT))
            .and(warp::body::json())
            .and(self.with_service())
            .and_then(|request: SummaryRequest, service: Arc<ResultService>| async move {
                let reply = match summary_date(request.date.as_deref())
                    .and_then(|date| service.daily_summary(&request.login_id, date))
                {
                    Ok(summary) => {
                        let message = if summary.is_empty() {
                            "no results for the day".to_string()
                        } else {
                            "results found".to_string()
                        };
                        success(message, summary)
                    }
                    Err(e) => failure(&e),
                };
                Ok::<ApiReply, Infallible>(reply)
            })
    }
}

fn health() -> impl Filter<Extract = (ApiReply,), Error = Rejection> + Clone {
    warp::path!("health")
        .and(warp::get())
        .map(|| success("ok".to_string(), ()))
}

fn save(service: &ResultService, segment: &str, request: &SaveRequest) -> Result<SaveOutcome, VitalError> {
    let kind = MetricKind::from_path_segment(segment)?;
    service.save(kind, &request.login_id, &request.results)
}

fn query(
    service: &ResultService,
    segment: &str,
    request: &QueryRequest,
) -> Result<(MetricKind, Option<TimeRange>, ReconstructedView), VitalError> {
    let kind = MetricKind::from_path_segment(segment)?;
    let range = time_range(
        request.result_start_date_time.as_deref(),
        request.result_end_date_time.as_deref(),
    )?;
    let view = service.query(kind, &request.login_id, range)?;
    Ok((kind, range, view))
}

/// Both bounds or neither. A bare date covers the whole day.
fn time_range(start: Option<&str>, end: Option<&str>) -> Result<Option<TimeRange>, EngineError> {
    match (start, end) {
        (None, None) => Ok(None),
        (Some(start), Some(end)) => {
            let start = parse_bound("resultStartDateTime", start, NaiveTime::MIN)?;
            let end = parse_bound("resultEndDateTime", end, day_end())?;
            TimeRange::new(start, end).map(Some)
        }
        _ => Err(EngineError::InvalidTimeRange(
            "resultStartDateTime and resultEndDateTime must be given together".to_string(),
        )),
    }
}

fn parse_bound(field: &str, raw: &str, time_of_day: NaiveTime) -> Result<NaiveDateTime, EngineError> {
    parse_timestamp(raw)
        .or_else(|| {
            NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
                .ok()
                .map(|date| date.and_time(time_of_day))
        })
        .ok_or_else(|| EngineError::InvalidTimestamp {
            field: field.to_string(),
            value: raw.to_string(),
        })
}

fn day_end() -> NaiveTime {
    NaiveTime::from_hms_opt(23, 59, 59).unwrap_or(NaiveTime::MIN)
}

fn summary_date(raw: Option<&str>) -> Result<NaiveDate, VitalError> {
    match raw {
        None => Ok(Local::now().date_naive()),
        Some(raw) => NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d").map_err(|_| {
            VitalError::Engine(EngineError::InvalidTimestamp {
                field: "date".to_string(),
                value: raw.to_string(),
            })
        }),
    }
}

fn found_message(kind: MetricKind, empty: bool) -> String {
    if empty {
        format!("no {} results", kind.label())
    } else {
        format!("{} results found", kind.label())
    }
}

fn success<T: Serialize>(message: String, payload: T) -> ApiReply {
    reply(StatusCode::OK, CODE_SUCCESS, message, payload)
}

fn failure(e: &VitalError) -> ApiReply {
    let (status, code) = match e.status() {
        ErrorStatus::Validation => (StatusCode::BAD_REQUEST, CODE_VALIDATION),
        ErrorStatus::NotFound => (StatusCode::NOT_FOUND, CODE_NOT_FOUND),
        ErrorStatus::Internal => {
            error!(error = %e, "request failed");
            (StatusCode::INTERNAL_SERVER_ERROR, CODE_INTERNAL)
        }
    };

    match e {
        VitalError::BatchRejected(failures) => reply(
            status,
            code,
            e.to_string(),
            FailuresBody {
                failures: failures.iter().map(FailureBody::from).collect(),
            },
        ),
        _ => reply(status, code, e.to_string(), ()),
    }
}

fn reply<T: Serialize>(status: StatusCode, code: &'static str, message: String, payload: T) -> ApiReply {
    let body = ApiResponse { code, message, payload };
    warp::reply::with_status(warp::reply::json(&body), status)
}

async fn handle_rejection(err: Rejection) -> Result<ApiReply, Infallible> {
    let (status, code, message) = if err.is_not_found() {
        (StatusCode::NOT_FOUND, CODE_NOT_FOUND, "route not found".to_string())
    } else if let Some(e) = err.find::<warp::body::BodyDeserializeError>() {
        (StatusCode::BAD_REQUEST, CODE_VALIDATION, format!("malformed request body: {e}"))
    } else if err.find::<warp::reject::UnsupportedMediaType>().is_some() {
        (StatusCode::BAD_REQUEST, CODE_VALIDATION, "request body must be JSON".to_string())
    } else if err.find::<warp::reject::LengthRequired>().is_some() {
        (StatusCode::BAD_REQUEST, CODE_VALIDATION, "request body is required".to_string())
    } else if err.find::<warp::reject::PayloadTooLarge>().is_some() {
        (StatusCode::PAYLOAD_TOO_LARGE, CODE_VALIDATION, "request body too large".to_string())
    } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
        (StatusCode::METHOD_NOT_ALLOWED, CODE_NOT_FOUND, "method not allowed".to_string())
    } else {
        warn!(?err, "unhandled rejection");
        (StatusCode::INTERNAL_SERVER_ERROR, CODE_INTERNAL, "internal error".to_string())
    };

    Ok(reply(status, code, message, ()))
}
