use crate::admission::AdmissionError;
use crate::config::ConfigError;
use crate::measurement::{BatchFailure, EngineError};
use crate::storage::StorageError;

/// How an error is reported to API clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorStatus {
    Validation,
    NotFound,
    Internal,
}

#[derive(Debug, thiserror::Error)]
pub enum VitalError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Admission(#[from] AdmissionError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("{0}")]
    Validation(String),

    #[error("{} of the submitted readings were rejected", .0.len())]
    BatchRejected(Vec<BatchFailure>),
}

impl VitalError {
    pub fn status(&self) -> ErrorStatus {
        match self {
            VitalError::Engine(e) if e.is_client_error() => ErrorStatus::Validation,
            VitalError::Validation(_) | VitalError::BatchRejected(_) => ErrorStatus::Validation,
            VitalError::Admission(AdmissionError::NoActiveAdmission(_)) => ErrorStatus::NotFound,
            _ => ErrorStatus::Internal,
        }
    }
}

pub type Result<T, E = VitalError> = std::result::Result<T, E>;
