//! Login id -> active admission lookup.
//!
//! Every query and save is scoped to the admission the caller is currently
//! checked into. A login with no active admission cannot read or write results.

use std::collections::HashMap;
use std::sync::RwLock;

use serde::Deserialize;
use tracing::info;

use crate::measurement::AdmissionId;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AdmissionError {
    #[error("no active admission for login `{0}`")]
    NoActiveAdmission(String),

    #[error("admission registry lock poisoned")]
    LockPoisoned,
}

pub trait AdmissionResolver: Send + Sync {
    fn resolve_active_admission(&self, login_id: &str) -> Result<AdmissionId, AdmissionError>;
}

/// A `login_id -> admission_id` pair loaded from configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AdmissionSeed {
    pub login_id: String,
    pub admission_id: String,
}

/// In-memory registry of active admissions.
#[derive(Debug, Default)]
pub struct AdmissionRegistry {
    active: RwLock<HashMap<String, AdmissionId>>,
}

impl AdmissionRegistry {
    pub fn new() -> Self {
        AdmissionRegistry::default()
    }

    pub fn from_seeds(seeds: &[AdmissionSeed]) -> Self {
        let active = seeds
            .iter()
            .map(|seed| (seed.login_id.clone(), AdmissionId::new(seed.admission_id.as_str())))
            .collect();
        AdmissionRegistry {
            active: RwLock::new(active),
        }
    }

    /// Check `login_id` into `admission_id`, replacing any earlier admission.
    pub fn admit(&self, login_id: &str, admission_id: AdmissionId) -> Result<(), AdmissionError> {
        let mut active = self.active.write().map_err(|_| AdmissionError::LockPoisoned)?;
        info!(login_id, admission = %admission_id, "admitted");
        active.insert(login_id.to_string(), admission_id);
        Ok(())
    }

    /// End the active admission of `login_id`, returning it.
    pub fn discharge(&self, login_id: &str) -> Result<AdmissionId, AdmissionError> {
        let mut active = self.active.write().map_err(|_| AdmissionError::LockPoisoned)?;
        let admission_id = active
            .remove(login_id)
            .ok_or_else(|| AdmissionError::NoActiveAdmission(login_id.to_string()))?;
        info!(login_id, admission = %admission_id, "discharged");
        Ok(admission_id)
    }
}

impl AdmissionResolver for AdmissionRegistry {
    fn resolve_active_admission(&self, login_id: &str) -> Result<AdmissionId, AdmissionError> {
        let active = self.active.read().map_err(|_| AdmissionError::LockPoisoned)?;
        active
            .get(login_id)
            .cloned()
            .ok_or_else(|| AdmissionError::NoActiveAdmission(login_id.to_string()))
    }
}
