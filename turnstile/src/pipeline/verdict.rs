use crate::error::{AdmissionError, ReasonCode};
use crate::policy::AccessPolicy;
use crate::window::{QuotaExceeded, Remaining};
use serde::Serialize;
use std::collections::BTreeMap;

/// Allow/deny decision for one request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AdmissionVerdict {
    pub admitted: bool,
    pub code: ReasonCode,
    pub message: String,
    /// Whether retrying the same request later may succeed
    pub retryable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<u64>,
    /// Canonical credential the request was accounted to
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub policy: Option<AccessPolicy>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining: Option<Remaining>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quota: Option<QuotaExceeded>,
}

impl AdmissionVerdict {
    pub(crate) fn admitted(
        tenant_id: u64,
        credential: String,
        policy: AccessPolicy,
        remaining: Remaining,
    ) -> Self {
        AdmissionVerdict {
            admitted: true,
            code: ReasonCode::Admitted,
            message: "Request admitted".to_string(),
            retryable: false,
            tenant_id: Some(tenant_id),
            credential: Some(credential),
            policy: Some(policy),
            remaining: Some(remaining),
            quota: None,
        }
    }

    pub(crate) fn denied(error: &AdmissionError, tenant_id: Option<u64>) -> Self {
        let quota = match error {
            AdmissionError::QuotaExceeded(q) => Some(q.clone()),
            _ => None,
        };

        AdmissionVerdict {
            admitted: false,
            code: error.code(),
            message: error.to_string(),
            retryable: error.is_retryable(),
            tenant_id,
            credential: None,
            policy: None,
            remaining: None,
            quota,
        }
    }
}

/// Admission outcome counters and store sizes
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PipelineStats {
    pub total: u64,
    pub admitted: u64,
    pub denied: u64,
    /// Outcomes per reason code, including `admitted`
    pub by_code: BTreeMap<&'static str, u64>,
    pub tracked_addresses: usize,
    pub blocked_addresses: usize,
    pub tracked_credentials: usize,
    pub events_dropped: u64,
    pub cache: crate::cache::CacheStats,
}

impl PipelineStats {
    pub fn count(&self, code: ReasonCode) -> u64 {
        self.by_code.get(code.as_str()).copied().unwrap_or(0)
    }
}
