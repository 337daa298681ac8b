//! Error taxonomy and stable reason codes
//!
//! Collaborator errors ([`StoreError`], [`AuthError`]) are returned by the
//! external policy store and identity resolver. Inside the pipeline every
//! failure becomes an [`AdmissionError`], which is translated into a verdict
//! carrying a [`ReasonCode`] before it leaves [`crate::AdmissionPipeline`].

use crate::policy::PolicyViolation;
use crate::shape::ShapeError;
use crate::window::QuotaExceeded;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Failure fetching a policy from the authoritative store
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// Transient outage, including fetch timeouts
    #[error("policy store unavailable: {0}")]
    Unavailable(String),

    /// The store has no policy for the credential
    #[error("no policy found for credential")]
    NotFound,
}

/// Failure resolving a credential to a tenant
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    /// The credential is unknown, expired or otherwise refused
    #[error("{0}")]
    Rejected(String),

    /// The resolver itself could not answer
    #[error("identity service unavailable: {0}")]
    Unavailable(String),
}

/// Every way an admission can fail
#[derive(Debug, Clone, thiserror::Error)]
pub enum AdmissionError {
    #[error("IP blocked due to volumetric abuse: {reason}")]
    AbuseBlocked { reason: String },

    #[error("Invalid call structure: {0}")]
    InvalidShape(#[from] ShapeError),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Access policy not found for resolved credential")]
    PolicyMissing,

    #[error("Tenant mismatch: credential resolved to {resolved}, policy belongs to {cached}")]
    TenantMismatch { resolved: u64, cached: u64 },

    #[error("{0}")]
    PolicyInvalid(#[from] PolicyViolation),

    #[error("Access denied to operation: {operation}")]
    OperationForbidden { operation: String },

    #[error("{0}")]
    QuotaExceeded(#[from] QuotaExceeded),

    #[error("Service temporarily unavailable: {0}")]
    StoreUnavailable(String),
}

impl AdmissionError {
    /// Stable machine-readable code for this failure
    pub fn code(&self) -> ReasonCode {
        match self {
            AdmissionError::AbuseBlocked { .. } => ReasonCode::AddressBlocked,
            AdmissionError::InvalidShape(_) => ReasonCode::InvalidShape,
            AdmissionError::AuthenticationFailed(_) => ReasonCode::AuthenticationFailed,
            AdmissionError::PolicyMissing => ReasonCode::PolicyNotFound,
            AdmissionError::TenantMismatch { .. } => ReasonCode::TenantMismatch,
            AdmissionError::PolicyInvalid(PolicyViolation::Inactive) => ReasonCode::AccountInactive,
            AdmissionError::PolicyInvalid(PolicyViolation::AutoBlocked { .. }) => {
                ReasonCode::AccountAutoBlocked
            }
            AdmissionError::PolicyInvalid(PolicyViolation::Suspended { .. }) => {
                ReasonCode::AccountSuspended
            }
            AdmissionError::OperationForbidden { .. } => ReasonCode::OperationForbidden,
            AdmissionError::QuotaExceeded(_) => ReasonCode::QuotaExceeded,
            AdmissionError::StoreUnavailable(_) => ReasonCode::ServiceUnavailable,
        }
    }

    /// Whether the same request may succeed later without operator action
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AdmissionError::InvalidShape(_)
                | AdmissionError::QuotaExceeded(_)
                | AdmissionError::StoreUnavailable(_)
        )
    }
}

/// Stable reason code carried by every verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonCode {
    Admitted,
    AddressBlocked,
    InvalidShape,
    AuthenticationFailed,
    PolicyNotFound,
    TenantMismatch,
    AccountInactive,
    AccountAutoBlocked,
    AccountSuspended,
    OperationForbidden,
    QuotaExceeded,
    ServiceUnavailable,
}

impl ReasonCode {
    pub const ALL: [ReasonCode; 12] = [
        ReasonCode::Admitted,
        ReasonCode::AddressBlocked,
        ReasonCode::InvalidShape,
        ReasonCode::AuthenticationFailed,
        ReasonCode::PolicyNotFound,
        ReasonCode::TenantMismatch,
        ReasonCode::AccountInactive,
        ReasonCode::AccountAutoBlocked,
        ReasonCode::AccountSuspended,
        ReasonCode::OperationForbidden,
        ReasonCode::QuotaExceeded,
        ReasonCode::ServiceUnavailable,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ReasonCode::Admitted => "admitted",
            ReasonCode::AddressBlocked => "address_blocked",
            ReasonCode::InvalidShape => "invalid_shape",
            ReasonCode::AuthenticationFailed => "authentication_failed",
            ReasonCode::PolicyNotFound => "policy_not_found",
            ReasonCode::TenantMismatch => "tenant_mismatch",
            ReasonCode::AccountInactive => "account_inactive",
            ReasonCode::AccountAutoBlocked => "account_auto_blocked",
            ReasonCode::AccountSuspended => "account_suspended",
            ReasonCode::OperationForbidden => "operation_forbidden",
            ReasonCode::QuotaExceeded => "quota_exceeded",
            ReasonCode::ServiceUnavailable => "service_unavailable",
        }
    }

    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
