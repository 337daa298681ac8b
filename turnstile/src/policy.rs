//! Tenant access policy
//!
//! An [`AccessPolicy`] is the authoritative per-credential record owned by the
//! remote policy store: the tenant it belongs to, its tier and rate ceilings,
//! and the account flags that can change out-of-band (suspension, auto-block,
//! deactivation, unlimited override).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const MINUTE_SECS: u64 = 60;
const HOUR_SECS: u64 = 60 * MINUTE_SECS;
const DAY_SECS: u64 = 24 * HOUR_SECS;

/// Quota window granularity, ordered finest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    Minute,
    Hour,
    Day,
}

impl Granularity {
    /// All granularities in evaluation order
    pub const ALL: [Granularity; 3] = [Granularity::Minute, Granularity::Hour, Granularity::Day];

    /// Length of one bucket of this granularity
    pub fn bucket(self) -> Duration {
        match self {
            Granularity::Minute => Duration::from_secs(MINUTE_SECS),
            Granularity::Hour => Duration::from_secs(HOUR_SECS),
            Granularity::Day => Duration::from_secs(DAY_SECS),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Granularity::Minute => "minute",
            Granularity::Hour => "hour",
            Granularity::Day => "day",
        }
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rate ceilings for each granularity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimits {
    pub requests_per_minute: u32,
    pub requests_per_hour: u32,
    pub requests_per_day: u32,
}

impl RateLimits {
    pub fn new(requests_per_minute: u32, requests_per_hour: u32, requests_per_day: u32) -> Self {
        RateLimits {
            requests_per_minute,
            requests_per_hour,
            requests_per_day,
        }
    }

    /// Ceiling for a single granularity
    pub fn ceiling(&self, granularity: Granularity) -> u32 {
        match granularity {
            Granularity::Minute => self.requests_per_minute,
            Granularity::Hour => self.requests_per_hour,
            Granularity::Day => self.requests_per_day,
        }
    }
}

impl Default for RateLimits {
    /// The free tier ceilings
    fn default() -> Self {
        RateLimits::new(2, 10, 100)
    }
}

/// Authoritative access policy for one credential
///
/// Policies are usually deserialized from the policy store, so every flag has
/// a serde default matching a plain active account.
///
/// # Example
///
/// ```
/// use turnstile::{AccessPolicy, RateLimits};
///
/// let policy = AccessPolicy::new(42, "pro", RateLimits::new(60, 1_000, 10_000));
/// assert!(policy.validate(std::time::SystemTime::now()).is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessPolicy {
    pub tenant_id: u64,
    #[serde(default = "default_tier")]
    pub tier: String,
    #[serde(default)]
    pub limits: RateLimits,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default)]
    pub suspended: bool,
    #[serde(default)]
    pub suspension_reason: Option<String>,
    /// Unix seconds; a suspension without expiry lasts until lifted
    #[serde(default)]
    pub suspended_until: Option<u64>,
    #[serde(default)]
    pub auto_blocked: bool,
    #[serde(default)]
    pub auto_block_reason: Option<String>,
    /// Bypasses every quota check
    #[serde(default)]
    pub unlimited: bool,
    /// Operation prefixes this credential may call; `None` means any
    #[serde(default)]
    pub allowed_operations: Option<Vec<String>>,
    /// Operation prefixes this credential may never call
    #[serde(default)]
    pub blocked_operations: Option<Vec<String>>,
}

fn default_tier() -> String {
    "free".to_string()
}

fn default_true() -> bool {
    true
}

impl AccessPolicy {
    /// Create an active, unrestricted policy
    pub fn new(tenant_id: u64, tier: impl Into<String>, limits: RateLimits) -> Self {
        AccessPolicy {
            tenant_id,
            tier: tier.into(),
            limits,
            active: true,
            suspended: false,
            suspension_reason: None,
            suspended_until: None,
            auto_blocked: false,
            auto_block_reason: None,
            unlimited: false,
            allowed_operations: None,
            blocked_operations: None,
        }
    }

    /// Check the account flags
    ///
    /// Flags are evaluated in order: inactive, auto-blocked, suspended. A
    /// suspension whose expiry lies in the past is treated as lifted.
    pub fn validate(&self, now: SystemTime) -> Result<(), PolicyViolation> {
        if !self.active {
            return Err(PolicyViolation::Inactive);
        }

        if self.auto_blocked {
            return Err(PolicyViolation::AutoBlocked {
                reason: self
                    .auto_block_reason
                    .clone()
                    .unwrap_or_else(|| "suspicious activity".to_string()),
            });
        }

        if self.suspended {
            match self.suspended_until {
                Some(until) if unix_secs(now) >= until => {}
                until => {
                    return Err(PolicyViolation::Suspended {
                        reason: self.suspension_reason.clone(),
                        until,
                    });
                }
            }
        }

        Ok(())
    }

    /// Check the operation against the blocked and allowed prefix lists
    pub fn permits_operation(&self, operation: &str) -> bool {
        if let Some(blocked) = &self.blocked_operations
            && blocked.iter().any(|prefix| operation.starts_with(prefix.as_str()))
        {
            return false;
        }

        match &self.allowed_operations {
            Some(allowed) if !allowed.is_empty() => allowed
                .iter()
                .any(|prefix| operation.starts_with(prefix.as_str())),
            _ => true,
        }
    }
}

/// Reason an otherwise resolvable account may not make requests
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PolicyViolation {
    #[error("API access is deactivated for this account")]
    Inactive,

    #[error("API key auto-blocked: {reason}")]
    AutoBlocked { reason: String },

    #[error("API access suspended{}: {}", until_suffix(.until), reason_or_default(.reason))]
    Suspended {
        reason: Option<String>,
        until: Option<u64>,
    },
}

fn until_suffix(until: &Option<u64>) -> String {
    until.map(|u| format!(" until {u}")).unwrap_or_default()
}

fn reason_or_default(reason: &Option<String>) -> &str {
    reason.as_deref().unwrap_or("no reason given")
}

pub(crate) fn unix_secs(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

pub(crate) fn unix_millis(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
