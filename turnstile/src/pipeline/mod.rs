//! Admission pipeline
//!
//! Every request passes through the same stages, in order, and the first
//! stage that objects decides the verdict:
//!
//! 1. volumetric abuse check on the source address
//! 2. shape validation
//! 3. identity resolution
//! 4. policy lookup through the cache
//! 5. account flags and operation restrictions
//! 6. quota check
//! 7. usage recording
//!
//! The abuse check runs before anything else so that malformed and
//! unauthenticated floods are counted too. Quota is only consumed in the last
//! stage, after every other check has passed.

mod verdict;
#[cfg(test)]
mod tests;

pub use verdict::{AdmissionVerdict, PipelineStats};

use crate::abuse::{AbuseTracker, AddressSnapshot, AddressStatus, PersistError};
use crate::cache::{CacheConfig, PolicyCache, PolicyStore};
use crate::error::{AdmissionError, AuthError, ReasonCode, StoreError};
use crate::events::{EventEmitter, EventKind, SecurityEvent, Severity};
use crate::shape::{self, Credential, RawRequest};
use crate::window::{CounterStore, Usage};
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};
use tokio::task::JoinHandle;

const DEFAULT_RESOLVE_TIMEOUT_MS: u64 = 2_000;
const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 3600;

/// Tenant a credential belongs to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub tenant_id: u64,
    /// Canonical credential used for caching and accounting; bearer tokens
    /// resolve to the API key they were issued for
    pub credential: String,
}

/// Maps a presented credential to its tenant
#[async_trait]
pub trait IdentityResolver: Send + Sync + 'static {
    async fn resolve(&self, credential: &Credential) -> Result<Identity, AuthError>;
}

/// What a maintenance pass removed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub policies: usize,
    pub credentials: usize,
    pub addresses: usize,
}

/// Facts gathered while a request moves through the stages
#[derive(Default)]
struct RequestContext {
    credential: Option<String>,
    tenant_id: Option<u64>,
    operation: Option<String>,
    newly_blocked: bool,
}

struct Admission {
    identity: Identity,
    policy: crate::policy::AccessPolicy,
    operation: String,
}

/// Owns the abuse tracker, policy cache and counter store for one process
///
/// # Example
///
/// ```no_run
/// # use std::sync::Arc;
/// # use turnstile::{AdmissionPipeline, IdentityResolver, PolicyStore, RawRequest};
/// # async fn demo(resolver: Arc<dyn IdentityResolver>, store: Arc<dyn PolicyStore>) -> Result<(), Box<dyn std::error::Error>> {
/// let pipeline = Arc::new(AdmissionPipeline::builder(resolver, store).build()?);
/// let maintenance = pipeline.spawn_maintenance();
///
/// let raw = RawRequest::new()
///     .param("key", "0a1b2c3d-0000-4000-8000-000000000001")
///     .param("q", "energy_daily");
/// let verdict = pipeline.admit("203.0.113.5", &raw).await;
/// println!("{}: {}", verdict.code, verdict.message);
///
/// pipeline.shutdown();
/// maintenance.await?;
/// # Ok(())
/// # }
/// ```
pub struct AdmissionPipeline {
    abuse: AbuseTracker,
    cache: PolicyCache,
    counters: CounterStore,
    resolver: Arc<dyn IdentityResolver>,
    events: Option<EventEmitter>,
    resolve_timeout: Duration,
    sweep_interval: Duration,
    outcomes: [AtomicU64; ReasonCode::ALL.len()],
}

/// Builder for configuring an [`AdmissionPipeline`]
pub struct AdmissionPipelineBuilder {
    resolver: Arc<dyn IdentityResolver>,
    store: Arc<dyn PolicyStore>,
    abuse: Option<AbuseTracker>,
    cache_config: CacheConfig,
    counters: Option<CounterStore>,
    events: Option<EventEmitter>,
    resolve_timeout: Duration,
    sweep_interval: Duration,
}

impl AdmissionPipeline {
    pub fn builder(
        resolver: Arc<dyn IdentityResolver>,
        store: Arc<dyn PolicyStore>,
    ) -> AdmissionPipelineBuilder {
        AdmissionPipelineBuilder {
            resolver,
            store,
            abuse: None,
            cache_config: CacheConfig::default(),
            counters: None,
            events: None,
            resolve_timeout: Duration::from_millis(DEFAULT_RESOLVE_TIMEOUT_MS),
            sweep_interval: Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS),
        }
    }

    /// Decide on a request using the system clock
    pub async fn admit(&self, address: &str, raw: &RawRequest) -> AdmissionVerdict {
        self.admit_at(address, raw, SystemTime::now()).await
    }

    /// Decide on a request as of `now`
    pub async fn admit_at(
        &self,
        address: &str,
        raw: &RawRequest,
        now: SystemTime,
    ) -> AdmissionVerdict {
        let mut ctx = RequestContext::default();

        let outcome = self
            .evaluate(address, raw, now, &mut ctx)
            .await
            .and_then(|admission| self.commit(address, admission, now));
        let verdict = match outcome {
            Ok(verdict) => verdict,
            Err(error) => {
                self.report_denial(address, &error, &ctx, now);
                AdmissionVerdict::denied(&error, ctx.tenant_id)
            }
        };

        self.outcomes[verdict.code.index()].fetch_add(1, Ordering::Relaxed);
        verdict
    }

    async fn evaluate(
        &self,
        address: &str,
        raw: &RawRequest,
        now: SystemTime,
        ctx: &mut RequestContext,
    ) -> Result<Admission, AdmissionError> {
        if let AddressStatus::Blocked {
            reason,
            newly_blocked,
        } = self.abuse.register(address, now)
        {
            ctx.newly_blocked = newly_blocked;
            return Err(AdmissionError::AbuseBlocked { reason });
        }

        let request = shape::validate(raw)?;
        ctx.credential = Some(request.credential.as_str().to_string());
        ctx.operation = Some(request.operation.clone());

        let identity = self.resolve(&request.credential).await?;
        ctx.tenant_id = Some(identity.tenant_id);
        ctx.credential = Some(identity.credential.clone());

        let policy = match self.cache.get_at(&identity.credential, now).await {
            Ok(entry) => entry.policy,
            Err(StoreError::NotFound) => return Err(AdmissionError::PolicyMissing),
            Err(StoreError::Unavailable(reason)) => {
                return Err(AdmissionError::StoreUnavailable(reason));
            }
        };

        if policy.tenant_id != identity.tenant_id {
            return Err(AdmissionError::TenantMismatch {
                resolved: identity.tenant_id,
                cached: policy.tenant_id,
            });
        }

        policy.validate(now)?;

        if !policy.permits_operation(&request.operation) {
            return Err(AdmissionError::OperationForbidden {
                operation: request.operation,
            });
        }

        self.counters.check_and_reserve(&identity.credential, &policy, now)?;

        Ok(Admission {
            identity,
            policy,
            operation: request.operation,
        })
    }

    async fn resolve(&self, credential: &Credential) -> Result<Identity, AdmissionError> {
        match tokio::time::timeout(self.resolve_timeout, self.resolver.resolve(credential)).await {
            Ok(Ok(identity)) => Ok(identity),
            Ok(Err(AuthError::Rejected(reason))) => {
                Err(AdmissionError::AuthenticationFailed(reason))
            }
            Ok(Err(AuthError::Unavailable(reason))) => {
                Err(AdmissionError::StoreUnavailable(reason))
            }
            Err(_) => Err(AdmissionError::StoreUnavailable(format!(
                "identity resolution timed out after {}ms",
                self.resolve_timeout.as_millis()
            ))),
        }
    }

    fn commit(
        &self,
        address: &str,
        admission: Admission,
        now: SystemTime,
    ) -> Result<AdmissionVerdict, AdmissionError> {
        let Admission {
            identity,
            policy,
            operation,
        } = admission;

        // Requests racing on one credential are settled here
        self.counters.check_and_record(&identity.credential, &policy, now)?;
        let remaining = self.counters.remaining(&identity.credential, &policy, now);

        tracing::debug!(
            address,
            tenant = identity.tenant_id,
            operation = %operation,
            "Request admitted"
        );

        if let Some(events) = &self.events {
            events.emit(
                SecurityEvent::new(
                    EventKind::RequestAdmitted,
                    Severity::Info,
                    address,
                    "Request admitted",
                    now,
                )
                .with_credential(&identity.credential)
                .with_tenant(identity.tenant_id)
                .with_operation(operation)
                .with_code(ReasonCode::Admitted),
            );
        }

        Ok(AdmissionVerdict::admitted(
            identity.tenant_id,
            identity.credential,
            policy,
            remaining,
        ))
    }

    fn report_denial(
        &self,
        address: &str,
        error: &AdmissionError,
        ctx: &RequestContext,
        now: SystemTime,
    ) {
        let credential = ctx
            .credential
            .as_deref()
            .map(crate::events::mask_credential)
            .unwrap_or_else(|| "-".to_string());

        match error {
            AdmissionError::AuthenticationFailed(reason) => tracing::warn!(
                target: "turnstile::auth",
                address,
                credential = %credential,
                "Authentication failed: {}",
                reason
            ),
            AdmissionError::PolicyMissing => tracing::error!(
                address,
                credential = %credential,
                tenant = ?ctx.tenant_id,
                "Resolved credential has no access policy"
            ),
            AdmissionError::StoreUnavailable(reason) => tracing::error!(
                address,
                credential = %credential,
                "Admission failed on infrastructure error: {}",
                reason
            ),
            _ => tracing::debug!(
                address,
                credential = %credential,
                code = %error.code(),
                "Request denied: {}",
                error
            ),
        }

        let Some(events) = &self.events else {
            return;
        };

        // The tracker reports the block itself and always shares an emitter
        if ctx.newly_blocked {
            return;
        }

        let (kind, severity) = event_kind(error);
        let mut event = SecurityEvent::new(kind, severity, address, error.to_string(), now)
            .with_code(error.code());
        if let Some(credential) = &ctx.credential {
            event = event.with_credential(credential);
        }
        if let Some(tenant_id) = ctx.tenant_id {
            event = event.with_tenant(tenant_id);
        }
        if let Some(operation) = &ctx.operation {
            event = event.with_operation(operation.clone());
        }
        if let AdmissionError::QuotaExceeded(quota) = error {
            event = event.with_data(serde_json::json!({
                "granularity": quota.granularity,
                "ceiling": quota.ceiling,
                "observed": quota.observed,
                "tier": quota.tier,
            }));
        }

        events.emit(event);
    }

    /// Drop a cached policy so the next request refetches it
    pub fn invalidate_policy(&self, credential: &str) -> bool {
        self.cache.invalidate(credential)
    }

    /// Clear an address block; `false` if the address was never seen
    pub fn unblock_address(&self, address: &str) -> bool {
        self.abuse.unblock(address)
    }

    pub fn address_snapshot(&self, address: &str) -> Option<AddressSnapshot> {
        self.abuse.address_snapshot(address, SystemTime::now())
    }

    /// Live usage of a canonical credential
    pub fn usage(&self, credential: &str) -> Usage {
        self.counters.usage(credential, SystemTime::now())
    }

    pub fn abuse(&self) -> &AbuseTracker {
        &self.abuse
    }

    pub fn cache(&self) -> &PolicyCache {
        &self.cache
    }

    pub fn counters(&self) -> &CounterStore {
        &self.counters
    }

    pub fn stats(&self) -> PipelineStats {
        let mut stats = PipelineStats::default();
        for code in ReasonCode::ALL {
            let count = self.outcomes[code.index()].load(Ordering::Relaxed);
            stats.by_code.insert(code.as_str(), count);
            stats.total += count;
            if code == ReasonCode::Admitted {
                stats.admitted += count;
            } else {
                stats.denied += count;
            }
        }

        stats.tracked_addresses = self.abuse.tracked_count();
        stats.blocked_addresses = self.abuse.blocked_count();
        stats.tracked_credentials = self.counters.len();
        stats.events_dropped = self.events.as_ref().map_or(0, EventEmitter::dropped);
        stats.cache = self.cache.stats();
        stats
    }

    /// Evict idle state from every store
    pub fn sweep(&self, now: SystemTime) -> SweepReport {
        let report = SweepReport {
            policies: self.cache.sweep(now),
            credentials: self.counters.sweep_idle(now),
            addresses: self.abuse.sweep_idle(now),
        };

        tracing::debug!(
            policies = report.policies,
            credentials = report.credentials,
            addresses = report.addresses,
            "Maintenance sweep finished"
        );
        report
    }

    /// Run [`AdmissionPipeline::sweep`] periodically until shutdown
    pub fn spawn_maintenance(self: &Arc<Self>) -> JoinHandle<()> {
        let pipeline = Arc::clone(self);
        let mut shutdown = self.cache.shutdown_signal();

        tokio::spawn(async move {
            if *shutdown.borrow_and_update() {
                return;
            }

            let mut interval = tokio::time::interval(pipeline.sweep_interval);
            // First tick completes immediately
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        pipeline.sweep(SystemTime::now());
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }

            tracing::info!("Maintenance task stopped");
        })
    }

    /// Stop background refreshes and the maintenance task
    pub fn shutdown(&self) {
        self.cache.shutdown();
    }
}

fn event_kind(error: &AdmissionError) -> (EventKind, Severity) {
    match error {
        AdmissionError::AbuseBlocked { .. } => {
            (EventKind::BlockedAddressRequest, Severity::Medium)
        }
        AdmissionError::InvalidShape(_) => (EventKind::InvalidShape, Severity::Medium),
        AdmissionError::AuthenticationFailed(_) => {
            (EventKind::AuthenticationFailed, Severity::High)
        }
        AdmissionError::PolicyMissing => (EventKind::PolicyNotFound, Severity::High),
        AdmissionError::TenantMismatch { .. } => (EventKind::TenantMismatch, Severity::High),
        AdmissionError::PolicyInvalid(_) => (EventKind::AccountInvalid, Severity::Medium),
        AdmissionError::OperationForbidden { .. } => {
            (EventKind::OperationForbidden, Severity::Medium)
        }
        AdmissionError::QuotaExceeded(_) => (EventKind::QuotaExceeded, Severity::Medium),
        AdmissionError::StoreUnavailable(_) => (EventKind::ServiceUnavailable, Severity::High),
    }
}

impl AdmissionPipelineBuilder {
    /// Use a preconfigured abuse tracker instead of the default one
    pub fn abuse_tracker(mut self, tracker: AbuseTracker) -> Self {
        self.abuse = Some(tracker);
        self
    }

    pub fn cache_config(mut self, config: CacheConfig) -> Self {
        self.cache_config = config;
        self
    }

    pub fn counter_store(mut self, counters: CounterStore) -> Self {
        self.counters = Some(counters);
        self
    }

    pub fn events(mut self, events: EventEmitter) -> Self {
        self.events = Some(events);
        self
    }

    /// Upper bound on a single identity resolution
    pub fn resolve_timeout(mut self, timeout: Duration) -> Self {
        self.resolve_timeout = timeout;
        self
    }

    /// How often the maintenance task sweeps idle state
    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Build the pipeline
    ///
    /// Without an explicit tracker a default one with in-memory block state
    /// is created. Either way the tracker reports blocks through this
    /// pipeline's event emitter unless it was given its own.
    pub fn build(self) -> Result<AdmissionPipeline, PersistError> {
        let abuse = match self.abuse {
            Some(mut tracker) => {
                if let Some(events) = &self.events {
                    tracker.attach_events(events);
                }
                tracker
            }
            None => {
                let mut builder = AbuseTracker::builder();
                if let Some(events) = &self.events {
                    builder = builder.events(events.clone());
                }
                builder.build()?
            }
        };

        Ok(AdmissionPipeline {
            abuse,
            cache: PolicyCache::builder(self.store)
                .config(self.cache_config)
                .build(),
            counters: self.counters.unwrap_or_default(),
            resolver: self.resolver,
            events: self.events,
            resolve_timeout: self.resolve_timeout,
            sweep_interval: self.sweep_interval.max(Duration::from_millis(1)),
            outcomes: std::array::from_fn(|_| AtomicU64::new(0)),
        })
    }
}
