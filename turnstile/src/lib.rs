//! # Turnstile
//!
//! Admission control and abuse prevention for metered APIs.
//!
//! ## Overview
//!
//! Turnstile sits in front of a query service and decides, for every inbound
//! request, whether it may proceed. It combines three independent defences:
//!
//! - **Volumetric abuse tracking**: per source address, regardless of credential
//! - **Per-tenant quotas**: sliding minute/hour/day windows per credential
//! - **Account policy**: suspension, deactivation and bans managed out-of-band
//!
//! Tenant policy is owned by a remote store. It is cached with a soft and a
//! hard TTL so that the store is read roughly once per credential per soft TTL
//! and an outage degrades to serving the last known policy.
//!
//! ## Quick Start
//!
//! ```
//! use turnstile::{AccessPolicy, CounterStore, RateLimits};
//! use std::time::SystemTime;
//!
//! let counters = CounterStore::new();
//! let policy = AccessPolicy::new(42, "free", RateLimits::new(2, 10, 100));
//! let now = SystemTime::now();
//!
//! for _ in 0..2 {
//!     counters.check_and_reserve("api-key", &policy, now)?;
//!     counters.record("api-key", &policy, now);
//! }
//! let err = counters.check_and_reserve("api-key", &policy, now).unwrap_err();
//! assert_eq!(err.to_string(), "Rate limit exceeded: 2 requests per minute (free tier)");
//! # Ok::<(), turnstile::QuotaExceeded>(())
//! ```
//!
//! ## Components
//!
//! - [`AbuseTracker`]: per-address ledger and persistent block list
//! - [`PolicyCache`]: stale-while-revalidate cache in front of a [`PolicyStore`]
//! - [`CounterStore`]: sliding-window usage counters
//! - [`AdmissionPipeline`]: runs every stage in a fixed order and returns an
//!   [`AdmissionVerdict`]
//! - [`EventEmitter`]: forwards [`SecurityEvent`]s to a durable [`EventSink`]
//!
//! External systems plug in through the [`PolicyStore`], [`IdentityResolver`],
//! [`EventSink`] and [`BlockStore`] traits.
//!
//! ## Thread Safety
//!
//! Every store is backed by a sharded concurrent map and can be shared across
//! tasks behind an `Arc`. Operations on one address or credential never wait
//! on another beyond shard contention.
//!
//! ## Features
//!
//! - `ahash` (default): Use AHash for faster hashing

pub mod abuse;
pub mod cache;
pub mod error;
pub mod events;
pub mod pipeline;
pub mod policy;
pub mod shape;
pub mod window;

pub use abuse::{
    AbuseTracker, AbuseTrackerBuilder, AddressSnapshot, AddressStatus, BlockRecord, BlockStore,
    JsonFileBlockStore, MemoryBlockStore, PersistError,
};
pub use cache::{
    CacheConfig, CacheStats, CachedPolicyEntry, PolicyCache, PolicyCacheBuilder, PolicyStore,
};
pub use error::{AdmissionError, AuthError, ReasonCode, StoreError};
pub use events::{
    EventEmitter, EventKind, EventSink, EventWorker, SecurityEvent, Severity, SinkError,
};
pub use pipeline::{
    AdmissionPipeline, AdmissionPipelineBuilder, AdmissionVerdict, Identity, IdentityResolver,
    PipelineStats, SweepReport,
};
pub use policy::{AccessPolicy, Granularity, PolicyViolation, RateLimits};
pub use shape::{Credential, RawRequest, ShapeError, ValidatedRequest};
pub use window::{CounterStore, QuotaExceeded, Remaining, Usage};

#[cfg(feature = "ahash")]
type BuildHasher = ahash::RandomState;
#[cfg(not(feature = "ahash"))]
type BuildHasher = std::collections::hash_map::RandomState;

/// Sharded map shared by every store
pub(crate) type ConcurrentMap<K, V> = dashmap::DashMap<K, V, BuildHasher>;
